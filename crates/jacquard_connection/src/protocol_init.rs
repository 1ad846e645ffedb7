// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Protocol-initialization state machine (spec §4.4): hello / begin /
//! component-info handshake over an already-paired [`Transport`], ending in
//! an immutable tag [`Component`].

use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;
use jacquard_core::message::{Capability, Component, Domain, Opcode, SemanticVersion};
use jacquard_core::{ConnectionError, JacquardError, JacquardResult, TransportError};
use jacquard_protocol::ble::WriteKind;
use jacquard_protocol::transport::Transport;
use tokio::sync::{oneshot, watch};

const REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
const REQUEST_RETRIES: u8 = 2;
/// Firmware below this version does not honor `write_with_response` on the
/// command characteristic (spec §4.4).
const MIN_WITH_RESPONSE_FIRMWARE: SemanticVersion = SemanticVersion {
  major: 1,
  minor: 43,
  micro: 0,
};

/// State of the protocol-initialization machine. Spec §4.4.
#[derive(Debug, Clone)]
pub enum ProtocolInitState {
  Paired,
  HelloSent,
  BeginSent,
  ComponentInfoSent,
  CreatingTagInstance,
  TagInitialized(Component),
  Error(ConnectionError),
}

impl ProtocolInitState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ProtocolInitState::TagInitialized(_) | ProtocolInitState::Error(_))
  }
}

/// Decoded `hello` response payload (spec §4.4: "protocol_min ≤ 2 ≤
/// protocol_max").
#[derive(Debug, Clone, Copy)]
pub struct HelloPayload {
  pub protocol_min: u8,
  pub protocol_max: u8,
}

/// Decoded `device_info` response payload.
#[derive(Debug, Clone)]
pub struct DeviceInfoPayload {
  pub firmware: SemanticVersion,
  pub vendor_id: u32,
  pub product_id: u32,
  pub tag_uuid: String,
}

/// Runs the protocol-init handshake to completion against `transport`.
pub async fn run_protocol_init(transport: Arc<Transport>, state_tx: watch::Sender<ProtocolInitState>) {
  let _ = state_tx.send(ProtocolInitState::Paired);

  let mut write_kind = WriteKind::WithResponse;

  let hello = match send_hello(&transport, write_kind).await {
    Ok(payload) => payload,
    Err(HelloError::WriteNotPermitted) => {
      tracing::info!("protocol_init: write-not-permitted on hello, downgrading to write_without_response");
      write_kind = WriteKind::WithoutResponse;
      match send_hello(&transport, write_kind).await {
        Ok(payload) => payload,
        Err(HelloError::WriteNotPermitted) => {
          let _ = state_tx.send(ProtocolInitState::Error(ConnectionError::BluetoothConnectionError(
            "write not permitted on both with_response and without_response".to_string(),
          )));
          return;
        }
        Err(HelloError::Fatal(e)) => {
          let _ = state_tx.send(ProtocolInitState::Error(e));
          return;
        }
      }
    }
    Err(HelloError::Fatal(e)) => {
      let _ = state_tx.send(ProtocolInitState::Error(e));
      return;
    }
  };
  let _ = state_tx.send(ProtocolInitState::HelloSent);

  if !(hello.protocol_min <= 2 && 2 <= hello.protocol_max) {
    let _ = state_tx.send(ProtocolInitState::Error(ConnectionError::MalformedResponse(format!(
      "hello range [{}, {}] does not include protocol 2",
      hello.protocol_min, hello.protocol_max
    ))));
    return;
  }

  if enqueue(&transport, Domain::Base, Opcode::Begin, Vec::new(), write_kind)
    .await
    .is_err()
  {
    let _ = state_tx.send(ProtocolInitState::Error(ConnectionError::MalformedResponse(
      "begin response missing required payload".to_string(),
    )));
    return;
  }
  let _ = state_tx.send(ProtocolInitState::BeginSent);

  let device_info = match enqueue(&transport, Domain::Base, Opcode::DeviceInfo, Vec::new(), write_kind).await {
    Ok(Some(payload)) => match decode_device_info(&payload) {
      Some(info) => info,
      None => {
        let _ = state_tx.send(ProtocolInitState::Error(ConnectionError::MalformedResponse(
          "device_info payload truncated".to_string(),
        )));
        return;
      }
    },
    _ => {
      let _ = state_tx.send(ProtocolInitState::Error(ConnectionError::MalformedResponse(
        "device_info response missing required payload".to_string(),
      )));
      return;
    }
  };
  let _ = state_tx.send(ProtocolInitState::ComponentInfoSent);
  let _ = state_tx.send(ProtocolInitState::CreatingTagInstance);

  let tag = Component::new(
    0,
    device_info.vendor_id,
    device_info.product_id,
    None,
    BitFlags::from(Capability::Led),
    device_info.firmware,
    device_info.tag_uuid,
  );
  let _ = state_tx.send(ProtocolInitState::TagInitialized(tag));
}

enum HelloError {
  WriteNotPermitted,
  Fatal(ConnectionError),
}

async fn send_hello(transport: &Arc<Transport>, write_kind: WriteKind) -> Result<HelloPayload, HelloError> {
  match enqueue(transport, Domain::Base, Opcode::Hello, Vec::new(), write_kind).await {
    Ok(Some(payload)) => decode_hello(&payload).ok_or_else(|| {
      HelloError::Fatal(ConnectionError::MalformedResponse("hello payload truncated".to_string()))
    }),
    Ok(None) => Err(HelloError::Fatal(ConnectionError::MalformedResponse(
      "hello response missing required payload".to_string(),
    ))),
    Err(JacquardError::Transport(TransportError::WriteNotPermitted)) => Err(HelloError::WriteNotPermitted),
    Err(e) => Err(HelloError::Fatal(ConnectionError::BluetoothConnectionError(e.to_string()))),
  }
}

async fn enqueue(
  transport: &Arc<Transport>,
  domain: Domain,
  opcode: Opcode,
  payload: Vec<u8>,
  write_kind: WriteKind,
) -> JacquardResult<Option<Vec<u8>>> {
  let (tx, rx) = oneshot::channel();
  // Spec §4.4: a physical write failure during protocol-init is fatal to
  // the request immediately, unlike the general §4.2 retry/timeout contract.
  transport.enqueue(domain, opcode, payload, write_kind, REQUEST_RETRIES, REQUEST_TIMEOUT, false, true, move |result| {
    let _ = tx.send(result);
  });
  rx.await.unwrap_or_else(|_| {
    Err(jacquard_core::JacquardError::Connection(ConnectionError::InternalError(
      "transport dropped response channel".to_string(),
    )))
  })
}

fn decode_hello(payload: &[u8]) -> Option<HelloPayload> {
  if payload.len() < 2 {
    return None;
  }
  Some(HelloPayload {
    protocol_min: payload[0],
    protocol_max: payload[1],
  })
}

fn decode_device_info(payload: &[u8]) -> Option<DeviceInfoPayload> {
  if payload.len() < 11 {
    return None;
  }
  let firmware = SemanticVersion::new(
    u16::from(payload[0]),
    u16::from(payload[1]),
    u16::from(payload[2]),
  );
  let vendor_id = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]);
  let product_id = u32::from_le_bytes([payload[7], payload[8], payload[9], payload[10]]);
  let tag_uuid = String::from_utf8_lossy(&payload[11..]).to_string();
  Some(DeviceInfoPayload {
    firmware,
    vendor_id,
    product_id,
    tag_uuid,
  })
}

#[cfg(test)]
mod test {
  use std::sync::Mutex as StdMutex;

  use async_trait::async_trait;
  use jacquard_protocol::ble::{BleCentral, BleEvent, BlePlatformError, CharacteristicId, PeripheralId, RequiredCharacteristics, ServiceId};
  use jacquard_protocol::Fragmenter;
  use tokio::sync::broadcast;
  use uuid::Uuid;

  use super::*;

  const MTU: usize = 185;

  fn opcode_tag(opcode: Opcode) -> u16 {
    match opcode {
      Opcode::Hello => 0x0001,
      Opcode::Begin => 0x0002,
      Opcode::DeviceInfo => 0x0003,
      _ => unreachable!("protocol-init fake only handles hello/begin/device_info"),
    }
  }

  /// Fake `BleCentral` scripted to answer the protocol-init handshake.
  /// `fail_first_with_response` makes the very first `WithResponse` write
  /// to hello fail with `write_not_permitted`, forcing the downgrade path
  /// (scenario 2).
  struct FakeBle {
    characteristics: RequiredCharacteristics,
    events_tx: broadcast::Sender<BleEvent>,
    reassembly: StdMutex<Fragmenter>,
    fail_first_with_response: bool,
    failed_once: StdMutex<bool>,
    firmware: SemanticVersion,
    vendor_id: u32,
    product_id: u32,
    tag_uuid: String,
  }

  impl FakeBle {
    fn new(characteristics: RequiredCharacteristics, fail_first_with_response: bool) -> Arc<Self> {
      let (events_tx, _keepalive) = broadcast::channel(32);
      Arc::new(Self {
        characteristics,
        events_tx,
        reassembly: StdMutex::new(Fragmenter::new()),
        fail_first_with_response,
        failed_once: StdMutex::new(false),
        firmware: SemanticVersion::new(1, 96, 0),
        vendor_id: 0x1178_3008,
        product_id: 0x283B_E7A0,
        tag_uuid: "abc-123".to_string(),
      })
    }
  }

  #[async_trait]
  impl BleCentral for FakeBle {
    async fn connect(&self, _peripheral: PeripheralId) {}
    async fn discover_services(&self, _peripheral: PeripheralId, _filter: ServiceId) {}
    async fn discover_characteristics(&self, _peripheral: PeripheralId, _service: ServiceId, _characteristics: &[CharacteristicId]) {}
    async fn request_notifications(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId) {}

    async fn write(
      &self,
      peripheral: PeripheralId,
      characteristic: CharacteristicId,
      data: Vec<u8>,
      kind: WriteKind,
    ) -> Result<(), BlePlatformError> {
      assert_eq!(characteristic, self.characteristics.command());
      let packet = self.reassembly.lock().unwrap().add_fragment(&data);
      let Some(packet) = packet else {
        return Ok(());
      };

      let id = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
      let opcode_tag = u16::from_le_bytes([packet[5], packet[6]]);

      if opcode_tag == super::opcode_tag(Opcode::Hello) && kind == WriteKind::WithResponse && self.fail_first_with_response {
        let mut failed_once = self.failed_once.lock().unwrap();
        if !*failed_once {
          *failed_once = true;
          return Err(BlePlatformError {
            message: "write not permitted".to_string(),
            write_not_permitted: true,
            peer_removed_pairing_info: false,
          });
        }
      }

      let payload: Vec<u8> = if opcode_tag == super::opcode_tag(Opcode::Hello) {
        vec![2, 2]
      } else if opcode_tag == super::opcode_tag(Opcode::Begin) {
        Vec::new()
      } else if opcode_tag == super::opcode_tag(Opcode::DeviceInfo) {
        let mut p = vec![
          self.firmware.major as u8,
          self.firmware.minor as u8,
          self.firmware.micro as u8,
        ];
        p.extend_from_slice(&self.vendor_id.to_le_bytes());
        p.extend_from_slice(&self.product_id.to_le_bytes());
        p.extend_from_slice(self.tag_uuid.as_bytes());
        p
      } else {
        unreachable!("unexpected opcode tag {opcode_tag}")
      };

      let mut response = Vec::with_capacity(5 + payload.len());
      response.extend_from_slice(&id.to_le_bytes());
      response.push(0); // Status::Ok tag
      response.extend_from_slice(&payload);
      let response_characteristic = self.characteristics.response();
      let events_tx = self.events_tx.clone();
      tokio::spawn(async move {
        for fragment in Fragmenter::encode(&response, MTU) {
          let _ = events_tx.send(BleEvent::Notification(peripheral, response_characteristic, fragment));
        }
      });
      Ok(())
    }

    async fn disconnect(&self, _peripheral: PeripheralId) {}

    fn events(&self, _peripheral: PeripheralId) -> broadcast::Receiver<BleEvent> {
      self.events_tx.subscribe()
    }

    fn command_write_kind(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId) -> Option<WriteKind> {
      Some(WriteKind::WithResponse)
    }
  }

  fn characteristics() -> RequiredCharacteristics {
    RequiredCharacteristics::new(
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
    )
  }

  async fn run_to_terminal(transport: Arc<Transport>) -> ProtocolInitState {
    let (state_tx, mut state_rx) = watch::channel(ProtocolInitState::Paired);
    tokio::spawn(run_protocol_init(transport, state_tx));
    loop {
      let state = state_rx.borrow_and_update().clone();
      if state.is_terminal() {
        return state;
      }
      state_rx.changed().await.unwrap();
    }
  }

  /// Scenario 1 (second half): hello/begin/device_info over a healthy
  /// transport reaches `TagInitialized` with the decoded component.
  #[tokio::test]
  async fn happy_handshake_reaches_tag_initialized() {
    let characteristics = characteristics();
    let ble: Arc<dyn BleCentral> = FakeBle::new(characteristics, false);
    let transport = Arc::new(Transport::new(ble, PeripheralId(Uuid::new_v4()), characteristics, MTU, "tag".to_string()));

    match run_to_terminal(transport).await {
      ProtocolInitState::TagInitialized(component) => {
        assert_eq!(component.version(), SemanticVersion::new(1, 96, 0));
        assert_eq!(component.vendor_id(), 0x1178_3008);
        assert_eq!(component.product_id(), 0x283B_E7A0);
      }
      other => panic!("expected TagInitialized, got {other:?}"),
    }
  }

  /// Scenario 2: the first `write_with_response` hello fails with
  /// write-not-permitted; protocol-init downgrades to
  /// write-without-response, retransmits hello once, then proceeds exactly
  /// as the happy path.
  #[tokio::test]
  async fn hello_write_not_permitted_downgrades_and_retries() {
    let characteristics = characteristics();
    let ble: Arc<dyn BleCentral> = FakeBle::new(characteristics, true);
    let transport = Arc::new(Transport::new(ble, PeripheralId(Uuid::new_v4()), characteristics, MTU, "tag".to_string()));

    match run_to_terminal(transport).await {
      ProtocolInitState::TagInitialized(component) => {
        assert_eq!(component.version(), SemanticVersion::new(1, 96, 0));
      }
      other => panic!("expected TagInitialized after downgrade, got {other:?}"),
    }
  }

  #[test]
  fn min_with_response_firmware_matches_spec() {
    assert_eq!(MIN_WITH_RESPONSE_FIRMWARE, SemanticVersion::new(1, 43, 0));
  }

  #[test]
  fn decode_hello_requires_two_bytes() {
    assert!(decode_hello(&[2]).is_none());
    let hello = decode_hello(&[2, 2]).unwrap();
    assert_eq!(hello.protocol_min, 2);
    assert_eq!(hello.protocol_max, 2);
  }

  #[test]
  fn decode_device_info_parses_fixed_fields() {
    let mut payload = vec![1, 96, 0];
    payload.extend_from_slice(&0x1178_3008u32.to_le_bytes());
    payload.extend_from_slice(&0x283B_E7A0u32.to_le_bytes());
    payload.extend_from_slice(b"abc-123");
    let info = decode_device_info(&payload).unwrap();
    assert_eq!(info.firmware, SemanticVersion::new(1, 96, 0));
    assert_eq!(info.vendor_id, 0x1178_3008);
    assert_eq!(info.product_id, 0x283B_E7A0);
    assert_eq!(info.tag_uuid, "abc-123");
  }
}
