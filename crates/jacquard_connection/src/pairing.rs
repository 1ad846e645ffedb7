// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pairing state machine (spec §4.3): brings a peripheral from
//! OS-level-paired to GATT-ready — services discovered, characteristics
//! located, notifications subscribed.

use std::collections::HashSet;

use jacquard_core::ConnectionError;
use jacquard_protocol::ble::{BleCentral, BleEvent, CharacteristicId, PeripheralId, RequiredCharacteristics, ServiceId, WriteKind};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Jacquard v2 GATT service and characteristic UUIDs, following the
/// Bluetooth SIG 128-bit base UUID convention
/// (`0000xxxx-0000-1000-8000-00805F9B34FB`) with a vendor 32-bit prefix.
pub const JACQUARD_SERVICE_UUID: Uuid = Uuid::from_u128(0xFB571000_0000_1000_8000_00805F9B34FB);
pub const COMMAND_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xFB571001_0000_1000_8000_00805F9B34FB);
pub const RESPONSE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xFB571002_0000_1000_8000_00805F9B34FB);
pub const EVENT_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xFB571003_0000_1000_8000_00805F9B34FB);
pub const RAW_DATA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xFB571004_0000_1000_8000_00805F9B34FB);

/// State of the pairing state machine. Spec §4.3.
#[derive(Debug, Clone)]
pub enum PairingState {
  Disconnected,
  BluetoothConnected,
  ServicesDiscovered,
  AwaitingNotificationUpdates,
  TagPaired {
    peripheral: PeripheralId,
    characteristics: RequiredCharacteristics,
  },
  Error(ConnectionError),
}

impl PairingState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, PairingState::TagPaired { .. } | PairingState::Error(_))
  }
}

/// Runs the pairing state machine for one peripheral. Spawns its own
/// single-context event loop on construction (`Transport`'s shape,
/// `jacquard_protocol::transport`).
pub struct Pairing {
  state_rx: watch::Receiver<PairingState>,
}

impl Pairing {
  pub fn new(ble: Arc<dyn BleCentral>, peripheral: PeripheralId) -> Self {
    let (state_tx, state_rx) = watch::channel(PairingState::Disconnected);
    let events = ble.events(peripheral);

    jacquard_core::util::async_manager::spawn(run_pairing_loop(PairingLoopState {
      ble,
      peripheral,
      events,
      state_tx,
      notified: HashSet::new(),
    }));

    Self { state_rx }
  }

  /// Replay-latest state stream (spec §9: "subject" with retained current
  /// value).
  pub fn state_stream(&self) -> watch::Receiver<PairingState> {
    self.state_rx.clone()
  }
}

struct PairingLoopState {
  ble: Arc<dyn BleCentral>,
  peripheral: PeripheralId,
  events: tokio::sync::broadcast::Receiver<BleEvent>,
  state_tx: watch::Sender<PairingState>,
  notified: HashSet<CharacteristicId>,
}

fn required_characteristic_ids() -> [CharacteristicId; 4] {
  [
    CharacteristicId(COMMAND_CHARACTERISTIC_UUID),
    CharacteristicId(RESPONSE_CHARACTERISTIC_UUID),
    CharacteristicId(EVENT_CHARACTERISTIC_UUID),
    CharacteristicId(RAW_DATA_CHARACTERISTIC_UUID),
  ]
}

async fn run_pairing_loop(mut state: PairingLoopState) {
  loop {
    let event = match state.events.recv().await {
      Ok(event) => event,
      Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
        tracing::warn!(skipped = n, "Pairing: lagged behind BLE event stream");
        continue;
      }
      Err(tokio::sync::broadcast::error::RecvError::Closed) => {
        tracing::info!("Pairing: BLE event stream closed");
        return;
      }
    };

    let current = state.state_tx.borrow().clone();
    if current.is_terminal() {
      continue;
    }

    match (current, event) {
      (PairingState::Disconnected, BleEvent::DidConnect(p)) => {
        assert_eq!(p, state.peripheral, "Pairing: did_connect for unrelated peripheral");
        state
          .ble
          .discover_services(state.peripheral, ServiceId(JACQUARD_SERVICE_UUID))
          .await;
        let _ = state.state_tx.send(PairingState::BluetoothConnected);
      }

      (PairingState::Disconnected, BleEvent::FailedToConnect(p, e)) if p == state.peripheral => {
        let error = if e.peer_removed_pairing_info {
          ConnectionError::PeerRemovedPairingInfo
        } else {
          ConnectionError::BluetoothConnectionError(e.message)
        };
        let _ = state.state_tx.send(PairingState::Error(error));
      }

      (PairingState::BluetoothConnected, BleEvent::DidDiscoverServices(p, services)) if p == state.peripheral => {
        if services.iter().any(|s| s.0 == JACQUARD_SERVICE_UUID) {
          let required = required_characteristic_ids();
          state
            .ble
            .discover_characteristics(state.peripheral, ServiceId(JACQUARD_SERVICE_UUID), &required)
            .await;
          let _ = state.state_tx.send(PairingState::ServicesDiscovered);
        } else {
          let _ = state.state_tx.send(PairingState::Error(ConnectionError::ServiceDiscoveryError));
        }
      }

      (PairingState::ServicesDiscovered, BleEvent::DidDiscoverCharacteristics(p, _svc, chars)) if p == state.peripheral => {
        let required = required_characteristic_ids();
        let has_all = required.iter().all(|r| chars.contains(r));
        let command_writable = state.ble.command_write_kind(state.peripheral, required[0]).is_some();

        if has_all && command_writable {
          let characteristics = RequiredCharacteristics::new(required[0], required[1], required[2], required[3]);
          for characteristic in characteristics.notifying() {
            state.ble.request_notifications(state.peripheral, characteristic).await;
          }
          state.notified.clear();
          let _ = state.state_tx.send(PairingState::AwaitingNotificationUpdates);
          // Stash for the next branch via the tag_paired fields; easiest
          // to recompute since `required_characteristic_ids()` is pure.
        } else {
          let _ = state
            .state_tx
            .send(PairingState::Error(ConnectionError::CharacteristicDiscoveryError));
        }
      }

      (PairingState::AwaitingNotificationUpdates, BleEvent::DidUpdateNotificationState(p, characteristic, err)) if p == state.peripheral => {
        if let Some(e) = err {
          let _ = state
            .state_tx
            .send(PairingState::Error(ConnectionError::NotificationUpdateError(e.message)));
        } else {
          state.notified.insert(characteristic);
          let required = required_characteristic_ids();
          let characteristics = RequiredCharacteristics::new(required[0], required[1], required[2], required[3]);
          let needed: HashSet<CharacteristicId> = characteristics.notifying().into_iter().collect();
          if needed.is_subset(&state.notified) {
            let _ = state.state_tx.send(PairingState::TagPaired {
              peripheral: state.peripheral,
              characteristics,
            });
          }
        }
      }

      (_, _) => {
        tracing::warn!("Pairing: no transition for this (state, event) pair");
        let _ = state
          .state_tx
          .send(PairingState::Error(ConnectionError::InternalError(
            "no transition".to_string(),
          )));
      }
    }
  }
}

#[cfg(test)]
mod test {
  use async_trait::async_trait;
  use jacquard_protocol::ble::BlePlatformError;
  use tokio::sync::broadcast;

  use super::*;

  /// `BleCentral` stand-in whose discover/notify calls are no-ops — the
  /// test drives `Pairing` entirely by pushing events on `events_tx`
  /// (spec §3.4).
  struct FakeBle {
    events_tx: broadcast::Sender<BleEvent>,
  }

  impl FakeBle {
    fn new() -> Arc<Self> {
      let (events_tx, _keepalive) = broadcast::channel(32);
      Arc::new(Self { events_tx })
    }
  }

  #[async_trait]
  impl BleCentral for FakeBle {
    async fn connect(&self, _peripheral: PeripheralId) {}
    async fn discover_services(&self, _peripheral: PeripheralId, _filter: ServiceId) {}
    async fn discover_characteristics(&self, _peripheral: PeripheralId, _service: ServiceId, _characteristics: &[CharacteristicId]) {}
    async fn request_notifications(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId) {}
    async fn write(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId, _data: Vec<u8>, _kind: WriteKind) -> Result<(), BlePlatformError> {
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

  /// Scenario 1 (first half): did_connect, did_discover_services, then
  /// did_discover_characteristics and three notify updates reach
  /// `tag_paired`.
  #[tokio::test]
  async fn happy_path_reaches_tag_paired() {
    let ble = FakeBle::new();
    let peripheral = PeripheralId(Uuid::nil());
    let pairing = Pairing::new(ble.clone(), peripheral);
    let mut state_rx = pairing.state_stream();

    let required = required_characteristic_ids();
    ble.events_tx.send(BleEvent::DidConnect(peripheral)).unwrap();
    ble.events_tx
      .send(BleEvent::DidDiscoverServices(peripheral, vec![ServiceId(JACQUARD_SERVICE_UUID)]))
      .unwrap();
    ble.events_tx
      .send(BleEvent::DidDiscoverCharacteristics(peripheral, ServiceId(JACQUARD_SERVICE_UUID), required.to_vec()))
      .unwrap();
    for characteristic in [required[1], required[2], required[3]] {
      ble.events_tx
        .send(BleEvent::DidUpdateNotificationState(peripheral, characteristic, None))
        .unwrap();
    }

    loop {
      let state = state_rx.borrow_and_update().clone();
      if let PairingState::TagPaired { characteristics, .. } = state {
        assert_eq!(characteristics.command(), required[0]);
        return;
      }
      state_rx.changed().await.unwrap();
    }
  }

  /// An unrelated disconnect-style event arriving once a required
  /// characteristic write fails surfaces `CharacteristicDiscoveryError`
  /// rather than hanging, proving the "no transition" fallback is an
  /// error, not a silent drop.
  #[tokio::test]
  async fn incomplete_characteristics_errors() {
    let ble = FakeBle::new();
    let peripheral = PeripheralId(Uuid::nil());
    let pairing = Pairing::new(ble.clone(), peripheral);
    let mut state_rx = pairing.state_stream();

    ble.events_tx.send(BleEvent::DidConnect(peripheral)).unwrap();
    ble.events_tx
      .send(BleEvent::DidDiscoverServices(peripheral, vec![ServiceId(JACQUARD_SERVICE_UUID)]))
      .unwrap();
    // Only one required characteristic discovered.
    ble.events_tx
      .send(BleEvent::DidDiscoverCharacteristics(
        peripheral,
        ServiceId(JACQUARD_SERVICE_UUID),
        vec![CharacteristicId(COMMAND_CHARACTERISTIC_UUID)],
      ))
      .unwrap();

    loop {
      let state = state_rx.borrow_and_update().clone();
      if let PairingState::Error(e) = state {
        assert_eq!(e, ConnectionError::CharacteristicDiscoveryError);
        return;
      }
      state_rx.changed().await.unwrap();
    }
  }

  #[test]
  fn terminal_states_are_tag_paired_and_error() {
    let tag_paired = PairingState::TagPaired {
      peripheral: PeripheralId(Uuid::nil()),
      characteristics: RequiredCharacteristics::new(
        CharacteristicId(COMMAND_CHARACTERISTIC_UUID),
        CharacteristicId(RESPONSE_CHARACTERISTIC_UUID),
        CharacteristicId(EVENT_CHARACTERISTIC_UUID),
        CharacteristicId(RAW_DATA_CHARACTERISTIC_UUID),
      ),
    };
    assert!(tag_paired.is_terminal());
    assert!(PairingState::Error(ConnectionError::ServiceDiscoveryError).is_terminal());
    assert!(!PairingState::Disconnected.is_terminal());
    assert!(!PairingState::BluetoothConnected.is_terminal());
  }

  #[test]
  fn jacquard_service_and_characteristic_uuids_are_distinct() {
    let ids = [
      JACQUARD_SERVICE_UUID,
      COMMAND_CHARACTERISTIC_UUID,
      RESPONSE_CHARACTERISTIC_UUID,
      EVENT_CHARACTERISTIC_UUID,
      RAW_DATA_CHARACTERISTIC_UUID,
    ];
    for (i, a) in ids.iter().enumerate() {
      for (j, b) in ids.iter().enumerate() {
        if i != j {
          assert_ne!(a, b);
        }
      }
    }
  }
}
