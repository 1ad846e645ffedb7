// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Owns one BLE peripheral, its three protocol characteristics, a request
//! queue, a fragmenter instance, and a reassembly buffer (spec §4.2).
//!
//! The scheduling loop is a single `tokio::select!` task, in the shape of
//! the teacher's `device_task::run_device_task` (priority-ordered branches:
//! inbound BLE event, queue work, timer).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jacquard_core::message::{Domain, Notification, Opcode, Status};
use jacquard_core::util::async_manager;
use jacquard_core::{JacquardError, TransportError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::ble::{BleCentral, BleEvent, CharacteristicId, PeripheralId, RequiredCharacteristics, WriteKind};
use crate::fragmenter::Fragmenter;

/// Result delivered to a request's `on_response` callback.
pub type TransportResult = Result<Option<Vec<u8>>, JacquardError>;

struct PendingRequest {
  domain: Domain,
  opcode: Opcode,
  payload: Vec<u8>,
  write_kind: WriteKind,
  retries_remaining: u8,
  timeout: Duration,
  skip_status_check: bool,
  fail_fast_on_write_error: bool,
  responder: oneshot::Sender<TransportResult>,
}

struct InFlight {
  id: u32,
  pending: PendingRequest,
  deadline: Instant,
}

struct NotificationCache {
  caching: bool,
  buffer: VecDeque<Notification>,
}

/// Request/response transport for one paired Jacquard tag.
pub struct Transport {
  queue_tx: mpsc::Sender<PendingRequest>,
  notification_tx: broadcast::Sender<Notification>,
  write_ack_tx: broadcast::Sender<Option<String>>,
  name_rx: watch::Receiver<String>,
  notification_cache: Arc<Mutex<NotificationCache>>,
  // Kept alive so broadcast sends never error with zero receivers.
  _notification_rx_keepalive: broadcast::Receiver<Notification>,
  _write_ack_rx_keepalive: broadcast::Receiver<Option<String>>,
}

impl Transport {
  pub fn new(
    ble: Arc<dyn BleCentral>,
    peripheral: PeripheralId,
    characteristics: RequiredCharacteristics,
    mtu: usize,
    initial_name: String,
  ) -> Self {
    let (queue_tx, queue_rx) = mpsc::channel(256);
    let (notification_tx, notification_rx_keepalive) = broadcast::channel(256);
    let (write_ack_tx, write_ack_rx_keepalive) = broadcast::channel(256);
    let (name_tx, name_rx) = watch::channel(initial_name);
    let notification_cache = Arc::new(Mutex::new(NotificationCache {
      caching: true,
      buffer: VecDeque::new(),
    }));

    let ble_events = ble.events(peripheral);

    async_manager::spawn(run_transport_loop(TransportLoopState {
      ble,
      peripheral,
      characteristics,
      mtu,
      queue_rx,
      ble_events,
      notification_tx: notification_tx.clone(),
      write_ack_tx: write_ack_tx.clone(),
      name_tx,
      notification_cache: notification_cache.clone(),
    }));

    Self {
      queue_tx,
      notification_tx,
      write_ack_tx,
      name_rx,
      notification_cache,
      _notification_rx_keepalive: notification_rx_keepalive,
      _write_ack_rx_keepalive: write_ack_rx_keepalive,
    }
  }

  /// Appends `request` to the queue. Returns immediately; `on_response`
  /// fires once the request resolves (success, final failure, or
  /// timeout). Spec §4.2.
  ///
  /// `fail_fast_on_write_error` is the protocol-init phase's opt-in to
  /// spec §4.4's "any other write error is fatal": the general §4.2
  /// request/response contract instead folds a physical write failure into
  /// the ordinary retry budget, the same as a response timeout would.
  pub fn enqueue<F>(
    &self,
    domain: Domain,
    opcode: Opcode,
    payload: Vec<u8>,
    write_kind: WriteKind,
    retries: u8,
    timeout: Duration,
    skip_status_check: bool,
    fail_fast_on_write_error: bool,
    on_response: F,
  ) where
    F: FnOnce(TransportResult) + Send + 'static,
  {
    let (responder, receiver) = oneshot::channel();
    let pending = PendingRequest {
      domain,
      opcode,
      payload,
      write_kind,
      retries_remaining: retries,
      timeout,
      skip_status_check,
      fail_fast_on_write_error,
      responder,
    };
    // `try_send` lands the request in the queue synchronously, in this
    // call's own stack frame, so two `enqueue` calls race only as the
    // calling tasks themselves are scheduled — never reordered a second
    // time by a spawned task awaiting a full channel (spec P4: FIFO
    // ordering of requests as submitted).
    if let Err(err) = self.queue_tx.try_send(pending) {
      let (pending, transport_err) = match err {
        mpsc::error::TrySendError::Full(pending) => (pending, TransportError::QueueFull),
        mpsc::error::TrySendError::Closed(pending) => (pending, TransportError::TransportShutDown),
      };
      let _ = pending.responder.send(Err(JacquardError::Transport(transport_err)));
      return;
    }
    async_manager::spawn(async move {
      if let Ok(result) = receiver.await {
        on_response(result);
      }
    });
  }

  /// Lazy multi-observer sequence of inbound notifications. The first call
  /// flushes any notifications buffered before a subscriber existed, in
  /// arrival order, then disables buffering for subsequent notifications.
  pub fn notification_stream(&self) -> broadcast::Receiver<Notification> {
    let rx = self.notification_tx.subscribe();
    let mut cache = self.notification_cache.lock().expect("notification cache poisoned");
    if cache.caching {
      cache.caching = false;
      for notification in cache.buffer.drain(..) {
        let _ = self.notification_tx.send(notification);
      }
    }
    rx
  }

  /// One item per physical write attempt to the command characteristic.
  pub fn write_ack_stream(&self) -> broadcast::Receiver<Option<String>> {
    self.write_ack_tx.subscribe()
  }

  /// Publishes the advertised name on connection and on any subsequent
  /// rename.
  pub fn name_stream(&self) -> watch::Receiver<String> {
    self.name_rx.clone()
  }
}

struct TransportLoopState {
  ble: Arc<dyn BleCentral>,
  peripheral: PeripheralId,
  characteristics: RequiredCharacteristics,
  mtu: usize,
  queue_rx: mpsc::Receiver<PendingRequest>,
  ble_events: broadcast::Receiver<BleEvent>,
  notification_tx: broadcast::Sender<Notification>,
  write_ack_tx: broadcast::Sender<Option<String>>,
  name_tx: watch::Sender<String>,
  notification_cache: Arc<Mutex<NotificationCache>>,
}

async fn run_transport_loop(mut state: TransportLoopState) {
  let mut queue: VecDeque<PendingRequest> = VecDeque::new();
  let mut in_flight: Option<InFlight> = None;
  let mut next_id: u32 = 1;
  let mut response_fragmenter = Fragmenter::new();
  let mut event_fragmenter = Fragmenter::new();

  loop {
    let timeout_fut = async {
      match &in_flight {
        Some(f) => tokio::time::sleep_until(f.deadline).await,
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      biased;

      maybe_req = state.queue_rx.recv() => {
        match maybe_req {
          Some(req) => queue.push_back(req),
          None => {
            tracing::info!("Transport: enqueue channel closed, shutting down loop");
            return;
          }
        }
      }

      event = state.ble_events.recv() => {
        match event {
          Ok(BleEvent::Notification(peripheral, characteristic, data)) if peripheral == state.peripheral => {
            handle_inbound(
              &state,
              characteristic,
              data,
              &mut response_fragmenter,
              &mut event_fragmenter,
              &mut in_flight,
            );
          }
          Ok(BleEvent::DidRename(peripheral, name)) if peripheral == state.peripheral => {
            let _ = state.name_tx.send(name);
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(n)) => {
            tracing::warn!(skipped = n, "Transport: lagged behind BLE event stream");
          }
          Err(broadcast::error::RecvError::Closed) => {
            tracing::info!("Transport: BLE event stream closed, shutting down loop");
            return;
          }
        }
      }

      _ = timeout_fut, if in_flight.is_some() => {
        let flight = in_flight.take().expect("guarded by is_some");
        handle_timeout(&state, flight, &mut in_flight).await;
      }
    }

    if in_flight.is_none() {
      if let Some(pending) = queue.pop_front() {
        send_pending(&state, pending, &mut next_id, &mut in_flight).await;
      }
    }
  }
}

fn handle_inbound(
  state: &TransportLoopState,
  characteristic: CharacteristicId,
  data: Vec<u8>,
  response_fragmenter: &mut Fragmenter,
  event_fragmenter: &mut Fragmenter,
  in_flight: &mut Option<InFlight>,
) {
  if characteristic == state.characteristics.response() {
    let Some(packet) = response_fragmenter.add_fragment(&data) else {
      return;
    };
    handle_response_packet(packet, in_flight);
  } else if characteristic == state.characteristics.event() {
    let Some(packet) = event_fragmenter.add_fragment(&data) else {
      return;
    };
    if packet.is_empty() {
      tracing::warn!("Transport: dropped notification with empty payload");
      return;
    }
    let notification = decode_notification(&packet);
    let mut cache = state.notification_cache.lock().expect("notification cache poisoned");
    if cache.caching {
      cache.buffer.push_back(notification.clone());
    }
    drop(cache);
    let _ = state.notification_tx.send(notification);
  }
}

fn handle_response_packet(packet: Vec<u8>, in_flight: &mut Option<InFlight>) {
  let Some((id, status, payload)) = decode_response(&packet) else {
    tracing::warn!("Transport: malformed response envelope, dropped");
    return;
  };

  let Some(flight) = in_flight.as_ref() else {
    tracing::warn!(id, "Transport: response received with no in-flight request, dropped");
    return;
  };

  if flight.id != id {
    tracing::warn!(
      expected = flight.id,
      got = id,
      "Transport: response id does not match in-flight request, dropped"
    );
    return;
  }

  let flight = in_flight.take().expect("checked above");
  let result = if status.is_ok() || flight.pending.skip_status_check {
    Ok(payload)
  } else {
    Err(JacquardError::Transport(TransportError::CommandFailed(status)))
  };
  let _ = flight.pending.responder.send(result);
}

async fn handle_timeout(state: &TransportLoopState, mut flight: InFlight, in_flight: &mut Option<InFlight>) {
  if flight.pending.retries_remaining == 0 {
    let _ = flight
      .pending
      .responder
      .send(Err(JacquardError::Transport(TransportError::RequestTimedOut)));
    return;
  }
  flight.pending.retries_remaining -= 1;
  tracing::debug!(
    id = flight.id,
    remaining = flight.pending.retries_remaining,
    "Transport: request timed out, retrying with same id"
  );
  // Retries reuse the original id and go straight back out, ahead of
  // anything still queued, preserving FIFO for everything behind it.
  send_with_id(state, flight.pending, flight.id, in_flight).await;
}

async fn send_pending(state: &TransportLoopState, pending: PendingRequest, next_id: &mut u32, in_flight: &mut Option<InFlight>) {
  let id = *next_id;
  *next_id = next_id.wrapping_add(1).max(1);
  send_with_id(state, pending, id, in_flight).await;
}

/// Performs one physical write attempt for `pending` under `id`, retrying
/// in place on write failure up to `pending.retries_remaining` unless
/// `pending.fail_fast_on_write_error` is set (spec §4.4's protocol-init-only
/// "any other write error is fatal"; ordinary requests fold a write failure
/// into the same retry budget a response timeout draws from, per spec §4.2).
async fn send_with_id(state: &TransportLoopState, mut pending: PendingRequest, id: u32, in_flight: &mut Option<InFlight>) {
  loop {
    let packet = encode_request(id, pending.domain, pending.opcode, &pending.payload);
    let fragments = Fragmenter::encode(&packet, state.mtu);
    let mut failure = None;
    for fragment in fragments {
      let result = state
        .ble
        .write(state.peripheral, state.characteristics.command(), fragment, pending.write_kind)
        .await;
      let ack = result.as_ref().err().map(|e| e.message.clone());
      let _ = state.write_ack_tx.send(ack);
      if let Err(e) = result {
        failure = Some(e);
        break;
      }
    }

    let Some(err) = failure else {
      let deadline = Instant::now() + pending.timeout;
      *in_flight = Some(InFlight { id, pending, deadline });
      return;
    };

    tracing::warn!(id, error = %err.message, "Transport: physical write failed");
    let transport_err = if err.write_not_permitted {
      TransportError::WriteNotPermitted
    } else {
      TransportError::WriteFailed(err.message)
    };

    if pending.fail_fast_on_write_error || pending.retries_remaining == 0 {
      let _ = pending.responder.send(Err(JacquardError::Transport(transport_err)));
      return;
    }

    pending.retries_remaining -= 1;
    tracing::debug!(
      id,
      remaining = pending.retries_remaining,
      "Transport: physical write failed, retrying with same id"
    );
  }
}

/// Encodes the outer request envelope. The inner payload bytes are already
/// serialized by the caller's opaque message codec (spec §1).
fn encode_request(id: u32, domain: Domain, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(8 + payload.len());
  out.extend_from_slice(&id.to_le_bytes());
  out.push(domain_tag(domain));
  out.extend_from_slice(&opcode_tag(opcode).to_le_bytes());
  out.extend_from_slice(payload);
  out
}

fn decode_response(packet: &[u8]) -> Option<(u32, Status, Option<Vec<u8>>)> {
  if packet.len() < 5 {
    return None;
  }
  let id = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
  let status = status_from_tag(packet[4]);
  let payload = if packet.len() > 5 {
    Some(packet[5..].to_vec())
  } else {
    None
  };
  Some((id, status, payload))
}

fn decode_notification(packet: &[u8]) -> Notification {
  if packet.len() < 3 {
    return Notification::new(Domain::Base, Opcode::Other(0), Vec::new());
  }
  let domain = domain_from_tag(packet[0]);
  let opcode = opcode_from_tag(u16::from_le_bytes([packet[1], packet[2]]));
  Notification::new(domain, opcode, packet[3..].to_vec())
}

fn domain_tag(domain: Domain) -> u8 {
  match domain {
    Domain::Base => 0,
    Domain::Dfu => 1,
    Domain::Config => 2,
    Domain::Module => 3,
  }
}

fn domain_from_tag(tag: u8) -> Domain {
  match tag {
    1 => Domain::Dfu,
    2 => Domain::Config,
    3 => Domain::Module,
    _ => Domain::Base,
  }
}

fn opcode_tag(opcode: Opcode) -> u16 {
  match opcode {
    Opcode::Hello => 0x0001,
    Opcode::Begin => 0x0002,
    Opcode::DeviceInfo => 0x0003,
    Opcode::UjtConfigWrite => 0x0004,
    Opcode::DfuStatus => 0x0005,
    Opcode::DfuPrepare => 0x0006,
    Opcode::DfuWrite => 0x0007,
    Opcode::DfuExecute => 0x0008,
    Opcode::ListModules => 0x0009,
    Opcode::UnloadModule => 0x000A,
    Opcode::BatteryStatus => 0x000B,
    Opcode::DfuExecuteNotification => 0x1001,
    Opcode::AttachNotification => 0x1002,
    Opcode::DetachNotification => 0x1003,
    Opcode::Other(code) => code,
  }
}

/// Reverses [`opcode_tag`] for the notification opcodes this core matches
/// on directly; anything else round-trips as `Other`.
fn opcode_from_tag(tag: u16) -> Opcode {
  match tag {
    0x1001 => Opcode::DfuExecuteNotification,
    0x1002 => Opcode::AttachNotification,
    0x1003 => Opcode::DetachNotification,
    other => Opcode::Other(other),
  }
}

#[cfg(test)]
mod test {
  use std::sync::Mutex as StdMutex;

  use async_trait::async_trait;
  use uuid::Uuid;

  use crate::ble::{BlePlatformError, ServiceId};

  use super::*;

  fn characteristics() -> RequiredCharacteristics {
    RequiredCharacteristics::new(
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
      CharacteristicId(Uuid::new_v4()),
    )
  }

  /// Fake `BleCentral`: decodes every physical write back into its id and
  /// payload marker byte, logs the write, and answers immediately with an
  /// `Ok` response on the response characteristic. Enough to drive
  /// `Transport` end to end without real hardware (spec §3.4).
  struct FakeBle {
    characteristics: RequiredCharacteristics,
    events_tx: broadcast::Sender<BleEvent>,
    reassembly: StdMutex<Fragmenter>,
    log: Arc<StdMutex<Vec<String>>>,
    written_ids: Arc<StdMutex<Vec<u32>>>,
  }

  impl FakeBle {
    fn new(characteristics: RequiredCharacteristics, log: Arc<StdMutex<Vec<String>>>, written_ids: Arc<StdMutex<Vec<u32>>>) -> Arc<Self> {
      let (events_tx, _keepalive) = broadcast::channel(64);
      Arc::new(Self {
        characteristics,
        events_tx,
        reassembly: StdMutex::new(Fragmenter::new()),
        log,
        written_ids,
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
      _kind: WriteKind,
    ) -> Result<(), BlePlatformError> {
      assert_eq!(characteristic, self.characteristics.command());
      let packet = self.reassembly.lock().unwrap().add_fragment(&data);
      let Some(packet) = packet else {
        return Ok(());
      };

      let id = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
      self.written_ids.lock().unwrap().push(id);
      let label = match packet.get(7) {
        Some(0xAA) => "A",
        Some(0xBB) => "B",
        _ => "?",
      };
      self.log.lock().unwrap().push(format!("write:{label}"));

      let mut response = Vec::with_capacity(5);
      response.extend_from_slice(&id.to_le_bytes());
      response.push(0); // Status::Ok tag
      let response_characteristic = self.characteristics.response();
      let events_tx = self.events_tx.clone();
      let log = self.log.clone();
      let label = label.to_string();
      tokio::spawn(async move {
        for fragment in Fragmenter::encode(&response, 185) {
          let _ = events_tx.send(BleEvent::Notification(peripheral, response_characteristic, fragment));
        }
        log.lock().unwrap().push(format!("response:{label}"));
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

  fn new_transport(log: Arc<StdMutex<Vec<String>>>, written_ids: Arc<StdMutex<Vec<u32>>>) -> Transport {
    let characteristics = characteristics();
    let ble: Arc<dyn BleCentral> = FakeBle::new(characteristics, log, written_ids);
    Transport::new(ble, PeripheralId(Uuid::new_v4()), characteristics, 185, "tag".to_string())
  }

  /// P4: enqueuing A then B with no `.await` between the two calls must
  /// resolve A's response before B is ever physically written, even though
  /// the response delivery and the next write happen on different tasks.
  #[tokio::test]
  async fn fifo_order_preserves_enqueue_call_order() {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let written_ids = Arc::new(StdMutex::new(Vec::new()));
    let transport = new_transport(log.clone(), written_ids.clone());

    let (done_a_tx, done_a_rx) = oneshot::channel();
    let (done_b_tx, done_b_rx) = oneshot::channel();

    transport.enqueue(
      Domain::Base,
      Opcode::Hello,
      vec![0xAA],
      WriteKind::WithResponse,
      0,
      Duration::from_secs(1),
      true,
      false,
      move |_| {
        let _ = done_a_tx.send(());
      },
    );
    transport.enqueue(
      Domain::Base,
      Opcode::Hello,
      vec![0xBB],
      WriteKind::WithResponse,
      0,
      Duration::from_secs(1),
      true,
      false,
      move |_| {
        let _ = done_b_tx.send(());
      },
    );

    done_a_rx.await.unwrap();
    done_b_rx.await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["write:A", "response:A", "write:B", "response:B"]);
  }

  /// P5: every physical send within one `Transport` carries a strictly
  /// greater id than the one before it.
  #[tokio::test]
  async fn ids_are_strictly_increasing_within_one_transport() {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let written_ids = Arc::new(StdMutex::new(Vec::new()));
    let transport = new_transport(log, written_ids.clone());

    for marker in [0xAAu8, 0xBB, 0xCC] {
      let (tx, rx) = oneshot::channel();
      transport.enqueue(
        Domain::Base,
        Opcode::Hello,
        vec![marker],
        WriteKind::WithResponse,
        0,
        Duration::from_secs(1),
        true,
        false,
        move |_| {
          let _ = tx.send(());
        },
      );
      rx.await.unwrap();
    }

    let ids = written_ids.lock().unwrap().clone();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[1] > w[0]), "ids not strictly increasing: {ids:?}");
  }
}

fn status_from_tag(tag: u8) -> Status {
  match tag {
    0 => Status::Ok,
    1 => Status::Unsupported,
    2 => Status::BadParam,
    3 => Status::Battery,
    4 => Status::Hardware,
    5 => Status::Auth,
    6 => Status::DeviceType,
    7 => Status::InvalidState,
    8 => Status::FlashAccess,
    9 => Status::Checksum,
    10 => Status::Busy,
    15 => Status::LowMemory,
    253 => Status::AppTimeout,
    254 => Status::AppUnknown,
    _ => Status::Unknown,
  }
}
