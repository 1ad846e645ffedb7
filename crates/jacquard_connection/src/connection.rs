// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Top-level connection state machine (spec §4.5): owns the Pairing and
//! Protocol-init child machines in sequence, applies the reconnect
//! policies, runs the post-init configuration step, and detects the
//! hard-coded "bad firmware" recovery case.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use jacquard_core::message::{Component, Domain, Opcode, SemanticVersion};
use jacquard_core::util::async_manager;
use jacquard_core::ConnectionError;
use jacquard_protocol::ble::{BleCentral, BleEvent, DisconnectReason, PeripheralId};
use jacquard_protocol::transport::Transport;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::pairing::{Pairing, PairingState};
use crate::protocol_init::{run_protocol_init, ProtocolInitState};

/// Fixed total used for advisory progress counters (spec §4.5: "total is
/// fixed at 14").
pub const TOTAL_STEPS: u32 = 14;

/// Notification queue depth requested at the configuration step (spec
/// §4.5).
const NOTIFICATION_QUEUE_DEPTH: u8 = 14;

/// State of the top-level connection state machine. Spec §4.5.
#[derive(Debug, Clone)]
pub enum ConnectionState {
  PreparingToConnect,
  Connecting { step: u32, total: u32 },
  Initializing { step: u32, total: u32 },
  Configuring { step: u32, total: u32 },
  FirmwareUpdateInitiated,
  FirmwareTransferring { progress: f32 },
  FirmwareTransferCompleted,
  FirmwareExecuting,
  Connected(Component),
  Disconnected(Option<ConnectionError>),
}

impl ConnectionState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ConnectionState::Disconnected(_))
  }
}

/// Hook for delegating a firmware recovery run to `jacquard_firmware`
/// without this crate depending on it. Spec §4.5's "firmware-recovery
/// step" bridges to the firmware-update orchestrator through this trait;
/// the facade crate wires a concrete `UpdateManager`-backed implementation.
#[async_trait]
pub trait FirmwareRecoveryHook: Send + Sync {
  async fn start_recovery(&self, tag: Component);
}

/// Immutable settings for one `Connection`. Built via [`ConnectionBuilder`],
/// in the teacher's `ServerBuilder` shape (spec.md §9 ambient stack:
/// resolve configuration before any I/O starts).
#[derive(Getters, CopyGetters)]
pub struct ConnectionConfig {
  #[getset(get_copy = "pub")]
  connect_timeout: Duration,
  #[getset(get_copy = "pub")]
  protocol_init_timeout: Duration,
  #[getset(get_copy = "pub")]
  protocol_init_retries: u8,
  #[getset(get_copy = "pub")]
  mtu: usize,
  #[getset(get = "pub")]
  bad_firmware_versions: HashSet<SemanticVersion>,
  #[getset(get = "pub")]
  firmware_recovery_hook: Option<Arc<dyn FirmwareRecoveryHook>>,
}

/// Builder for [`ConnectionConfig`]. Defaults match spec.md's literal
/// constants (2.0s / 2 retries for protocol-init, queue depth 14).
pub struct ConnectionBuilder {
  connect_timeout: Duration,
  protocol_init_timeout: Duration,
  protocol_init_retries: u8,
  mtu: usize,
  bad_firmware_versions: HashSet<SemanticVersion>,
  firmware_recovery_hook: Option<Arc<dyn FirmwareRecoveryHook>>,
}

impl Default for ConnectionBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(20),
      protocol_init_timeout: Duration::from_millis(2000),
      protocol_init_retries: 2,
      // Typical negotiated ATT MTU; override if the platform reports a
      // different negotiated value for this peripheral.
      mtu: 185,
      bad_firmware_versions: HashSet::new(),
      firmware_recovery_hook: None,
    }
  }
}

impl ConnectionBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  pub fn protocol_init_timeout(mut self, timeout: Duration) -> Self {
    self.protocol_init_timeout = timeout;
    self
  }

  pub fn protocol_init_retries(mut self, retries: u8) -> Self {
    self.protocol_init_retries = retries;
    self
  }

  pub fn mtu(mut self, mtu: usize) -> Self {
    self.mtu = mtu;
    self
  }

  pub fn bad_firmware_version(mut self, version: SemanticVersion) -> Self {
    self.bad_firmware_versions.insert(version);
    self
  }

  pub fn firmware_recovery_hook(mut self, hook: Arc<dyn FirmwareRecoveryHook>) -> Self {
    self.firmware_recovery_hook = Some(hook);
    self
  }

  pub fn build(self) -> ConnectionConfig {
    ConnectionConfig {
      connect_timeout: self.connect_timeout,
      protocol_init_timeout: self.protocol_init_timeout,
      protocol_init_retries: self.protocol_init_retries,
      mtu: self.mtu,
      bad_firmware_versions: self.bad_firmware_versions,
      firmware_recovery_hook: self.firmware_recovery_hook,
    }
  }
}

enum AttemptOutcome {
  Connected(Component),
  Reconnect(ConnectionError),
  Fatal(ConnectionError),
}

/// Owns one peripheral's full connect/initialize/configure lifecycle,
/// including reconnection. Spec §4.5.
pub struct Connection {
  peripheral: PeripheralId,
  ble: Arc<dyn BleCentral>,
  config: ConnectionConfig,
  state_tx: watch::Sender<ConnectionState>,
  state_rx: watch::Receiver<ConnectionState>,
  transport_tx: watch::Sender<Option<Arc<Transport>>>,
  transport_rx: watch::Receiver<Option<Arc<Transport>>>,
  should_stop: AtomicBool,
}

impl Connection {
  pub fn new(ble: Arc<dyn BleCentral>, peripheral: PeripheralId, config: ConnectionConfig) -> Arc<Self> {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected(None));
    let (transport_tx, transport_rx) = watch::channel(None);
    Arc::new(Self {
      peripheral,
      ble,
      config,
      state_tx,
      state_rx,
      transport_tx,
      transport_rx,
      should_stop: AtomicBool::new(false),
    })
  }

  /// Replay-latest state stream.
  pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
    self.state_rx.clone()
  }

  /// The transport backing the current connect attempt, or `None` between
  /// attempts. A fresh `Some` is published each time `run_one_attempt`
  /// stands up a new `Transport`, which is how `jacquard_firmware`'s
  /// update manager observes a tag reboot followed by reconnection during
  /// the firmware-execute step (spec §4.7).
  pub fn transport_stream(&self) -> watch::Receiver<Option<Arc<Transport>>> {
    self.transport_rx.clone()
  }

  pub fn peripheral(&self) -> PeripheralId {
    self.peripheral
  }

  /// Starts the connect/reconnect loop on its own task. Spec §5: "each
  /// state machine owns a serial execution context." Consumes this `Arc`
  /// handle; callers that need to observe `state_stream()` or call
  /// `disconnect()` afterward should clone the `Arc` before calling this.
  pub fn connect(self: Arc<Self>) {
    async_manager::spawn(async move { self.run().await });
  }

  /// Stops reconnection and tells the BLE stack to disconnect. Spec §5:
  /// "explicit `disconnect()` ... is required" to stop reconnection.
  pub async fn disconnect(&self) {
    self.should_stop.store(true, Ordering::SeqCst);
    self.ble.disconnect(self.peripheral).await;
  }

  fn set_state(&self, state: ConnectionState) {
    tracing::debug!(?state, "Connection: state transition");
    let _ = self.state_tx.send(state);
  }

  async fn run(self: Arc<Self>) {
    loop {
      if self.should_stop.load(Ordering::SeqCst) {
        self.set_state(ConnectionState::Disconnected(None));
        return;
      }

      match self.run_one_attempt().await {
        AttemptOutcome::Connected(tag) => {
          if self.config.bad_firmware_versions.contains(&tag.version()) {
            self.set_state(ConnectionState::FirmwareUpdateInitiated);
            if let Some(hook) = self.config.firmware_recovery_hook.clone() {
              hook.start_recovery(tag).await;
            } else {
              tracing::warn!("Connection: firmware recovery needed but no recovery hook configured");
            }
            // The firmware execute step disconnects and reconnects the
            // tag; do not expose `connected` for this run (spec §4.5).
            match self.wait_for_disconnect().await {
              Some(e) if !self.should_reconnect(&e, true) => {
                self.set_state(ConnectionState::Disconnected(Some(e)));
                return;
              }
              _ => continue,
            }
          }

          self.set_state(ConnectionState::Connected(tag));
          match self.wait_for_disconnect().await {
            Some(e) if !self.should_reconnect(&e, true) => {
              self.set_state(ConnectionState::Disconnected(Some(e)));
              return;
            }
            _ => continue,
          }
        }
        AttemptOutcome::Reconnect(e) => {
          self.set_state(ConnectionState::Disconnected(Some(e)));
          continue;
        }
        AttemptOutcome::Fatal(e) => {
          self.set_state(ConnectionState::Disconnected(Some(e)));
          return;
        }
      }
    }
  }

  /// Runs one full preparing_to_connect → connected attempt, or returns the
  /// error that ended it.
  async fn run_one_attempt(&self) -> AttemptOutcome {
    let mut step = 0u32;
    let mut reached_init = false;

    let _ = self.transport_tx.send(None);
    self.set_state(ConnectionState::PreparingToConnect);
    self.ble.connect(self.peripheral).await;
    step += 1;
    self.set_state(ConnectionState::Connecting { step, total: TOTAL_STEPS });

    let pairing = Pairing::new(self.ble.clone(), self.peripheral);
    let pairing_rx = pairing.state_stream();
    let deadline = Instant::now() + self.config.connect_timeout;

    let pairing_terminal = tokio::select! {
      biased;
      _ = tokio::time::sleep_until(deadline) => {
        let e = ConnectionError::ConnectionTimeout;
        return if self.should_reconnect(&e, reached_init) {
          AttemptOutcome::Reconnect(e)
        } else {
          AttemptOutcome::Fatal(e)
        };
      }
      state = wait_for_terminal(pairing_rx, step) => state,
    };

    let characteristics = match pairing_terminal.0 {
      PairingState::TagPaired { characteristics, .. } => characteristics,
      PairingState::Error(e) => {
        return if self.should_reconnect(&e, reached_init) {
          AttemptOutcome::Reconnect(e)
        } else {
          AttemptOutcome::Fatal(e)
        };
      }
      _ => unreachable!("wait_for_terminal only returns terminal pairing states"),
    };
    step = pairing_terminal.1;

    // The watchdog is invalidated on entering `initializing` (spec §4.5).
    reached_init = true;
    step += 1;
    self.set_state(ConnectionState::Initializing { step, total: TOTAL_STEPS });

    let transport = Arc::new(Transport::new(
      self.ble.clone(),
      self.peripheral,
      characteristics,
      self.config.mtu,
      String::new(),
    ));

    let _ = self.transport_tx.send(Some(transport.clone()));

    let (init_tx, init_rx) = watch::channel(ProtocolInitState::Paired);
    {
      let transport = transport.clone();
      async_manager::spawn(async move {
        run_protocol_init(transport, init_tx).await;
      });
    }

    let (init_terminal, step_after_init) = wait_for_terminal(init_rx, step).await;
    step = step_after_init;

    let tag = match init_terminal {
      ProtocolInitState::TagInitialized(tag) => tag,
      ProtocolInitState::Error(e) => {
        return if self.should_reconnect(&e, reached_init) {
          AttemptOutcome::Reconnect(e)
        } else {
          AttemptOutcome::Fatal(e)
        };
      }
      _ => unreachable!("wait_for_terminal only returns terminal protocol-init states"),
    };

    step += 1;
    self.set_state(ConnectionState::Configuring { step, total: TOTAL_STEPS });

    if let Err(e) = configure(&transport, self.config.protocol_init_retries, self.config.protocol_init_timeout).await {
      return if self.should_reconnect(&e, reached_init) {
        AttemptOutcome::Reconnect(e)
      } else {
        AttemptOutcome::Fatal(e)
      };
    }

    AttemptOutcome::Connected(tag)
  }

  /// Waits for a disconnect not explicitly requested by this side. Spec
  /// §4.5's reconnect-on-disconnect policy: reconnect unless user-initiated
  /// or the adapter powered off.
  async fn wait_for_disconnect(&self) -> Option<ConnectionError> {
    let mut events = self.ble.events(self.peripheral);
    loop {
      match events.recv().await {
        Ok(BleEvent::DidDisconnect(p, reason)) if p == self.peripheral => {
          return match reason {
            DisconnectReason::UserInitiated => None,
            DisconnectReason::AdapterPoweredOff => Some(ConnectionError::BluetoothPowerOff),
            DisconnectReason::LinkLost => Some(ConnectionError::BluetoothConnectionError(
              "link lost".to_string(),
            )),
          };
        }
        Ok(_) => continue,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
          tracing::warn!(skipped = n, "Connection: lagged behind BLE event stream");
          continue;
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Spec §4.5: true unless `PeerRemovedPairingInfo` (permanently
  /// unrecoverable), forced true once the init phase has been reached even
  /// if a later phase times out. Preserved literally per the Open Question
  /// decision recorded in DESIGN.md: this quirk is not "fixed" even though
  /// no other documented error currently depends on it.
  fn should_reconnect(&self, e: &ConnectionError, reached_init_discovery: bool) -> bool {
    if matches!(e, ConnectionError::PeerRemovedPairingInfo) {
      return false;
    }
    if reached_init_discovery {
      return true;
    }
    match e {
      ConnectionError::BluetoothPowerOff => false,
      _ => true,
    }
  }
}

async fn wait_for_terminal<T: Clone>(mut rx: watch::Receiver<T>, mut step: u32) -> (T, u32)
where
  T: IsTerminalState,
{
  loop {
    let current = rx.borrow().clone();
    if current.is_terminal() {
      return (current, step);
    }
    step += 1;
    if rx.changed().await.is_err() {
      return (current, step);
    }
  }
}

trait IsTerminalState {
  fn is_terminal(&self) -> bool;
}

impl IsTerminalState for PairingState {
  fn is_terminal(&self) -> bool {
    PairingState::is_terminal(self)
  }
}

impl IsTerminalState for ProtocolInitState {
  fn is_terminal(&self) -> bool {
    ProtocolInitState::is_terminal(self)
  }
}

async fn configure(transport: &Arc<Transport>, retries: u8, timeout: Duration) -> Result<(), ConnectionError> {
  let (tx, rx) = oneshot::channel();
  transport.enqueue(
    Domain::Config,
    Opcode::UjtConfigWrite,
    vec![NOTIFICATION_QUEUE_DEPTH],
    jacquard_protocol::ble::WriteKind::WithResponse,
    retries,
    timeout,
    false,
    false,
    move |result| {
      let _ = tx.send(result);
    },
  );
  match rx.await {
    Ok(Ok(_)) => Ok(()),
    Ok(Err(e)) => Err(ConnectionError::InternalError(format!("configuration write failed: {e}"))),
    Err(_) => Err(ConnectionError::InternalError(
      "transport dropped configuration response channel".to_string(),
    )),
  }
}
