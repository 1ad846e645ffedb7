// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Firmware-update orchestrator (spec §4.7): runs preflight checks, a
//! module pre-step, one image-writer per update in sequence, then an
//! execute step that tolerates a tag reboot. Grounded on the teacher's
//! `server.rs` pattern of one owner driving several child tasks in
//! sequence and translating their outcomes into its own state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jacquard_connection::Connection;
use jacquard_core::message::{Domain, Opcode};
use jacquard_core::util::async_manager;
use jacquard_core::{FirmwareError, JacquardError};
use jacquard_protocol::ble::WriteKind;
use jacquard_protocol::transport::Transport;
use tokio::sync::{oneshot, watch, Notify};

use crate::cache::FirmwareCache;
use crate::cloud::{DeviceFirmwareParams, FirmwareCloud};
use crate::model::DfuUpdateInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
const REQUEST_RETRIES: u8 = 2;
const LOW_BATTERY_THRESHOLD: u8 = 10;
const POST_EXECUTE_WATCHDOG: Duration = Duration::from_secs(60);

/// State of the firmware-update orchestrator. Spec §4.7.
#[derive(Debug, Clone)]
pub enum FirmwareUpdateState {
  Idle,
  PreparingForTransfer,
  Transferring { progress: f32 },
  Transferred,
  Executing,
  Completed,
  Error(FirmwareError),
  Stopped,
}

impl FirmwareUpdateState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      FirmwareUpdateState::Completed | FirmwareUpdateState::Error(_) | FirmwareUpdateState::Stopped
    )
  }

  /// Spec §4.7: `stop_updates()` is only valid from these three states.
  fn stoppable(&self) -> bool {
    matches!(
      self,
      FirmwareUpdateState::PreparingForTransfer | FirmwareUpdateState::Transferring { .. } | FirmwareUpdateState::Transferred
    )
  }

  /// A run is "in progress" for the duplicate-`apply_updates()` check if
  /// it is neither fresh (`idle`) nor already finished.
  fn in_progress(&self) -> bool {
    !matches!(self, FirmwareUpdateState::Idle) && !self.is_terminal()
  }
}

struct ExecuteGate {
  trigger: Mutex<Option<oneshot::Sender<()>>>,
}

/// Orchestrates applying a batch of [`DfuUpdateInfo`] records to one
/// connected tag. One instance is meant to be reused across runs; a second
/// `apply_updates()` while a run is in progress is rejected (spec §4.7).
pub struct UpdateManager {
  connection: Arc<Connection>,
  should_auto_execute: bool,
  state_tx: watch::Sender<FirmwareUpdateState>,
  state_rx: watch::Receiver<FirmwareUpdateState>,
  stop: Arc<Notify>,
  should_stop: AtomicBool,
  execute_gate: Arc<ExecuteGate>,
}

impl UpdateManager {
  pub fn new(connection: Arc<Connection>, should_auto_execute: bool) -> Arc<Self> {
    let (state_tx, state_rx) = watch::channel(FirmwareUpdateState::Idle);
    Arc::new(Self {
      connection,
      should_auto_execute,
      state_tx,
      state_rx,
      stop: Arc::new(Notify::new()),
      should_stop: AtomicBool::new(false),
      execute_gate: Arc::new(ExecuteGate { trigger: Mutex::new(None) }),
    })
  }

  pub fn state_stream(&self) -> watch::Receiver<FirmwareUpdateState> {
    self.state_rx.clone()
  }

  /// Starts applying `updates` in order. Spec §4.7: rejected with
  /// `InvalidState` if a run is already in progress; does not disturb it.
  pub fn apply_updates(self: &Arc<Self>, updates: Vec<DfuUpdateInfo>) -> Result<(), FirmwareError> {
    if self.state_rx.borrow().in_progress() {
      return Err(FirmwareError::InvalidState("a firmware update is already in progress".to_string()));
    }
    self.should_stop.store(false, Ordering::SeqCst);
    let mgr = self.clone();
    async_manager::spawn(async move { mgr.run(updates).await });
    Ok(())
  }

  /// Releases a run parked at `transferred` awaiting manual execute (spec
  /// §4.7: "otherwise wait for `execute_updates()`"). A no-op if no run is
  /// currently waiting.
  pub fn execute_updates(&self) {
    if let Some(tx) = self.execute_gate.trigger.lock().expect("execute gate poisoned").take() {
      let _ = tx.send(());
    }
  }

  /// Spec §4.7: accepted only from `preparing_for_transfer`, `transferring`,
  /// or `transferred`; any other state is a precondition error.
  pub fn stop_updates(&self) -> Result<(), FirmwareError> {
    if !self.state_rx.borrow().stoppable() {
      return Err(FirmwareError::InvalidState(
        "stop_updates() is only valid while a transfer is preparing, running, or awaiting execute".to_string(),
      ));
    }
    self.should_stop.store(true, Ordering::SeqCst);
    self.stop.notify_waiters();
    Ok(())
  }

  fn set_state(&self, state: FirmwareUpdateState) {
    tracing::debug!(?state, "UpdateManager: state transition");
    let _ = self.state_tx.send(state);
  }

  async fn run(self: Arc<Self>, updates: Vec<DfuUpdateInfo>) {
    let Some(transport) = self.current_transport() else {
      self.set_state(FirmwareUpdateState::Error(FirmwareError::TagDisconnected));
      return;
    };

    match query_battery(&transport).await {
      Ok((level, charging)) if level < LOW_BATTERY_THRESHOLD && !charging => {
        self.set_state(FirmwareUpdateState::Error(FirmwareError::LowBattery));
        return;
      }
      Err(e) => {
        self.set_state(FirmwareUpdateState::Error(FirmwareError::Transfer(e.to_string())));
        return;
      }
      Ok(_) => {}
    }

    self.set_state(FirmwareUpdateState::PreparingForTransfer);

    let loaded_modules = match list_modules(&transport).await {
      Ok(modules) => modules,
      Err(e) => {
        self.set_state(FirmwareUpdateState::Error(FirmwareError::Transfer(e.to_string())));
        return;
      }
    };

    for update in &updates {
      if let Some(mid) = update.module_id {
        if loaded_modules.contains(&mid) {
          if let Err(e) = unload_module(&transport, mid).await {
            self.set_state(FirmwareUpdateState::Error(FirmwareError::Transfer(e.to_string())));
            return;
          }
        }
      }
    }

    self.set_state(FirmwareUpdateState::Transferring { progress: 0.0 });

    for (index, update) in updates.iter().enumerate() {
      let Some(image) = update.image.clone() else {
        self.set_state(FirmwareUpdateState::Error(FirmwareError::DataUnavailable));
        return;
      };

      let (iw_tx, mut iw_rx) = watch::channel(crate::image_writer::ImageWriterState::Idle);
      let component_id = update.module_id.unwrap_or(0);
      async_manager::spawn(crate::image_writer::run_image_writer(
        transport.clone(),
        component_id,
        update.vendor_id,
        update.product_id,
        image,
        iw_tx,
      ));

      loop {
        tokio::select! {
          _ = self.stop.notified() => {
            self.set_state(FirmwareUpdateState::Stopped);
            return;
          }
          changed = iw_rx.changed() => {
            if changed.is_err() {
              break;
            }
            let current = iw_rx.borrow().clone();
            match current {
              crate::image_writer::ImageWriterState::Writing { progress } => {
                let overall = (index as f32 + progress) / updates.len() as f32;
                self.set_state(FirmwareUpdateState::Transferring { progress: overall });
              }
              crate::image_writer::ImageWriterState::Complete => break,
              crate::image_writer::ImageWriterState::Error(e) => {
                self.set_state(FirmwareUpdateState::Error(FirmwareError::Transfer(e.to_string())));
                return;
              }
              _ => {}
            }
          }
        }
      }
    }

    self.set_state(FirmwareUpdateState::Transferred);

    if !self.should_auto_execute {
      let (tx, rx) = oneshot::channel();
      *self.execute_gate.trigger.lock().expect("execute gate poisoned") = Some(tx);
      tokio::select! {
        _ = self.stop.notified() => {
          self.set_state(FirmwareUpdateState::Stopped);
          return;
        }
        _ = rx => {}
      }
    }

    self.set_state(FirmwareUpdateState::Executing);

    for update in &updates {
      if let Err(e) = dfu_execute(&transport, update.vendor_id, update.product_id).await {
        self.set_state(FirmwareUpdateState::Error(FirmwareError::Execution(e.to_string())));
        return;
      }
    }

    let targets_tag = updates.iter().any(|u| u.module_id.is_none());
    if targets_tag {
      wait_for_tag_reboot_recovery(&self.connection, POST_EXECUTE_WATCHDOG).await;
      self.set_state(FirmwareUpdateState::Completed);
    } else {
      match wait_for_gear_execute_notification(&transport, POST_EXECUTE_WATCHDOG).await {
        true => self.set_state(FirmwareUpdateState::Completed),
        false => self.set_state(FirmwareUpdateState::Error(FirmwareError::Execution(
          "post-execute watchdog elapsed with no activation notification".to_string(),
        ))),
      }
    }
  }

  fn current_transport(&self) -> Option<Arc<Transport>> {
    self.connection.transport_stream().borrow().clone()
  }
}

/// Resolves the firmware metadata for `(vendor_id, product_id)`, consulting
/// the cache first (spec §6's 12-hour freshness window) and falling back to
/// the cloud, downloading the image when the update is actionable and not
/// already cached.
pub async fn check_for_update(
  cloud: &dyn FirmwareCloud,
  cache: &dyn FirmwareCache,
  params: &DeviceFirmwareParams,
) -> Result<DfuUpdateInfo, FirmwareError> {
  if cache.is_fresh(params.vendor_id, params.product_id).await {
    if let Some(mut cached) = cache.get(params.vendor_id, params.product_id).await {
      if cached.is_actionable() && cached.image.is_none() {
        if let Some(image) = cache.get_image(params.vendor_id, params.product_id).await {
          cached.image = Some(image);
        }
      }
      return Ok(cached);
    }
  }

  let mut info = cloud.get_device_firmware(params).await?;
  cache.put(&info).await;

  if info.is_actionable() {
    let image = cloud.download_image(&info.download_url).await?;
    cache.put_image(info.vendor_id, info.product_id, &image).await;
    info.image = Some(image);
  }

  Ok(info)
}

async fn query_battery(transport: &Arc<Transport>) -> Result<(u8, bool), FirmwareError> {
  let payload = enqueue(transport, Domain::Base, Opcode::BatteryStatus, Vec::new())
    .await
    .map_err(|e| FirmwareError::Transfer(e.to_string()))?;
  if payload.len() < 2 {
    return Err(FirmwareError::Transfer("battery_status payload truncated".to_string()));
  }
  Ok((payload[0], payload[1] != 0))
}

async fn list_modules(transport: &Arc<Transport>) -> Result<Vec<u32>, FirmwareError> {
  let payload = enqueue(transport, Domain::Module, Opcode::ListModules, Vec::new())
    .await
    .map_err(|e| FirmwareError::Transfer(e.to_string()))?;
  Ok(payload.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

async fn unload_module(transport: &Arc<Transport>, module_id: u32) -> Result<(), FirmwareError> {
  enqueue(transport, Domain::Module, Opcode::UnloadModule, module_id.to_le_bytes().to_vec())
    .await
    .map(|_| ())
    .map_err(|e| FirmwareError::Transfer(e.to_string()))
}

async fn dfu_execute(transport: &Arc<Transport>, vendor_id: u32, product_id: u32) -> Result<(), FirmwareError> {
  let mut payload = Vec::with_capacity(8);
  payload.extend_from_slice(&vendor_id.to_le_bytes());
  payload.extend_from_slice(&product_id.to_le_bytes());
  enqueue(transport, Domain::Dfu, Opcode::DfuExecute, payload)
    .await
    .map(|_| ())
    .map_err(|e| FirmwareError::Execution(e.to_string()))
}

/// Waits for the connection to drop its transport (reboot starting) and
/// publish a new one (reconnect complete), then for the first post-execute
/// activation notification on the new transport. Spec §4.7: completes
/// either way once the 60s watchdog elapses, since the reboot path may not
/// surface a distinguishable notification on every firmware revision.
async fn wait_for_tag_reboot_recovery(connection: &Arc<Connection>, watchdog: Duration) {
  let confirm = async {
    let mut transport_rx = connection.transport_stream();
    // Wait for the transport to clear — the reboot-triggered disconnect.
    while transport_rx.borrow().is_some() {
      if transport_rx.changed().await.is_err() {
        return;
      }
    }
    // Wait for a fresh transport — the reconnect completing.
    loop {
      if let Some(new_transport) = transport_rx.borrow().clone() {
        wait_for_gear_execute_notification(&new_transport, watchdog).await;
        return;
      }
      if transport_rx.changed().await.is_err() {
        return;
      }
    }
  };
  tokio::select! {
    _ = confirm => {}
    _ = tokio::time::sleep(watchdog) => {}
  }
}

async fn wait_for_gear_execute_notification(transport: &Arc<Transport>, watchdog: Duration) -> bool {
  use jacquard_core::message::Opcode as NotificationOpcode;
  use tokio::sync::broadcast::error::RecvError;

  let mut notifications = transport.notification_stream();
  let wait = async {
    loop {
      match notifications.recv().await {
        Ok(n) if matches!(n.opcode(), NotificationOpcode::DfuExecuteNotification) => return true,
        Ok(_) => continue,
        Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => return false,
      }
    }
  };
  tokio::select! {
    result = wait => result,
    _ = tokio::time::sleep(watchdog) => false,
  }
}

async fn enqueue(transport: &Arc<Transport>, domain: Domain, opcode: Opcode, payload: Vec<u8>) -> Result<Vec<u8>, JacquardError> {
  let (tx, rx) = oneshot::channel();
  transport.enqueue(
    domain,
    opcode,
    payload,
    WriteKind::WithResponse,
    REQUEST_RETRIES,
    REQUEST_TIMEOUT,
    false,
    false,
    move |result| {
      let _ = tx.send(result);
    },
  );
  match rx.await {
    Ok(Ok(Some(payload))) => Ok(payload),
    Ok(Ok(None)) => Ok(Vec::new()),
    Ok(Err(e)) => Err(e),
    Err(_) => Err(JacquardError::Connection(jacquard_core::ConnectionError::InternalError(
      "transport dropped response channel".to_string(),
    ))),
  }
}
