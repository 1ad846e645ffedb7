// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Injected BLE capability surface (spec §1's "Out of scope: the concrete
//! BLE stack"). Grounded on the teacher's `HardwareConnector` /
//! `HardwareSpecializer` / `HardwareInternal` trait trio
//! (`buttplug_server::device::hardware`): a small async trait the
//! application supplies a concrete scan/connect/discover/write/notify
//! implementation for, while this crate only ever programs against the
//! trait.

use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use jacquard_core::ConnectionError;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Opaque peripheral identifier, injected by the BLE capability (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub Uuid);

/// A GATT characteristic UUID, scoped to one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(pub Uuid);

/// A GATT service UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub Uuid);

/// Whether a BLE write expects a peripheral-side acknowledgement. Spec §4.2:
/// "`write_kind` is one of {with_response, without_response}."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
  WithResponse,
  WithoutResponse,
}

/// Events the BLE capability may deliver, keyed by the peripheral they
/// concern. The Pairing state machine and the Transport are both
/// consumers; the process-wide registry (`jacquard_connection::registry`)
/// routes by `PeripheralId` to the right consumer.
#[derive(Debug, Clone)]
pub enum BleEvent {
  DidConnect(PeripheralId),
  FailedToConnect(PeripheralId, BlePlatformError),
  DidDiscoverServices(PeripheralId, Vec<ServiceId>),
  DidDiscoverCharacteristics(PeripheralId, ServiceId, Vec<CharacteristicId>),
  DidUpdateNotificationState(PeripheralId, CharacteristicId, Option<BlePlatformError>),
  Notification(PeripheralId, CharacteristicId, Vec<u8>),
  DidRename(PeripheralId, String),
  DidDisconnect(PeripheralId, DisconnectReason),
}

/// A disconnect's originating cause, needed by the connection state
/// machine's reconnect policy (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
  UserInitiated,
  AdapterPoweredOff,
  LinkLost,
}

/// Platform-surface error, opaque beyond the one case the pairing state
/// machine must distinguish: "peer removed pairing info" (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlePlatformError {
  pub message: String,
  pub peer_removed_pairing_info: bool,
  pub write_not_permitted: bool,
}

impl BlePlatformError {
  pub fn other(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      peer_removed_pairing_info: false,
      write_not_permitted: false,
    }
  }
}

impl From<BlePlatformError> for ConnectionError {
  fn from(e: BlePlatformError) -> Self {
    if e.peer_removed_pairing_info {
      ConnectionError::PeerRemovedPairingInfo
    } else {
      ConnectionError::BluetoothConnectionError(e.message)
    }
  }
}

/// The four characteristics the Pairing state machine must locate before a
/// tag is usable (spec §3). Produced only by the Pairing machine.
#[derive(Debug, Clone, Copy, Getters, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct RequiredCharacteristics {
  command: CharacteristicId,
  response: CharacteristicId,
  event: CharacteristicId,
  raw_data: CharacteristicId,
}

impl RequiredCharacteristics {
  pub fn new(
    command: CharacteristicId,
    response: CharacteristicId,
    event: CharacteristicId,
    raw_data: CharacteristicId,
  ) -> Self {
    Self {
      command,
      response,
      event,
      raw_data,
    }
  }

  pub fn notifying(&self) -> [CharacteristicId; 3] {
    [self.response, self.event, self.raw_data]
  }
}

/// Injected BLE capability: scan, connect, discover, write, notify.
#[async_trait]
pub trait BleCentral: Send + Sync {
  async fn connect(&self, peripheral: PeripheralId);

  async fn discover_services(&self, peripheral: PeripheralId, filter: ServiceId);

  async fn discover_characteristics(
    &self,
    peripheral: PeripheralId,
    service: ServiceId,
    characteristics: &[CharacteristicId],
  );

  async fn request_notifications(&self, peripheral: PeripheralId, characteristic: CharacteristicId);

  async fn write(
    &self,
    peripheral: PeripheralId,
    characteristic: CharacteristicId,
    data: Vec<u8>,
    kind: WriteKind,
  ) -> Result<(), BlePlatformError>;

  /// Disconnects from the peripheral. Spec §5: "explicit `disconnect()` ...
  /// is required" to stop reconnection.
  async fn disconnect(&self, peripheral: PeripheralId);

  /// Subscribes to every event the BLE stack emits for `peripheral`.
  fn events(&self, peripheral: PeripheralId) -> broadcast::Receiver<BleEvent>;

  /// Reports which write semantics `characteristic` supports, preferring
  /// `WithResponse`, or `None` if it supports neither (spec §4.3,
  /// transition 4: "the command characteristic exposes at least one of
  /// {write, write_without_response}"). Answerable without an async round
  /// trip: GATT characteristic properties are known as of discovery.
  fn command_write_kind(&self, peripheral: PeripheralId, characteristic: CharacteristicId) -> Option<WriteKind>;
}
