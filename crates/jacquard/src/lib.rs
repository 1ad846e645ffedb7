// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Facade over the Jacquard connection/protocol core: re-exports the
//! public surface of `jacquard_core`, `jacquard_protocol`,
//! `jacquard_connection`, and `jacquard_firmware` under one crate name for
//! application code, and wires the firmware-recovery hook between the
//! connection and firmware crates.

pub mod recovery;

pub use jacquard_connection::{Connection, ConnectionBuilder, ConnectionConfig, ConnectionState, PeripheralRegistry, REGISTRY};
pub use jacquard_core::message::{Capability, Component, Domain, Notification, Opcode, SemanticVersion, Status};
pub use jacquard_core::{ConnectionError, FirmwareError, JacquardError, JacquardResult, TransportError};
pub use jacquard_firmware::{
  check_for_update, DeviceFirmwareParams, DfuUpdateInfo, DfuUpdateStatus, FirmwareCache, FirmwareCloud, FirmwareUpdateState,
  HttpFirmwareCloud, ImageWriterState, JsonFileFirmwareCache, UpdateManager,
};
pub use jacquard_protocol::ble::{
  BleCentral, BleEvent, BlePlatformError, CharacteristicId, DisconnectReason, PeripheralId, RequiredCharacteristics, ServiceId, WriteKind,
};

use std::sync::Arc;

pub use recovery::CloudFirmwareRecovery;

/// Builds a `Connection` whose firmware-recovery step is backed by
/// `cloud`/`cache` via [`CloudFirmwareRecovery`]. This is the entry point
/// most applications want; [`ConnectionBuilder`] remains available directly
/// for callers that don't need cloud-driven recovery wired up.
pub fn connect_with_cloud_recovery(
  ble: Arc<dyn BleCentral>,
  peripheral: PeripheralId,
  cloud: Arc<dyn FirmwareCloud>,
  cache: Arc<dyn FirmwareCache>,
  configure: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder,
) -> Arc<Connection> {
  let recovery = CloudFirmwareRecovery::new(cloud, cache);
  let builder = configure(ConnectionBuilder::new().firmware_recovery_hook(recovery.clone()));
  let connection = Connection::new(ble, peripheral, builder.build());
  recovery.bind(&connection);
  connection.clone().connect();
  connection
}
