// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Error taxonomy for the connection/protocol core (spec §7).

use displaydoc::Display;
use thiserror::Error;

pub type JacquardResult<T = ()> = Result<T, JacquardError>;

/// Errors arising while bringing a peripheral from paired-at-OS-level to
/// application-ready (pairing, protocol-init, and the top-level orchestrator).
#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
pub enum ConnectionError {
  /// internal state-machine inconsistency: {0}
  InternalError(String),
  /// outer envelope present but required payload missing: {0}
  MalformedResponse(String),
  /// platform error at connect/discover: {0}
  BluetoothConnectionError(String),
  /// peer removed pairing info at the OS level; user must re-pair
  PeerRemovedPairingInfo,
  /// required GATT service not found on peripheral
  ServiceDiscoveryError,
  /// required GATT characteristics not found on peripheral
  CharacteristicDiscoveryError,
  /// failed to subscribe to a required notify characteristic: {0}
  NotificationUpdateError(String),
  /// pre-init connection watchdog fired before initialization began
  ConnectionTimeout,
  /// bluetooth adapter was powered off
  BluetoothPowerOff,
  /// caller passed an object with no peripheral handle attached
  UnconnectableTag,
  /// identifier unknown to the BLE stack: {0}
  DeviceNotFound(String),
}

/// Errors arising from the request/response transport.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
pub enum TransportError {
  /// response status {0:?} was not ok and the opcode did not opt out of checks
  CommandFailed(crate::message::Status),
  /// request timed out after exhausting retries
  RequestTimedOut,
  /// underlying BLE write failed: {0}
  WriteFailed(String),
  /// peripheral rejected the write as not permitted for the given write kind
  WriteNotPermitted,
  /// packet exceeds the maximum encodable length of 1024 bytes
  PacketTooLarge(usize),
  /// request queue is full
  QueueFull,
  /// transport's event loop has already shut down
  TransportShutDown,
}

/// Errors arising from firmware download/transfer/execution.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
pub enum FirmwareError {
  /// firmware metadata or image unavailable from cloud or cache
  DataUnavailable,
  /// battery too low to start a firmware transfer
  LowBattery,
  /// transfer to the device failed: {0}
  Transfer(String),
  /// execution of the transferred image failed: {0}
  Execution(String),
  /// tag disconnected while a transfer or execute was pending
  TagDisconnected,
  /// operation invalid in the current state: {0}
  InvalidState(String),
}

/// Aggregation enum for every error this core can surface on a result
/// channel. Mirrors spec §7's table one variant family per row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JacquardError {
  #[error(transparent)]
  Connection(#[from] ConnectionError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Firmware(#[from] FirmwareError),
}
