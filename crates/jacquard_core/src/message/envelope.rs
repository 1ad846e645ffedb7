// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum_macros::{Display, EnumString};

/// Status codes carried on every [`ResponseEnvelope`]. Values are stable
/// over-the-wire integers (spec §6).
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr, Display,
)]
#[repr(u8)]
pub enum Status {
  Ok = 0,
  Unsupported = 1,
  BadParam = 2,
  Battery = 3,
  Hardware = 4,
  Auth = 5,
  DeviceType = 6,
  InvalidState = 7,
  FlashAccess = 8,
  Checksum = 9,
  Busy = 10,
  LowMemory = 15,
  AppTimeout = 253,
  AppUnknown = 254,
  Unknown = 255,
}

impl Status {
  pub fn is_ok(&self) -> bool {
    matches!(self, Status::Ok)
  }
}

/// Command domain. Jacquard multiplexes several command families over one
/// envelope; the domain selects which family an opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum Domain {
  Base,
  Dfu,
  Config,
  Module,
}

/// Opcode within a [`Domain`]. Spec §4.4/§4.6/§4.7/§6 name the opcodes this
/// core issues directly; application-level command opcodes are out of
/// scope and pass through as [`Opcode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
  Hello,
  Begin,
  DeviceInfo,
  UjtConfigWrite,
  DfuStatus,
  DfuPrepare,
  DfuWrite,
  DfuExecute,
  ListModules,
  UnloadModule,
  BatteryStatus,
  DfuExecuteNotification,
  AttachNotification,
  DetachNotification,
  /// Any opcode this core does not interpret directly; the caller's
  /// message codec is responsible for the payload.
  Other(u16),
}

impl std::fmt::Display for Opcode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Opcode::Other(code) => write!(f, "Other({code})"),
      other => write!(f, "{other:?}"),
    }
  }
}

/// Outer request message wrapping a typed, opaque payload (spec §3, §6).
///
/// `id` is assigned by the Transport at send time, not at enqueue time
/// (spec §4.2); until sent, a freshly constructed envelope carries `id = 0`
/// as a placeholder.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct RequestEnvelope {
  #[getset(get_copy = "pub")]
  id: u32,
  #[getset(get_copy = "pub")]
  domain: Domain,
  #[getset(get_copy = "pub")]
  opcode: Opcode,
  #[getset(get = "pub")]
  payload: Vec<u8>,
}

impl RequestEnvelope {
  pub fn new(domain: Domain, opcode: Opcode, payload: Vec<u8>) -> Self {
    Self {
      id: 0,
      domain,
      opcode,
      payload,
    }
  }

  /// Assigns the monotonic id at physical send time. Spec §4.2.
  pub(crate) fn assign_id(&mut self, id: u32) {
    self.id = id;
  }
}

/// Outer response message. Spec §3: "Exactly one response per sent
/// request; late responses are discarded with a warning."
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ResponseEnvelope {
  #[getset(get_copy = "pub")]
  id: u32,
  #[getset(get_copy = "pub")]
  status: Status,
  #[getset(get = "pub")]
  payload: Option<Vec<u8>>,
}

impl ResponseEnvelope {
  pub fn new(id: u32, status: Status, payload: Option<Vec<u8>>) -> Self {
    Self { id, status, payload }
  }
}

/// Notification message. Spec §3: "No ordering guarantee across domains;
/// within one domain, delivery order matches arrival order on the wire."
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Notification {
  #[getset(get_copy = "pub")]
  domain: Domain,
  #[getset(get_copy = "pub")]
  opcode: Opcode,
  #[getset(get = "pub")]
  payload: Vec<u8>,
}

impl Notification {
  pub fn new(domain: Domain, opcode: Opcode, payload: Vec<u8>) -> Self {
    Self {
      domain,
      opcode,
      payload,
    }
  }
}
