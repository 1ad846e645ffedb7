// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Command/notification schema and the encoding boundary (spec §3, §6).
//!
//! The serialized payload formats themselves are treated as an opaque,
//! externally supplied codec (spec §1's "Out of scope" list); this module
//! only defines the envelope shapes that wrap those payloads and the typed
//! domain objects (`Component`, status codes) that travel inside them.

mod component;
mod envelope;

pub use component::{Capability, Component, SemanticVersion};
pub use envelope::{Domain, Notification, Opcode, RequestEnvelope, ResponseEnvelope, Status};

/// Protocol version implemented by this core. Spec §1: "only version 2 is
/// implemented; the supported version is a single constant."
pub const PROTOCOL_VERSION: u8 = 2;

/// A fully serialized message, ready for fragmentation. Spec §3: "at most
/// 1024 bytes; larger packets are rejected at encode time."
pub type Packet = Vec<u8>;

pub const MAX_PACKET_LEN: usize = 1024;

/// Opaque codec boundary for a command payload. The concrete message
/// library (an external IDL-generated one, per spec §1) is expected to
/// implement this for each typed payload it exposes; this core never
/// inspects payload bytes itself.
pub trait MessageCodec: Sized {
  fn serialize(&self) -> Vec<u8>;
  fn deserialize(bytes: &[u8]) -> Option<Self>;
}
