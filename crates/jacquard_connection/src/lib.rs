// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pairing, protocol-initialization, and top-level connection state
//! machines, plus the process-wide peripheral registry (spec §4.3–§4.5,
//! §5).

pub mod connection;
pub mod pairing;
pub mod protocol_init;
pub mod registry;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, ConnectionState, FirmwareRecoveryHook};
pub use pairing::{Pairing, PairingState};
pub use protocol_init::ProtocolInitState;
pub use registry::{PeripheralRegistry, REGISTRY};
