// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Fragmentation codec, the injected BLE capability surface, and the
//! request/response/notification transport (spec §4.1, §4.2).

pub mod ble;
mod fragmenter;
pub mod transport;

pub use fragmenter::Fragmenter;
