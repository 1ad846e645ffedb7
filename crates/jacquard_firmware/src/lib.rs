// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Image-writer and firmware-update state machines, the injected cloud
//! client, and the injected persisted cache (spec §4.6, §4.7, §6).

pub mod cache;
pub mod cloud;
pub mod image_writer;
pub mod model;
pub mod update_manager;

pub use cache::{FirmwareCache, JsonFileFirmwareCache};
pub use cloud::{DeviceFirmwareParams, FirmwareCloud, HttpFirmwareCloud};
pub use image_writer::ImageWriterState;
pub use model::{DfuUpdateInfo, DfuUpdateStatus};
pub use update_manager::{check_for_update, FirmwareUpdateState, UpdateManager};
