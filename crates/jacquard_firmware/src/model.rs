// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Firmware metadata record shared by the cloud client and the persisted
//! cache (spec §3, §6).

use jacquard_core::message::SemanticVersion;
use serde::{Deserialize, Serialize};

/// Whether an available update must be installed. Spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfuUpdateStatus {
  Mandatory,
  Optional,
  None,
}

/// Metadata describing one available (or absent) firmware update for a
/// `(vendor_id, product_id[, module_id])` component. Spec §3's `DFUUpdateInfo`.
///
/// `image` is populated once [`crate::cloud::FirmwareCloud::download_image`]
/// has fetched the binary; records fetched from the cloud metadata endpoint
/// alone carry `image: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuUpdateInfo {
  /// Opaque date string as published by the cloud endpoint; not interpreted.
  pub date: String,
  pub version: SemanticVersion,
  pub status: DfuUpdateStatus,
  pub vendor_id: u32,
  pub product_id: u32,
  pub module_id: Option<u32>,
  pub download_url: String,
  pub image: Option<Vec<u8>>,
  pub crc: u16,
}

impl DfuUpdateInfo {
  pub fn is_actionable(&self) -> bool {
    !matches!(self.status, DfuUpdateStatus::None)
  }
}

/// Spec §3: "Equality: two records are equal iff (vid,pid,mid,version)
/// match and binary is present." A record with no downloaded image is
/// never equal to anything, including itself — it is not yet ready to
/// compare as "the same staged update."
impl PartialEq for DfuUpdateInfo {
  fn eq(&self, other: &Self) -> bool {
    self.image.is_some()
      && other.image.is_some()
      && self.vendor_id == other.vendor_id
      && self.product_id == other.product_id
      && self.module_id == other.module_id
      && self.version == other.version
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn info(image: Option<Vec<u8>>) -> DfuUpdateInfo {
    DfuUpdateInfo {
      date: "2026-01-01".to_string(),
      version: SemanticVersion::new(1, 96, 0),
      status: DfuUpdateStatus::Mandatory,
      vendor_id: 0x1178_3008,
      product_id: 0x283B_E7A0,
      module_id: None,
      download_url: "https://example.invalid/fw.bin".to_string(),
      image,
      crc: 0xABCD,
    }
  }

  #[test]
  fn equal_only_when_both_have_image_and_identity_matches() {
    let with_image = info(Some(vec![1, 2, 3]));
    let other_with_image = info(Some(vec![4, 5, 6]));
    assert_eq!(with_image, other_with_image);

    let without_image = info(None);
    assert_ne!(with_image, without_image);
    assert_ne!(without_image, without_image.clone());
  }

  #[test]
  fn differing_identity_is_never_equal() {
    let a = info(Some(vec![1]));
    let mut b = info(Some(vec![1]));
    b.module_id = Some(7);
    assert_ne!(a, b);
  }
}
