// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use enumflags2::{bitflags, BitFlags};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

/// Capability set a [`Component`] may expose (spec §3).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
  Led = 0b0001,
  Gesture = 0b0010,
  TouchStream = 0b0100,
  Haptic = 0b1000,
}

/// Semantic version (major.minor.micro), as carried in device-info and DFU
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SemanticVersion {
  pub major: u16,
  pub minor: u16,
  pub micro: u16,
}

impl SemanticVersion {
  pub fn new(major: u16, minor: u16, micro: u16) -> Self {
    Self { major, minor, micro }
  }

  /// Decimal-encoded `"MMmmmPPP"` form used in cloud firmware queries
  /// (spec §6): 3-digit zero-padded micro and minor.
  pub fn to_decimal_string(&self) -> String {
    format!("{}{:03}{:03}", self.major, self.minor, self.micro)
  }
}

impl std::fmt::Display for SemanticVersion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
  }
}

/// A tag or an attached gear unit (spec §3).
///
/// The `tag` component (`component_id == 0`) is singleton and immutable per
/// connection. Gear components are created on attach-notification and
/// their `component_id` is unstable across attachments.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Component {
  #[getset(get_copy = "pub")]
  component_id: u32,
  #[getset(get_copy = "pub")]
  vendor_id: u32,
  #[getset(get_copy = "pub")]
  product_id: u32,
  #[getset(get_copy = "pub")]
  module_id: Option<u32>,
  #[getset(get_copy = "pub")]
  capabilities: BitFlags<Capability>,
  #[getset(get_copy = "pub")]
  version: SemanticVersion,
  #[getset(get = "pub")]
  uuid: String,
}

impl Component {
  pub fn new(
    component_id: u32,
    vendor_id: u32,
    product_id: u32,
    module_id: Option<u32>,
    capabilities: BitFlags<Capability>,
    version: SemanticVersion,
    uuid: impl Into<String>,
  ) -> Self {
    Self {
      component_id,
      vendor_id,
      product_id,
      module_id,
      capabilities,
      version,
      uuid: uuid.into(),
    }
  }

  /// The tag component is singleton with `component_id == 0` (spec §3).
  pub fn is_tag(&self) -> bool {
    self.component_id == 0
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn decimal_version_string_zero_pads() {
    let v = SemanticVersion::new(1, 2, 3);
    assert_eq!(v.to_decimal_string(), "1002003");
  }

  #[test]
  fn tag_component_is_singleton_by_id() {
    let tag = Component::new(
      0,
      0x1178_3008,
      0x283B_E7A0,
      None,
      Capability::Led.into(),
      SemanticVersion::new(1, 96, 0),
      "abc-123",
    );
    assert!(tag.is_tag());
    let gear = Component::new(
      1,
      0x1178_3008,
      0x283B_E7A0,
      None,
      BitFlags::empty(),
      SemanticVersion::new(1, 0, 0),
      "def-456",
    );
    assert!(!gear.is_tag());
  }
}
