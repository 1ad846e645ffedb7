// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Human-rendering codec for 32-bit vendor/product/module identifiers
//! (spec §3): four lowercase hex bytes separated by hyphens, e.g.
//! `"fb-57-a1-12"`.

/// Renders `n` as four lowercase hex bytes, most-significant byte first,
/// hyphen separated.
pub fn hex(n: u32) -> String {
  let bytes = n.to_be_bytes();
  bytes
    .iter()
    .map(|b| format!("{b:02x}"))
    .collect::<Vec<_>>()
    .join("-")
}

/// Parses the `hex` format back into a `u32`. Invalid strings decode to 0
/// with a logged assertion, per spec §3.
pub fn dec(s: &str) -> u32 {
  let parts: Vec<&str> = s.split('-').collect();
  if parts.len() != 4 {
    tracing::warn!(input = s, "hex_id::dec: expected 4 hyphen-separated byte groups");
    return 0;
  }
  let mut bytes = [0u8; 4];
  for (i, part) in parts.iter().enumerate() {
    match u8::from_str_radix(part, 16) {
      Ok(b) if part.len() == 2 => bytes[i] = b,
      _ => {
        tracing::warn!(input = s, "hex_id::dec: invalid byte group {part}");
        return 0;
      }
    }
  }
  u32::from_be_bytes(bytes)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn hex_matches_spec_example() {
    // 0xfb57a112
    assert_eq!(hex(0xfb57_a112), "fb-57-a1-12");
  }

  #[test]
  fn dec_hex_round_trip_for_all_bytes_patterns() {
    for n in [0u32, 1, 0xfb57_a112, u32::MAX, 0x1178_3008] {
      assert_eq!(dec(&hex(n)), n);
    }
  }

  #[test]
  fn hex_dec_round_trip_is_case_insensitive() {
    let upper = "FB-57-A1-12";
    assert_eq!(hex(dec(upper)), upper.to_lowercase());
  }

  #[test]
  fn invalid_string_decodes_to_zero() {
    assert_eq!(dec("not-a-valid-id-string"), 0);
    assert_eq!(dec("zz-00-00-00"), 0);
    assert_eq!(dec("ab-cd"), 0);
  }
}
