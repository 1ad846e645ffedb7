// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Varint codec used to prefix the first fragment of a multi-fragment
//! packet with its total length (spec §4.1).
//!
//! Little-endian, 7 data bits per byte, high bit set means "more bytes
//! follow."

/// Encodes a non-negative length. Negative input is rejected with an empty
/// result and a logged assertion failure, matching spec §4.1's contract for
/// a generic signed-integer-accepting encoder.
pub fn encode(value: i64) -> Vec<u8> {
  if value < 0 {
    tracing::warn!(value, "varint::encode: refusing to encode a negative value");
    return Vec::new();
  }
  let mut v = value as u64;
  let mut out = Vec::new();
  loop {
    let mut byte = (v & 0x7F) as u8;
    v >>= 7;
    if v != 0 {
      byte |= 0x80;
      out.push(byte);
    } else {
      out.push(byte);
      break;
    }
  }
  out
}

/// Decodes a varint from the front of `bytes`. Returns the decoded value
/// and the number of bytes consumed, or `None` if `bytes` ends before a
/// terminating byte (continuation bit clear) is found.
pub fn decode(bytes: &[u8]) -> Option<(u64, usize)> {
  let mut value: u64 = 0;
  let mut shift = 0u32;
  for (i, &byte) in bytes.iter().enumerate() {
    value |= ((byte & 0x7F) as u64) << shift;
    if byte & 0x80 == 0 {
      return Some((value, i + 1));
    }
    shift += 7;
    if shift >= 64 {
      return None;
    }
  }
  None
}
