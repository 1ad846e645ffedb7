// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Bidirectional codec between whole packets and MTU-sized fragments
//! (spec §4.1). Pure: no I/O, never exposes a `Fragment` outside this
//! crate.

use jacquard_core::message::MAX_PACKET_LEN;
use jacquard_core::util::varint;

const FIRST_FLAG: u8 = 0x80;
const LAST_FLAG: u8 = 0x40;
const SEQ_MASK: u8 = 0x3F;

/// A single MTU-sized fragment ready to be written to the command
/// characteristic. Never exposed outside [`Fragmenter`]/`Transport`.
pub(crate) type Fragment = Vec<u8>;

/// Splits outgoing packets into MTU-sized fragments and reassembles
/// inbound fragments. One instance of reassembly state is live at a time,
/// matching the single in-flight request the Transport maintains.
#[derive(Default)]
pub struct Fragmenter {
  reassembly: Option<Reassembly>,
}

struct Reassembly {
  expected_len: usize,
  buffer: Vec<u8>,
  expected_seq: u8,
}

impl Fragmenter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Encodes `packet` into an ordered list of fragments, each no larger
  /// than `mtu - 3` bytes including the 1-byte header. Returns an empty
  /// list (and logs) if `packet` exceeds the 1024-byte maximum.
  pub fn encode(packet: &[u8], mtu: usize) -> Vec<Fragment> {
    if packet.len() > MAX_PACKET_LEN {
      tracing::warn!(
        len = packet.len(),
        "Fragmenter::encode: packet exceeds maximum encodable length"
      );
      return Vec::new();
    }

    let effective = mtu.saturating_sub(3);
    // 1 byte is always spent on the fragment header.
    let per_fragment_cap = effective.saturating_sub(1);

    let len_prefix = varint::encode(packet.len() as i64);

    // Single-fragment case: header + len_prefix + all packet bytes fit.
    if len_prefix.len() + packet.len() <= per_fragment_cap {
      let mut fragment = Vec::with_capacity(1 + len_prefix.len() + packet.len());
      fragment.push(FIRST_FLAG | LAST_FLAG);
      fragment.extend_from_slice(&len_prefix);
      fragment.extend_from_slice(packet);
      return vec![fragment];
    }

    let mut fragments = Vec::new();
    let mut seq: u8 = 0;

    // First fragment carries the varint length prefix.
    let first_data_cap = per_fragment_cap.saturating_sub(len_prefix.len());
    let first_chunk_len = first_data_cap.min(packet.len());
    let mut remaining = &packet[first_chunk_len..];

    let mut first_fragment = Vec::with_capacity(1 + len_prefix.len() + first_chunk_len);
    first_fragment.push(FIRST_FLAG | (seq & SEQ_MASK));
    first_fragment.extend_from_slice(&len_prefix);
    first_fragment.extend_from_slice(&packet[..first_chunk_len]);
    fragments.push(first_fragment);
    seq = seq.wrapping_add(1);

    while !remaining.is_empty() {
      let chunk_len = per_fragment_cap.min(remaining.len());
      let (chunk, rest) = remaining.split_at(chunk_len);
      remaining = rest;
      let is_last = remaining.is_empty();

      let mut header = seq & SEQ_MASK;
      if is_last {
        header |= LAST_FLAG;
      }
      let mut fragment = Vec::with_capacity(1 + chunk_len);
      fragment.push(header);
      fragment.extend_from_slice(chunk);
      fragments.push(fragment);
      seq = seq.wrapping_add(1);
    }

    fragments
  }

  /// Feeds one inbound fragment into the reassembly state machine.
  /// Returns `Some(packet)` once a complete packet has been reassembled.
  pub fn add_fragment(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.is_empty() {
      tracing::warn!("Fragmenter::add_fragment: empty fragment, dropped");
      return None;
    }
    let header = bytes[0];
    let is_first = header & FIRST_FLAG != 0;
    let is_last = header & LAST_FLAG != 0;
    let seq = header & SEQ_MASK;
    let payload = &bytes[1..];

    if is_first {
      let (len, consumed) = match varint::decode(payload) {
        Some(v) => v,
        None => {
          tracing::warn!("Fragmenter::add_fragment: malformed varint length prefix, dropped");
          self.reassembly = None;
          return None;
        }
      };
      let mut buffer = Vec::with_capacity(len as usize);
      buffer.extend_from_slice(&payload[consumed..]);

      if is_last {
        self.reassembly = None;
        return Some(buffer);
      }

      self.reassembly = Some(Reassembly {
        expected_len: len as usize,
        buffer,
        expected_seq: seq.wrapping_add(1) & SEQ_MASK,
      });
      return None;
    }

    let Some(state) = self.reassembly.as_mut() else {
      tracing::warn!("Fragmenter::add_fragment: continuation fragment with no reassembly in progress, dropped");
      return None;
    };

    if seq != state.expected_seq {
      tracing::warn!(
        expected = state.expected_seq,
        got = seq,
        "Fragmenter::add_fragment: out-of-order fragment, discarding in-progress packet"
      );
      self.reassembly = None;
      return None;
    }

    state.buffer.extend_from_slice(payload);
    state.expected_seq = state.expected_seq.wrapping_add(1) & SEQ_MASK;

    if is_last || state.buffer.len() >= state.expected_len {
      let packet = std::mem::take(&mut state.buffer);
      self.reassembly = None;
      Some(packet)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn round_trip(packet: &[u8], mtu: usize) -> Vec<u8> {
    let fragments = Fragmenter::encode(packet, mtu);
    let mut fragmenter = Fragmenter::new();
    let mut result = None;
    for fragment in fragments {
      result = fragmenter.add_fragment(&fragment);
    }
    result.expect("fragments should reassemble into a packet")
  }

  #[test]
  fn single_fragment_sets_first_and_last_bits() {
    let packet = b"hello";
    let fragments = Fragmenter::encode(packet, 64);
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0][0], 0xC0);
  }

  #[test]
  fn round_trip_small_packet() {
    let packet = b"hello jacquard";
    assert_eq!(round_trip(packet, 64), packet);
  }

  #[test]
  fn round_trip_across_many_mtus_and_lengths() {
    for mtu in [20usize, 23, 50, 100, 512] {
      for len in [1usize, 17, 127, 500, 1024] {
        let packet: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        assert_eq!(round_trip(&packet, mtu), packet, "mtu={mtu} len={len}");
      }
    }
  }

  #[test]
  fn multi_fragment_has_exactly_one_first_and_one_last_with_sequential_seq() {
    let packet: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
    let fragments = Fragmenter::encode(&packet, 23);
    assert!(fragments.len() > 1);

    let first_count = fragments.iter().filter(|f| f[0] & 0x80 != 0).count();
    let last_count = fragments.iter().filter(|f| f[0] & 0x40 != 0).count();
    assert_eq!(first_count, 1);
    assert_eq!(last_count, 1);

    for (i, fragment) in fragments.iter().enumerate() {
      assert_eq!(fragment[0] & 0x3F, (i as u8) & 0x3F);
    }
  }

  #[test]
  fn encode_rejects_oversized_packet() {
    let packet = vec![0u8; 1025];
    assert!(Fragmenter::encode(&packet, 64).is_empty());
  }

  #[test]
  fn out_of_order_fragment_discards_in_progress_packet() {
    let packet: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
    let fragments = Fragmenter::encode(&packet, 23);
    assert!(fragments.len() >= 3);

    let mut fragmenter = Fragmenter::new();
    assert_eq!(fragmenter.add_fragment(&fragments[0]), None);
    // Skip a fragment -- out of order.
    assert_eq!(fragmenter.add_fragment(&fragments[2]), None);
    // Even feeding the correct next fragment from the original sequence
    // after this point must not complete the original packet, since the
    // in-progress state was discarded.
    assert_eq!(fragmenter.add_fragment(&fragments[1]), None);
  }

  #[test]
  fn continuation_with_no_first_fragment_is_dropped() {
    let mut fragmenter = Fragmenter::new();
    assert_eq!(fragmenter.add_fragment(&[0x01, 0xAA]), None);
  }
}
