// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Image-writer state machine (spec §4.6): transfers one firmware image to
//! one component, resuming from whatever offset the tag already reports.

use std::sync::Arc;
use std::time::Duration;

use jacquard_core::message::{Domain, Opcode};
use jacquard_core::util::crc16;
use jacquard_core::{FirmwareError, JacquardError};
use jacquard_protocol::ble::WriteKind;
use jacquard_protocol::transport::Transport;
use tokio::sync::{oneshot, watch};

/// Bytes per `dfu_write` chunk (spec §4.6).
pub const CHUNK_SIZE: usize = 128;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
const REQUEST_RETRIES: u8 = 2;

/// Max consecutive chunk-ack mismatches at the same offset before giving up.
const MAX_CHUNK_RETRIES: u32 = 5;

/// State of the image-writer state machine. Spec §4.6.
#[derive(Debug, Clone)]
pub enum ImageWriterState {
  Idle,
  CheckingStatus,
  PreparingForWrite,
  Writing { progress: f32 },
  Complete,
  Error(FirmwareError),
}

impl ImageWriterState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ImageWriterState::Complete | ImageWriterState::Error(_))
  }
}

struct DfuStatusResponse {
  #[allow(dead_code)]
  final_size: u32,
  #[allow(dead_code)]
  final_crc: u16,
  current_size: u32,
  current_crc: u16,
}

/// Transfers `image` to component `component_id` on `(vendor_id,
/// product_id)`, resuming from whatever offset the tag reports already
/// written (spec §4.6's status-probe resume contract).
pub async fn run_image_writer(
  transport: Arc<Transport>,
  component_id: u32,
  vendor_id: u32,
  product_id: u32,
  image: Vec<u8>,
  state_tx: watch::Sender<ImageWriterState>,
) {
  let _ = state_tx.send(ImageWriterState::CheckingStatus);
  let image_crc = crc16::crc16(&image);

  let status = match probe_status(&transport, vendor_id, product_id).await {
    Ok(status) => status,
    Err(e) => {
      let _ = state_tx.send(ImageWriterState::Error(e));
      return;
    }
  };

  // P6: already fully transferred and verified — skip straight to complete.
  if status.current_size as usize == image.len() && status.current_crc == image_crc {
    let _ = state_tx.send(ImageWriterState::Complete);
    return;
  }

  let mut offset = if status.current_size == 0 {
    0usize
  } else {
    let resumable = status.current_size as usize;
    if resumable <= image.len() && status.current_crc == crc16::crc16(&image[..resumable]) {
      resumable
    } else {
      tracing::warn!("image_writer: current_crc mismatch on resume, restarting from zero");
      0
    }
  };

  let _ = state_tx.send(ImageWriterState::PreparingForWrite);
  if let Err(e) = prepare(&transport, component_id, vendor_id, product_id, image.len(), image_crc).await {
    let _ = state_tx.send(ImageWriterState::Error(e));
    return;
  }

  let _ = state_tx.send(ImageWriterState::Writing {
    progress: offset as f32 / image.len().max(1) as f32,
  });

  let mut chunk_retries = 0u32;
  while offset < image.len() {
    let end = (offset + CHUNK_SIZE).min(image.len());
    let chunk = &image[offset..end];

    match write_chunk(&transport, chunk, offset).await {
      Ok((offset_accepted, crc)) => {
        let expected_crc = crc16::crc16(&image[..offset_accepted]);
        if offset_accepted != end || crc != expected_crc {
          chunk_retries += 1;
          if chunk_retries > MAX_CHUNK_RETRIES {
            let e = FirmwareError::Transfer(format!("chunk ack offset/crc mismatch at offset {offset} after {MAX_CHUNK_RETRIES} retries"));
            let _ = state_tx.send(ImageWriterState::Error(e));
            return;
          }
          tracing::warn!(
            offset_accepted,
            expected_offset = end,
            chunk_retries,
            "image_writer: chunk ack offset/crc mismatch, retrying from last known-good offset"
          );
          // Stay at the last known-good `offset`; the loop retries the
          // same chunk next iteration.
          continue;
        }
        chunk_retries = 0;
        offset = offset_accepted;
        let _ = state_tx.send(ImageWriterState::Writing {
          progress: offset as f32 / image.len() as f32,
        });
      }
      Err(e) => {
        let _ = state_tx.send(ImageWriterState::Error(e));
        return;
      }
    }
  }

  let _ = state_tx.send(ImageWriterState::Complete);
}

async fn probe_status(transport: &Arc<Transport>, vendor_id: u32, product_id: u32) -> Result<DfuStatusResponse, FirmwareError> {
  let mut payload = Vec::with_capacity(8);
  payload.extend_from_slice(&vendor_id.to_le_bytes());
  payload.extend_from_slice(&product_id.to_le_bytes());

  let response = enqueue(transport, Domain::Dfu, Opcode::DfuStatus, payload)
    .await
    .map_err(|e| FirmwareError::Transfer(e.to_string()))?;

  decode_status(&response).ok_or_else(|| FirmwareError::Transfer("dfu_status payload truncated".to_string()))
}

fn decode_status(payload: &[u8]) -> Option<DfuStatusResponse> {
  if payload.len() < 12 {
    return None;
  }
  Some(DfuStatusResponse {
    final_size: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
    final_crc: u16::from_le_bytes([payload[4], payload[5]]),
    current_size: u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]),
    current_crc: u16::from_le_bytes([payload[10], payload[11]]),
  })
}

async fn prepare(
  transport: &Arc<Transport>,
  component_id: u32,
  vendor_id: u32,
  product_id: u32,
  image_len: usize,
  image_crc: u16,
) -> Result<(), FirmwareError> {
  let mut payload = Vec::with_capacity(18);
  payload.extend_from_slice(&component_id.to_le_bytes());
  payload.extend_from_slice(&vendor_id.to_le_bytes());
  payload.extend_from_slice(&product_id.to_le_bytes());
  payload.extend_from_slice(&(image_len as u32).to_le_bytes());
  payload.extend_from_slice(&image_crc.to_le_bytes());

  enqueue(transport, Domain::Dfu, Opcode::DfuPrepare, payload)
    .await
    .map(|_| ())
    .map_err(|e| FirmwareError::Transfer(e.to_string()))
}

async fn write_chunk(transport: &Arc<Transport>, chunk: &[u8], offset: usize) -> Result<(usize, u16), FirmwareError> {
  let mut payload = Vec::with_capacity(4 + chunk.len());
  payload.extend_from_slice(&(offset as u32).to_le_bytes());
  payload.extend_from_slice(chunk);

  let response = enqueue(transport, Domain::Dfu, Opcode::DfuWrite, payload)
    .await
    .map_err(|e| FirmwareError::Transfer(e.to_string()))?;

  if response.len() < 6 {
    return Err(FirmwareError::Transfer("dfu_write ack truncated".to_string()));
  }
  let offset_accepted = u32::from_le_bytes([response[0], response[1], response[2], response[3]]) as usize;
  let crc = u16::from_le_bytes([response[4], response[5]]);
  Ok((offset_accepted, crc))
}

async fn enqueue(transport: &Arc<Transport>, domain: Domain, opcode: Opcode, payload: Vec<u8>) -> Result<Vec<u8>, JacquardError> {
  let (tx, rx) = oneshot::channel();
  transport.enqueue(
    domain,
    opcode,
    payload,
    WriteKind::WithResponse,
    REQUEST_RETRIES,
    REQUEST_TIMEOUT,
    false,
    false,
    move |result| {
      let _ = tx.send(result);
    },
  );
  match rx.await {
    Ok(Ok(Some(payload))) => Ok(payload),
    Ok(Ok(None)) => Ok(Vec::new()),
    Ok(Err(e)) => Err(e),
    Err(_) => Err(JacquardError::Connection(jacquard_core::ConnectionError::InternalError(
      "transport dropped response channel".to_string(),
    ))),
  }
}
