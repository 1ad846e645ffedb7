// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Injected HTTPS cloud-firmware capability (spec §6): "an injected
//! capability exposes `get_device_firmware(params) -> DFUUpdateInfo` and
//! `download_image(url) -> bytes`." [`HttpFirmwareCloud`] is the default
//! `reqwest`-backed implementation, grounded on the teacher's
//! `lovense_connect_service_hardware.rs` HTTP caller.

use std::env;

use async_trait::async_trait;
use jacquard_core::message::SemanticVersion;
use jacquard_core::FirmwareError;
use serde::{Deserialize, Serialize};

use crate::model::{DfuUpdateInfo, DfuUpdateStatus};

const DEFAULT_BASE_URL: &str = "https://jacquard-firmware.googleapis.com";
const BASE_URL_ENV_VAR: &str = "JACQUARD_FIRMWARE_BASE_URL";

/// Query parameters for [`FirmwareCloud::get_device_firmware`] (spec §6).
#[derive(Debug, Clone)]
pub struct DeviceFirmwareParams {
  pub vendor_id: u32,
  pub product_id: u32,
  pub current_version: SemanticVersion,
  /// Obfuscated component id, opaque to this core.
  pub component_id: String,
  pub country_code: String,
  pub platform_tag: String,
  pub sdk_version: String,
  pub tag_version: SemanticVersion,
}

/// Injected cloud-firmware capability. Spec §1 lists HTTPS cloud access as
/// an external collaborator; implementors outside this crate may supply a
/// test double.
#[async_trait]
pub trait FirmwareCloud: Send + Sync {
  async fn get_device_firmware(&self, params: &DeviceFirmwareParams) -> Result<DfuUpdateInfo, FirmwareError>;
  async fn download_image(&self, url: &str) -> Result<Vec<u8>, FirmwareError>;
}

#[derive(Deserialize)]
struct DfuInfoResponse {
  date: String,
  version: String,
  status: String,
  #[serde(rename = "moduleId")]
  module_id: Option<u32>,
  #[serde(rename = "downloadUrl")]
  download_url: String,
  crc: u16,
}

#[derive(Serialize)]
struct DfuInfoRequest<'a> {
  vid: String,
  pid: String,
  current_version: String,
  component_id: &'a str,
  country_code: &'a str,
  platform_tag: &'a str,
  sdk_version: &'a str,
  tag_version: String,
}

/// Default implementation, issuing HTTPS requests via `reqwest`. Base URL
/// overridable via `JACQUARD_FIRMWARE_BASE_URL` (spec §6).
pub struct HttpFirmwareCloud {
  client: reqwest::Client,
  base_url: String,
}

impl HttpFirmwareCloud {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: env::var(BASE_URL_ENV_VAR).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
    }
  }
}

impl Default for HttpFirmwareCloud {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl FirmwareCloud for HttpFirmwareCloud {
  async fn get_device_firmware(&self, params: &DeviceFirmwareParams) -> Result<DfuUpdateInfo, FirmwareError> {
    let request = DfuInfoRequest {
      vid: format!("{:08x}", params.vendor_id),
      pid: format!("{:08x}", params.product_id),
      current_version: params.current_version.to_decimal_string(),
      component_id: &params.component_id,
      country_code: &params.country_code,
      platform_tag: &params.platform_tag,
      sdk_version: &params.sdk_version,
      tag_version: params.tag_version.to_decimal_string(),
    };

    let response = self
      .client
      .get(format!("{}/v1/device-firmware", self.base_url))
      .query(&request)
      .send()
      .await
      .map_err(|e| FirmwareError::DataUnavailable.also_log(&e))?;

    if !response.status().is_success() {
      tracing::warn!(status = %response.status(), "cloud firmware metadata request failed");
      return Err(FirmwareError::DataUnavailable);
    }

    let body: DfuInfoResponse = response
      .json()
      .await
      .map_err(|e| FirmwareError::DataUnavailable.also_log(&e))?;

    decode_dfu_info(params.vendor_id, params.product_id, body).ok_or(FirmwareError::DataUnavailable)
  }

  async fn download_image(&self, url: &str) -> Result<Vec<u8>, FirmwareError> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| FirmwareError::DataUnavailable.also_log(&e))?;

    if !response.status().is_success() {
      tracing::warn!(status = %response.status(), url, "firmware image download failed");
      return Err(FirmwareError::DataUnavailable);
    }

    response
      .bytes()
      .await
      .map(|b| b.to_vec())
      .map_err(|e| FirmwareError::DataUnavailable.also_log(&e))
  }
}

fn decode_dfu_info(vendor_id: u32, product_id: u32, body: DfuInfoResponse) -> Option<DfuUpdateInfo> {
  let version = parse_decimal_version(&body.version)?;
  let status = match body.status.as_str() {
    "mandatory" => DfuUpdateStatus::Mandatory,
    "optional" => DfuUpdateStatus::Optional,
    _ => DfuUpdateStatus::None,
  };
  Some(DfuUpdateInfo {
    date: body.date,
    version,
    status,
    vendor_id,
    product_id,
    module_id: body.module_id,
    download_url: body.download_url,
    image: None,
    crc: body.crc,
  })
}

/// Inverse of [`SemanticVersion::to_decimal_string`]: `"MMmmmPPP"`.
fn parse_decimal_version(s: &str) -> Option<SemanticVersion> {
  if s.len() < 7 {
    return None;
  }
  let split = s.len() - 6;
  let major: u16 = s[..split].parse().ok()?;
  let minor: u16 = s[split..split + 3].parse().ok()?;
  let micro: u16 = s[split + 3..].parse().ok()?;
  Some(SemanticVersion::new(major, minor, micro))
}

trait AlsoLog {
  fn also_log(self, e: &reqwest::Error) -> Self;
}

impl AlsoLog for FirmwareError {
  fn also_log(self, e: &reqwest::Error) -> Self {
    tracing::warn!(error = %e, "cloud firmware request failed");
    self
  }
}
