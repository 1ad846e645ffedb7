// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Wires `jacquard_connection`'s injected [`FirmwareRecoveryHook`] to a
//! concrete `jacquard_firmware::UpdateManager`, closing the loop the
//! connection crate leaves open to avoid depending on the firmware crate
//! directly (spec §4.5's "firmware-recovery step").

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use jacquard_connection::{Connection, FirmwareRecoveryHook};
use jacquard_core::message::Component;
use jacquard_firmware::{check_for_update, DeviceFirmwareParams, FirmwareCache, FirmwareCloud, UpdateManager};
use once_cell::sync::OnceCell;

const RECOVERY_COMPONENT_ID: &str = "0";
const RECOVERY_COUNTRY_CODE: &str = "US";
const RECOVERY_PLATFORM_TAG: &str = "rust-sdk";

/// Forces an immediate, auto-executing firmware update when the connection
/// machine detects a known-bad firmware version. Bound to its `Connection`
/// after construction via [`CloudFirmwareRecovery::bind`], since the
/// connection doesn't exist yet at the point its builder needs the hook.
pub struct CloudFirmwareRecovery {
  cloud: Arc<dyn FirmwareCloud>,
  cache: Arc<dyn FirmwareCache>,
  connection: OnceCell<Weak<Connection>>,
}

impl CloudFirmwareRecovery {
  pub fn new(cloud: Arc<dyn FirmwareCloud>, cache: Arc<dyn FirmwareCache>) -> Arc<Self> {
    Arc::new(Self {
      cloud,
      cache,
      connection: OnceCell::new(),
    })
  }

  /// Must be called once, after the `Connection` built with this hook
  /// exists, and before it starts connecting.
  pub fn bind(&self, connection: &Arc<Connection>) {
    if self.connection.set(Arc::downgrade(connection)).is_err() {
      tracing::warn!("CloudFirmwareRecovery: bind() called more than once, ignoring");
    }
  }
}

#[async_trait]
impl FirmwareRecoveryHook for CloudFirmwareRecovery {
  async fn start_recovery(&self, tag: Component) {
    let Some(connection) = self.connection.get().and_then(Weak::upgrade) else {
      tracing::warn!("CloudFirmwareRecovery: start_recovery called before bind()");
      return;
    };

    let params = DeviceFirmwareParams {
      vendor_id: tag.vendor_id(),
      product_id: tag.product_id(),
      current_version: tag.version(),
      component_id: RECOVERY_COMPONENT_ID.to_string(),
      country_code: RECOVERY_COUNTRY_CODE.to_string(),
      platform_tag: RECOVERY_PLATFORM_TAG.to_string(),
      sdk_version: env!("CARGO_PKG_VERSION").to_string(),
      tag_version: tag.version(),
    };

    let info = match check_for_update(self.cloud.as_ref(), self.cache.as_ref(), &params).await {
      Ok(info) => info,
      Err(e) => {
        tracing::warn!(error = %e, "CloudFirmwareRecovery: failed to resolve update metadata for bad firmware");
        return;
      }
    };

    if !info.is_actionable() || info.image.is_none() {
      tracing::warn!("CloudFirmwareRecovery: cloud reports no actionable update for a known-bad firmware version");
      return;
    }

    let manager = UpdateManager::new(connection, true);
    if let Err(e) = manager.apply_updates(vec![info]) {
      tracing::warn!(error = %e, "CloudFirmwareRecovery: failed to start forced update");
    }
  }
}
