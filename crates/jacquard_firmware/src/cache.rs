// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Injected persisted firmware-metadata/image cache (spec §6): "a cache
//! keyed by `md5(\"dfuInfo_{vid}_{pid}\")` stores the JSON-encoded
//! `DFUUpdateInfo` and `md5(\"imageData_{vid}_{pid}\")` stores the binary
//! image. A 12-hour freshness window governs whether a forced refresh is
//! required."

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::model::DfuUpdateInfo;

/// Spec §6's literal freshness window.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

fn dfu_info_key(vendor_id: u32, product_id: u32) -> String {
  cache_key(&format!("dfuInfo_{vendor_id}_{product_id}"))
}

fn image_key(vendor_id: u32, product_id: u32) -> String {
  cache_key(&format!("imageData_{vendor_id}_{product_id}"))
}

fn cache_key(seed: &str) -> String {
  let digest = Md5::digest(seed.as_bytes());
  format!("{digest:x}")
}

/// Injected persisted cache. Spec §1 lists "local persistent cache for
/// firmware metadata/images" as an external collaborator.
#[async_trait]
pub trait FirmwareCache: Send + Sync {
  async fn get(&self, vendor_id: u32, product_id: u32) -> Option<DfuUpdateInfo>;
  async fn put(&self, info: &DfuUpdateInfo);
  async fn get_image(&self, vendor_id: u32, product_id: u32) -> Option<Vec<u8>>;
  async fn put_image(&self, vendor_id: u32, product_id: u32, image: &[u8]);
  /// Whether the cached record for `(vendor_id, product_id)`, if any, is
  /// still within the 12-hour freshness window.
  async fn is_fresh(&self, vendor_id: u32, product_id: u32) -> bool;
}

#[derive(Serialize, Deserialize)]
struct StampedRecord {
  fetched_at_unix_secs: u64,
  info: DfuUpdateInfo,
}

/// Default implementation: one JSON file per metadata record and one raw
/// binary file per image, under `root`.
pub struct JsonFileFirmwareCache {
  root: PathBuf,
}

impl JsonFileFirmwareCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn info_path(&self, vendor_id: u32, product_id: u32) -> PathBuf {
    self.root.join(format!("{}.json", dfu_info_key(vendor_id, product_id)))
  }

  fn image_path(&self, vendor_id: u32, product_id: u32) -> PathBuf {
    self.root.join(image_key(vendor_id, product_id))
  }

  async fn ensure_root(&self) {
    if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
      tracing::warn!(error = %e, root = %self.root.display(), "firmware cache: failed to create cache directory");
    }
  }

  async fn read_record(path: &Path) -> Option<StampedRecord> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
  }
}

#[async_trait]
impl FirmwareCache for JsonFileFirmwareCache {
  async fn get(&self, vendor_id: u32, product_id: u32) -> Option<DfuUpdateInfo> {
    let path = self.info_path(vendor_id, product_id);
    Self::read_record(&path).await.map(|record| record.info)
  }

  async fn put(&self, info: &DfuUpdateInfo) {
    self.ensure_root().await;
    let record = StampedRecord {
      fetched_at_unix_secs: now_unix_secs(),
      info: info.clone(),
    };
    let path = self.info_path(info.vendor_id, info.product_id);
    match serde_json::to_vec(&record) {
      Ok(bytes) => {
        if let Err(e) = tokio::fs::write(&path, bytes).await {
          tracing::warn!(error = %e, path = %path.display(), "firmware cache: failed to write metadata record");
        }
      }
      Err(e) => tracing::warn!(error = %e, "firmware cache: failed to serialize metadata record"),
    }
  }

  async fn get_image(&self, vendor_id: u32, product_id: u32) -> Option<Vec<u8>> {
    tokio::fs::read(self.image_path(vendor_id, product_id)).await.ok()
  }

  async fn put_image(&self, vendor_id: u32, product_id: u32, image: &[u8]) {
    self.ensure_root().await;
    let path = self.image_path(vendor_id, product_id);
    if let Err(e) = tokio::fs::write(&path, image).await {
      tracing::warn!(error = %e, path = %path.display(), "firmware cache: failed to write image");
    }
  }

  async fn is_fresh(&self, vendor_id: u32, product_id: u32) -> bool {
    let Some(record) = Self::read_record(&self.info_path(vendor_id, product_id)).await else {
      return false;
    };
    let age = now_unix_secs().saturating_sub(record.fetched_at_unix_secs);
    Duration::from_secs(age) < FRESHNESS_WINDOW
  }
}

fn now_unix_secs() -> u64 {
  SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod test {
  use std::collections::HashMap;
  use std::sync::Mutex;

  use super::*;

  #[test]
  fn cache_key_matches_spec_seed_convention() {
    // Spec gives the seed format, not a fixed digest; pin the md5 of a
    // known seed so a future crate-swap can't silently change the key.
    let key = dfu_info_key(0x1178_3008, 0x283B_E7A0);
    assert_eq!(key, cache_key("dfuInfo_294135816_674673056"));
  }

  #[test]
  fn freshness_window_is_twelve_hours() {
    assert_eq!(FRESHNESS_WINDOW, Duration::from_secs(43200));
  }

  /// In-memory stand-in for [`JsonFileFirmwareCache`] (spec §3.4): no
  /// filesystem access, freshness controlled directly by the test instead
  /// of by wall-clock time.
  #[derive(Default)]
  pub(crate) struct FakeCache {
    records: Mutex<HashMap<(u32, u32), DfuUpdateInfo>>,
    images: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    fresh: Mutex<HashMap<(u32, u32), bool>>,
  }

  impl FakeCache {
    pub(crate) fn new() -> Self {
      Self::default()
    }

    pub(crate) fn set_fresh(&self, vendor_id: u32, product_id: u32, fresh: bool) {
      self.fresh.lock().unwrap().insert((vendor_id, product_id), fresh);
    }
  }

  #[async_trait]
  impl FirmwareCache for FakeCache {
    async fn get(&self, vendor_id: u32, product_id: u32) -> Option<DfuUpdateInfo> {
      self.records.lock().unwrap().get(&(vendor_id, product_id)).cloned()
    }

    async fn put(&self, info: &DfuUpdateInfo) {
      self.records.lock().unwrap().insert((info.vendor_id, info.product_id), info.clone());
    }

    async fn get_image(&self, vendor_id: u32, product_id: u32) -> Option<Vec<u8>> {
      self.images.lock().unwrap().get(&(vendor_id, product_id)).cloned()
    }

    async fn put_image(&self, vendor_id: u32, product_id: u32, image: &[u8]) {
      self.images.lock().unwrap().insert((vendor_id, product_id), image.to_vec());
    }

    async fn is_fresh(&self, vendor_id: u32, product_id: u32) -> bool {
      self.fresh.lock().unwrap().get(&(vendor_id, product_id)).copied().unwrap_or(false)
    }
  }

  #[tokio::test]
  async fn fake_cache_round_trips_metadata_and_image() {
    let cache = FakeCache::new();
    let info = DfuUpdateInfo {
      date: "2026-01-01".to_string(),
      version: jacquard_core::message::SemanticVersion::new(1, 96, 0),
      status: crate::model::DfuUpdateStatus::Mandatory,
      vendor_id: 0x1178_3008,
      product_id: 0x283B_E7A0,
      module_id: None,
      download_url: "https://example.invalid/fw.bin".to_string(),
      image: None,
      crc: 0xABCD,
    };
    assert!(cache.get(info.vendor_id, info.product_id).await.is_none());
    cache.put(&info).await;
    assert_eq!(cache.get(info.vendor_id, info.product_id).await.unwrap().crc, info.crc);

    cache.put_image(info.vendor_id, info.product_id, &[9, 9, 9]).await;
    assert_eq!(cache.get_image(info.vendor_id, info.product_id).await.unwrap(), vec![9, 9, 9]);
  }

  #[tokio::test]
  async fn fake_cache_freshness_defaults_to_stale() {
    let cache = FakeCache::new();
    assert!(!cache.is_fresh(1, 1).await);
    cache.set_fresh(1, 1, true);
    assert!(cache.is_fresh(1, 1).await);
  }
}
