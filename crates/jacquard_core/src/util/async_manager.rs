// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Thin spawn/sleep shim so the rest of the workspace never names
//! `tokio::spawn` directly, matching the teacher's
//! `util::async_manager`/`util::sleep` indirection (kept as a seam for a
//! future non-tokio runtime, e.g. wasm).

use std::future::Future;
use std::time::Duration;

pub fn spawn<F>(future: F)
where
  F: Future<Output = ()> + Send + 'static,
{
  tokio::spawn(future);
}

pub async fn sleep(duration: Duration) {
  tokio::time::sleep(duration).await;
}
