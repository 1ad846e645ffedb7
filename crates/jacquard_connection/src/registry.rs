// Jacquard SDK Source Code File
//
// Copyright 2026 Jacquard SDK Contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Process-wide peripheral registry (spec §5): "a single process-wide
//! registry maps peripheral id → connection-state-machine instance,
//! protected by a mutex. The registry prevents two concurrent connection
//! attempts against the same tag." Grounded on the teacher's use of
//! `dashmap` for shared concurrent maps (`buttplug_server` depends on it);
//! `dashmap::DashMap`'s sharded locking gives per-key exclusion without a
//! single coarse lock.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jacquard_protocol::ble::{BleCentral, PeripheralId};
use once_cell::sync::Lazy;

use crate::connection::{Connection, ConnectionConfig};

/// Maps peripheral id to the connection state machine instance managing
/// it. The only mutable state outside a per-tag execution context (spec
/// §5).
pub struct PeripheralRegistry {
  connections: DashMap<PeripheralId, Arc<Connection>>,
}

impl Default for PeripheralRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl PeripheralRegistry {
  pub fn new() -> Self {
    Self {
      connections: DashMap::new(),
    }
  }

  /// Returns the existing connection for `peripheral`, or registers and
  /// starts a fresh one. If a connection is already registered, `ble` and
  /// `config` are ignored in favor of the one already running — the
  /// registry's whole purpose is excluding a second concurrent attempt
  /// against the same tag.
  pub fn connect(&self, ble: Arc<dyn BleCentral>, peripheral: PeripheralId, config: ConnectionConfig) -> Arc<Connection> {
    match self.connections.entry(peripheral) {
      Entry::Occupied(entry) => entry.get().clone(),
      Entry::Vacant(entry) => {
        let connection = Connection::new(ble, peripheral, config);
        entry.insert(connection.clone());
        connection.clone().connect();
        connection
      }
    }
  }

  pub fn get(&self, peripheral: PeripheralId) -> Option<Arc<Connection>> {
    self.connections.get(&peripheral).map(|entry| entry.clone())
  }

  /// Unregisters and disconnects. `dashmap` gives no automatic GC on
  /// disconnect; callers that are done with a tag must call this
  /// explicitly, matching spec §5's "explicit `disconnect()` is required."
  pub async fn remove(&self, peripheral: PeripheralId) {
    if let Some((_, connection)) = self.connections.remove(&peripheral) {
      connection.disconnect().await;
    }
  }

  pub fn len(&self) -> usize {
    self.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }
}

/// The process-wide singleton. BLE delegate callbacks route inbound events
/// by peripheral id through whichever `Connection` (and its child Pairing/
/// Transport tasks) is registered here.
pub static REGISTRY: Lazy<PeripheralRegistry> = Lazy::new(PeripheralRegistry::new);

#[cfg(test)]
mod test {
  use super::*;
  use jacquard_protocol::ble::{BleEvent, CharacteristicId, WriteKind};
  use tokio::sync::broadcast;
  use uuid::Uuid;

  struct NullBle;

  #[async_trait::async_trait]
  impl BleCentral for NullBle {
    async fn connect(&self, _peripheral: PeripheralId) {}
    async fn discover_services(&self, _peripheral: PeripheralId, _filter: jacquard_protocol::ble::ServiceId) {}
    async fn discover_characteristics(
      &self,
      _peripheral: PeripheralId,
      _service: jacquard_protocol::ble::ServiceId,
      _characteristics: &[CharacteristicId],
    ) {
    }
    async fn request_notifications(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId) {}
    async fn write(
      &self,
      _peripheral: PeripheralId,
      _characteristic: CharacteristicId,
      _data: Vec<u8>,
      _kind: WriteKind,
    ) -> Result<(), jacquard_protocol::ble::BlePlatformError> {
      Ok(())
    }
    async fn disconnect(&self, _peripheral: PeripheralId) {}
    fn events(&self, _peripheral: PeripheralId) -> broadcast::Receiver<BleEvent> {
      broadcast::channel(1).1
    }
    fn command_write_kind(&self, _peripheral: PeripheralId, _characteristic: CharacteristicId) -> Option<WriteKind> {
      Some(WriteKind::WithResponse)
    }
  }

  #[tokio::test]
  async fn second_connect_for_same_peripheral_returns_existing_instance() {
    let registry = PeripheralRegistry::new();
    let ble: Arc<dyn BleCentral> = Arc::new(NullBle);
    let peripheral = PeripheralId(Uuid::new_v4());

    let first = registry.connect(ble.clone(), peripheral, crate::connection::ConnectionBuilder::new().build());
    let second = registry.connect(ble, peripheral, crate::connection::ConnectionBuilder::new().build());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);

    registry.remove(peripheral).await;
    assert!(registry.is_empty());
  }
}
