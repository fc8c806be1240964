// Local shard group registry
//
// Hosts every shard group of a single-process deployment: one
// `LocalShardNode` per group, each behind a swappable front so the split
// orchestrator can interpose its router. Doubles as the connector the
// shard client resolves endpoints against and as the provisioner the
// orchestrator drives.

use dashmap::DashMap;
use std::sync::Arc;

use super::LocalShardNode;
use crate::common::{KeyHasher, TripSwitch};
use crate::config::NodeConfig;
use crate::error::{AccessError, Result};
use crate::sharding::{
    ShardConnector, ShardGroupDescriptor, ShardGroupProvisioner, ShardNodeClient,
    SwappableNodeClient,
};
use crate::storage::EventStorage;

pub struct LocalShardGroupRegistry {
    node_config: NodeConfig,
    hasher: Arc<dyn KeyHasher>,
    trip: Arc<TripSwitch>,
    nodes: DashMap<String, Arc<LocalShardNode>>,
    fronts: DashMap<String, Arc<SwappableNodeClient>>,
    endpoints_by_name: DashMap<String, String>,
}

impl LocalShardGroupRegistry {
    pub fn new(
        node_config: NodeConfig,
        hasher: Arc<dyn KeyHasher>,
        trip: Arc<TripSwitch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_config,
            hasher,
            trip,
            nodes: DashMap::new(),
            fronts: DashMap::new(),
            endpoints_by_name: DashMap::new(),
        })
    }

    /// Bring up a shard group over the given storage and register its
    /// writer front under the descriptor's endpoint. The group inherits the
    /// registry's node configuration.
    pub fn create_group(
        &self,
        descriptor: &ShardGroupDescriptor,
        storage: Arc<dyn EventStorage>,
    ) -> Result<Arc<LocalShardNode>> {
        self.create_group_with_config(descriptor, storage, &self.node_config)
    }

    /// As `create_group`, with a per-group configuration override (e.g. a
    /// group whose readers skip reverse-index maintenance).
    pub fn create_group_with_config(
        &self,
        descriptor: &ShardGroupDescriptor,
        storage: Arc<dyn EventStorage>,
        config: &NodeConfig,
    ) -> Result<Arc<LocalShardNode>> {
        if let Some(existing) = self.nodes.get(&descriptor.name) {
            return Ok(existing.clone());
        }
        let node = LocalShardNode::new(
            config,
            storage,
            self.hasher.clone(),
            self.trip.clone(),
        )?;
        let front = SwappableNodeClient::new(node.clone() as Arc<dyn ShardNodeClient>);
        self.nodes.insert(descriptor.name.clone(), node.clone());
        self.fronts
            .insert(descriptor.writer_endpoint.clone(), front);
        self.endpoints_by_name
            .insert(descriptor.name.clone(), descriptor.writer_endpoint.clone());
        tracing::info!(
            "registered shard group '{}' at endpoint '{}'",
            descriptor.name,
            descriptor.writer_endpoint
        );
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Option<Arc<LocalShardNode>> {
        self.nodes.get(name).map(|node| node.clone())
    }
}

impl ShardConnector for LocalShardGroupRegistry {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardNodeClient>> {
        self.fronts
            .get(endpoint)
            .map(|front| front.clone() as Arc<dyn ShardNodeClient>)
            .ok_or_else(|| AccessError::Network(format!("unknown endpoint '{}'", endpoint)))
    }
}

impl ShardGroupProvisioner for LocalShardGroupRegistry {
    fn provision(
        &self,
        descriptor: &ShardGroupDescriptor,
        storage: Arc<dyn EventStorage>,
    ) -> Result<Arc<dyn ShardNodeClient>> {
        let node = self.create_group(descriptor, storage)?;
        Ok(node as Arc<dyn ShardNodeClient>)
    }

    fn decommission(&self, name: &str) -> Result<()> {
        self.nodes.remove(name);
        if let Some((_, endpoint)) = self.endpoints_by_name.remove(name) {
            self.fronts.remove(&endpoint);
        }
        tracing::info!("decommissioned shard group '{}'", name);
        Ok(())
    }

    fn writer_front(&self, descriptor: &ShardGroupDescriptor) -> Result<Arc<SwappableNodeClient>> {
        self.fronts
            .get(&descriptor.writer_endpoint)
            .map(|front| front.clone())
            .ok_or_else(|| {
                AccessError::NotFound(format!(
                    "no writer front registered for endpoint '{}'",
                    descriptor.writer_endpoint
                ))
            })
    }

    fn set_collision_tolerant(
        &self,
        descriptor: &ShardGroupDescriptor,
        tolerant: bool,
    ) -> Result<()> {
        let node = self.nodes.get(&descriptor.name).ok_or_else(|| {
            AccessError::NotFound(format!("shard group '{}'", descriptor.name))
        })?;
        node.writer().set_collision_tolerant(tolerant);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::sharding::ShardGroupRole;
    use crate::storage::MemoryEventStorage;

    fn descriptor(name: &str) -> ShardGroupDescriptor {
        ShardGroupDescriptor {
            name: name.to_string(),
            role: ShardGroupRole::User,
            hash_range_start: i32::MIN,
            writer_endpoint: format!("local://{}", name),
            reader_endpoints: Vec::new(),
            storage_instance: name.to_string(),
        }
    }

    fn registry() -> Arc<LocalShardGroupRegistry> {
        LocalShardGroupRegistry::new(
            NodeConfig::default(),
            Arc::new(Fnv1aKeyHasher),
            Arc::new(TripSwitch::new()),
        )
    }

    #[test]
    fn test_create_group_is_idempotent_by_name() {
        let registry = registry();
        let desc = descriptor("user-a");
        let first = registry
            .create_group(&desc, Arc::new(MemoryEventStorage::new()))
            .unwrap();
        let second = registry
            .create_group(&desc, Arc::new(MemoryEventStorage::new()))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.connect(&desc.writer_endpoint).is_ok());
    }

    #[test]
    fn test_per_group_config_override() {
        let registry = registry();
        let overridden = NodeConfig {
            store_bidirectional_mappings: false,
            ..NodeConfig::default()
        };
        let node = registry
            .create_group_with_config(
                &descriptor("user-lean"),
                Arc::new(MemoryEventStorage::new()),
                &overridden,
            )
            .unwrap();

        // the group's reader store was built without reverse indexes
        let store = node.reader().store();
        let err = store
            .read()
            .get_component_to_user_mappings(
                &crate::model::ApplicationComponent::new("Orders"),
                &crate::model::AccessLevel::new("View"),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidArgument(_)));

        // default-config groups keep the reverse indexes
        let node = registry
            .create_group(&descriptor("user-full"), Arc::new(MemoryEventStorage::new()))
            .unwrap();
        let store = node.reader().store();
        assert!(store
            .read()
            .get_component_to_user_mappings(
                &crate::model::ApplicationComponent::new("Orders"),
                &crate::model::AccessLevel::new("View"),
                false,
            )
            .is_ok());
    }

    #[test]
    fn test_decommission_removes_node_and_front() {
        let registry = registry();
        let desc = descriptor("user-a");
        registry
            .create_group(&desc, Arc::new(MemoryEventStorage::new()))
            .unwrap();

        registry.decommission(&desc.name).unwrap();
        assert!(registry.node(&desc.name).is_none());
        assert!(registry.connect(&desc.writer_endpoint).is_err());
    }
}
