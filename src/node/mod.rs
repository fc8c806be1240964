// # Shard Group Nodes
//
// Composition of the pipeline into deployable node roles: the writer
// (validate, buffer, persist, cache), the reader (local store plus refresh
// loop), and the router interposed during split/merge. `LocalShardNode`
// bundles a writer and a reader into one in-process shard group serving
// the full node surface; the network server exposes the same surface over
// TCP.

pub mod reader;
pub mod registry;
pub mod router;
pub mod writer;

pub use reader::{EventFeed, ReaderNode};
pub use registry::LocalShardGroupRegistry;
pub use router::RouterNode;
pub use writer::WriterNode;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::common::{KeyHasher, TripSwitch};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::event::{Event, EventAction, EventData};
use crate::network::protocol::{Query, QueryReply};
use crate::sharding::ShardNodeClient;
use crate::storage::EventStorage;
use crate::store::AccessStore;

fn sorted<T: Ord>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut collected: Vec<T> = items.into_iter().collect();
    collected.sort();
    collected
}

/// Dispatch one protocol query against a store snapshot. Collection
/// replies are sorted so fan-out merges are deterministic.
pub fn execute_query(store: &AccessStore, query: &Query) -> Result<QueryReply> {
    let reply = match query {
        Query::GetUsers => QueryReply::Users(sorted(store.get_users())),
        Query::GetGroups => QueryReply::Groups(sorted(store.get_groups())),
        Query::GetEntityTypes => QueryReply::EntityTypes(sorted(store.get_entity_types())),
        Query::GetEntities { entity_type } => {
            QueryReply::Entities(sorted(store.get_entities(entity_type)?))
        }
        Query::ContainsUser { user } => QueryReply::Bool(store.contains_user(user)),
        Query::ContainsGroup { group } => QueryReply::Bool(store.contains_group(group)),
        Query::ContainsEntityType { entity_type } => {
            QueryReply::Bool(store.contains_entity_type(entity_type))
        }
        Query::ContainsEntity { entity_type, entity } => {
            QueryReply::Bool(store.contains_entity(entity_type, entity))
        }
        Query::GetUserToGroupMappings { user, include_indirect } => {
            QueryReply::Groups(sorted(store.get_user_to_group_mappings(user, *include_indirect)?))
        }
        Query::GetGroupToUserMappings { group, include_indirect } => {
            QueryReply::Users(sorted(store.get_group_to_user_mappings(group, *include_indirect)?))
        }
        Query::GetGroupToGroupMappings { group, include_indirect } => QueryReply::Groups(sorted(
            store.get_group_to_group_mappings(group, *include_indirect)?,
        )),
        Query::GetGroupToGroupMappingsForGroups { groups } => {
            QueryReply::Groups(sorted(store.get_group_to_group_mappings_for_groups(groups)))
        }
        Query::GetUserToComponentMappings { user } => {
            QueryReply::ComponentLevels(sorted(store.get_user_to_component_mappings(user)?))
        }
        Query::GetGroupToComponentMappings { group } => {
            QueryReply::ComponentLevels(sorted(store.get_group_to_component_mappings(group)?))
        }
        Query::HasAccessToComponent { user, component, level } => {
            QueryReply::Bool(store.has_access_to_component(user, component, level)?)
        }
        Query::HasAccessToComponentByGroups { groups, component, level } => {
            QueryReply::Bool(store.has_access_to_component_by_groups(groups, component, level))
        }
        Query::GetAccessibleComponents { user } => {
            QueryReply::ComponentLevels(sorted(store.get_accessible_components(user)?))
        }
        Query::GetAccessibleComponentsByGroups { groups } => {
            QueryReply::ComponentLevels(sorted(store.get_accessible_components_by_groups(groups)))
        }
        Query::GetUserToEntityMappings { user } => {
            QueryReply::EntityRefs(sorted(store.get_user_to_entity_mappings(user)?))
        }
        Query::GetGroupToEntityMappings { group } => {
            QueryReply::EntityRefs(sorted(store.get_group_to_entity_mappings(group)?))
        }
        Query::HasAccessToEntity { user, entity_type, entity } => {
            QueryReply::Bool(store.has_access_to_entity(user, entity_type, entity)?)
        }
        Query::HasAccessToEntityByGroups { groups, entity_type, entity } => {
            QueryReply::Bool(store.has_access_to_entity_by_groups(groups, entity_type, entity))
        }
        Query::GetAccessibleEntities { user } => {
            QueryReply::EntityRefs(sorted(store.get_accessible_entities(user)?))
        }
        Query::GetAccessibleEntitiesOfType { user, entity_type } => {
            QueryReply::Entities(sorted(store.get_accessible_entities_of_type(user, entity_type)?))
        }
        Query::GetAccessibleEntitiesByGroups { groups } => {
            QueryReply::EntityRefs(sorted(store.get_accessible_entities_by_groups(groups)))
        }
    };
    Ok(reply)
}

/// A full in-process shard group: one writer, one reader fed by the
/// writer's cache, shared storage. Implements the same node surface the
/// network server exposes, so the shard client, orchestrator and tests can
/// run entirely in-process.
pub struct LocalShardNode {
    writer: Arc<WriterNode>,
    reader: Arc<ReaderNode>,
}

impl LocalShardNode {
    pub fn new(
        config: &NodeConfig,
        storage: Arc<dyn EventStorage>,
        hasher: Arc<dyn KeyHasher>,
        trip: Arc<TripSwitch>,
    ) -> Result<Arc<Self>> {
        let writer = WriterNode::new(config, storage.clone(), hasher, trip.clone())?;
        let reader = ReaderNode::new(config, writer.cache(), storage, trip)?;
        Ok(Arc::new(Self { writer, reader }))
    }

    pub fn writer(&self) -> Arc<WriterNode> {
        self.writer.clone()
    }

    pub fn reader(&self) -> Arc<ReaderNode> {
        self.reader.clone()
    }
}

#[async_trait]
impl ShardNodeClient for LocalShardNode {
    async fn apply_event(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>> {
        self.writer.process(action, data)
    }

    async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
        self.writer.ingest(events)
    }

    async fn query(&self, query: Query) -> Result<QueryReply> {
        // query-triggered refresh keeps single-node reads current without
        // waiting for the periodic tick
        if let Err(e) = self.reader.refresh().await {
            tracing::warn!("on-demand refresh before query failed: {}", e);
        }
        self.reader.execute_query(&query)
    }

    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        self.writer.cache().get_all_since(prior_event_id)
    }

    async fn processing_count(&self) -> Result<usize> {
        Ok(self.writer.event_processing_count())
    }

    async fn flush(&self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::config::{BufferConfig, FlushStrategyKind};
    use crate::model::{AccessLevel, ApplicationComponent, Group, User};
    use crate::storage::MemoryEventStorage;

    fn local_node() -> Arc<LocalShardNode> {
        let config = NodeConfig {
            buffer: BufferConfig {
                strategy: FlushStrategyKind::Manual,
                size_limit: 10_000,
                flush_interval_ms: 60_000,
                flush_failure_limit: 3,
            },
            ..NodeConfig::default()
        };
        LocalShardNode::new(
            &config,
            Arc::new(MemoryEventStorage::new()),
            Arc::new(Fnv1aKeyHasher),
            Arc::new(TripSwitch::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_flush_query_cycle() {
        let node = local_node();
        node.apply_event(EventAction::Add, EventData::User { user: User::new("u1") })
            .await
            .unwrap();
        node.apply_event(EventAction::Add, EventData::Group { group: Group::new("g1") })
            .await
            .unwrap();
        node.apply_event(
            EventAction::Add,
            EventData::UserToGroup {
                user: User::new("u1"),
                group: Group::new("g1"),
            },
        )
        .await
        .unwrap();
        node.apply_event(
            EventAction::Add,
            EventData::GroupToComponent {
                group: Group::new("g1"),
                component: ApplicationComponent::new("Orders"),
                level: AccessLevel::new("View"),
            },
        )
        .await
        .unwrap();
        node.flush().await.unwrap();

        let reply = node
            .query(Query::HasAccessToComponent {
                user: User::new("u1"),
                component: ApplicationComponent::new("Orders"),
                level: AccessLevel::new("View"),
            })
            .await
            .unwrap();
        assert_eq!(reply, QueryReply::Bool(true));
    }

    #[tokio::test]
    async fn test_processing_count_drains_on_flush() {
        let node = local_node();
        node.apply_event(EventAction::Add, EventData::User { user: User::new("u1") })
            .await
            .unwrap();
        assert_eq!(node.processing_count().await.unwrap(), 1);
        node.flush().await.unwrap();
        assert_eq!(node.processing_count().await.unwrap(), 0);
    }
}
