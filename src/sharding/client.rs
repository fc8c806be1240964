// # Shard Client and Router
//
// The client side of the data plane: routes writes and single-key queries
// to the shard group owning the key's hash, and fans multi-shard queries
// out across a role, merging results (set union for listings, boolean OR
// for access checks).
//
// Entity-type and entity events have no single owner; they are applied to
// every shard group of the User and Group roles. Group events additionally
// reach every User-role shard and the group-to-group shard, because user
// membership and group nesting on those shards validate against them.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{ShardConfigurationStore, ShardGroupDescriptor, ShardGroupRole};
use crate::common::KeyHasher;
use crate::error::{AccessError, Result};
use crate::event::{Event, EventAction, EventData, EventKind};
use crate::model::{AccessLevel, ApplicationComponent, Entity, EntityType, Group, User};
use crate::network::protocol::{Query, QueryReply};

/// Remote surface of one shard group node. Implemented in-process by
/// `LocalShardNode` and over the wire by `RemoteNodeClient`.
#[async_trait]
pub trait ShardNodeClient: Send + Sync {
    /// Validate, stamp and buffer one change. `None` means the write was
    /// accepted but held or dropped (router pause, merge collision).
    async fn apply_event(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>>;

    /// Ingest pre-formed events preserving their ids and timestamps.
    /// Returns how many were accepted.
    async fn ingest_events(&self, events: Vec<Event>) -> Result<usize>;

    async fn query(&self, query: Query) -> Result<QueryReply>;

    /// Pull cached events after the given id.
    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>>;

    /// Buffered, not-yet-flushed event count of the writer.
    async fn processing_count(&self) -> Result<usize>;

    async fn flush(&self) -> Result<()>;
}

/// Creates node connections from configured endpoints. The production
/// implementation dials TCP; tests wire in-process nodes.
pub trait ShardConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardNodeClient>>;
}

/// A node client whose target can be swapped at runtime. The split
/// orchestrator interposes its router in front of a source writer by
/// swapping here, without the shard client noticing.
pub struct SwappableNodeClient {
    inner: RwLock<Arc<dyn ShardNodeClient>>,
}

impl SwappableNodeClient {
    pub fn new(initial: Arc<dyn ShardNodeClient>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(initial),
        })
    }

    /// Replace the target, returning the previous one.
    pub fn swap(&self, next: Arc<dyn ShardNodeClient>) -> Arc<dyn ShardNodeClient> {
        std::mem::replace(&mut *self.inner.write(), next)
    }

    pub fn current(&self) -> Arc<dyn ShardNodeClient> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl ShardNodeClient for SwappableNodeClient {
    async fn apply_event(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>> {
        self.current().apply_event(action, data).await
    }

    async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
        self.current().ingest_events(events).await
    }

    async fn query(&self, query: Query) -> Result<QueryReply> {
        self.current().query(query).await
    }

    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        self.current().events_since(prior_event_id).await
    }

    async fn processing_count(&self) -> Result<usize> {
        self.current().processing_count().await
    }

    async fn flush(&self) -> Result<()> {
        self.current().flush().await
    }
}

pub struct ShardClient {
    config: Arc<ShardConfigurationStore>,
    connector: Arc<dyn ShardConnector>,
    connections: RwLock<HashMap<String, Arc<dyn ShardNodeClient>>>,
    reader_cursor: AtomicUsize,
    hasher: Arc<dyn KeyHasher>,
}

impl ShardClient {
    pub fn new(
        config: Arc<ShardConfigurationStore>,
        connector: Arc<dyn ShardConnector>,
        hasher: Arc<dyn KeyHasher>,
    ) -> Self {
        Self {
            config,
            connector,
            connections: RwLock::new(HashMap::new()),
            reader_cursor: AtomicUsize::new(0),
            hasher,
        }
    }

    fn connection(&self, endpoint: &str) -> Result<Arc<dyn ShardNodeClient>> {
        if let Some(existing) = self.connections.read().get(endpoint) {
            return Ok(existing.clone());
        }
        let connection = self.connector.connect(endpoint)?;
        self.connections
            .write()
            .insert(endpoint.to_string(), connection.clone());
        Ok(connection)
    }

    fn writer(&self, descriptor: &ShardGroupDescriptor) -> Result<Arc<dyn ShardNodeClient>> {
        self.connection(&descriptor.writer_endpoint)
    }

    fn reader(&self, descriptor: &ShardGroupDescriptor) -> Result<Arc<dyn ShardNodeClient>> {
        if descriptor.reader_endpoints.is_empty() {
            return self.connection(&descriptor.writer_endpoint);
        }
        let index =
            self.reader_cursor.fetch_add(1, Ordering::Relaxed) % descriptor.reader_endpoints.len();
        self.connection(&descriptor.reader_endpoints[index])
    }

    fn writer_for_key(&self, role: ShardGroupRole, key: &str) -> Result<Arc<dyn ShardNodeClient>> {
        let hash = self.hasher.hash_key(key);
        let config = self.config.snapshot();
        let descriptor = config.group_for(role, hash)?;
        self.writer(descriptor)
    }

    fn reader_for_key(&self, role: ShardGroupRole, key: &str) -> Result<Arc<dyn ShardNodeClient>> {
        let hash = self.hasher.hash_key(key);
        let config = self.config.snapshot();
        let descriptor = config.group_for(role, hash)?;
        self.reader(descriptor)
    }

    fn readers_for_role(&self, role: ShardGroupRole) -> Result<Vec<Arc<dyn ShardNodeClient>>> {
        let config = self.config.snapshot();
        config
            .groups_for_role(role)
            .into_iter()
            .map(|descriptor| self.reader(descriptor))
            .collect()
    }

    fn writers_for_role(&self, role: ShardGroupRole) -> Result<Vec<Arc<dyn ShardNodeClient>>> {
        let config = self.config.snapshot();
        config
            .groups_for_role(role)
            .into_iter()
            .map(|descriptor| self.writer(descriptor))
            .collect()
    }

    // ------------------------------------------------------------------
    // Write routing
    // ------------------------------------------------------------------

    /// Route one change to the shard group(s) owning it, synchronously.
    pub async fn route_write(&self, action: EventAction, data: EventData) -> Result<()> {
        match data.kind() {
            EventKind::User
            | EventKind::UserToGroup
            | EventKind::UserToComponent
            | EventKind::UserToEntity => {
                let writer = self.writer_for_key(ShardGroupRole::User, data.route_key())?;
                writer.apply_event(action, data).await?;
            }
            EventKind::GroupToComponent | EventKind::GroupToEntity => {
                let writer = self.writer_for_key(ShardGroupRole::Group, data.route_key())?;
                writer.apply_event(action, data).await?;
            }
            EventKind::GroupToGroup => {
                let writer =
                    self.writer_for_key(ShardGroupRole::GroupToGroup, data.route_key())?;
                writer.apply_event(action, data).await?;
            }
            EventKind::Group => {
                // the owning group shard by hash, plus every user shard and
                // the group-to-group shard, which validate memberships and
                // nestings against the group's existence
                let owner = self.writer_for_key(ShardGroupRole::Group, data.route_key())?;
                owner.apply_event(action, data.clone()).await?;
                for writer in self.writers_for_role(ShardGroupRole::User)? {
                    writer.apply_event(action, data.clone()).await?;
                }
                for writer in self.writers_for_role(ShardGroupRole::GroupToGroup)? {
                    writer.apply_event(action, data.clone()).await?;
                }
            }
            EventKind::EntityType | EventKind::Entity => {
                for writer in self.writers_for_role(ShardGroupRole::User)? {
                    writer.apply_event(action, data.clone()).await?;
                }
                for writer in self.writers_for_role(ShardGroupRole::Group)? {
                    writer.apply_event(action, data.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Force a flush on every writer. Used by tests and the orchestrator's
    /// drain phase.
    pub async fn flush_all(&self) -> Result<()> {
        for role in ShardGroupRole::ALL {
            for writer in self.writers_for_role(role)? {
                writer.flush().await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query routing and fan-out aggregation
    // ------------------------------------------------------------------

    /// Issue the same query to every shard of a role concurrently.
    async fn fanout(&self, role: ShardGroupRole, query: Query) -> Result<Vec<QueryReply>> {
        let readers = self.readers_for_role(role)?;
        let replies =
            futures::future::join_all(readers.iter().map(|reader| reader.query(query.clone())))
                .await;
        replies.into_iter().collect()
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let mut users = BTreeSet::new();
        for reply in self.fanout(ShardGroupRole::User, Query::GetUsers).await? {
            match reply {
                QueryReply::Users(batch) => users.extend(batch),
                other => return Err(unexpected_reply("GetUsers", &other)),
            }
        }
        Ok(users.into_iter().collect())
    }

    pub async fn get_groups(&self) -> Result<Vec<Group>> {
        let mut groups = BTreeSet::new();
        for reply in self.fanout(ShardGroupRole::Group, Query::GetGroups).await? {
            match reply {
                QueryReply::Groups(batch) => groups.extend(batch),
                other => return Err(unexpected_reply("GetGroups", &other)),
            }
        }
        Ok(groups.into_iter().collect())
    }

    pub async fn get_entity_types(&self) -> Result<Vec<EntityType>> {
        let mut entity_types = BTreeSet::new();
        for reply in self
            .fanout(ShardGroupRole::Group, Query::GetEntityTypes)
            .await?
        {
            match reply {
                QueryReply::EntityTypes(batch) => entity_types.extend(batch),
                other => return Err(unexpected_reply("GetEntityTypes", &other)),
            }
        }
        Ok(entity_types.into_iter().collect())
    }

    pub async fn get_entities(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        let mut entities = BTreeSet::new();
        let query = Query::GetEntities { entity_type };
        for reply in self.fanout(ShardGroupRole::Group, query).await? {
            match reply {
                QueryReply::Entities(batch) => entities.extend(batch),
                other => return Err(unexpected_reply("GetEntities", &other)),
            }
        }
        Ok(entities.into_iter().collect())
    }

    pub async fn contains_user(&self, user: User) -> Result<bool> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        match reader.query(Query::ContainsUser { user }).await? {
            QueryReply::Bool(contained) => Ok(contained),
            other => Err(unexpected_reply("ContainsUser", &other)),
        }
    }

    pub async fn contains_group(&self, group: Group) -> Result<bool> {
        let reader = self.reader_for_key(ShardGroupRole::Group, group.as_str())?;
        match reader.query(Query::ContainsGroup { group }).await? {
            QueryReply::Bool(contained) => Ok(contained),
            other => Err(unexpected_reply("ContainsGroup", &other)),
        }
    }

    /// The user's group set: direct memberships from the user shard,
    /// transitively closed over the group-to-group shard.
    pub async fn get_user_to_group_mappings(
        &self,
        user: User,
        include_indirect: bool,
    ) -> Result<Vec<Group>> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        let direct = match reader
            .query(Query::GetUserToGroupMappings {
                user,
                include_indirect: false,
            })
            .await?
        {
            QueryReply::Groups(groups) => groups,
            other => return Err(unexpected_reply("GetUserToGroupMappings", &other)),
        };
        if !include_indirect {
            return Ok(direct);
        }
        let closure = self.group_closure(direct).await?;
        Ok(closure.into_iter().collect())
    }

    pub async fn has_access_to_component(
        &self,
        user: User,
        component: ApplicationComponent,
        level: AccessLevel,
    ) -> Result<bool> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        // the user shard covers direct mappings and surfaces UserNotFound
        let direct = match reader
            .query(Query::HasAccessToComponent {
                user: user.clone(),
                component: component.clone(),
                level: level.clone(),
            })
            .await?
        {
            QueryReply::Bool(granted) => granted,
            other => return Err(unexpected_reply("HasAccessToComponent", &other)),
        };
        if direct {
            return Ok(true);
        }
        let groups = self.user_groups_closed(&reader, user).await?;
        if groups.is_empty() {
            return Ok(false);
        }
        for shard in self.readers_for_role(ShardGroupRole::Group)? {
            let query = Query::HasAccessToComponentByGroups {
                groups: groups.clone(),
                component: component.clone(),
                level: level.clone(),
            };
            match shard.query(query).await? {
                QueryReply::Bool(true) => return Ok(true),
                QueryReply::Bool(false) => {}
                other => return Err(unexpected_reply("HasAccessToComponentByGroups", &other)),
            }
        }
        Ok(false)
    }

    pub async fn has_access_to_entity(
        &self,
        user: User,
        entity_type: EntityType,
        entity: Entity,
    ) -> Result<bool> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        let direct = match reader
            .query(Query::HasAccessToEntity {
                user: user.clone(),
                entity_type: entity_type.clone(),
                entity: entity.clone(),
            })
            .await?
        {
            QueryReply::Bool(granted) => granted,
            other => return Err(unexpected_reply("HasAccessToEntity", &other)),
        };
        if direct {
            return Ok(true);
        }
        let groups = self.user_groups_closed(&reader, user).await?;
        if groups.is_empty() {
            return Ok(false);
        }
        for shard in self.readers_for_role(ShardGroupRole::Group)? {
            let query = Query::HasAccessToEntityByGroups {
                groups: groups.clone(),
                entity_type: entity_type.clone(),
                entity: entity.clone(),
            };
            match shard.query(query).await? {
                QueryReply::Bool(true) => return Ok(true),
                QueryReply::Bool(false) => {}
                other => return Err(unexpected_reply("HasAccessToEntityByGroups", &other)),
            }
        }
        Ok(false)
    }

    pub async fn get_accessible_components(
        &self,
        user: User,
    ) -> Result<Vec<(ApplicationComponent, AccessLevel)>> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        let mut accessible: BTreeSet<(ApplicationComponent, AccessLevel)> = match reader
            .query(Query::GetUserToComponentMappings { user: user.clone() })
            .await?
        {
            QueryReply::ComponentLevels(mappings) => mappings.into_iter().collect(),
            other => return Err(unexpected_reply("GetUserToComponentMappings", &other)),
        };
        let groups = self.user_groups_closed(&reader, user).await?;
        if !groups.is_empty() {
            for shard in self.readers_for_role(ShardGroupRole::Group)? {
                let query = Query::GetAccessibleComponentsByGroups {
                    groups: groups.clone(),
                };
                match shard.query(query).await? {
                    QueryReply::ComponentLevels(mappings) => accessible.extend(mappings),
                    other => {
                        return Err(unexpected_reply("GetAccessibleComponentsByGroups", &other))
                    }
                }
            }
        }
        Ok(accessible.into_iter().collect())
    }

    pub async fn get_accessible_entities(
        &self,
        user: User,
    ) -> Result<Vec<(EntityType, Entity)>> {
        let reader = self.reader_for_key(ShardGroupRole::User, user.as_str())?;
        let mut accessible: BTreeSet<(EntityType, Entity)> = match reader
            .query(Query::GetUserToEntityMappings { user: user.clone() })
            .await?
        {
            QueryReply::EntityRefs(refs) => refs.into_iter().collect(),
            other => return Err(unexpected_reply("GetUserToEntityMappings", &other)),
        };
        let groups = self.user_groups_closed(&reader, user).await?;
        if !groups.is_empty() {
            for shard in self.readers_for_role(ShardGroupRole::Group)? {
                let query = Query::GetAccessibleEntitiesByGroups {
                    groups: groups.clone(),
                };
                match shard.query(query).await? {
                    QueryReply::EntityRefs(refs) => accessible.extend(refs),
                    other => {
                        return Err(unexpected_reply("GetAccessibleEntitiesByGroups", &other))
                    }
                }
            }
        }
        Ok(accessible.into_iter().collect())
    }

    /// Direct groups of a user, closed over the group-to-group shard.
    async fn user_groups_closed(
        &self,
        user_shard: &Arc<dyn ShardNodeClient>,
        user: User,
    ) -> Result<Vec<Group>> {
        let direct = match user_shard
            .query(Query::GetUserToGroupMappings {
                user,
                include_indirect: false,
            })
            .await?
        {
            QueryReply::Groups(groups) => groups,
            other => return Err(unexpected_reply("GetUserToGroupMappings", &other)),
        };
        if direct.is_empty() {
            return Ok(direct);
        }
        let closed = self.group_closure(direct).await?;
        Ok(closed.into_iter().collect())
    }

    /// Union of the given groups and their forward closure on the
    /// group-to-group shard.
    async fn group_closure(&self, groups: Vec<Group>) -> Result<BTreeSet<Group>> {
        let mut closed: BTreeSet<Group> = groups.iter().cloned().collect();
        let config = self.config.snapshot();
        if config
            .groups_for_role(ShardGroupRole::GroupToGroup)
            .is_empty()
        {
            return Ok(closed);
        }
        let shard = {
            let descriptor = config.group_for(ShardGroupRole::GroupToGroup, 0)?;
            self.reader(descriptor)?
        };
        match shard
            .query(Query::GetGroupToGroupMappingsForGroups { groups })
            .await?
        {
            QueryReply::Groups(transitive) => closed.extend(transitive),
            other => return Err(unexpected_reply("GetGroupToGroupMappingsForGroups", &other)),
        }
        Ok(closed)
    }
}

fn unexpected_reply(query: &str, reply: &QueryReply) -> AccessError {
    AccessError::Internal(format!(
        "unexpected reply shape for {}: {:?}",
        query, reply
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{ShardConfiguration, ShardGroupDescriptor};
    use parking_lot::Mutex;

    /// Hasher that reads the key as an integer, so tests can steer events
    /// into chosen ranges.
    struct ParseHasher;

    impl KeyHasher for ParseHasher {
        fn hash_key(&self, key: &str) -> i32 {
            key.parse().unwrap_or(0)
        }
    }

    struct RecordingNode {
        name: String,
        applied: Mutex<Vec<(EventAction, EventData)>>,
    }

    impl RecordingNode {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                applied: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ShardNodeClient for RecordingNode {
        async fn apply_event(
            &self,
            action: EventAction,
            data: EventData,
        ) -> Result<Option<Uuid>> {
            self.applied.lock().push((action, data));
            Ok(Some(Uuid::new_v4()))
        }

        async fn ingest_events(&self, events: Vec<Event>) -> Result<usize> {
            Ok(events.len())
        }

        async fn query(&self, _query: Query) -> Result<QueryReply> {
            Ok(QueryReply::Users(vec![User::new(self.name.clone())]))
        }

        async fn events_since(&self, _prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn processing_count(&self) -> Result<usize> {
            Ok(0)
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MapConnector {
        nodes: HashMap<String, Arc<RecordingNode>>,
    }

    impl ShardConnector for MapConnector {
        fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardNodeClient>> {
            self.nodes
                .get(endpoint)
                .map(|node| node.clone() as Arc<dyn ShardNodeClient>)
                .ok_or_else(|| AccessError::Network(format!("unknown endpoint '{}'", endpoint)))
        }
    }

    fn descriptor(role: ShardGroupRole, start: i32, name: &str) -> ShardGroupDescriptor {
        ShardGroupDescriptor {
            name: name.to_string(),
            role,
            hash_range_start: start,
            writer_endpoint: name.to_string(),
            reader_endpoints: Vec::new(),
            storage_instance: format!("{}-storage", name),
        }
    }

    fn sharded_client() -> (ShardClient, HashMap<String, Arc<RecordingNode>>) {
        let config = ShardConfiguration::new()
            .with_group_added(descriptor(ShardGroupRole::User, i32::MIN, "user-low"))
            .unwrap()
            .with_group_added(descriptor(ShardGroupRole::User, 0, "user-high"))
            .unwrap()
            .with_group_added(descriptor(ShardGroupRole::Group, i32::MIN, "group-all"))
            .unwrap()
            .with_group_added(descriptor(ShardGroupRole::GroupToGroup, i32::MIN, "g2g"))
            .unwrap();
        let nodes: HashMap<String, Arc<RecordingNode>> =
            ["user-low", "user-high", "group-all", "g2g"]
                .iter()
                .map(|name| (name.to_string(), RecordingNode::new(name)))
                .collect();
        let client = ShardClient::new(
            Arc::new(ShardConfigurationStore::in_memory(config).unwrap()),
            Arc::new(MapConnector {
                nodes: nodes.clone(),
            }),
            Arc::new(ParseHasher),
        );
        (client, nodes)
    }

    #[tokio::test]
    async fn test_user_event_routes_to_owning_shard() {
        let (client, nodes) = sharded_client();
        client
            .route_write(EventAction::Add, EventData::User { user: User::new("-42") })
            .await
            .unwrap();
        client
            .route_write(EventAction::Add, EventData::User { user: User::new("7") })
            .await
            .unwrap();

        assert_eq!(nodes["user-low"].applied.lock().len(), 1);
        assert_eq!(nodes["user-high"].applied.lock().len(), 1);
        assert_eq!(nodes["group-all"].applied.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_group_event_fans_to_user_and_g2g_shards() {
        let (client, nodes) = sharded_client();
        client
            .route_write(EventAction::Add, EventData::Group { group: Group::new("5") })
            .await
            .unwrap();

        assert_eq!(nodes["group-all"].applied.lock().len(), 1);
        assert_eq!(nodes["user-low"].applied.lock().len(), 1);
        assert_eq!(nodes["user-high"].applied.lock().len(), 1);
        assert_eq!(nodes["g2g"].applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_entity_events_fan_to_user_and_group_roles() {
        let (client, nodes) = sharded_client();
        client
            .route_write(
                EventAction::Add,
                EventData::EntityType {
                    entity_type: EntityType::new("Clients"),
                },
            )
            .await
            .unwrap();

        assert_eq!(nodes["user-low"].applied.lock().len(), 1);
        assert_eq!(nodes["user-high"].applied.lock().len(), 1);
        assert_eq!(nodes["group-all"].applied.lock().len(), 1);
        assert_eq!(nodes["g2g"].applied.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_get_users_fans_out_and_merges() {
        let (client, _nodes) = sharded_client();
        let users = client.get_users().await.unwrap();
        // each user shard reports its own name; results are merged sorted
        assert_eq!(users, vec![User::new("user-high"), User::new("user-low")]);
    }

    #[tokio::test]
    async fn test_swappable_client_redirects() {
        let first = RecordingNode::new("first");
        let second = RecordingNode::new("second");
        let swappable = SwappableNodeClient::new(first.clone());

        swappable
            .apply_event(EventAction::Add, EventData::User { user: User::new("u") })
            .await
            .unwrap();
        swappable.swap(second.clone());
        swappable
            .apply_event(EventAction::Add, EventData::User { user: User::new("u") })
            .await
            .unwrap();

        assert_eq!(first.applied.lock().len(), 1);
        assert_eq!(second.applied.lock().len(), 1);
    }
}
