// # Authorization Store
//
// The full permission model over the directed graph: users and groups as
// graph vertices, plus mapping tables from users/groups to application
// components (with access levels) and to entities. Every mapping table has
// an optional reverse index kept in lockstep, so forward and reverse
// queries are both O(results).
//
// Removal of a primary element (user, group, entity type, entity) cascades
// to every mapping referencing it. When the store acts as a validator
// shadow, the cascade is instead synthesized as an ordered sequence of
// prepended remove events via `cascading_removes`.

pub mod concurrent;

pub use concurrent::ConcurrentAccessStore;

use std::collections::{HashMap, HashSet};

use crate::error::{AccessError, Result};
use crate::event::{EventAction, EventData};
use crate::graph::{DirectedGraph, TraversalDirection};
use crate::model::{AccessLevel, ApplicationComponent, Entity, EntityType, Group, User};

type ComponentLevel = (ApplicationComponent, AccessLevel);
type EntityRef = (EntityType, Entity);

/// In-memory authorization store. Single-owner; see
/// [`ConcurrentAccessStore`] for the shared reader/writer wrapper.
#[derive(Debug, Clone)]
pub struct AccessStore {
    graph: DirectedGraph<User, Group>,
    user_components: HashMap<User, HashSet<ComponentLevel>>,
    component_users: HashMap<ComponentLevel, HashSet<User>>,
    group_components: HashMap<Group, HashSet<ComponentLevel>>,
    component_groups: HashMap<ComponentLevel, HashSet<Group>>,
    entities: HashMap<EntityType, HashSet<Entity>>,
    user_entities: HashMap<User, HashMap<EntityType, HashSet<Entity>>>,
    entity_users: HashMap<EntityRef, HashSet<User>>,
    group_entities: HashMap<Group, HashMap<EntityType, HashSet<Entity>>>,
    entity_groups: HashMap<EntityRef, HashSet<Group>>,
    store_bidirectional_mappings: bool,
}

impl AccessStore {
    pub fn new(store_bidirectional_mappings: bool) -> Self {
        Self {
            graph: DirectedGraph::new(),
            user_components: HashMap::new(),
            component_users: HashMap::new(),
            group_components: HashMap::new(),
            component_groups: HashMap::new(),
            entities: HashMap::new(),
            user_entities: HashMap::new(),
            entity_users: HashMap::new(),
            group_entities: HashMap::new(),
            entity_groups: HashMap::new(),
            store_bidirectional_mappings,
        }
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Apply a single validated change. Readers replay persisted events
    /// through this path in stream order.
    pub fn apply(&mut self, action: EventAction, data: &EventData) -> Result<()> {
        match (action, data) {
            (EventAction::Add, EventData::User { user }) => self.add_user(user.clone()),
            (EventAction::Remove, EventData::User { user }) => self.remove_user(user),
            (EventAction::Add, EventData::Group { group }) => self.add_group(group.clone()),
            (EventAction::Remove, EventData::Group { group }) => self.remove_group(group),
            (EventAction::Add, EventData::EntityType { entity_type }) => {
                self.add_entity_type(entity_type.clone())
            }
            (EventAction::Remove, EventData::EntityType { entity_type }) => {
                self.remove_entity_type(entity_type)
            }
            (EventAction::Add, EventData::Entity { entity_type, entity }) => {
                self.add_entity(entity_type, entity.clone())
            }
            (EventAction::Remove, EventData::Entity { entity_type, entity }) => {
                self.remove_entity(entity_type, entity)
            }
            (EventAction::Add, EventData::UserToGroup { user, group }) => {
                self.add_user_to_group_mapping(user, group)
            }
            (EventAction::Remove, EventData::UserToGroup { user, group }) => {
                self.remove_user_to_group_mapping(user, group)
            }
            (EventAction::Add, EventData::GroupToGroup { from_group, to_group }) => {
                self.add_group_to_group_mapping(from_group, to_group)
            }
            (EventAction::Remove, EventData::GroupToGroup { from_group, to_group }) => {
                self.remove_group_to_group_mapping(from_group, to_group)
            }
            (EventAction::Add, EventData::UserToComponent { user, component, level }) => {
                self.add_user_to_component_mapping(user, component.clone(), level.clone())
            }
            (EventAction::Remove, EventData::UserToComponent { user, component, level }) => {
                self.remove_user_to_component_mapping(user, component, level)
            }
            (EventAction::Add, EventData::GroupToComponent { group, component, level }) => {
                self.add_group_to_component_mapping(group, component.clone(), level.clone())
            }
            (EventAction::Remove, EventData::GroupToComponent { group, component, level }) => {
                self.remove_group_to_component_mapping(group, component, level)
            }
            (EventAction::Add, EventData::UserToEntity { user, entity_type, entity }) => {
                self.add_user_to_entity_mapping(user, entity_type, entity.clone())
            }
            (EventAction::Remove, EventData::UserToEntity { user, entity_type, entity }) => {
                self.remove_user_to_entity_mapping(user, entity_type, entity)
            }
            (EventAction::Add, EventData::GroupToEntity { group, entity_type, entity }) => {
                self.add_group_to_entity_mapping(group, entity_type, entity.clone())
            }
            (EventAction::Remove, EventData::GroupToEntity { group, entity_type, entity }) => {
                self.remove_group_to_entity_mapping(group, entity_type, entity)
            }
        }
    }

    /// Referential validity of a change against the current state, without
    /// mutating. Mirrors the checks `apply` performs; the validator uses
    /// this to reject a primary event before any cascade is synthesized.
    pub fn check_apply(&self, action: EventAction, data: &EventData) -> Result<()> {
        match (action, data) {
            (EventAction::Add, EventData::User { user }) => {
                if self.contains_user(user) {
                    return Err(AccessError::AlreadyExists(format!("user '{}'", user)));
                }
            }
            (EventAction::Remove, EventData::User { user }) => {
                if !self.contains_user(user) {
                    return Err(AccessError::UserNotFound(user.to_string()));
                }
            }
            (EventAction::Add, EventData::Group { group }) => {
                if self.contains_group(group) {
                    return Err(AccessError::AlreadyExists(format!("group '{}'", group)));
                }
            }
            (EventAction::Remove, EventData::Group { group }) => {
                if !self.contains_group(group) {
                    return Err(AccessError::GroupNotFound(group.to_string()));
                }
            }
            (EventAction::Add, EventData::EntityType { entity_type }) => {
                if self.contains_entity_type(entity_type) {
                    return Err(AccessError::AlreadyExists(format!(
                        "entity type '{}'",
                        entity_type
                    )));
                }
            }
            (EventAction::Remove, EventData::EntityType { entity_type }) => {
                if !self.contains_entity_type(entity_type) {
                    return Err(AccessError::EntityTypeNotFound(entity_type.to_string()));
                }
            }
            (EventAction::Add, EventData::Entity { entity_type, entity }) => {
                if !self.contains_entity_type(entity_type) {
                    return Err(AccessError::EntityTypeNotFound(entity_type.to_string()));
                }
                if self.contains_entity(entity_type, entity) {
                    return Err(AccessError::AlreadyExists(format!(
                        "entity '{}' in entity type '{}'",
                        entity, entity_type
                    )));
                }
            }
            (EventAction::Remove, EventData::Entity { entity_type, entity }) => {
                if !self.contains_entity_type(entity_type) {
                    return Err(AccessError::EntityTypeNotFound(entity_type.to_string()));
                }
                if !self.contains_entity(entity_type, entity) {
                    return Err(AccessError::EntityNotFound(
                        entity_type.to_string(),
                        entity.to_string(),
                    ));
                }
            }
            (EventAction::Add, EventData::UserToGroup { user, group }) => {
                let existing = self.get_user_to_group_mappings(user, false)?;
                if !self.contains_group(group) {
                    return Err(AccessError::GroupNotFound(group.to_string()));
                }
                if existing.contains(group) {
                    return Err(AccessError::AlreadyExists(format!(
                        "edge from '{}' to '{}'",
                        user, group
                    )));
                }
            }
            (EventAction::Remove, EventData::UserToGroup { user, group }) => {
                let existing = self.get_user_to_group_mappings(user, false)?;
                if !existing.contains(group) {
                    return Err(AccessError::NotFound(format!(
                        "edge from '{}' to '{}'",
                        user, group
                    )));
                }
            }
            (EventAction::Add, EventData::GroupToGroup { from_group, to_group }) => {
                if !self.contains_group(from_group) {
                    return Err(AccessError::GroupNotFound(from_group.to_string()));
                }
                if !self.contains_group(to_group) {
                    return Err(AccessError::GroupNotFound(to_group.to_string()));
                }
                if from_group == to_group {
                    return Err(AccessError::InvalidArgument(format!(
                        "cannot create an edge from '{}' to itself",
                        from_group
                    )));
                }
                if self
                    .get_group_to_group_mappings(from_group, false)?
                    .contains(to_group)
                {
                    return Err(AccessError::AlreadyExists(format!(
                        "edge from '{}' to '{}'",
                        from_group, to_group
                    )));
                }
                if self
                    .get_group_to_group_mappings(to_group, true)?
                    .contains(from_group)
                {
                    return Err(AccessError::InvalidArgument(
                        "edge would create a cycle".to_string(),
                    ));
                }
            }
            (EventAction::Remove, EventData::GroupToGroup { from_group, to_group }) => {
                if !self.contains_group(from_group) {
                    return Err(AccessError::GroupNotFound(from_group.to_string()));
                }
                if !self
                    .get_group_to_group_mappings(from_group, false)?
                    .contains(to_group)
                {
                    return Err(AccessError::NotFound(format!(
                        "edge from '{}' to '{}'",
                        from_group, to_group
                    )));
                }
            }
            (EventAction::Add, EventData::UserToComponent { user, component, level }) => {
                let existing = self.get_user_to_component_mappings(user)?;
                if existing.contains(&(component.clone(), level.clone())) {
                    return Err(AccessError::AlreadyExists(format!(
                        "mapping from user '{}' to component '{}' at level '{}'",
                        user, component, level
                    )));
                }
            }
            (EventAction::Remove, EventData::UserToComponent { user, component, level }) => {
                let existing = self.get_user_to_component_mappings(user)?;
                if !existing.contains(&(component.clone(), level.clone())) {
                    return Err(AccessError::NotFound(format!(
                        "mapping from user '{}' to component '{}' at level '{}'",
                        user, component, level
                    )));
                }
            }
            (EventAction::Add, EventData::GroupToComponent { group, component, level }) => {
                let existing = self.get_group_to_component_mappings(group)?;
                if existing.contains(&(component.clone(), level.clone())) {
                    return Err(AccessError::AlreadyExists(format!(
                        "mapping from group '{}' to component '{}' at level '{}'",
                        group, component, level
                    )));
                }
            }
            (EventAction::Remove, EventData::GroupToComponent { group, component, level }) => {
                let existing = self.get_group_to_component_mappings(group)?;
                if !existing.contains(&(component.clone(), level.clone())) {
                    return Err(AccessError::NotFound(format!(
                        "mapping from group '{}' to component '{}' at level '{}'",
                        group, component, level
                    )));
                }
            }
            (EventAction::Add, EventData::UserToEntity { user, entity_type, entity }) => {
                if !self.contains_user(user) {
                    return Err(AccessError::UserNotFound(user.to_string()));
                }
                self.require_entity(entity_type, entity)?;
                let existing = self.get_user_to_entity_mappings(user)?;
                if existing.contains(&(entity_type.clone(), entity.clone())) {
                    return Err(AccessError::AlreadyExists(format!(
                        "mapping from user '{}' to entity '{}' of type '{}'",
                        user, entity, entity_type
                    )));
                }
            }
            (EventAction::Remove, EventData::UserToEntity { user, entity_type, entity }) => {
                if !self.contains_user(user) {
                    return Err(AccessError::UserNotFound(user.to_string()));
                }
                let existing = self.get_user_to_entity_mappings(user)?;
                if !existing.contains(&(entity_type.clone(), entity.clone())) {
                    return Err(AccessError::NotFound(format!(
                        "mapping from user '{}' to entity '{}' of type '{}'",
                        user, entity, entity_type
                    )));
                }
            }
            (EventAction::Add, EventData::GroupToEntity { group, entity_type, entity }) => {
                if !self.contains_group(group) {
                    return Err(AccessError::GroupNotFound(group.to_string()));
                }
                self.require_entity(entity_type, entity)?;
                let existing = self.get_group_to_entity_mappings(group)?;
                if existing.contains(&(entity_type.clone(), entity.clone())) {
                    return Err(AccessError::AlreadyExists(format!(
                        "mapping from group '{}' to entity '{}' of type '{}'",
                        group, entity, entity_type
                    )));
                }
            }
            (EventAction::Remove, EventData::GroupToEntity { group, entity_type, entity }) => {
                if !self.contains_group(group) {
                    return Err(AccessError::GroupNotFound(group.to_string()));
                }
                let existing = self.get_group_to_entity_mappings(group)?;
                if !existing.contains(&(entity_type.clone(), entity.clone())) {
                    return Err(AccessError::NotFound(format!(
                        "mapping from group '{}' to entity '{}' of type '{}'",
                        group, entity, entity_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// The ordered sequence of mapping removes that must precede removal of
    /// a primary element, derived from the current store state. Returns an
    /// empty sequence for non-primary events.
    pub fn cascading_removes(&self, data: &EventData) -> Vec<EventData> {
        let mut prepends = Vec::new();
        match data {
            EventData::User { user } => {
                let mut groups: Vec<Group> = self.graph.leaf_edges(user).cloned().collect();
                groups.sort();
                for group in groups {
                    prepends.push(EventData::UserToGroup { user: user.clone(), group });
                }
                let mut components: Vec<ComponentLevel> = self
                    .user_components
                    .get(user)
                    .into_iter()
                    .flat_map(|set| set.iter().cloned())
                    .collect();
                components.sort();
                for (component, level) in components {
                    prepends.push(EventData::UserToComponent {
                        user: user.clone(),
                        component,
                        level,
                    });
                }
                for (entity_type, entity) in self.entity_refs_of_user(user) {
                    prepends.push(EventData::UserToEntity {
                        user: user.clone(),
                        entity_type,
                        entity,
                    });
                }
            }
            EventData::Group { group } => {
                let mut users: Vec<User> = self.graph.leaf_reverse_edges(group).cloned().collect();
                users.sort();
                for user in users {
                    prepends.push(EventData::UserToGroup { user, group: group.clone() });
                }
                let mut sources: Vec<Group> =
                    self.graph.non_leaf_reverse_edges(group).cloned().collect();
                sources.sort();
                for from_group in sources {
                    prepends.push(EventData::GroupToGroup {
                        from_group,
                        to_group: group.clone(),
                    });
                }
                let mut targets: Vec<Group> = self.graph.non_leaf_edges(group).cloned().collect();
                targets.sort();
                for to_group in targets {
                    prepends.push(EventData::GroupToGroup {
                        from_group: group.clone(),
                        to_group,
                    });
                }
                let mut components: Vec<ComponentLevel> = self
                    .group_components
                    .get(group)
                    .into_iter()
                    .flat_map(|set| set.iter().cloned())
                    .collect();
                components.sort();
                for (component, level) in components {
                    prepends.push(EventData::GroupToComponent {
                        group: group.clone(),
                        component,
                        level,
                    });
                }
                for (entity_type, entity) in self.entity_refs_of_group(group) {
                    prepends.push(EventData::GroupToEntity {
                        group: group.clone(),
                        entity_type,
                        entity,
                    });
                }
            }
            EventData::EntityType { entity_type } => {
                let mut members: Vec<Entity> = self
                    .entities
                    .get(entity_type)
                    .into_iter()
                    .flat_map(|set| set.iter().cloned())
                    .collect();
                members.sort();
                for entity in &members {
                    prepends.extend(self.entity_mapping_removes(entity_type, entity));
                }
            }
            EventData::Entity { entity_type, entity } => {
                prepends.extend(self.entity_mapping_removes(entity_type, entity));
            }
            _ => {}
        }
        prepends
    }

    fn entity_mapping_removes(&self, entity_type: &EntityType, entity: &Entity) -> Vec<EventData> {
        let mut removes = Vec::new();
        let mut users = self.users_of_entity(entity_type, entity);
        users.sort();
        for user in users {
            removes.push(EventData::UserToEntity {
                user,
                entity_type: entity_type.clone(),
                entity: entity.clone(),
            });
        }
        let mut groups = self.groups_of_entity(entity_type, entity);
        groups.sort();
        for group in groups {
            removes.push(EventData::GroupToEntity {
                group,
                entity_type: entity_type.clone(),
                entity: entity.clone(),
            });
        }
        removes
    }

    // ------------------------------------------------------------------
    // Primary elements
    // ------------------------------------------------------------------

    pub fn add_user(&mut self, user: User) -> Result<()> {
        if self.graph.contains_leaf(&user) {
            return Err(AccessError::AlreadyExists(format!("user '{}'", user)));
        }
        self.graph.add_leaf_vertex(user)
    }

    pub fn remove_user(&mut self, user: &User) -> Result<()> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        if let Some(components) = self.user_components.remove(user) {
            for key in components {
                if let Some(reverse) = self.component_users.get_mut(&key) {
                    reverse.remove(user);
                }
            }
        }
        if let Some(by_type) = self.user_entities.remove(user) {
            for (entity_type, members) in by_type {
                for entity in members {
                    if let Some(reverse) =
                        self.entity_users.get_mut(&(entity_type.clone(), entity))
                    {
                        reverse.remove(user);
                    }
                }
            }
        }
        self.graph.remove_leaf_vertex(user)
    }

    pub fn add_group(&mut self, group: Group) -> Result<()> {
        if self.graph.contains_non_leaf(&group) {
            return Err(AccessError::AlreadyExists(format!("group '{}'", group)));
        }
        self.graph.add_non_leaf_vertex(group)
    }

    pub fn remove_group(&mut self, group: &Group) -> Result<()> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        if let Some(components) = self.group_components.remove(group) {
            for key in components {
                if let Some(reverse) = self.component_groups.get_mut(&key) {
                    reverse.remove(group);
                }
            }
        }
        if let Some(by_type) = self.group_entities.remove(group) {
            for (entity_type, members) in by_type {
                for entity in members {
                    if let Some(reverse) =
                        self.entity_groups.get_mut(&(entity_type.clone(), entity))
                    {
                        reverse.remove(group);
                    }
                }
            }
        }
        self.graph.remove_non_leaf_vertex(group)
    }

    pub fn add_entity_type(&mut self, entity_type: EntityType) -> Result<()> {
        if self.entities.contains_key(&entity_type) {
            return Err(AccessError::AlreadyExists(format!(
                "entity type '{}'",
                entity_type
            )));
        }
        self.entities.insert(entity_type, HashSet::new());
        Ok(())
    }

    /// Removing an entity type removes every entity within it and every
    /// mapping to those entities.
    pub fn remove_entity_type(&mut self, entity_type: &EntityType) -> Result<()> {
        let members = self
            .entities
            .remove(entity_type)
            .ok_or_else(|| AccessError::EntityTypeNotFound(entity_type.to_string()))?;
        for entity in members {
            self.remove_entity_references(entity_type, &entity);
        }
        Ok(())
    }

    pub fn add_entity(&mut self, entity_type: &EntityType, entity: Entity) -> Result<()> {
        let members = self
            .entities
            .get_mut(entity_type)
            .ok_or_else(|| AccessError::EntityTypeNotFound(entity_type.to_string()))?;
        if members.contains(&entity) {
            return Err(AccessError::AlreadyExists(format!(
                "entity '{}' in entity type '{}'",
                entity, entity_type
            )));
        }
        members.insert(entity);
        Ok(())
    }

    pub fn remove_entity(&mut self, entity_type: &EntityType, entity: &Entity) -> Result<()> {
        let members = self
            .entities
            .get_mut(entity_type)
            .ok_or_else(|| AccessError::EntityTypeNotFound(entity_type.to_string()))?;
        if !members.remove(entity) {
            return Err(AccessError::EntityNotFound(
                entity_type.to_string(),
                entity.to_string(),
            ));
        }
        self.remove_entity_references(entity_type, entity);
        Ok(())
    }

    /// Strip every user/group mapping referencing an entity. Uses the
    /// reverse indexes when maintained, otherwise scans the forward tables.
    fn remove_entity_references(&mut self, entity_type: &EntityType, entity: &Entity) {
        let key = (entity_type.clone(), entity.clone());
        if self.store_bidirectional_mappings {
            if let Some(users) = self.entity_users.remove(&key) {
                for user in users {
                    if let Some(by_type) = self.user_entities.get_mut(&user) {
                        if let Some(members) = by_type.get_mut(entity_type) {
                            members.remove(entity);
                        }
                    }
                }
            }
            if let Some(groups) = self.entity_groups.remove(&key) {
                for group in groups {
                    if let Some(by_type) = self.group_entities.get_mut(&group) {
                        if let Some(members) = by_type.get_mut(entity_type) {
                            members.remove(entity);
                        }
                    }
                }
            }
        } else {
            for by_type in self.user_entities.values_mut() {
                if let Some(members) = by_type.get_mut(entity_type) {
                    members.remove(entity);
                }
            }
            for by_type in self.group_entities.values_mut() {
                if let Some(members) = by_type.get_mut(entity_type) {
                    members.remove(entity);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Group membership mappings
    // ------------------------------------------------------------------

    pub fn add_user_to_group_mapping(&mut self, user: &User, group: &Group) -> Result<()> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        self.graph
            .add_leaf_to_non_leaf_edge(user.clone(), group.clone())
    }

    pub fn remove_user_to_group_mapping(&mut self, user: &User, group: &Group) -> Result<()> {
        self.graph.remove_leaf_to_non_leaf_edge(user, group)
    }

    pub fn add_group_to_group_mapping(&mut self, from_group: &Group, to_group: &Group) -> Result<()> {
        if !self.graph.contains_non_leaf(from_group) {
            return Err(AccessError::GroupNotFound(from_group.to_string()));
        }
        if !self.graph.contains_non_leaf(to_group) {
            return Err(AccessError::GroupNotFound(to_group.to_string()));
        }
        self.graph
            .add_non_leaf_to_non_leaf_edge(from_group.clone(), to_group.clone())
    }

    pub fn remove_group_to_group_mapping(
        &mut self,
        from_group: &Group,
        to_group: &Group,
    ) -> Result<()> {
        self.graph
            .remove_non_leaf_to_non_leaf_edge(from_group, to_group)
    }

    // ------------------------------------------------------------------
    // Component mappings
    // ------------------------------------------------------------------

    pub fn add_user_to_component_mapping(
        &mut self,
        user: &User,
        component: ApplicationComponent,
        level: AccessLevel,
    ) -> Result<()> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        let key = (component, level);
        let mappings = self.user_components.entry(user.clone()).or_default();
        if !mappings.insert(key.clone()) {
            return Err(AccessError::AlreadyExists(format!(
                "mapping from user '{}' to component '{}' at level '{}'",
                user, key.0, key.1
            )));
        }
        if self.store_bidirectional_mappings {
            self.component_users
                .entry(key)
                .or_default()
                .insert(user.clone());
        }
        Ok(())
    }

    pub fn remove_user_to_component_mapping(
        &mut self,
        user: &User,
        component: &ApplicationComponent,
        level: &AccessLevel,
    ) -> Result<()> {
        let key = (component.clone(), level.clone());
        let present = self
            .user_components
            .get_mut(user)
            .map(|mappings| mappings.remove(&key))
            .unwrap_or(false);
        if !present {
            return Err(AccessError::NotFound(format!(
                "mapping from user '{}' to component '{}' at level '{}'",
                user, component, level
            )));
        }
        if let Some(reverse) = self.component_users.get_mut(&key) {
            reverse.remove(user);
        }
        Ok(())
    }

    pub fn add_group_to_component_mapping(
        &mut self,
        group: &Group,
        component: ApplicationComponent,
        level: AccessLevel,
    ) -> Result<()> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        let key = (component, level);
        let mappings = self.group_components.entry(group.clone()).or_default();
        if !mappings.insert(key.clone()) {
            return Err(AccessError::AlreadyExists(format!(
                "mapping from group '{}' to component '{}' at level '{}'",
                group, key.0, key.1
            )));
        }
        if self.store_bidirectional_mappings {
            self.component_groups
                .entry(key)
                .or_default()
                .insert(group.clone());
        }
        Ok(())
    }

    pub fn remove_group_to_component_mapping(
        &mut self,
        group: &Group,
        component: &ApplicationComponent,
        level: &AccessLevel,
    ) -> Result<()> {
        let key = (component.clone(), level.clone());
        let present = self
            .group_components
            .get_mut(group)
            .map(|mappings| mappings.remove(&key))
            .unwrap_or(false);
        if !present {
            return Err(AccessError::NotFound(format!(
                "mapping from group '{}' to component '{}' at level '{}'",
                group, component, level
            )));
        }
        if let Some(reverse) = self.component_groups.get_mut(&key) {
            reverse.remove(group);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity mappings
    // ------------------------------------------------------------------

    pub fn add_user_to_entity_mapping(
        &mut self,
        user: &User,
        entity_type: &EntityType,
        entity: Entity,
    ) -> Result<()> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        self.require_entity(entity_type, &entity)?;
        let members = self
            .user_entities
            .entry(user.clone())
            .or_default()
            .entry(entity_type.clone())
            .or_default();
        if !members.insert(entity.clone()) {
            return Err(AccessError::AlreadyExists(format!(
                "mapping from user '{}' to entity '{}' of type '{}'",
                user, entity, entity_type
            )));
        }
        if self.store_bidirectional_mappings {
            self.entity_users
                .entry((entity_type.clone(), entity))
                .or_default()
                .insert(user.clone());
        }
        Ok(())
    }

    pub fn remove_user_to_entity_mapping(
        &mut self,
        user: &User,
        entity_type: &EntityType,
        entity: &Entity,
    ) -> Result<()> {
        let present = self
            .user_entities
            .get_mut(user)
            .and_then(|by_type| by_type.get_mut(entity_type))
            .map(|members| members.remove(entity))
            .unwrap_or(false);
        if !present {
            return Err(AccessError::NotFound(format!(
                "mapping from user '{}' to entity '{}' of type '{}'",
                user, entity, entity_type
            )));
        }
        if let Some(reverse) = self
            .entity_users
            .get_mut(&(entity_type.clone(), entity.clone()))
        {
            reverse.remove(user);
        }
        Ok(())
    }

    pub fn add_group_to_entity_mapping(
        &mut self,
        group: &Group,
        entity_type: &EntityType,
        entity: Entity,
    ) -> Result<()> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        self.require_entity(entity_type, &entity)?;
        let members = self
            .group_entities
            .entry(group.clone())
            .or_default()
            .entry(entity_type.clone())
            .or_default();
        if !members.insert(entity.clone()) {
            return Err(AccessError::AlreadyExists(format!(
                "mapping from group '{}' to entity '{}' of type '{}'",
                group, entity, entity_type
            )));
        }
        if self.store_bidirectional_mappings {
            self.entity_groups
                .entry((entity_type.clone(), entity))
                .or_default()
                .insert(group.clone());
        }
        Ok(())
    }

    pub fn remove_group_to_entity_mapping(
        &mut self,
        group: &Group,
        entity_type: &EntityType,
        entity: &Entity,
    ) -> Result<()> {
        let present = self
            .group_entities
            .get_mut(group)
            .and_then(|by_type| by_type.get_mut(entity_type))
            .map(|members| members.remove(entity))
            .unwrap_or(false);
        if !present {
            return Err(AccessError::NotFound(format!(
                "mapping from group '{}' to entity '{}' of type '{}'",
                group, entity, entity_type
            )));
        }
        if let Some(reverse) = self
            .entity_groups
            .get_mut(&(entity_type.clone(), entity.clone()))
        {
            reverse.remove(group);
        }
        Ok(())
    }

    fn require_entity(&self, entity_type: &EntityType, entity: &Entity) -> Result<()> {
        let members = self
            .entities
            .get(entity_type)
            .ok_or_else(|| AccessError::EntityTypeNotFound(entity_type.to_string()))?;
        if !members.contains(entity) {
            return Err(AccessError::EntityNotFound(
                entity_type.to_string(),
                entity.to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Containment and listing queries
    // ------------------------------------------------------------------

    pub fn contains_user(&self, user: &User) -> bool {
        self.graph.contains_leaf(user)
    }

    pub fn contains_group(&self, group: &Group) -> bool {
        self.graph.contains_non_leaf(group)
    }

    pub fn contains_entity_type(&self, entity_type: &EntityType) -> bool {
        self.entities.contains_key(entity_type)
    }

    pub fn contains_entity(&self, entity_type: &EntityType, entity: &Entity) -> bool {
        self.entities
            .get(entity_type)
            .map(|members| members.contains(entity))
            .unwrap_or(false)
    }

    pub fn get_users(&self) -> Vec<User> {
        self.graph.leaves().cloned().collect()
    }

    pub fn get_groups(&self) -> Vec<Group> {
        self.graph.non_leaves().cloned().collect()
    }

    pub fn get_entity_types(&self) -> Vec<EntityType> {
        self.entities.keys().cloned().collect()
    }

    pub fn get_entities(&self, entity_type: &EntityType) -> Result<Vec<Entity>> {
        self.entities
            .get(entity_type)
            .map(|members| members.iter().cloned().collect())
            .ok_or_else(|| AccessError::EntityTypeNotFound(entity_type.to_string()))
    }

    // ------------------------------------------------------------------
    // Membership queries
    // ------------------------------------------------------------------

    pub fn get_user_to_group_mappings(
        &self,
        user: &User,
        include_indirect: bool,
    ) -> Result<HashSet<Group>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        if include_indirect {
            Ok(self.graph.traverse_from_leaf(user).cloned().collect())
        } else {
            Ok(self.graph.leaf_edges(user).cloned().collect())
        }
    }

    pub fn get_group_to_group_mappings(
        &self,
        group: &Group,
        include_indirect: bool,
    ) -> Result<HashSet<Group>> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        if include_indirect {
            Ok(self
                .graph
                .traverse_from_non_leaf(group, TraversalDirection::Forward)
                .cloned()
                .collect())
        } else {
            Ok(self.graph.non_leaf_edges(group).cloned().collect())
        }
    }

    /// Users mapped to `group`, directly or (with `include_indirect`)
    /// through any group that can reach it.
    pub fn get_group_to_user_mappings(
        &self,
        group: &Group,
        include_indirect: bool,
    ) -> Result<HashSet<User>> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        let mut users: HashSet<User> = self.graph.leaf_reverse_edges(group).cloned().collect();
        if include_indirect {
            for source in self
                .graph
                .traverse_from_non_leaf(group, TraversalDirection::Reverse)
            {
                users.extend(self.graph.leaf_reverse_edges(source).cloned());
            }
        }
        Ok(users)
    }

    /// The forward closure over a set of groups, excluding the inputs.
    /// Used by the distributed query decomposition against the
    /// group-to-group shard.
    pub fn get_group_to_group_mappings_for_groups(&self, groups: &[Group]) -> HashSet<Group> {
        let mut closure = HashSet::new();
        for group in groups {
            if !self.graph.contains_non_leaf(group) {
                continue;
            }
            closure.extend(
                self.graph
                    .traverse_from_non_leaf(group, TraversalDirection::Forward)
                    .cloned(),
            );
        }
        for group in groups {
            closure.remove(group);
        }
        closure
    }

    // ------------------------------------------------------------------
    // Component access queries
    // ------------------------------------------------------------------

    pub fn get_user_to_component_mappings(&self, user: &User) -> Result<HashSet<ComponentLevel>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        Ok(self.user_components.get(user).cloned().unwrap_or_default())
    }

    pub fn get_group_to_component_mappings(&self, group: &Group) -> Result<HashSet<ComponentLevel>> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        Ok(self.group_components.get(group).cloned().unwrap_or_default())
    }

    pub fn has_access_to_component(
        &self,
        user: &User,
        component: &ApplicationComponent,
        level: &AccessLevel,
    ) -> Result<bool> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        let key = (component.clone(), level.clone());
        if self
            .user_components
            .get(user)
            .map(|mappings| mappings.contains(&key))
            .unwrap_or(false)
        {
            return Ok(true);
        }
        // lazy traversal; stops at the first group granting access
        Ok(self.graph.traverse_from_leaf(user).any(|group| {
            self.group_components
                .get(group)
                .map(|mappings| mappings.contains(&key))
                .unwrap_or(false)
        }))
    }

    /// Access check evaluated against a set of groups, with no user in
    /// play. The group shards answer the fanned-out part of a distributed
    /// `has_access_to_component` with this.
    pub fn has_access_to_component_by_groups(
        &self,
        groups: &[Group],
        component: &ApplicationComponent,
        level: &AccessLevel,
    ) -> bool {
        let key = (component.clone(), level.clone());
        groups.iter().any(|group| {
            self.group_components
                .get(group)
                .map(|mappings| mappings.contains(&key))
                .unwrap_or(false)
        })
    }

    pub fn get_accessible_components(&self, user: &User) -> Result<HashSet<ComponentLevel>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        let mut accessible: HashSet<ComponentLevel> =
            self.user_components.get(user).cloned().unwrap_or_default();
        for group in self.graph.traverse_from_leaf(user) {
            if let Some(mappings) = self.group_components.get(group) {
                accessible.extend(mappings.iter().cloned());
            }
        }
        Ok(accessible)
    }

    pub fn get_accessible_components_by_groups(&self, groups: &[Group]) -> HashSet<ComponentLevel> {
        let mut accessible = HashSet::new();
        for group in groups {
            if let Some(mappings) = self.group_components.get(group) {
                accessible.extend(mappings.iter().cloned());
            }
        }
        accessible
    }

    /// Users mapped to a component/level, directly or (with
    /// `include_indirect`) through group membership. Requires the reverse
    /// indexes.
    pub fn get_component_to_user_mappings(
        &self,
        component: &ApplicationComponent,
        level: &AccessLevel,
        include_indirect: bool,
    ) -> Result<HashSet<User>> {
        self.require_bidirectional()?;
        let key = (component.clone(), level.clone());
        let mut users: HashSet<User> = self.component_users.get(&key).cloned().unwrap_or_default();
        if include_indirect {
            for group in self.component_groups.get(&key).into_iter().flatten() {
                users.extend(self.get_group_to_user_mappings(group, true)?);
            }
        }
        Ok(users)
    }

    pub fn get_component_to_group_mappings(
        &self,
        component: &ApplicationComponent,
        level: &AccessLevel,
    ) -> Result<HashSet<Group>> {
        self.require_bidirectional()?;
        let key = (component.clone(), level.clone());
        Ok(self.component_groups.get(&key).cloned().unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Entity access queries
    // ------------------------------------------------------------------

    pub fn get_user_to_entity_mappings(&self, user: &User) -> Result<HashSet<EntityRef>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        Ok(self.entity_refs_of_user(user).into_iter().collect())
    }

    pub fn get_group_to_entity_mappings(&self, group: &Group) -> Result<HashSet<EntityRef>> {
        if !self.graph.contains_non_leaf(group) {
            return Err(AccessError::GroupNotFound(group.to_string()));
        }
        Ok(self.entity_refs_of_group(group).into_iter().collect())
    }

    pub fn has_access_to_entity(
        &self,
        user: &User,
        entity_type: &EntityType,
        entity: &Entity,
    ) -> Result<bool> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        self.require_entity(entity_type, entity)?;
        let direct = self
            .user_entities
            .get(user)
            .and_then(|by_type| by_type.get(entity_type))
            .map(|members| members.contains(entity))
            .unwrap_or(false);
        if direct {
            return Ok(true);
        }
        Ok(self.graph.traverse_from_leaf(user).any(|group| {
            self.group_entities
                .get(group)
                .and_then(|by_type| by_type.get(entity_type))
                .map(|members| members.contains(entity))
                .unwrap_or(false)
        }))
    }

    pub fn has_access_to_entity_by_groups(
        &self,
        groups: &[Group],
        entity_type: &EntityType,
        entity: &Entity,
    ) -> bool {
        groups.iter().any(|group| {
            self.group_entities
                .get(group)
                .and_then(|by_type| by_type.get(entity_type))
                .map(|members| members.contains(entity))
                .unwrap_or(false)
        })
    }

    pub fn get_accessible_entities(&self, user: &User) -> Result<HashSet<EntityRef>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        let mut accessible: HashSet<EntityRef> =
            self.entity_refs_of_user(user).into_iter().collect();
        for group in self.graph.traverse_from_leaf(user) {
            accessible.extend(self.entity_refs_of_group(group));
        }
        Ok(accessible)
    }

    pub fn get_accessible_entities_of_type(
        &self,
        user: &User,
        entity_type: &EntityType,
    ) -> Result<HashSet<Entity>> {
        if !self.graph.contains_leaf(user) {
            return Err(AccessError::UserNotFound(user.to_string()));
        }
        if !self.entities.contains_key(entity_type) {
            return Err(AccessError::EntityTypeNotFound(entity_type.to_string()));
        }
        let mut accessible: HashSet<Entity> = self
            .user_entities
            .get(user)
            .and_then(|by_type| by_type.get(entity_type))
            .cloned()
            .unwrap_or_default();
        for group in self.graph.traverse_from_leaf(user) {
            if let Some(members) = self
                .group_entities
                .get(group)
                .and_then(|by_type| by_type.get(entity_type))
            {
                accessible.extend(members.iter().cloned());
            }
        }
        Ok(accessible)
    }

    pub fn get_accessible_entities_by_groups(&self, groups: &[Group]) -> HashSet<EntityRef> {
        let mut accessible = HashSet::new();
        for group in groups {
            accessible.extend(self.entity_refs_of_group(group));
        }
        accessible
    }

    pub fn get_entity_to_user_mappings(
        &self,
        entity_type: &EntityType,
        entity: &Entity,
        include_indirect: bool,
    ) -> Result<HashSet<User>> {
        self.require_bidirectional()?;
        self.require_entity(entity_type, entity)?;
        let key = (entity_type.clone(), entity.clone());
        let mut users: HashSet<User> = self.entity_users.get(&key).cloned().unwrap_or_default();
        if include_indirect {
            for group in self.entity_groups.get(&key).into_iter().flatten() {
                users.extend(self.get_group_to_user_mappings(group, true)?);
            }
        }
        Ok(users)
    }

    fn require_bidirectional(&self) -> Result<()> {
        if self.store_bidirectional_mappings {
            Ok(())
        } else {
            Err(AccessError::InvalidArgument(
                "reverse mapping queries require bidirectional mapping storage".to_string(),
            ))
        }
    }

    fn entity_refs_of_user(&self, user: &User) -> Vec<EntityRef> {
        let mut refs: Vec<EntityRef> = self
            .user_entities
            .get(user)
            .into_iter()
            .flat_map(|by_type| {
                by_type.iter().flat_map(|(entity_type, members)| {
                    members
                        .iter()
                        .map(move |entity| (entity_type.clone(), entity.clone()))
                })
            })
            .collect();
        refs.sort();
        refs
    }

    fn entity_refs_of_group(&self, group: &Group) -> Vec<EntityRef> {
        let mut refs: Vec<EntityRef> = self
            .group_entities
            .get(group)
            .into_iter()
            .flat_map(|by_type| {
                by_type.iter().flat_map(|(entity_type, members)| {
                    members
                        .iter()
                        .map(move |entity| (entity_type.clone(), entity.clone()))
                })
            })
            .collect();
        refs.sort();
        refs
    }

    fn users_of_entity(&self, entity_type: &EntityType, entity: &Entity) -> Vec<User> {
        if self.store_bidirectional_mappings {
            self.entity_users
                .get(&(entity_type.clone(), entity.clone()))
                .into_iter()
                .flat_map(|users| users.iter().cloned())
                .collect()
        } else {
            self.user_entities
                .iter()
                .filter(|(_, by_type)| {
                    by_type
                        .get(entity_type)
                        .map(|members| members.contains(entity))
                        .unwrap_or(false)
                })
                .map(|(user, _)| user.clone())
                .collect()
        }
    }

    fn groups_of_entity(&self, entity_type: &EntityType, entity: &Entity) -> Vec<Group> {
        if self.store_bidirectional_mappings {
            self.entity_groups
                .get(&(entity_type.clone(), entity.clone()))
                .into_iter()
                .flat_map(|groups| groups.iter().cloned())
                .collect()
        } else {
            self.group_entities
                .iter()
                .filter(|(_, by_type)| {
                    by_type
                        .get(entity_type)
                        .map(|members| members.contains(entity))
                        .unwrap_or(false)
                })
                .map(|(group, _)| group.clone())
                .collect()
        }
    }
}

impl Default for AccessStore {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Structural equality over the full model, used by the load/replay
/// equivalence tests. Graph vertex/edge sets and every mapping table must
/// match.
impl PartialEq for AccessStore {
    fn eq(&self, other: &Self) -> bool {
        let users_eq = {
            let mut left = self.get_users();
            let mut right = other.get_users();
            left.sort();
            right.sort();
            left == right
        };
        let groups_eq = {
            let mut left = self.get_groups();
            let mut right = other.get_groups();
            left.sort();
            right.sort();
            left == right
        };
        users_eq
            && groups_eq
            && self.entities == other.entities
            && self.user_components == other.user_components
            && self.group_components == other.group_components
            && self.user_entities == other.user_entities
            && self.group_entities == other.group_entities
            && self
                .get_users()
                .iter()
                .all(|user| {
                    let mut left: Vec<&Group> = self.graph.leaf_edges(user).collect();
                    let mut right: Vec<&Group> = other.graph.leaf_edges(user).collect();
                    left.sort();
                    right.sort();
                    left == right
                })
            && self.get_groups().iter().all(|group| {
                let mut left: Vec<&Group> = self.graph.non_leaf_edges(group).collect();
                let mut right: Vec<&Group> = other.graph.non_leaf_edges(group).collect();
                left.sort();
                right.sort();
                left == right
            })
    }
}
