// # Shard Configuration
//
// A shard group is a writer, its readers, an event cache and persistent
// storage, collectively owning a contiguous hash range for one role. The
// configuration is the ordered set of shard groups per role, persisted
// centrally and versioned by a monotonic generation counter. Readers take
// copy-on-write snapshots; cutover publishes a new generation atomically.

pub mod client;
pub mod instance;
pub mod split;

pub use client::{ShardClient, ShardConnector, ShardNodeClient, SwappableNodeClient};
pub use instance::{FileInstanceManager, InstanceManager, MemoryInstanceManager};
pub use split::{
    MergeShardGroupsRequest, ShardGroupOrchestrator, ShardGroupProvisioner,
    SplitShardGroupRequest,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AccessError, Result};
use crate::event::EventKind;

/// Which portion of the model a shard group owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardGroupRole {
    User,
    Group,
    GroupToGroup,
}

impl ShardGroupRole {
    /// The role owning a single-shard event kind. `None` for entity kinds,
    /// which are fanned out to every shard group of the User and Group
    /// roles (entity mappings on every shard validate against them).
    pub fn for_kind(kind: EventKind) -> Option<ShardGroupRole> {
        match kind {
            EventKind::User
            | EventKind::UserToGroup
            | EventKind::UserToComponent
            | EventKind::UserToEntity => Some(ShardGroupRole::User),
            EventKind::Group | EventKind::GroupToComponent | EventKind::GroupToEntity => {
                Some(ShardGroupRole::Group)
            }
            EventKind::GroupToGroup => Some(ShardGroupRole::GroupToGroup),
            EventKind::EntityType | EventKind::Entity => None,
        }
    }

    pub const ALL: [ShardGroupRole; 3] = [
        ShardGroupRole::User,
        ShardGroupRole::Group,
        ShardGroupRole::GroupToGroup,
    ];
}

impl std::fmt::Display for ShardGroupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardGroupRole::User => "user",
            ShardGroupRole::Group => "group",
            ShardGroupRole::GroupToGroup => "group-to-group",
        };
        write!(f, "{}", name)
    }
}

/// One shard group of the configuration. Ownership of a hash code is
/// decided by nearest-lower-or-equal `hash_range_start` within the role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardGroupDescriptor {
    pub name: String,
    pub role: ShardGroupRole,
    pub hash_range_start: i32,
    pub writer_endpoint: String,
    pub reader_endpoints: Vec<String>,
    /// Name of the persistent storage instance backing the group.
    pub storage_instance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfiguration {
    pub generation: u64,
    pub groups: Vec<ShardGroupDescriptor>,
}

impl ShardConfiguration {
    pub fn new() -> Self {
        Self {
            generation: 0,
            groups: Vec::new(),
        }
    }

    /// Structural invariants: within each populated role, range starts are
    /// unique and exactly one group covers `i32::MIN`; the group-to-group
    /// role is a singleton.
    pub fn validate(&self) -> Result<()> {
        for role in ShardGroupRole::ALL {
            let starts: Vec<i32> = self
                .groups
                .iter()
                .filter(|group| group.role == role)
                .map(|group| group.hash_range_start)
                .collect();
            if starts.is_empty() {
                continue;
            }
            let mut deduped = starts.clone();
            deduped.sort_unstable();
            deduped.dedup();
            if deduped.len() != starts.len() {
                return Err(AccessError::Configuration(format!(
                    "duplicate hash range start within role '{}'",
                    role
                )));
            }
            if !starts.contains(&i32::MIN) {
                return Err(AccessError::Configuration(format!(
                    "no shard group of role '{}' covers the minimum hash value",
                    role
                )));
            }
            if role == ShardGroupRole::GroupToGroup && starts.len() != 1 {
                return Err(AccessError::Configuration(
                    "the group-to-group role must have exactly one shard group".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Groups of one role, sorted by range start.
    pub fn groups_for_role(&self, role: ShardGroupRole) -> Vec<&ShardGroupDescriptor> {
        let mut groups: Vec<&ShardGroupDescriptor> = self
            .groups
            .iter()
            .filter(|group| group.role == role)
            .collect();
        groups.sort_by_key(|group| group.hash_range_start);
        groups
    }

    /// The group owning `hash` within a role: largest range start at or
    /// below the hash.
    pub fn group_for(&self, role: ShardGroupRole, hash: i32) -> Result<&ShardGroupDescriptor> {
        self.groups_for_role(role)
            .into_iter()
            .filter(|group| group.hash_range_start <= hash)
            .next_back()
            .ok_or_else(|| {
                AccessError::Configuration(format!(
                    "no shard group of role '{}' owns hash {}",
                    role, hash
                ))
            })
    }

    pub fn find(&self, role: ShardGroupRole, hash_range_start: i32) -> Option<&ShardGroupDescriptor> {
        self.groups
            .iter()
            .find(|group| group.role == role && group.hash_range_start == hash_range_start)
    }

    /// The inclusive hash range `[start, end]` a group owns: up to one
    /// below the next start in the role, or `i32::MAX` for the last group.
    pub fn range_of(&self, role: ShardGroupRole, hash_range_start: i32) -> Result<(i32, i32)> {
        let groups = self.groups_for_role(role);
        let index = groups
            .iter()
            .position(|group| group.hash_range_start == hash_range_start)
            .ok_or_else(|| {
                AccessError::NotFound(format!(
                    "shard group of role '{}' starting at {}",
                    role, hash_range_start
                ))
            })?;
        let end = groups
            .get(index + 1)
            .map(|next| next.hash_range_start - 1)
            .unwrap_or(i32::MAX);
        Ok((hash_range_start, end))
    }

    pub fn with_group_added(&self, descriptor: ShardGroupDescriptor) -> Result<Self> {
        let mut next = self.clone();
        next.generation += 1;
        next.groups.push(descriptor);
        next.validate()?;
        Ok(next)
    }

    pub fn with_group_removed(&self, role: ShardGroupRole, hash_range_start: i32) -> Result<Self> {
        let mut next = self.clone();
        next.generation += 1;
        let before = next.groups.len();
        next.groups
            .retain(|group| !(group.role == role && group.hash_range_start == hash_range_start));
        if next.groups.len() == before {
            return Err(AccessError::NotFound(format!(
                "shard group of role '{}' starting at {}",
                role, hash_range_start
            )));
        }
        next.validate()?;
        Ok(next)
    }
}

impl Default for ShardConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

/// Central, versioned home of the shard configuration. Snapshots are
/// copy-on-write: readers hold an `Arc` to an immutable generation while
/// cutover swaps in the next one.
pub struct ShardConfigurationStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<ShardConfiguration>>,
}

impl ShardConfigurationStore {
    pub fn in_memory(initial: ShardConfiguration) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(initial)),
        })
    }

    /// Open the persisted configuration, or start empty when the file does
    /// not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let initial = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: ShardConfiguration = serde_json::from_str(&raw)?;
            config.validate()?;
            config
        } else {
            ShardConfiguration::new()
        };
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(initial)),
        })
    }

    pub fn snapshot(&self) -> Arc<ShardConfiguration> {
        self.current.read().clone()
    }

    /// Publish the next generation. The new configuration must be valid and
    /// strictly newer than the current one; persistence happens before the
    /// in-memory swap.
    pub fn publish(&self, next: ShardConfiguration) -> Result<Arc<ShardConfiguration>> {
        next.validate()?;
        let mut current = self.current.write();
        if next.generation <= current.generation {
            return Err(AccessError::Configuration(format!(
                "stale shard configuration generation {} (current {})",
                next.generation, current.generation
            )));
        }
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(&next)?)?;
        }
        let next = Arc::new(next);
        *current = next.clone();
        tracing::info!("published shard configuration generation {}", next.generation);
        Ok(next)
    }
}
