// # Temporal Event Model
//
// Every change to the authorization model is expressed as an event: a shared
// header (id, action, occurredAt, hashCode) plus a tagged payload, one
// variant per mapping or element kind. Events are immutable once persisted.
//
// The routing hash code is derived from the stable string form of the
// event's primary key and decides shard ownership.

pub mod buffer;
pub mod cache;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::KeyHasher;
use crate::model::{AccessLevel, ApplicationComponent, Entity, EntityType, Group, User};

/// Whether the event asserts or retracts a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Add,
    Remove,
}

/// Event category. One buffer queue exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    User,
    Group,
    EntityType,
    Entity,
    UserToGroup,
    GroupToGroup,
    UserToComponent,
    GroupToComponent,
    UserToEntity,
    GroupToEntity,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::User,
        EventKind::Group,
        EventKind::EntityType,
        EventKind::Entity,
        EventKind::UserToGroup,
        EventKind::GroupToGroup,
        EventKind::UserToComponent,
        EventKind::GroupToComponent,
        EventKind::UserToEntity,
        EventKind::GroupToEntity,
    ];

    /// Deterministic tie-break when merging category queues at flush time:
    /// users before groups before mappings before entities.
    pub fn flush_priority(self) -> u8 {
        match self {
            EventKind::User => 0,
            EventKind::Group => 1,
            EventKind::UserToGroup => 2,
            EventKind::GroupToGroup => 3,
            EventKind::UserToComponent => 4,
            EventKind::GroupToComponent => 5,
            EventKind::EntityType => 6,
            EventKind::Entity => 7,
            EventKind::UserToEntity => 8,
            EventKind::GroupToEntity => 9,
        }
    }

    /// Primary elements cascade on removal; mappings do not.
    pub fn is_primary_element(self) -> bool {
        matches!(
            self,
            EventKind::User | EventKind::Group | EventKind::EntityType | EventKind::Entity
        )
    }
}

/// The tagged event payload. Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventData {
    User {
        user: User,
    },
    Group {
        group: Group,
    },
    EntityType {
        entity_type: EntityType,
    },
    Entity {
        entity_type: EntityType,
        entity: Entity,
    },
    UserToGroup {
        user: User,
        group: Group,
    },
    GroupToGroup {
        from_group: Group,
        to_group: Group,
    },
    UserToComponent {
        user: User,
        component: ApplicationComponent,
        level: AccessLevel,
    },
    GroupToComponent {
        group: Group,
        component: ApplicationComponent,
        level: AccessLevel,
    },
    UserToEntity {
        user: User,
        entity_type: EntityType,
        entity: Entity,
    },
    GroupToEntity {
        group: Group,
        entity_type: EntityType,
        entity: Entity,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::User { .. } => EventKind::User,
            EventData::Group { .. } => EventKind::Group,
            EventData::EntityType { .. } => EventKind::EntityType,
            EventData::Entity { .. } => EventKind::Entity,
            EventData::UserToGroup { .. } => EventKind::UserToGroup,
            EventData::GroupToGroup { .. } => EventKind::GroupToGroup,
            EventData::UserToComponent { .. } => EventKind::UserToComponent,
            EventData::GroupToComponent { .. } => EventKind::GroupToComponent,
            EventData::UserToEntity { .. } => EventKind::UserToEntity,
            EventData::GroupToEntity { .. } => EventKind::GroupToEntity,
        }
    }

    /// The stable string the routing hash is computed over. User-keyed
    /// events route by user, group-keyed events by group, group-to-group
    /// edges by their source group, and entity-keyed events by entity type.
    pub fn route_key(&self) -> &str {
        match self {
            EventData::User { user } | EventData::UserToGroup { user, .. } => user.as_str(),
            EventData::UserToComponent { user, .. } | EventData::UserToEntity { user, .. } => {
                user.as_str()
            }
            EventData::Group { group }
            | EventData::GroupToComponent { group, .. }
            | EventData::GroupToEntity { group, .. } => group.as_str(),
            EventData::GroupToGroup { from_group, .. } => from_group.as_str(),
            EventData::EntityType { entity_type } | EventData::Entity { entity_type, .. } => {
                entity_type.as_str()
            }
        }
    }
}

/// A single immutable change to the authorization model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event id.
    pub id: Uuid,
    pub action: EventAction,
    pub data: EventData,
    /// Assigned at the writer at enqueue time; monotonically non-decreasing
    /// per writer with 100ns granularity.
    #[serde(with = "ticks")]
    pub occurred_at: DateTime<Utc>,
    /// Routing key over the full i32 domain.
    pub hash_code: i32,
}

impl Event {
    pub fn new(
        action: EventAction,
        data: EventData,
        occurred_at: DateTime<Utc>,
        hasher: &dyn KeyHasher,
    ) -> Self {
        let hash_code = hasher.hash_key(data.route_key());
        Self {
            id: Uuid::new_v4(),
            action,
            data,
            occurred_at,
            hash_code,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

/// The minimum representable `occurred_at` increment: one tick (100ns),
/// matching the 7-digit fractional seconds of the wire format.
pub fn tick() -> chrono::Duration {
    chrono::Duration::nanoseconds(100)
}

/// Serde adapter for `occurred_at`: ISO 8601 UTC with exactly 7 fractional
/// digits on serialize; any RFC 3339 offset/precision accepted on parse.
pub mod ticks {
    use chrono::{DateTime, Timelike, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sub_ticks = (ts.nanosecond() % 1_000_000_000) / 100;
        let formatted = format!("{}.{:07}Z", ts.format("%Y-%m-%dT%H:%M:%S"), sub_ticks);
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use chrono::TimeZone;

    #[test]
    fn test_route_key_selection() {
        let data = EventData::UserToGroup {
            user: User::new("u1"),
            group: Group::new("g1"),
        };
        assert_eq!(data.route_key(), "u1");

        let data = EventData::GroupToGroup {
            from_group: Group::new("g1"),
            to_group: Group::new("g2"),
        };
        assert_eq!(data.route_key(), "g1");

        let data = EventData::Entity {
            entity_type: EntityType::new("Clients"),
            entity: Entity::new("AcmeCorp"),
        };
        assert_eq!(data.route_key(), "Clients");
    }

    #[test]
    fn test_hash_code_matches_route_key() {
        let hasher = Fnv1aKeyHasher;
        let event = Event::new(
            EventAction::Add,
            EventData::User { user: User::new("u1") },
            Utc::now(),
            &hasher,
        );
        assert_eq!(event.hash_code, crate::common::fnv1a_hash32("u1"));
    }

    #[test]
    fn test_occurred_at_seven_digit_wire_form() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::nanoseconds(5_897_900);
        let event = Event {
            id: Uuid::nil(),
            action: EventAction::Add,
            data: EventData::User { user: User::new("u1") },
            occurred_at: ts,
            hash_code: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["occurredAt"], "2025-03-14T09:26:53.0058979Z");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.occurred_at, ts);
    }

    #[test]
    fn test_kind_and_payload_tagging() {
        let event = Event::new(
            EventAction::Remove,
            EventData::UserToGroup {
                user: User::new("u1"),
                group: Group::new("g1"),
            },
            Utc::now(),
            &Fnv1aKeyHasher,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "Remove");
        assert_eq!(json["data"]["kind"], "UserToGroup");
        assert_eq!(json["data"]["payload"]["user"], "u1");
        assert_eq!(json["data"]["payload"]["group"], "g1");
    }

    #[test]
    fn test_flush_priority_ordering() {
        assert!(EventKind::User.flush_priority() < EventKind::Group.flush_priority());
        assert!(EventKind::Group.flush_priority() < EventKind::UserToGroup.flush_priority());
        assert!(EventKind::GroupToComponent.flush_priority() < EventKind::EntityType.flush_priority());
    }

    #[test]
    fn test_bincode_round_trip() {
        let event = Event::new(
            EventAction::Add,
            EventData::GroupToEntity {
                group: Group::new("g1"),
                entity_type: EntityType::new("Clients"),
                entity: Entity::new("AcmeCorp"),
            },
            Utc::now(),
            &Fnv1aKeyHasher,
        );
        let bytes = bincode::serde::encode_to_vec(&event, bincode::config::standard()).unwrap();
        let (back, _): (Event, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, event);
    }
}
