// Node protocol
//
// Length-prefixed bincode frames between shard clients and shard group
// nodes. One request kind per operation of the writer, reader, cache-pull
// and status surfaces. Errors travel as structured responses carrying the
// stable wire code, the message, and named attributes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ErrorMappingConfig;
use crate::error::AccessError;
use crate::event::{Event, EventAction, EventData};
use crate::model::{AccessLevel, ApplicationComponent, Entity, EntityType, Group, User};

// ============================================================================
// Constants - Bounds for Network Protocol
// ============================================================================

/// Maximum frame size (16MB) accepted on either side; larger frames are
/// rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 16_777_216;

/// Query surface of a shard group node. The `*ByGroups` and `*ForGroups`
/// forms carry a group set computed elsewhere; the distributed query
/// decomposition fans them out to the shards owning the group data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    GetUsers,
    GetGroups,
    GetEntityTypes,
    GetEntities {
        entity_type: EntityType,
    },
    ContainsUser {
        user: User,
    },
    ContainsGroup {
        group: Group,
    },
    ContainsEntityType {
        entity_type: EntityType,
    },
    ContainsEntity {
        entity_type: EntityType,
        entity: Entity,
    },
    GetUserToGroupMappings {
        user: User,
        include_indirect: bool,
    },
    GetGroupToUserMappings {
        group: Group,
        include_indirect: bool,
    },
    GetGroupToGroupMappings {
        group: Group,
        include_indirect: bool,
    },
    GetGroupToGroupMappingsForGroups {
        groups: Vec<Group>,
    },
    GetUserToComponentMappings {
        user: User,
    },
    GetGroupToComponentMappings {
        group: Group,
    },
    HasAccessToComponent {
        user: User,
        component: ApplicationComponent,
        level: AccessLevel,
    },
    HasAccessToComponentByGroups {
        groups: Vec<Group>,
        component: ApplicationComponent,
        level: AccessLevel,
    },
    GetAccessibleComponents {
        user: User,
    },
    GetAccessibleComponentsByGroups {
        groups: Vec<Group>,
    },
    GetUserToEntityMappings {
        user: User,
    },
    GetGroupToEntityMappings {
        group: Group,
    },
    HasAccessToEntity {
        user: User,
        entity_type: EntityType,
        entity: Entity,
    },
    HasAccessToEntityByGroups {
        groups: Vec<Group>,
        entity_type: EntityType,
        entity: Entity,
    },
    GetAccessibleEntities {
        user: User,
    },
    GetAccessibleEntitiesOfType {
        user: User,
        entity_type: EntityType,
    },
    GetAccessibleEntitiesByGroups {
        groups: Vec<Group>,
    },
}

/// Result shapes for the query surface. Collections are sorted so replies
/// are deterministic and mergeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryReply {
    Bool(bool),
    Users(Vec<User>),
    Groups(Vec<Group>),
    EntityTypes(Vec<EntityType>),
    Entities(Vec<Entity>),
    ComponentLevels(Vec<(ApplicationComponent, AccessLevel)>),
    EntityRefs(Vec<(EntityType, Entity)>),
}

// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Writer ingress: validate, stamp and buffer one change.
    ApplyEvent {
        action: EventAction,
        data: EventData,
    },
    /// Writer ingress for pre-formed events (range copy, router release);
    /// ids and timestamps are preserved.
    IngestEvents {
        events: Vec<Event>,
    },
    Query(Query),
    /// Cache pull; `None` asks for the whole retained window.
    EventsSince {
        prior_event_id: Option<Uuid>,
    },
    /// Writer status: buffered, not-yet-flushed event count.
    ProcessingCount,
    Flush,
    Ping,
}

// Server response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// `event_id` is `None` when the write was accepted but held or dropped
    /// (router pause, merge collision).
    Applied {
        event_id: Option<Uuid>,
    },
    Ingested {
        accepted: usize,
    },
    Query(QueryReply),
    Events(Vec<Event>),
    Count(usize),
    Ok,
    Pong,
    Error(ErrorResponse),
}

/// Structured wire error: stable code, message, named attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub attributes: Vec<(String, String)>,
}

impl ErrorResponse {
    /// Shape an error for the wire according to the node's error-mapping
    /// configuration.
    pub fn from_error(error: &AccessError, config: &ErrorMappingConfig) -> Self {
        if config.override_internal_server_errors && error.is_internal() {
            let message = if config.include_inner_exceptions {
                format!("service unavailable: {}", error)
            } else {
                "service unavailable".to_string()
            };
            return Self {
                code: "ServiceUnavailableException".to_string(),
                message,
                attributes: Vec::new(),
            };
        }
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            attributes: error.attributes(),
        }
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    /// Rebuild the client-side error from the wire form. Codes without a
    /// dedicated variant fall back to their base classification.
    pub fn into_error(self) -> AccessError {
        match self.code.as_str() {
            "ArgumentException" => AccessError::InvalidArgument(self.message),
            "ArgumentNullException" => AccessError::NullArgument(self.message),
            "ArgumentOutOfRangeException" => AccessError::ArgumentOutOfRange(self.message),
            "UserNotFoundException" => {
                AccessError::UserNotFound(self.attribute("User").unwrap_or(self.message))
            }
            "GroupNotFoundException" => {
                AccessError::GroupNotFound(self.attribute("Group").unwrap_or(self.message))
            }
            "EntityTypeNotFoundException" => AccessError::EntityTypeNotFound(
                self.attribute("EntityType").unwrap_or(self.message),
            ),
            "EntityNotFoundException" => AccessError::EntityNotFound(
                self.attribute("EntityType").unwrap_or_default(),
                self.attribute("Entity").unwrap_or(self.message),
            ),
            "NotFoundException" => AccessError::NotFound(self.message),
            "ServiceUnavailableException" => AccessError::ServiceUnavailable(self.message),
            "EventCacheEmptyException" => AccessError::EventCacheEmpty,
            "EventNotCachedException" => self
                .attribute("EventId")
                .and_then(|raw| raw.parse().ok())
                .map(AccessError::EventNotCached)
                .unwrap_or(AccessError::NotFound(self.message)),
            "PersistentStorageEmptyException" => AccessError::PersistentStorageEmpty,
            "BufferFlushingException" => AccessError::BufferFlushing(self.message),
            "TimeoutException" => AccessError::Timeout(self.message),
            "OperationCanceledException" => AccessError::Cancelled,
            "NetworkException" => AccessError::Network(self.message),
            _ => AccessError::Internal(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_round_trip_preserves_specialization() {
        let config = ErrorMappingConfig {
            include_inner_exceptions: false,
            override_internal_server_errors: true,
        };
        let wire = ErrorResponse::from_error(&AccessError::UserNotFound("u1".to_string()), &config);
        assert_eq!(wire.code, "UserNotFoundException");
        match wire.into_error() {
            AccessError::UserNotFound(user) => assert_eq!(user, "u1"),
            other => panic!("expected UserNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_internal_errors_collapse_when_configured() {
        let config = ErrorMappingConfig {
            include_inner_exceptions: false,
            override_internal_server_errors: true,
        };
        let wire =
            ErrorResponse::from_error(&AccessError::Internal("index corrupt".to_string()), &config);
        assert_eq!(wire.code, "ServiceUnavailableException");
        assert_eq!(wire.message, "service unavailable");

        let verbose = ErrorMappingConfig {
            include_inner_exceptions: true,
            override_internal_server_errors: true,
        };
        let wire = ErrorResponse::from_error(
            &AccessError::Internal("index corrupt".to_string()),
            &verbose,
        );
        assert!(wire.message.contains("index corrupt"));
    }

    #[test]
    fn test_internal_errors_surface_when_override_disabled() {
        let config = ErrorMappingConfig {
            include_inner_exceptions: true,
            override_internal_server_errors: false,
        };
        let wire =
            ErrorResponse::from_error(&AccessError::Internal("index corrupt".to_string()), &config);
        assert_eq!(wire.code, "InternalServerException");
    }

    #[test]
    fn test_request_bincode_round_trip() {
        let request = Request::Query(Query::HasAccessToComponent {
            user: User::new("u1"),
            component: ApplicationComponent::new("Orders"),
            level: AccessLevel::new("View"),
        });
        let bytes = bincode::serde::encode_to_vec(&request, bincode::config::standard()).unwrap();
        let (back, _): (Request, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, request);
    }
}
