// Event validator
//
// Dry-run applies each incoming primary event against a shadow reference
// store to check referential validity. A remove of a primary element
// additionally synthesizes the full cascade as an ordered sequence of
// secondary remove events that must precede the primary. The shadow store
// is owned exclusively by the validator; no locking is involved.

use crate::error::{AccessError, Result};
use crate::event::{EventAction, EventData};
use crate::store::AccessStore;

pub struct EventValidator {
    shadow: AccessStore,
}

impl EventValidator {
    /// An empty shadow store. Writers restarting over existing storage use
    /// [`EventValidator::with_shadow`] with a replayed store instead.
    pub fn new(store_bidirectional_mappings: bool) -> Self {
        Self {
            shadow: AccessStore::new(store_bidirectional_mappings),
        }
    }

    pub fn with_shadow(shadow: AccessStore) -> Self {
        Self { shadow }
    }

    /// Validate a primary change and synthesize its cascade.
    ///
    /// On success the shadow store has the prepends and the primary applied,
    /// and the returned sequence holds the secondary removes in the order
    /// they must be enqueued (each precedes the primary). On failure the
    /// shadow is untouched and the reason surfaces as the matching
    /// argument/not-found error.
    pub fn validate(&mut self, action: EventAction, data: &EventData) -> Result<Vec<EventData>> {
        self.shadow.check_apply(action, data)?;

        let prepends = if action == EventAction::Remove && data.kind().is_primary_element() {
            self.shadow.cascading_removes(data)
        } else {
            Vec::new()
        };

        // The prepends were derived from current shadow state, so applying
        // them and then the primary cannot fail; a failure here means the
        // cascade derivation and the store disagree.
        for prepend in &prepends {
            self.shadow
                .apply(EventAction::Remove, prepend)
                .map_err(|e| {
                    AccessError::Internal(format!("cascade apply diverged from store: {}", e))
                })?;
        }
        self.shadow.apply(action, data).map_err(|e| {
            AccessError::Internal(format!("validated event failed to apply: {}", e))
        })?;

        Ok(prepends)
    }

    /// Read access to the shadow, for status inspection in tests.
    pub fn shadow(&self) -> &AccessStore {
        &self.shadow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, ApplicationComponent, Group, User};

    fn validator_with_membership() -> EventValidator {
        let mut validator = EventValidator::new(true);
        validator
            .validate(EventAction::Add, &EventData::User { user: User::new("u1") })
            .unwrap();
        validator
            .validate(EventAction::Add, &EventData::Group { group: Group::new("g1") })
            .unwrap();
        validator
            .validate(
                EventAction::Add,
                &EventData::UserToGroup {
                    user: User::new("u1"),
                    group: Group::new("g1"),
                },
            )
            .unwrap();
        validator
    }

    #[test]
    fn test_invalid_event_rejected_without_side_effects() {
        let mut validator = EventValidator::new(true);
        let err = validator
            .validate(
                EventAction::Add,
                &EventData::UserToGroup {
                    user: User::new("u1"),
                    group: Group::new("g1"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, AccessError::UserNotFound(_)));
        assert!(validator.shadow().get_users().is_empty());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut validator = validator_with_membership();
        let err = validator
            .validate(EventAction::Add, &EventData::User { user: User::new("u1") })
            .unwrap_err();
        assert!(matches!(err, AccessError::AlreadyExists(_)));
    }

    #[test]
    fn test_remove_user_synthesizes_cascade() {
        let mut validator = validator_with_membership();
        let prepends = validator
            .validate(EventAction::Remove, &EventData::User { user: User::new("u1") })
            .unwrap();
        assert_eq!(
            prepends,
            vec![EventData::UserToGroup {
                user: User::new("u1"),
                group: Group::new("g1"),
            }]
        );
        // shadow reflects the full remove
        assert!(!validator.shadow().contains_user(&User::new("u1")));
    }

    #[test]
    fn test_remove_group_cascade_covers_components() {
        let mut validator = validator_with_membership();
        validator
            .validate(
                EventAction::Add,
                &EventData::GroupToComponent {
                    group: Group::new("g1"),
                    component: ApplicationComponent::new("Orders"),
                    level: AccessLevel::new("View"),
                },
            )
            .unwrap();

        let prepends = validator
            .validate(EventAction::Remove, &EventData::Group { group: Group::new("g1") })
            .unwrap();
        assert_eq!(
            prepends,
            vec![
                EventData::UserToGroup {
                    user: User::new("u1"),
                    group: Group::new("g1"),
                },
                EventData::GroupToComponent {
                    group: Group::new("g1"),
                    component: ApplicationComponent::new("Orders"),
                    level: AccessLevel::new("View"),
                },
            ]
        );
    }

    #[test]
    fn test_mapping_remove_has_no_cascade() {
        let mut validator = validator_with_membership();
        let prepends = validator
            .validate(
                EventAction::Remove,
                &EventData::UserToGroup {
                    user: User::new("u1"),
                    group: Group::new("g1"),
                },
            )
            .unwrap();
        assert!(prepends.is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut validator = EventValidator::new(true);
        for name in ["g1", "g2"] {
            validator
                .validate(EventAction::Add, &EventData::Group { group: Group::new(name) })
                .unwrap();
        }
        validator
            .validate(
                EventAction::Add,
                &EventData::GroupToGroup {
                    from_group: Group::new("g1"),
                    to_group: Group::new("g2"),
                },
            )
            .unwrap();
        let err = validator
            .validate(
                EventAction::Add,
                &EventData::GroupToGroup {
                    from_group: Group::new("g2"),
                    to_group: Group::new("g1"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidArgument(_)));
    }
}
