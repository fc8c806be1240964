// # Authorization Model Identifiers
//
// Opaque identifier newtypes for every element of the permission model.
// All of them share the same contract: a total order, a stable string form
// (the routing stringifier), and hash/equality by that string. The store is
// monomorphic over these types; the wire uses their string form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A leaf vertex of the permission graph; an end principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct User(String);

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        User(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-leaf vertex of the permission graph; a collection of users and/or
/// other groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(String);

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Group(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A namespace for entities. Removing an entity type cascades to every
/// entity within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(id: impl Into<String>) -> Self {
        EntityType(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A business object within an entity type namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(String);

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Entity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A function or screen of the protected application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationComponent(String);

impl ApplicationComponent {
    pub fn new(id: impl Into<String>) -> Self {
        ApplicationComponent(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A level of access to an application component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessLevel(String);

impl AccessLevel {
    pub fn new(id: impl Into<String>) -> Self {
        AccessLevel(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_total_order_and_stringification() {
        let mut users = BTreeSet::new();
        users.insert(User::new("u2"));
        users.insert(User::new("u1"));
        let ordered: Vec<String> = users.iter().map(|u| u.to_string()).collect();
        assert_eq!(ordered, vec!["u1", "u2"]);
    }

    #[test]
    fn test_serde_is_transparent() {
        let group = Group::new("admins");
        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(json, "\"admins\"");
        let back: Group = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group);
    }
}
