//! Identity types for CANOPY entities.
//!
//! Every cached entity carries a 128-bit comparable identifier. Ids are
//! UUIDv7 so freshly allocated ids sort by creation time, which keeps the
//! durable store's id-keyed tables roughly append-ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Row identifier of an external schema class (64-bit, as noted in the data
/// model: class/instance ids come from the consumer's schema, not from us).
pub type ClassId = u64;

/// Row identifier of an external schema instance.
pub type InstanceId = u64;

/// Raw serialized node payload, opaque to the cache.
pub type RawContent = Vec<u8>;

/// Common behavior of typed entity ids.
///
/// Generic code (key builders, resolvers) uses this instead of naming a
/// concrete id type.
pub trait EntityIdType: Copy + Eq + Ord + std::hash::Hash + fmt::Display {
    /// Wrap an existing UUID.
    fn from_uuid(id: Uuid) -> Self;

    /// Generate a new timestamp-sortable UUIDv7 id.
    fn now_v7() -> Self;

    /// The underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// The nil id. Never a valid entity identity; used to detect
    /// caller programming errors.
    fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    /// Whether this is the nil id.
    fn is_nil(&self) -> bool {
        self.as_uuid().is_nil()
    }

    /// Big-endian bytes, suitable as an ordered store key.
    fn to_bytes(&self) -> [u8; 16] {
        *self.as_uuid().as_bytes()
    }
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a new timestamp-sortable UUIDv7 id.
            pub fn now_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// The nil id; never a valid entity identity.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Whether this is the nil id.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Big-endian bytes, suitable as an ordered store key.
            pub fn to_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            /// Rebuild an id from its big-endian byte form.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl EntityIdType for $name {
            fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            fn now_v7() -> Self {
                Self(Uuid::now_v7())
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

entity_id!(
    /// Identifier of a [`Ruleset`](crate::Ruleset).
    RulesetId
);
entity_id!(
    /// Identifier of a [`RulesetVariables`](crate::RulesetVariables) set.
    VariablesId
);
entity_id!(
    /// Identifier of a [`HierarchyLevel`](crate::HierarchyLevel).
    HierarchyLevelId
);
entity_id!(
    /// Identifier of a [`DataSource`](crate::DataSource).
    DataSourceId
);
entity_id!(
    /// Identifier of a [`Node`](crate::Node).
    NodeId
);
entity_id!(
    /// Tag marking a superseded hierarchy-level generation awaiting cleanup.
    RemovalId
);
