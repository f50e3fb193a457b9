//! Core types for the `CommandCore` retry and consistency pipeline.
//!
//! All identifiers and counters use smart constructors so that an invalid
//! value can never reach the orchestrator or the event store, following the
//! "parse, don't validate" principle.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the aggregate root a command targets.
///
/// Guaranteed to be non-empty (after trimming) and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateRootId(String);

/// Name of the aggregate root type, e.g. `"BankAccount"`.
///
/// Together with [`AggregateRootId`] it forms the address of an event log.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateRootType(String);

/// A globally unique command identifier using UUIDv7 format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Creates a new `CommandId` with the current timestamp.
    pub fn new() -> Self {
        // Uuid::now_v7() always yields a version 7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

/// Version of an aggregate's event log.
///
/// Each committed [`EventStream`](crate::event_stream::EventStream) occupies
/// exactly one version. Versions start at 1 and form a gap-free sequence.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// The version of the first stream ever appended for an aggregate.
    ///
    /// Implemented as a function because nutype prevents const construction.
    pub fn initial() -> Self {
        Self::try_new(1).expect("1 is always a valid stream version")
    }

    /// Returns the version immediately after this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next version should always be valid")
    }
}

/// Maximum number of times a command may be resubmitted to the retry queue.
///
/// Bounded at 100 so a misconfigured command cannot cycle forever.
#[nutype(
    validate(less_or_equal = 100),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryCount(u32);

/// A timestamp for when an event stream was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn aggregate_root_id_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let id = AggregateRootId::try_new(s.clone());
            prop_assert!(id.is_ok());
            let id = id.unwrap();
            prop_assert_eq!(id.as_ref(), &s);
        }

        #[test]
        fn aggregate_root_id_rejects_blank_strings(s in " {0,50}") {
            prop_assert!(AggregateRootId::try_new(s).is_err());
        }

        #[test]
        fn aggregate_root_type_trims_whitespace(s in " {0,10}[a-zA-Z]{1,200} {0,10}") {
            let ty = AggregateRootType::try_new(s.clone()).unwrap();
            prop_assert_eq!(ty.as_ref(), s.trim());
        }

        #[test]
        fn stream_version_rejects_zero_and_accepts_positive(v in 1u64..u64::MAX) {
            prop_assert!(StreamVersion::try_new(0).is_err());
            let version = StreamVersion::try_new(v).unwrap();
            let next: u64 = version.next().into();
            prop_assert_eq!(next, v + 1);
        }

        #[test]
        fn retry_count_is_bounded(n in 0u32..=1000) {
            prop_assert_eq!(RetryCount::try_new(n).is_ok(), n <= 100);
        }
    }

    #[test]
    fn initial_version_is_one() {
        assert_eq!(StreamVersion::initial().into_inner(), 1);
    }

    #[test]
    fn command_ids_are_v7_and_unique() {
        let a = CommandId::new();
        let b = CommandId::new();
        assert_ne!(a, b);
        assert_eq!(a.get_version(), Some(uuid::Version::SortRand));
        assert!(CommandId::try_new(Uuid::nil()).is_err());
    }

    #[test]
    fn retry_count_defaults_to_three() {
        assert_eq!(RetryCount::default().into_inner(), 3);
    }

    #[test]
    fn timestamp_serializes_transparently() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, back);
    }
}
