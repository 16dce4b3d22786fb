//! Domain entities and their invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered producer/subscriber application.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq, Eq)]
pub struct Application {
    /// Surrogate id.
    pub id: i64,
    /// Unique name (alphanumeric, no whitespace).
    pub name: String,
    /// Absolute HTTP/S base address, stored without a trailing slash.
    pub address: String,
    /// Opaque shared secret. Never serialized back to clients — callers must
    /// redact this field before returning an `Application` over HTTP (see
    /// `amebo-daemon`'s list handler).
    pub secret: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Application {
    /// Returns the address with any trailing slash stripped, the form used
    /// when concatenating a subscription's handler path.
    #[must_use]
    pub fn base_address(&self) -> &str {
        self.address.trim_end_matches('/')
    }
}

/// A named event kind owned by an application, carrying a JSON-Schema
/// contract for its payload.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq, Eq)]
pub struct Action {
    /// Surrogate id.
    pub id: i64,
    /// Unique name (length >= 3).
    pub name: String,
    /// Owning application id.
    pub application_id: i64,
    /// JSON Schema document, stored as text.
    pub schemata: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A standing instruction to POST every future event of a given action to a
/// subscriber's handler.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq, Eq)]
pub struct Subscription {
    /// Surrogate id.
    pub id: i64,
    /// Subscribing application id.
    pub application_id: i64,
    /// Subscribed action id.
    pub action_id: i64,
    /// Absolute delivery URL: subscriber's base address + handler path.
    pub handler: String,
    /// Maximum delivery attempts before a gist is terminal-failed (1-10000).
    pub max_retries: i32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Default `max_retries` for a newly registered subscription.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Lower bound for `max_retries`.
pub const MIN_MAX_RETRIES: i32 = 1;
/// Upper bound for `max_retries`.
pub const MAX_MAX_RETRIES: i32 = 10_000;

/// One occurrence of an action with a concrete payload; immutable and
/// ordered by insertion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Event {
    /// Surrogate id; also the dispatcher's FIFO order key.
    pub id: i64,
    /// Action id this event belongs to.
    pub action_id: i64,
    /// Producer-supplied idempotency token.
    pub deduper: String,
    /// Payload validated against the action's schema at publish time.
    pub payload: Value,
    /// Optional point in time before which no delivery attempt should occur.
    pub sleep_until: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An outbox row: one pending delivery of one event to one subscription.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq, Eq)]
pub struct Gist {
    /// Surrogate id.
    pub id: i64,
    /// Event being delivered.
    pub event_id: i64,
    /// Subscription being delivered to.
    pub subscription_id: i64,
    /// `true` once at least one attempt returned 200/202.
    pub completed: bool,
    /// Number of delivery attempts made so far.
    pub retries: i32,
    /// Inherited from the event at fan-out time.
    pub sleep_until: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_address_strips_trailing_slash() {
        let app = Application {
            id: 1,
            name: "svcA".into(),
            address: "https://svc-a.example.com/".into(),
            secret: "0123456789abcdef".into(),
            created_at: Utc::now(),
        };
        assert_eq!(app.base_address(), "https://svc-a.example.com");
    }

    #[test]
    fn base_address_is_stable_without_trailing_slash() {
        let app = Application {
            id: 1,
            name: "svcA".into(),
            address: "https://svc-a.example.com".into(),
            secret: "0123456789abcdef".into(),
            created_at: Utc::now(),
        };
        assert_eq!(app.base_address(), "https://svc-a.example.com");
    }
}
