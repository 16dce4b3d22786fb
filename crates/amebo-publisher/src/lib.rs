#![deny(unsafe_code)]
//! amebo-publisher
//!
//! The publish pipeline: resolve an action's owning application, validate
//! the secret and the payload, persist the event, and fan out one gist per
//! live subscription — all inside a single transaction.

use amebo_core::model::Event;
use amebo_core::{Error, Result};
use amebo_schema::SchemaCache;
use amebo_store::{QueryValue, Store};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::info;

/// The event envelope accepted by `POST /v1/events`.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishEnvelope {
    /// Action this event belongs to.
    pub action: String,
    /// Proves the publisher owns `action`'s application.
    pub secret: String,
    /// Opaque idempotency token; `(deduper, payload)` must be unique.
    pub deduper: String,
    /// Payload validated against the action's schema.
    pub payload: Value,
    /// Optional point in time before which no delivery attempt should occur.
    #[serde(default)]
    pub sleep_until: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ActionLookup {
    action_id: i64,
    schemata: String,
    app_secret: String,
}

/// The Publisher: validates and persists events, fanning out gists to every
/// subscription live on the owning action at publish time.
#[derive(Clone)]
pub struct Publisher {
    store: Store,
    schema_cache: SchemaCache,
}

impl Publisher {
    /// Builds a publisher bound to `store`, sharing `schema_cache` with the
    /// rest of the process.
    #[must_use]
    pub fn new(store: Store, schema_cache: SchemaCache) -> Self {
        Self { store, schema_cache }
    }

    /// Runs the publish pipeline. On any failure the transaction is rolled
    /// back and the mapped error returned; no event or gist row survives a
    /// failed publish.
    pub async fn publish(&self, envelope: PublishEnvelope) -> Result<Event> {
        let mut tx = self.store.begin().await?;

        let lookup = match self.resolve_action(&mut tx, &envelope.action).await {
            Ok(l) => l,
            Err(err) => {
                tx.rollback().await;
                return Err(err);
            }
        };

        if !constant_time_eq(lookup.app_secret.as_bytes(), envelope.secret.as_bytes()) {
            tx.rollback().await;
            return Err(Error::Unauthorized("secret mismatch".into()));
        }

        if let Err(err) = self
            .schema_cache
            .validate(&envelope.action, &lookup.schemata, &envelope.payload)
        {
            tx.rollback().await;
            return Err(err);
        }

        let event = match self.insert_event(&mut tx, lookup.action_id, &envelope).await {
            Ok(event) => event,
            Err(err) => {
                tx.rollback().await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .fan_out(&mut tx, lookup.action_id, event.id, envelope.sleep_until)
            .await
        {
            tx.rollback().await;
            return Err(err);
        }

        tx.commit().await?;
        info!(action = envelope.action, event_id = event.id, "published event");
        Ok(event)
    }

    async fn resolve_action(
        &self,
        tx: &mut amebo_store::StoreTx<'_>,
        action: &str,
    ) -> Result<ActionLookup> {
        let actions = tx.qualify("actions");
        let applications = tx.qualify("applications");
        let ph1 = tx.placeholder(1);
        let sql = format!(
            "SELECT a.id AS action_id, a.schemata AS schemata, ap.secret AS app_secret \
             FROM {actions} a JOIN {applications} ap ON a.application_id = ap.id \
             WHERE a.name = {ph1}"
        );
        tx.one(&sql, &[QueryValue::Text(action.to_string())])
            .await?
            .ok_or_else(|| Error::Unprocessable(format!("unknown action '{action}'")))
    }

    async fn insert_event(
        &self,
        tx: &mut amebo_store::StoreTx<'_>,
        action_id: i64,
        envelope: &PublishEnvelope,
    ) -> Result<Event> {
        let table = tx.qualify("events");
        let (p1, p2, p3, p4, p5) = (
            tx.placeholder(1),
            tx.placeholder(2),
            tx.placeholder(3),
            tx.placeholder(4),
            tx.placeholder(5),
        );
        let sql = format!(
            "INSERT INTO {table} (action_id, deduper, payload, sleep_until, created_at) \
             VALUES ({p1}, {p2}, {p3}, {p4}, {p5}) \
             RETURNING id, action_id, deduper, payload, sleep_until, created_at"
        );
        let params = [
            QueryValue::Int(action_id),
            QueryValue::Text(envelope.deduper.clone()),
            QueryValue::Json(envelope.payload.clone()),
            QueryValue::from(envelope.sleep_until),
            QueryValue::Timestamp(Utc::now()),
        ];
        tx.one(&sql, &params)
            .await?
            .ok_or_else(|| Error::Store("event insert returned no row".into()))
    }

    async fn fan_out(
        &self,
        tx: &mut amebo_store::StoreTx<'_>,
        action_id: i64,
        event_id: i64,
        sleep_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let gists = tx.qualify("gists");
        let subscriptions = tx.qualify("subscriptions");
        let (p1, p2, p3, p4) = (
            tx.placeholder(1),
            tx.placeholder(2),
            tx.placeholder(3),
            tx.placeholder(4),
        );
        let sql = format!(
            "INSERT INTO {gists} (event_id, subscription_id, completed, retries, sleep_until, created_at) \
             SELECT {p1}, id, FALSE, 0, {p2}, {p3} FROM {subscriptions} WHERE action_id = {p4}"
        );
        tx.exec(
            &sql,
            &[
                QueryValue::Int(event_id),
                QueryValue::from(sleep_until),
                QueryValue::Timestamp(Utc::now()),
                QueryValue::Int(action_id),
            ],
        )
        .await?;
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
