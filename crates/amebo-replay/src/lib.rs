#![deny(unsafe_code)]
//! amebo-replay
//!
//! Manual single-gist redelivery. Loads the same `(endpoint, payload,
//! secret)` tuple the Dispatcher would, but without the
//! `completed`/`retries`/`sleep_until` filters — replay works on any gist,
//! including terminal-failed or already-delivered ones — and performs
//! exactly one HTTP POST. Purely diagnostic: the gist's
//! `completed`/`retries` are never written, by design.

use amebo_core::model::Gist;
use amebo_core::{Error, Result};
use amebo_store::{QueryValue, Store};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

#[derive(sqlx::FromRow)]
struct ReplayLookup {
    endpoint: String,
    payload: Value,
    secret: String,
}

/// The outcome of a manual replay.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// The gist as it stood in the store at replay time, unchanged by the
    /// replay itself.
    pub gist: Gist,
    /// The subscriber's response body, if it parsed as JSON.
    pub proxied: Option<Value>,
}

/// Replays a single gist's delivery on demand.
#[derive(Clone)]
pub struct Replayer {
    store: Store,
    client: reqwest::Client,
}

impl Replayer {
    /// Builds a replayer bound to `store`. `request_timeout` bounds the
    /// single outbound POST, consistent with the Dispatcher's timeout.
    #[must_use]
    pub fn new(store: Store, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client configuration is static and always valid");
        Self { store, client }
    }

    /// Replays `gist_id`'s delivery once. Maps the subscriber's response to
    /// `Ok` on 200/202, [`Error::UpstreamUnavailable`] on any other status,
    /// and [`Error::UpstreamError`] on a transport failure.
    pub async fn replay(&self, gist_id: i64) -> Result<ReplayResult> {
        let gist = self.gist_by_id(gist_id).await?;
        let lookup = self.lookup(gist_id).await?;

        let response = self
            .client
            .post(&lookup.endpoint)
            .header("Content-Type", "application/json")
            .header("X-PASS-Phrase", lookup.secret)
            .json(&lookup.payload)
            .send()
            .await
            .map_err(|err| Error::UpstreamError(err.to_string()))?;

        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        let proxied: Option<Value> = serde_json::from_str(&body_text).ok();

        if status == 200 || status == 202 {
            info!(gist_id, status, "replay accepted");
            Ok(ReplayResult { gist, proxied })
        } else {
            Err(Error::UpstreamUnavailable {
                status,
                body: Some(body_text),
            })
        }
    }

    async fn gist_by_id(&self, gist_id: i64) -> Result<Gist> {
        let table = self.store.qualify("gists");
        let ph1 = self.store.placeholder(1);
        let sql = format!(
            "SELECT id, event_id, subscription_id, completed, retries, sleep_until, created_at \
             FROM {table} WHERE id = {ph1}"
        );
        self.store
            .one(&sql, &[QueryValue::Int(gist_id)])
            .await?
            .ok_or_else(|| Error::NotFound(format!("no gist with id {gist_id}")))
    }

    async fn lookup(&self, gist_id: i64) -> Result<ReplayLookup> {
        let gists = self.store.qualify("gists");
        let events = self.store.qualify("events");
        let subscriptions = self.store.qualify("subscriptions");
        let actions = self.store.qualify("actions");
        let applications = self.store.qualify("applications");
        let ph1 = self.store.placeholder(1);
        let sql = format!(
            "SELECT s.handler AS endpoint, e.payload AS payload, ap.secret AS secret \
             FROM {gists} g \
             JOIN {events} e ON g.event_id = e.id \
             JOIN {subscriptions} s ON g.subscription_id = s.id \
             JOIN {actions} a ON e.action_id = a.id \
             JOIN {applications} ap ON a.application_id = ap.id \
             WHERE g.id = {ph1}"
        );
        self.store
            .one(&sql, &[QueryValue::Int(gist_id)])
            .await?
            .ok_or_else(|| Error::NotFound(format!("no gist with id {gist_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Seeds one application, one action, one subscription, one event, and
    /// one gist, returning the gist id.
    async fn seed_gist(store: &Store, handler: &str, completed: bool, retries: i32) -> i64 {
        store
            .exec(
                "INSERT INTO applications (id, name, address, secret, created_at) VALUES (1, 'svcA', 'https://a.example.com', 'shared-secret-0123456', ?)",
                &[QueryValue::Timestamp(Utc::now())],
            )
            .await
            .unwrap();
        store
            .exec(
                "INSERT INTO actions (id, name, application_id, schemata, created_at) VALUES (1, 'user.created', 1, '{}', ?)",
                &[QueryValue::Timestamp(Utc::now())],
            )
            .await
            .unwrap();
        store
            .exec(
                "INSERT INTO subscriptions (id, application_id, action_id, handler, max_retries, created_at) VALUES (1, 1, 1, ?, 3, ?)",
                &[QueryValue::Text(handler.to_string()), QueryValue::Timestamp(Utc::now())],
            )
            .await
            .unwrap();
        store
            .exec(
                "INSERT INTO events (id, action_id, deduper, payload, created_at) VALUES (1, 1, 'd1', '{\"id\":1}', ?)",
                &[QueryValue::Timestamp(Utc::now())],
            )
            .await
            .unwrap();
        store
            .exec(
                "INSERT INTO gists (id, event_id, subscription_id, completed, retries, created_at) VALUES (1, 1, 1, ?, ?, ?)",
                &[
                    QueryValue::Bool(completed),
                    QueryValue::Int32(retries),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await
            .unwrap();
        1
    }

    #[tokio::test]
    async fn replay_accepts_on_2xx_and_exposes_proxied_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/uc"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({"ack": true})))
            .mount(&mock_server)
            .await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let handler = format!("{}/hooks/uc", mock_server.uri());
        let gist_id = seed_gist(&store, &handler, true, 3).await;

        let replayer = Replayer::new(store, std::time::Duration::from_secs(5));
        let result = replayer.replay(gist_id).await.unwrap();

        assert_eq!(result.proxied, Some(serde_json::json!({"ack": true})));
        assert!(result.gist.completed);
    }

    #[tokio::test]
    async fn replay_does_not_mutate_persisted_gist_state() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/uc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let handler = format!("{}/hooks/uc", mock_server.uri());
        // Already terminal-failed: completed=0, retries at the subscription's max.
        let gist_id = seed_gist(&store, &handler, false, 3).await;

        let replayer = Replayer::new(store.clone(), std::time::Duration::from_secs(5));
        let err = replayer.replay(gist_id).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable { status: 500, .. }));

        let after: Gist = store
            .one("SELECT id, event_id, subscription_id, completed, retries, sleep_until, created_at FROM gists WHERE id = ?", &[QueryValue::Int(gist_id)])
            .await
            .unwrap()
            .unwrap();
        assert!(!after.completed);
        assert_eq!(after.retries, 3);
    }

    #[tokio::test]
    async fn replay_missing_gist_is_not_found() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let replayer = Replayer::new(store, std::time::Duration::from_secs(5));
        let err = replayer.replay(999).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
