#![deny(unsafe_code)]
//! amebo-dispatcher
//!
//! The outbox Dispatcher: a single in-process periodic task that performs
//! one pick → fire → classify → reconcile → pace cycle per tick.
//! Self-rescheduling, never runs two cycles in parallel, and never
//! propagates errors to the HTTP layer — a failed cycle is logged and
//! retried on the next tick.
//!
//! Unlike outbox dispatchers that pace failed cycles with exponential
//! backoff, Amebo's idle sleep is flat — `AMEBO_IDLE_SECS` regardless of
//! how many prior cycles failed — because a failed cycle here means a
//! transient store error, not a poisoned message; retrying at a fixed
//! cadence is simpler and the store error surfaces in logs either way.

use amebo_core::Result;
use amebo_store::{QueryValue, Store};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepted HTTP statuses for a delivery attempt.
const ACCEPTED_STATUSES: [u16; 2] = [200, 202];

#[derive(sqlx::FromRow)]
struct PickedGist {
    gist_id: i64,
    endpoint: String,
    payload: Value,
    secret: String,
}

/// The Dispatcher: drains the gist outbox against a fixed envelope per
/// cycle, pacing itself with an idle sleep when a cycle's pick was small.
pub struct Dispatcher {
    store: Store,
    client: reqwest::Client,
    envelope_size: i64,
    rest_when: usize,
    idle: Duration,
}

impl Dispatcher {
    /// Builds a dispatcher bound to `store`. `request_timeout` bounds every
    /// outbound delivery POST; a timeout counts as rejection.
    #[must_use]
    pub fn new(
        store: Store,
        envelope_size: i64,
        rest_when: usize,
        idle: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client configuration is static and always valid");
        Self {
            store,
            client,
            envelope_size,
            rest_when,
            idle,
        }
    }

    /// Runs cycles until `cancel` fires. Returns once the in-flight cycle
    /// (if any) and the subsequent idle sleep have both observed
    /// cancellation — uncompleted deliveries remain `pending` in the store
    /// and resume on next startup with no coordination required.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let picked = match self.cycle().await {
                Ok(picked) => picked,
                Err(err) => {
                    warn!(error = %err, "dispatcher cycle failed, pacing before retry");
                    0
                }
            };

            if picked < self.rest_when {
                tokio::select! {
                    () = tokio::time::sleep(self.idle) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }

    /// Runs exactly one pick → fire → classify → reconcile cycle, returning
    /// the number of gists picked (used by the caller to decide pacing).
    pub async fn cycle(&self) -> Result<usize> {
        let picked = self.pick().await?;
        if picked.is_empty() {
            return Ok(0);
        }
        let picked_count = picked.len();

        let (accepted, rejected) = self.fire(picked).await;
        debug!(
            accepted = accepted.len(),
            rejected = rejected.len(),
            "dispatcher cycle classified"
        );
        self.reconcile(&accepted, &rejected).await?;
        Ok(picked_count)
    }

    async fn pick(&self) -> Result<Vec<PickedGist>> {
        let gists = self.store.qualify("gists");
        let events = self.store.qualify("events");
        let subscriptions = self.store.qualify("subscriptions");
        let actions = self.store.qualify("actions");
        let applications = self.store.qualify("applications");
        let (p1, p2) = (self.store.placeholder(1), self.store.placeholder(2));
        let sql = format!(
            "SELECT g.id AS gist_id, s.handler AS endpoint, e.payload AS payload, ap.secret AS secret \
             FROM {gists} g \
             JOIN {events} e ON g.event_id = e.id \
             JOIN {subscriptions} s ON g.subscription_id = s.id \
             JOIN {actions} a ON e.action_id = a.id \
             JOIN {applications} ap ON a.application_id = ap.id \
             WHERE g.completed = FALSE \
               AND g.retries < s.max_retries \
               AND (g.sleep_until IS NULL OR g.sleep_until < {p1}) \
             ORDER BY g.event_id \
             LIMIT {p2}"
        );
        self.store
            .many(
                &sql,
                &[QueryValue::Timestamp(Utc::now()), QueryValue::Int(self.envelope_size)],
            )
            .await
    }

    async fn fire(&self, picked: Vec<PickedGist>) -> (Vec<i64>, Vec<i64>) {
        let mut tasks = JoinSet::new();
        for gist in picked {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = client
                    .post(&gist.endpoint)
                    .header("Content-Type", "application/json")
                    .header("X-PASS-Phrase", gist.secret)
                    .json(&gist.payload)
                    .send()
                    .await;
                let accepted = matches!(
                    &result,
                    Ok(response) if ACCEPTED_STATUSES.contains(&response.status().as_u16())
                );
                (gist.gist_id, accepted)
            });
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            match outcome {
                Ok((gist_id, true)) => accepted.push(gist_id),
                Ok((gist_id, false)) => rejected.push(gist_id),
                Err(join_err) => warn!(error = %join_err, "delivery task panicked"),
            }
        }
        (accepted, rejected)
    }

    async fn reconcile(&self, accepted: &[i64], rejected: &[i64]) -> Result<()> {
        let table = self.store.qualify("gists");
        if !rejected.is_empty() {
            let (in_clause, params) = self.in_clause(rejected);
            let sql = format!("UPDATE {table} SET retries = retries + 1 WHERE id IN ({in_clause})");
            self.store.exec(&sql, &params).await?;
        }
        if !accepted.is_empty() {
            let (in_clause, params) = self.in_clause(accepted);
            let sql = format!(
                "UPDATE {table} SET completed = TRUE, retries = retries + 1 WHERE id IN ({in_clause})"
            );
            self.store.exec(&sql, &params).await?;
        }
        Ok(())
    }

    fn in_clause(&self, ids: &[i64]) -> (String, Vec<QueryValue>) {
        let placeholders: Vec<String> = (0..ids.len())
            .map(|i| self.store.placeholder(i + 1))
            .collect();
        let params = ids.iter().copied().map(QueryValue::Int).collect();
        (placeholders.join(", "), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn accepted_statuses_are_200_and_202_only() {
        assert!(ACCEPTED_STATUSES.contains(&200));
        assert!(ACCEPTED_STATUSES.contains(&202));
        assert!(!ACCEPTED_STATUSES.contains(&201));
        assert!(!ACCEPTED_STATUSES.contains(&500));
    }

    async fn seed_subscription(store: &Store, app_id: i64, action_id: i64, handler: &str, max_retries: i32) -> i64 {
        store
            .exec(
                "INSERT INTO subscriptions (application_id, action_id, handler, max_retries, created_at) VALUES (?, ?, ?, ?, ?)",
                &[
                    QueryValue::Int(app_id),
                    QueryValue::Int(action_id),
                    QueryValue::Text(handler.to_string()),
                    QueryValue::Int32(max_retries),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await
            .unwrap();
        #[derive(sqlx::FromRow)]
        struct IdRow {
            id: i64,
        }
        let row: IdRow = store
            .one("SELECT id FROM subscriptions WHERE handler = ?", &[QueryValue::Text(handler.to_string())])
            .await
            .unwrap()
            .unwrap();
        row.id
    }

    async fn seed_app_and_action(store: &Store, app_name: &str, action_name: &str, address: &str) -> (i64, i64) {
        store
            .exec(
                "INSERT INTO applications (name, address, secret, created_at) VALUES (?, ?, 'shared-secret-0123456', ?)",
                &[
                    QueryValue::Text(app_name.to_string()),
                    QueryValue::Text(address.to_string()),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await
            .unwrap();
        store
            .exec(
                "INSERT INTO actions (name, application_id, schemata, created_at) SELECT ?, id, '{}', ? FROM applications WHERE name = ?",
                &[
                    QueryValue::Text(action_name.to_string()),
                    QueryValue::Timestamp(Utc::now()),
                    QueryValue::Text(app_name.to_string()),
                ],
            )
            .await
            .unwrap();
        #[derive(sqlx::FromRow)]
        struct Ids {
            app_id: i64,
            action_id: i64,
        }
        let row: Ids = store
            .one(
                "SELECT a.id AS app_id, c.id AS action_id FROM applications a JOIN actions c ON c.application_id = a.id WHERE a.name = ? AND c.name = ?",
                &[QueryValue::Text(app_name.to_string()), QueryValue::Text(action_name.to_string())],
            )
            .await
            .unwrap()
            .unwrap();
        (row.app_id, row.action_id)
    }

    async fn seed_event_and_gist(
        store: &Store,
        action_id: i64,
        subscription_id: i64,
        deduper: &str,
        sleep_until: Option<chrono::DateTime<Utc>>,
    ) -> i64 {
        store
            .exec(
                "INSERT INTO events (action_id, deduper, payload, sleep_until, created_at) VALUES (?, ?, '{\"id\":1}', ?, ?)",
                &[
                    QueryValue::Int(action_id),
                    QueryValue::Text(deduper.to_string()),
                    QueryValue::from(sleep_until),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await
            .unwrap();
        #[derive(sqlx::FromRow)]
        struct IdRow {
            id: i64,
        }
        let event: IdRow = store
            .one("SELECT id FROM events WHERE deduper = ?", &[QueryValue::Text(deduper.to_string())])
            .await
            .unwrap()
            .unwrap();
        store
            .exec(
                "INSERT INTO gists (event_id, subscription_id, completed, retries, sleep_until, created_at) VALUES (?, ?, 0, 0, ?, ?)",
                &[
                    QueryValue::Int(event.id),
                    QueryValue::Int(subscription_id),
                    QueryValue::from(sleep_until),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await
            .unwrap();
        event.id
    }

    fn test_dispatcher(store: Store, envelope_size: i64) -> Dispatcher {
        Dispatcher::new(store, envelope_size, 8, Duration::from_millis(10), Duration::from_secs(5))
    }

    /// An accepted delivery eventually completes the gist.
    #[tokio::test]
    async fn accepted_delivery_completes_the_gist() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let (app_id, action_id) = seed_app_and_action(&store, "svcA", "user.created", &mock_server.uri()).await;
        let sub_id = seed_subscription(&store, app_id, action_id, &format!("{}/hooks", mock_server.uri()), 3).await;
        seed_event_and_gist(&store, action_id, sub_id, "d1", None).await;

        let dispatcher = test_dispatcher(store.clone(), 256);
        assert_eq!(dispatcher.cycle().await.unwrap(), 1);

        #[derive(sqlx::FromRow)]
        struct Row {
            completed: bool,
            retries: i32,
        }
        let row: Row = store
            .one("SELECT completed, retries FROM gists LIMIT 1", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(row.completed);
        assert_eq!(row.retries, 1);
    }

    /// Bounded retries: a subscriber that always 500s stops at max_retries.
    #[tokio::test]
    async fn rejected_delivery_stops_at_max_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&mock_server).await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let (app_id, action_id) = seed_app_and_action(&store, "svcA", "user.created", &mock_server.uri()).await;
        let sub_id = seed_subscription(&store, app_id, action_id, &format!("{}/hooks", mock_server.uri()), 2).await;
        seed_event_and_gist(&store, action_id, sub_id, "d1", None).await;

        let dispatcher = test_dispatcher(store.clone(), 256);
        assert_eq!(dispatcher.cycle().await.unwrap(), 1);
        assert_eq!(dispatcher.cycle().await.unwrap(), 1);
        assert_eq!(dispatcher.cycle().await.unwrap(), 0, "third cycle must not pick an exhausted gist");

        #[derive(sqlx::FromRow)]
        struct Row {
            completed: bool,
            retries: i32,
        }
        let row: Row = store
            .one("SELECT completed, retries FROM gists LIMIT 1", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(!row.completed);
        assert_eq!(row.retries, 2);
    }

    /// No single cycle attempts more than `envelope_size` deliveries.
    #[tokio::test]
    async fn cycle_never_exceeds_envelope_size() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let (app_id, action_id) = seed_app_and_action(&store, "svcA", "user.created", &mock_server.uri()).await;
        let sub_id = seed_subscription(&store, app_id, action_id, &format!("{}/hooks", mock_server.uri()), 3).await;
        for i in 0..5 {
            seed_event_and_gist(&store, action_id, sub_id, &format!("d{i}"), None).await;
        }

        let dispatcher = test_dispatcher(store.clone(), 2);
        let picked = dispatcher.cycle().await.unwrap();
        assert_eq!(picked, 2);
    }

    /// A gist with `sleep_until` in the future is never picked.
    #[tokio::test]
    async fn sleeping_gist_is_never_picked() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let (app_id, action_id) = seed_app_and_action(&store, "svcA", "user.created", &mock_server.uri()).await;
        let sub_id = seed_subscription(&store, app_id, action_id, &format!("{}/hooks", mock_server.uri()), 3).await;
        let future = Utc::now() + chrono::Duration::hours(1);
        seed_event_and_gist(&store, action_id, sub_id, "d1", Some(future)).await;

        let dispatcher = test_dispatcher(store, 256);
        assert_eq!(dispatcher.cycle().await.unwrap(), 0);
    }

    /// Within one cycle, pick order is ascending event id, regardless of
    /// insertion order of the surrounding rows.
    #[tokio::test]
    async fn pick_orders_by_ascending_event_id() {
        let mock_server = MockServer::start().await;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::connect_sqlite(tmp.path().to_str().unwrap()).await.unwrap();
        let (app_id, action_id) = seed_app_and_action(&store, "svcA", "user.created", &mock_server.uri()).await;
        let sub_id = seed_subscription(&store, app_id, action_id, &format!("{}/hooks", mock_server.uri()), 3).await;

        let e1 = seed_event_and_gist(&store, action_id, sub_id, "d1", None).await;
        let e2 = seed_event_and_gist(&store, action_id, sub_id, "d2", None).await;
        let e3 = seed_event_and_gist(&store, action_id, sub_id, "d3", None).await;
        assert!(e1 < e2 && e2 < e3, "seeding is expected to produce ascending ids");

        let dispatcher = test_dispatcher(store, 256);
        let picked = dispatcher.pick().await.unwrap();
        let ids: Vec<i64> = picked.iter().map(|g| g.gist_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "pick() must already be in ascending order");
    }
}
