#![deny(unsafe_code)]
//! amebo-catalog
//!
//! List+insert (and, for applications, address-update) operations over
//! applications, actions, and subscriptions. Every mutating operation is
//! secret-gated through `amebo-vault` before it touches the store.

use amebo_core::model::{Action, Application, Subscription};
use amebo_core::model::{DEFAULT_MAX_RETRIES, MAX_MAX_RETRIES, MIN_MAX_RETRIES};
use amebo_core::{Error, Result};
use amebo_store::{FilterBuilder, QueryValue, Store, Timeline};
use amebo_vault::Vault;
use chrono::{Duration, Utc};
use tracing::info;

/// Clamped `page`/`pagination` parameters shared by every listing endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// 1-based page number.
    pub page: u32,
    /// Rows per page, already capped at the server max.
    pub pagination: u32,
}

impl Page {
    /// Builds a page, defaulting `page` to 1 and `pagination` to
    /// `max_page_size`, clamping both to sane bounds.
    #[must_use]
    pub fn clamped(page: Option<u32>, pagination: Option<u32>, max_page_size: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            pagination: pagination.unwrap_or(max_page_size).clamp(1, max_page_size),
        }
    }

    fn offset(&self) -> u32 {
        (self.page - 1) * self.pagination
    }
}

/// Equality/LIKE/timeline filters accepted by `GET /v1/applications`.
#[derive(Debug, Clone, Default)]
pub struct ApplicationFilter {
    /// Exact id match.
    pub id: Option<i64>,
    /// Substring match on `name`.
    pub name: Option<String>,
    /// `today`|`week`|`month`, clamped against `created_at`.
    pub timeline: Option<String>,
}

/// Equality/LIKE/timeline filters accepted by `GET /v1/actions`.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    /// Exact id match.
    pub id: Option<i64>,
    /// Substring match on `name`.
    pub name: Option<String>,
    /// Exact owning-application id match.
    pub application_id: Option<i64>,
    /// `today`|`week`|`month`, clamped against `created_at`.
    pub timeline: Option<String>,
}

/// Equality/timeline filters accepted by `GET /v1/subscriptions`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Exact id match.
    pub id: Option<i64>,
    /// Exact subscribing-application id match.
    pub application_id: Option<i64>,
    /// Exact subscribed-action id match.
    pub action_id: Option<i64>,
    /// `today`|`week`|`month`, clamped against `created_at`.
    pub timeline: Option<String>,
}

/// The Catalog: CRUD over applications, actions, and subscriptions.
#[derive(Clone)]
pub struct Catalog {
    store: Store,
    vault: Vault,
    max_page_size: u32,
}

impl Catalog {
    /// Builds a catalog bound to `store`, authorizing mutations through
    /// `vault`, capping listings at `max_page_size` rows per page.
    #[must_use]
    pub fn new(store: Store, vault: Vault, max_page_size: u32) -> Self {
        Self {
            store,
            vault,
            max_page_size,
        }
    }

    /// Clamps raw `page`/`pagination` query parameters to this catalog's
    /// configured max page size.
    #[must_use]
    pub fn page(&self, page: Option<u32>, pagination: Option<u32>) -> Page {
        Page::clamped(page, pagination, self.max_page_size)
    }

    // -- applications --------------------------------------------------

    /// Lists applications matching `filter`, ordered by id, one page at a
    /// time. Callers at the HTTP boundary are responsible for redacting
    /// `secret` before serializing the result.
    pub async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> Result<Vec<Application>> {
        let mut fb = self.new_filter_builder();
        fb.eq("id", filter.id).like("name", filter.name.as_deref());
        fb.timeline("created_at", self.timeline_cutoff(filter.timeline.as_deref())?);
        let (clause, mut params) = fb.build();

        let table = self.store.qualify("applications");
        let (limit_ph, offset_ph) = self.limit_offset_placeholders(params.len());
        let sql = format!(
            "SELECT id, name, address, secret, created_at FROM {table}{clause} ORDER BY id LIMIT {limit_ph} OFFSET {offset_ph}"
        );
        params.push(QueryValue::Int(i64::from(page.pagination)));
        params.push(QueryValue::Int(i64::from(page.offset())));
        self.store.many(&sql, &params).await
    }

    /// Registers a new application. Fails with [`Error::Conflict`] if
    /// `name` is already taken.
    pub async fn insert_application(
        &self,
        name: &str,
        address: &str,
        secret: &str,
    ) -> Result<Application> {
        validate_application_name(name)?;
        validate_address(address)?;
        validate_secret(secret)?;

        let table = self.store.qualify("applications");
        let (p1, p2, p3, p4) = self.four_placeholders();
        let sql = format!(
            "INSERT INTO {table} (name, address, secret, created_at) VALUES ({p1}, {p2}, {p3}, {p4})"
        );
        self.store
            .exec(
                &sql,
                &[
                    QueryValue::Text(name.to_string()),
                    QueryValue::Text(address.trim_end_matches('/').to_string()),
                    QueryValue::Text(secret.to_string()),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        info!(application = name, "registered application");
        self.application_by_name(name).await
    }

    /// Updates an application's address. Secret-gated: `secret` must match
    /// the stored value (`PUT /v1/applications/:id`).
    pub async fn update_application_address(
        &self,
        id: i64,
        secret: &str,
        new_address: &str,
    ) -> Result<Application> {
        validate_address(new_address)?;
        let app = self.application_by_id(id).await?;
        if !self.vault.verify_application_secret(&app.name, secret).await? {
            return Err(Error::Unauthorized("secret mismatch".into()));
        }

        let table = self.store.qualify("applications");
        let (p1, p2) = self.two_placeholders();
        let sql = format!("UPDATE {table} SET address = {p1} WHERE id = {p2}");
        self.store
            .exec(
                &sql,
                &[
                    QueryValue::Text(new_address.trim_end_matches('/').to_string()),
                    QueryValue::Int(id),
                ],
            )
            .await?;
        info!(application = app.name, "updated application address");
        self.application_by_id(id).await
    }

    async fn application_by_id(&self, id: i64) -> Result<Application> {
        let table = self.store.qualify("applications");
        let ph1 = self.store.placeholder(1);
        let sql = format!("SELECT id, name, address, secret, created_at FROM {table} WHERE id = {ph1}");
        self.store
            .one(&sql, &[QueryValue::Int(id)])
            .await?
            .ok_or_else(|| Error::NotFound(format!("no application with id {id}")))
    }

    async fn application_by_name(&self, name: &str) -> Result<Application> {
        let table = self.store.qualify("applications");
        let ph1 = self.store.placeholder(1);
        let sql = format!("SELECT id, name, address, secret, created_at FROM {table} WHERE name = {ph1}");
        self.store
            .one(&sql, &[QueryValue::Text(name.to_string())])
            .await?
            .ok_or_else(|| Error::NotFound(format!("no application named {name}")))
    }

    // -- actions ---------------------------------------------------------

    /// Lists actions matching `filter`, ordered by id.
    pub async fn list_actions(&self, filter: &ActionFilter, page: Page) -> Result<Vec<Action>> {
        let mut fb = self.new_filter_builder();
        fb.eq("id", filter.id)
            .eq("application_id", filter.application_id)
            .like("name", filter.name.as_deref());
        fb.timeline("created_at", self.timeline_cutoff(filter.timeline.as_deref())?);
        let (clause, mut params) = fb.build();

        let table = self.store.qualify("actions");
        let (limit_ph, offset_ph) = self.limit_offset_placeholders(params.len());
        let sql = format!(
            "SELECT id, name, application_id, schemata, created_at FROM {table}{clause} ORDER BY id LIMIT {limit_ph} OFFSET {offset_ph}"
        );
        params.push(QueryValue::Int(i64::from(page.pagination)));
        params.push(QueryValue::Int(i64::from(page.offset())));
        self.store.many(&sql, &params).await
    }

    /// Registers a new action. Requires a prior application named
    /// `application` whose secret matches `secret`; fails with
    /// [`Error::Unauthorized`] otherwise.
    pub async fn insert_action(
        &self,
        name: &str,
        application: &str,
        secret: &str,
        schemata: &str,
    ) -> Result<Action> {
        validate_action_name(name)?;
        validate_schemata(schemata)?;
        let app = self.application_by_name(application).await?;
        if !self.vault.verify_application_secret(&app.name, secret).await? {
            return Err(Error::Unauthorized("secret mismatch".into()));
        }

        let table = self.store.qualify("actions");
        let (p1, p2, p3, p4) = self.four_placeholders();
        let sql = format!(
            "INSERT INTO {table} (name, application_id, schemata, created_at) VALUES ({p1}, {p2}, {p3}, {p4})"
        );
        self.store
            .exec(
                &sql,
                &[
                    QueryValue::Text(name.to_string()),
                    QueryValue::Int(app.id),
                    QueryValue::Text(schemata.to_string()),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        info!(action = name, application = app.name, "registered action");
        self.action_by_name(name).await
    }

    async fn action_by_name(&self, name: &str) -> Result<Action> {
        let table = self.store.qualify("actions");
        let ph1 = self.store.placeholder(1);
        let sql = format!(
            "SELECT id, name, application_id, schemata, created_at FROM {table} WHERE name = {ph1}"
        );
        self.store
            .one(&sql, &[QueryValue::Text(name.to_string())])
            .await?
            .ok_or_else(|| Error::NotFound(format!("no action named {name}")))
    }

    // -- subscriptions -----------------------------------------------------

    /// Lists subscriptions matching `filter`, ordered by id.
    pub async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        page: Page,
    ) -> Result<Vec<Subscription>> {
        let mut fb = self.new_filter_builder();
        fb.eq("id", filter.id)
            .eq("application_id", filter.application_id)
            .eq("action_id", filter.action_id);
        fb.timeline("created_at", self.timeline_cutoff(filter.timeline.as_deref())?);
        let (clause, mut params) = fb.build();

        let table = self.store.qualify("subscriptions");
        let (limit_ph, offset_ph) = self.limit_offset_placeholders(params.len());
        let sql = format!(
            "SELECT id, application_id, action_id, handler, max_retries, created_at FROM {table}{clause} ORDER BY id LIMIT {limit_ph} OFFSET {offset_ph}"
        );
        params.push(QueryValue::Int(i64::from(page.pagination)));
        params.push(QueryValue::Int(i64::from(page.offset())));
        self.store.many(&sql, &params).await
    }

    /// Registers a new subscription. Requires the subscribing application
    /// `application` to exist with a matching `secret` and `action` to
    /// already exist. The stored `handler` is the absolute delivery URL:
    /// the subscriber's base address concatenated with `handler_path`.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_subscription(
        &self,
        application: &str,
        secret: &str,
        action: &str,
        handler_path: &str,
        max_retries: Option<i32>,
    ) -> Result<Subscription> {
        if !handler_path.starts_with('/') {
            return Err(Error::BadInput("handler must be a path beginning with '/'".into()));
        }
        let max_retries = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if !(MIN_MAX_RETRIES..=MAX_MAX_RETRIES).contains(&max_retries) {
            return Err(Error::BadInput(format!(
                "max_retries must be between {MIN_MAX_RETRIES} and {MAX_MAX_RETRIES}"
            )));
        }

        let app = self.application_by_name(application).await?;
        if !self.vault.verify_application_secret(&app.name, secret).await? {
            return Err(Error::Unauthorized("secret mismatch".into()));
        }
        let act = self.action_by_name(action).await?;
        let handler = format!("{}{handler_path}", app.base_address());

        let table = self.store.qualify("subscriptions");
        let (p1, p2, p3, p4, p5) = self.five_placeholders();
        let sql = format!(
            "INSERT INTO {table} (application_id, action_id, handler, max_retries, created_at) VALUES ({p1}, {p2}, {p3}, {p4}, {p5})"
        );
        self.store
            .exec(
                &sql,
                &[
                    QueryValue::Int(app.id),
                    QueryValue::Int(act.id),
                    QueryValue::Text(handler.clone()),
                    QueryValue::Int32(max_retries),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        info!(application = app.name, action = act.name, handler, "registered subscription");

        let table = self.store.qualify("subscriptions");
        let ph1 = self.store.placeholder(1);
        let ph2 = self.store.placeholder(2);
        let ph3 = self.store.placeholder(3);
        let select = format!(
            "SELECT id, application_id, action_id, handler, max_retries, created_at FROM {table} WHERE application_id = {ph1} AND action_id = {ph2} AND handler = {ph3}"
        );
        self.store
            .one(
                &select,
                &[
                    QueryValue::Int(app.id),
                    QueryValue::Int(act.id),
                    QueryValue::Text(handler.clone()),
                ],
            )
            .await?
            .ok_or_else(|| Error::Store("subscription vanished after insert".into()))
    }

    // -- shared helpers --------------------------------------------------

    fn new_filter_builder(&self) -> FilterBuilder {
        FilterBuilder::new(self.store.is_postgres(), 1)
    }

    fn timeline_cutoff(&self, timeline: Option<&str>) -> Result<Option<String>> {
        match timeline {
            None => Ok(None),
            Some(raw) => {
                let tl = Timeline::parse(raw)
                    .ok_or_else(|| Error::BadInput(format!("unknown timeline {raw:?}")))?;
                Ok(Some((Utc::now() - Duration::days(tl.days())).to_rfc3339()))
            }
        }
    }

    fn limit_offset_placeholders(&self, filter_params: usize) -> (String, String) {
        if self.store.is_postgres() {
            let limit = 1 + filter_params;
            (format!("${limit}"), format!("${}", limit + 1))
        } else {
            ("?".to_string(), "?".to_string())
        }
    }

    fn two_placeholders(&self) -> (String, String) {
        (self.store.placeholder(1), self.store.placeholder(2))
    }

    fn four_placeholders(&self) -> (String, String, String, String) {
        (
            self.store.placeholder(1),
            self.store.placeholder(2),
            self.store.placeholder(3),
            self.store.placeholder(4),
        )
    }

    fn five_placeholders(&self) -> (String, String, String, String, String) {
        (
            self.store.placeholder(1),
            self.store.placeholder(2),
            self.store.placeholder(3),
            self.store.placeholder(4),
            self.store.placeholder(5),
        )
    }
}

fn validate_application_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(char::is_alphanumeric) {
        return Err(Error::BadInput(
            "application name must be non-empty alphanumeric".into(),
        ));
    }
    Ok(())
}

fn validate_action_name(name: &str) -> Result<()> {
    if name.chars().count() < 3 {
        return Err(Error::BadInput("action name must be at least 3 characters".into()));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<()> {
    if !(address.starts_with("http://") || address.starts_with("https://")) {
        return Err(Error::BadInput("address must be an absolute http(s) URL".into()));
    }
    Ok(())
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.len() < 16 {
        return Err(Error::BadInput("secret must be at least 16 characters".into()));
    }
    Ok(())
}

fn validate_schemata(schemata: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(schemata)
        .map_err(|err| Error::BadInput(format!("schemata is not valid JSON: {err}")))?;
    if !value.is_object() {
        return Err(Error::BadInput("schemata must be a JSON object".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_to_one_and_max_page_size() {
        let p = Page::clamped(None, None, 100);
        assert_eq!(p.page, 1);
        assert_eq!(p.pagination, 100);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn page_clamps_pagination_to_max() {
        let p = Page::clamped(Some(2), Some(10_000), 100);
        assert_eq!(p.pagination, 100);
        assert_eq!(p.offset(), 100);
    }

    #[test]
    fn page_rejects_page_zero_by_flooring_to_one() {
        let p = Page::clamped(Some(0), Some(10), 100);
        assert_eq!(p.page, 1);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn validate_application_name_rejects_whitespace() {
        assert!(validate_application_name("has space").is_err());
        assert!(validate_application_name("svcA").is_ok());
    }

    #[test]
    fn validate_action_name_enforces_minimum_length() {
        assert!(validate_action_name("ab").is_err());
        assert!(validate_action_name("abc").is_ok());
    }

    #[test]
    fn validate_address_requires_http_scheme() {
        assert!(validate_address("ftp://example.com").is_err());
        assert!(validate_address("https://example.com").is_ok());
    }

    #[test]
    fn validate_secret_enforces_minimum_length() {
        assert!(validate_secret("short").is_err());
        assert!(validate_secret("0123456789abcdef").is_ok());
    }

    #[test]
    fn validate_schemata_requires_json_object() {
        assert!(validate_schemata("[1, 2, 3]").is_err());
        assert!(validate_schemata("not json").is_err());
        assert!(validate_schemata(r#"{"type": "object"}"#).is_ok());
    }
}
