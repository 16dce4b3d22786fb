#![deny(unsafe_code)]
//! amebo-vault
//!
//! Hashed administrator credentials and per-application shared secrets.
//! Two authentication paths, one signed bearer token.

use amebo_core::{Error, Result};
use amebo_store::{QueryValue, Store};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

/// Token max-age in seconds: a 10-minute bearer token lifetime.
pub const TOKEN_MAX_AGE_SECS: i64 = 600;

/// Which of the two authentication paths a request is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// Administrator username/password, hashed with Argon2.
    Basic,
    /// Application name + verbatim shared secret.
    Token,
}

impl AuthScheme {
    /// Parses the `scheme` field of a `POST /v1/tokens` request.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "basic" => Some(Self::Basic),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

/// Claims carried by the signed bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Which authentication path minted this token.
    pub scheme: AuthScheme,
    /// Administrator username or application name.
    pub username: String,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds (`iat + TOKEN_MAX_AGE_SECS`).
    pub exp: i64,
}

/// The Credential Vault: validates bearer tokens and the two credential
/// forms they are minted from.
#[derive(Clone)]
pub struct Vault {
    store: Store,
    secret: String,
}

impl Vault {
    /// Builds a vault bound to `store`, signing tokens with `secret`.
    #[must_use]
    pub fn new(store: Store, secret: impl Into<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
        }
    }

    /// Authenticates a request and mints a bearer token on success
    /// (`POST /v1/tokens`).
    pub async fn authenticate(
        &self,
        scheme: AuthScheme,
        username: &str,
        password: &str,
    ) -> Result<String> {
        match scheme {
            AuthScheme::Basic => self.authenticate_basic(username, password).await,
            AuthScheme::Token => self.authenticate_token(username, password).await,
        }
    }

    async fn authenticate_basic(&self, username: &str, password: &str) -> Result<String> {
        #[derive(sqlx::FromRow)]
        struct Row {
            secret_hash: String,
        }

        let table = self.store.qualify("credentials");
        let ph1 = self.store.placeholder(1);
        let sql = format!(
            "SELECT secret_hash FROM {table} WHERE username = {ph1} AND scheme = 'basic'"
        );
        let row: Option<Row> = self
            .store
            .one(&sql, &[QueryValue::Text(username.to_string())])
            .await?;
        let row = row.ok_or_else(|| Error::Unauthorized("unknown administrator".into()))?;

        let parsed = PasswordHash::new(&row.secret_hash)
            .map_err(|err| Error::Store(format!("corrupt password hash: {err}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::Unauthorized("bad credentials".into()))?;

        self.mint(AuthScheme::Basic, username)
    }

    async fn authenticate_token(&self, application: &str, secret: &str) -> Result<String> {
        #[derive(sqlx::FromRow)]
        struct Row {
            secret: String,
        }

        let table = self.store.qualify("applications");
        let ph1 = self.store.placeholder(1);
        let sql = format!("SELECT secret FROM {table} WHERE name = {ph1}");
        let row: Option<Row> = self
            .store
            .one(&sql, &[QueryValue::Text(application.to_string())])
            .await?;
        let row = row.ok_or_else(|| Error::Unauthorized("unknown application".into()))?;

        if !constant_time_eq(row.secret.as_bytes(), secret.as_bytes()) {
            return Err(Error::Unauthorized("bad credentials".into()));
        }

        self.mint(AuthScheme::Token, application)
    }

    /// Mints a signed HS256 bearer token for `username` under `scheme`.
    pub fn mint(&self, scheme: AuthScheme, username: &str) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            scheme,
            username: username.to_string(),
            iat,
            exp: iat + TOKEN_MAX_AGE_SECS,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| Error::Store(format!("token signing failed: {err}")))
    }

    /// Verifies a bearer token and returns its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthorized("invalid or expired token".into()))
    }

    /// Verifies that `secret` matches `application`'s stored secret
    /// (constant-time), used by the Catalog and Publisher to authorize
    /// mutating operations that are not gated by a bearer token.
    pub async fn verify_application_secret(&self, application: &str, secret: &str) -> Result<bool> {
        #[derive(sqlx::FromRow)]
        struct Row {
            secret: String,
        }
        let table = self.store.qualify("applications");
        let ph1 = self.store.placeholder(1);
        let sql = format!("SELECT secret FROM {table} WHERE name = {ph1}");
        let row: Option<Row> = self
            .store
            .one(&sql, &[QueryValue::Text(application.to_string())])
            .await?;
        Ok(row.is_some_and(|r| constant_time_eq(r.secret.as_bytes(), secret.as_bytes())))
    }

    /// Upserts the administrator credential row at startup from
    /// `AMEBO_USERNAME`/`AMEBO_PASSWORD`.
    pub async fn bootstrap_admin(&self, username: &str, password: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| Error::Store(format!("password hashing failed: {err}")))?
            .to_string();

        let table = self.store.qualify("credentials");
        let (ph1, ph2, ph3) = (
            self.store.placeholder(1),
            self.store.placeholder(2),
            self.store.placeholder(3),
        );
        let delete_sql = format!("DELETE FROM {table} WHERE username = {ph1}");
        self.store
            .exec(&delete_sql, &[QueryValue::Text(username.to_string())])
            .await?;

        let insert_sql = format!(
            "INSERT INTO {table} (username, scheme, secret_hash, created_at) VALUES ({ph1}, 'basic', {ph2}, {ph3})"
        );
        self.store
            .exec(
                &insert_sql,
                &[
                    QueryValue::Text(username.to_string()),
                    QueryValue::Text(hash),
                    QueryValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        info!(username, "bootstrapped administrator credential");
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_identical_slices() {
        assert!(constant_time_eq(b"0123456789abcdef", b"0123456789abcdef"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer-secret"));
    }

    #[test]
    fn auth_scheme_parse_rejects_unknown_scheme() {
        assert_eq!(AuthScheme::parse("oauth"), None);
        assert_eq!(AuthScheme::parse("basic"), Some(AuthScheme::Basic));
    }
}
