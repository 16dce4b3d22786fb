//! Error taxonomy. Each variant maps to exactly one HTTP status at the
//! `amebo-daemon` boundary; lower crates only ever construct these, never
//! a raw `StatusCode`.

/// A typed Amebo error. Lower components return this; `amebo-daemon` is the
/// single place that translates it into a response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store `one()` returned empty on a lookup that required a row.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad secret or token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Missing auth on a protected route.
    #[error("authentication required")]
    NoCreds,

    /// Unique-constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Action unknown (or its owning application unknown) during publish.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Payload fails the action's JSON Schema.
    #[error("schema violation: {0:?}")]
    SchemaViolation(Vec<String>),

    /// Missing or malformed JSON or request fields.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Non-JSON body on a mutating route.
    #[error("wrong content type: expected application/json")]
    WrongContentType,

    /// Replay: subscriber returned a non-2xx status.
    #[error("upstream unavailable: status {status}")]
    UpstreamUnavailable {
        /// Upstream HTTP status code.
        status: u16,
        /// Upstream response body, if any.
        body: Option<String>,
    },

    /// Replay: transport-level failure reaching the subscriber.
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// Any other store failure (connection loss, migration error, ...).
    #[error("store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Error::Conflict(db_err.message().to_string());
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return Error::NotFound("row not found".into());
        }
        Error::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_variant_detail() {
        let err = Error::Conflict("deduper+payload already published".into());
        assert!(err.to_string().contains("deduper+payload"));
    }

    #[test]
    fn schema_violation_preserves_all_messages() {
        let err = Error::SchemaViolation(vec!["id: expected integer".into()]);
        match err {
            Error::SchemaViolation(msgs) => assert_eq!(msgs.len(), 1),
            _ => panic!("wrong variant"),
        }
    }
}
