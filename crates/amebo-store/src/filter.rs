//! Composable `WHERE` clause construction for Catalog listing endpoints: a
//! builder that tracks whether a `WHERE` has been emitted to choose
//! `WHERE` vs `AND`.

use crate::QueryValue;

/// Coarse timeline filter accepted by listing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeline {
    /// Rows created since the start of today (UTC).
    Today,
    /// Rows created in the last 7 days.
    Week,
    /// Rows created in the last 30 days.
    Month,
}

impl Timeline {
    /// Parses the `timeline` query parameter (`today`|`week`|`month`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "today" => Some(Timeline::Today),
            "week" => Some(Timeline::Week),
            "month" => Some(Timeline::Month),
            _ => None,
        }
    }

    /// Number of days this timeline clamps the filtered column to.
    #[must_use]
    pub fn days(self) -> i64 {
        match self {
            Timeline::Today => 1,
            Timeline::Week => 7,
            Timeline::Month => 30,
        }
    }
}

/// Incrementally builds a `WHERE ... AND ...` clause plus its bound
/// parameters, switching the correct placeholder style via the [`Store`]'s
/// `placeholder` convention. Callers supply their own `n`-th placeholder
/// index since a builder may be composed after other already-bound clauses
/// (e.g. a join condition).
pub struct FilterBuilder {
    clauses: Vec<String>,
    params: Vec<QueryValue>,
    next_index: usize,
    is_postgres: bool,
}

impl FilterBuilder {
    /// Creates a new builder. `first_index` is the 1-based placeholder index
    /// of the first filter this builder will add (Postgres only).
    #[must_use]
    pub fn new(is_postgres: bool, first_index: usize) -> Self {
        Self {
            clauses: Vec::new(),
            params: Vec::new(),
            next_index: first_index,
            is_postgres,
        }
    }

    fn placeholder(&mut self) -> String {
        let ph = if self.is_postgres {
            format!("${}", self.next_index)
        } else {
            "?".to_string()
        };
        self.next_index += 1;
        ph
    }

    /// Adds an equality filter if `value` is `Some`.
    pub fn eq(&mut self, column: &str, value: Option<impl Into<QueryValue>>) -> &mut Self {
        if let Some(v) = value {
            let ph = self.placeholder();
            self.clauses.push(format!("{column} = {ph}"));
            self.params.push(v.into());
        }
        self
    }

    /// Adds a case-sensitive `LIKE` filter if `value` is `Some`, wrapping it
    /// in `%...%` wildcards.
    pub fn like(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            let ph = self.placeholder();
            self.clauses.push(format!("{column} LIKE {ph}"));
            self.params.push(QueryValue::Text(format!("%{v}%")));
        }
        self
    }

    /// Clamps `column` to `>= now - timeline.days() days` if `timeline` is
    /// `Some`. The bound is computed by the caller and passed in as an
    /// RFC3339 string so this builder stays free of a `chrono` dependency
    /// on the bound's computation strategy.
    pub fn timeline(&mut self, column: &str, cutoff_rfc3339: Option<String>) -> &mut Self {
        if let Some(cutoff) = cutoff_rfc3339 {
            let ph = self.placeholder();
            self.clauses.push(format!("{column} >= {ph}"));
            self.params.push(QueryValue::Text(cutoff));
        }
        self
    }

    /// Renders the accumulated clauses as `" WHERE a = ? AND b LIKE ?"` (or
    /// an empty string if no filter was added), along with the bound
    /// parameters in order.
    #[must_use]
    pub fn build(self) -> (String, Vec<QueryValue>) {
        if self.clauses.is_empty() {
            (String::new(), Vec::new())
        } else {
            (format!(" WHERE {}", self.clauses.join(" AND ")), self.params)
        }
    }
}
