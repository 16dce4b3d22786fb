//! Embedded DDL for the Amebo tables, one statement set per backend since
//! column types (`TEXT` timestamps vs `TIMESTAMPTZ`, `INTEGER` booleans vs
//! `BOOLEAN`) differ.

pub(crate) fn ddl_for(is_postgres: bool) -> &'static [&'static str] {
    if is_postgres {
        POSTGRES_DDL
    } else {
        SQLITE_DDL
    }
}

const SQLITE_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS applications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        address TEXT NOT NULL,
        secret TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        application_id INTEGER NOT NULL REFERENCES applications(id),
        schemata TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        application_id INTEGER NOT NULL REFERENCES applications(id),
        action_id INTEGER NOT NULL REFERENCES actions(id),
        handler TEXT NOT NULL,
        max_retries INTEGER NOT NULL DEFAULT 3,
        created_at TEXT NOT NULL,
        UNIQUE(application_id, action_id, handler)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action_id INTEGER NOT NULL REFERENCES actions(id),
        deduper TEXT NOT NULL,
        payload TEXT NOT NULL,
        sleep_until TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(deduper, payload)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS gists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL REFERENCES events(id),
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id),
        completed INTEGER NOT NULL DEFAULT 0,
        retries INTEGER NOT NULL DEFAULT 0,
        sleep_until TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(event_id, subscription_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        scheme TEXT NOT NULL,
        secret_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
];

const POSTGRES_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS amebo.applications (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        address TEXT NOT NULL,
        secret TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS amebo.actions (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        application_id BIGINT NOT NULL REFERENCES amebo.applications(id),
        schemata TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS amebo.subscriptions (
        id BIGSERIAL PRIMARY KEY,
        application_id BIGINT NOT NULL REFERENCES amebo.applications(id),
        action_id BIGINT NOT NULL REFERENCES amebo.actions(id),
        handler TEXT NOT NULL,
        max_retries INTEGER NOT NULL DEFAULT 3,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE(application_id, action_id, handler)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS amebo.events (
        id BIGSERIAL PRIMARY KEY,
        action_id BIGINT NOT NULL REFERENCES amebo.actions(id),
        deduper TEXT NOT NULL,
        payload JSONB NOT NULL,
        sleep_until TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    // jsonb has no default btree opclass, so (deduper, payload) uniqueness
    // is enforced via an expression index over the JSON's text form.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS events_deduper_payload_key
        ON amebo.events (deduper, (payload::text))"#,
    r#"CREATE TABLE IF NOT EXISTS amebo.gists (
        id BIGSERIAL PRIMARY KEY,
        event_id BIGINT NOT NULL REFERENCES amebo.events(id),
        subscription_id BIGINT NOT NULL REFERENCES amebo.subscriptions(id),
        completed BOOLEAN NOT NULL DEFAULT FALSE,
        retries INTEGER NOT NULL DEFAULT 0,
        sleep_until TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE(event_id, subscription_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS amebo.credentials (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        scheme TEXT NOT NULL,
        secret_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
];
