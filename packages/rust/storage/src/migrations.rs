//! SQL migration definitions for the Prospector cache database.
//!
//! Migrations are applied in order on database open.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: geocode_cache",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Reverse/forward geocoding results. NULL payload records a failed lookup.
CREATE TABLE IF NOT EXISTS geocode_cache (
    key       TEXT PRIMARY KEY,
    payload   TEXT,
    cached_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    cancelled    INTEGER NOT NULL DEFAULT 0,
    metrics_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
