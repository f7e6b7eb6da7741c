//! Content database schema.

/// Tables for the content the platform serves. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    slug TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    excerpt TEXT NOT NULL DEFAULT '',
    service TEXT NOT NULL REFERENCES services(slug),
    author TEXT NOT NULL,
    published_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_posts_service ON posts(service, published_at);
"#;
