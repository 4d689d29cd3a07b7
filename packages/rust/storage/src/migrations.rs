//! SQL migration definitions for the local content store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

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
            description: "Initial schema: courses, blocks, block_children, block_tags",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Course overviews; `modified` is rewritten on every publish
CREATE TABLE IF NOT EXISTS courses (
    course_key       TEXT PRIMARY KEY,
    display_name     TEXT,
    start_at         TEXT,
    end_at           TEXT,
    enrollment_start TEXT,
    enrollment_end   TEXT,
    self_paced       INTEGER NOT NULL DEFAULT 0,
    created          TEXT,
    modified         TEXT,
    extra_json       TEXT NOT NULL DEFAULT '{}'
);

-- Content blocks, keyed by location without branch/version
CREATE TABLE IF NOT EXISTS blocks (
    location        TEXT PRIMARY KEY,
    course_key      TEXT NOT NULL REFERENCES courses(course_key) ON DELETE CASCADE,
    block_type      TEXT NOT NULL,
    display_name    TEXT,
    graded          INTEGER,
    completion_mode TEXT,
    edited_on       TEXT,
    published       INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_blocks_course ON blocks(course_key);

-- Authoring order of children
CREATE TABLE IF NOT EXISTS block_children (
    parent   TEXT NOT NULL REFERENCES blocks(location) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    child    TEXT NOT NULL,
    PRIMARY KEY (parent, position)
);

-- Taxonomy tags
CREATE TABLE IF NOT EXISTS block_tags (
    location TEXT NOT NULL REFERENCES blocks(location) ON DELETE CASCADE,
    tag      TEXT NOT NULL,
    PRIMARY KEY (location, tag)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "User models: external_ids, user_retirements",
            sql: r#"
CREATE TABLE IF NOT EXISTS external_ids (
    id               INTEGER PRIMARY KEY,
    external_user_id TEXT NOT NULL,
    external_id_type TEXT NOT NULL,
    user_id          INTEGER NOT NULL,
    username         TEXT NOT NULL,
    created          TEXT
);

CREATE INDEX IF NOT EXISTS idx_external_ids_user ON external_ids(user_id);

CREATE TABLE IF NOT EXISTS user_retirements (
    user_id  INTEGER PRIMARY KEY,
    username TEXT NOT NULL,
    created  TEXT
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
