//! SQL migration definitions for the harvester database.
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
            description: "Initial schema: celebrities, celebrity_mentions, scraping_jobs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Entity roster
CREATE TABLE IF NOT EXISTS celebrities (
    celebrity_id INTEGER PRIMARY KEY,
    name         TEXT NOT NULL
);

-- Harvested mentions; one row per (entity, url)
CREATE TABLE IF NOT EXISTS celebrity_mentions (
    mention_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    celebrity_id          INTEGER NOT NULL REFERENCES celebrities(celebrity_id) ON DELETE CASCADE,
    cleaned_text          TEXT NOT NULL,
    source                TEXT NOT NULL DEFAULT 'google',
    time_stamp            TEXT NOT NULL,
    original_url          TEXT NOT NULL,
    domain                TEXT NOT NULL DEFAULT 'unknown',
    content_category      TEXT NOT NULL DEFAULT 'uncategorized',
    sentiment_score       REAL NOT NULL DEFAULT 0
                          CHECK (sentiment_score BETWEEN -1.0 AND 1.0),
    keyword_tags          TEXT,
    extraction_confidence REAL NOT NULL DEFAULT 1.0
                          CHECK (extraction_confidence BETWEEN 0.0 AND 1.0),
    processing_time_ms    INTEGER NOT NULL DEFAULT 0 CHECK (processing_time_ms >= 0),
    content_length        INTEGER NOT NULL DEFAULT 0 CHECK (content_length >= 0),
    created_at            TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(celebrity_id, original_url)
);

CREATE INDEX IF NOT EXISTS idx_mentions_celebrity ON celebrity_mentions(celebrity_id);
CREATE INDEX IF NOT EXISTS idx_mentions_domain ON celebrity_mentions(domain);

-- Run records
CREATE TABLE IF NOT EXISTS scraping_jobs (
    job_id         TEXT PRIMARY KEY,
    celebrity_id   INTEGER,
    status         TEXT NOT NULL DEFAULT 'pending'
                   CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    mentions_found INTEGER NOT NULL DEFAULT 0,
    urls_processed INTEGER NOT NULL DEFAULT 0,
    start_time     TEXT NOT NULL,
    end_time       TEXT,
    error_message  TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON scraping_jobs(status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ascending_and_recorded() {
        let migrations = all_migrations();
        for pair in migrations.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
        for m in &migrations {
            let marker = format!("INSERT INTO schema_migrations (version) VALUES ({});", m.version);
            assert!(m.sql.contains(&marker), "v{} does not record itself", m.version);
        }
    }
}
