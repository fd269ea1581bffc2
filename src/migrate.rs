//! Database schema migrations.
//!
//! A versioned runner: each migration is a numbered up/down SQL pair,
//! recorded in `schema_migrations`, applied in order inside a transaction.
//! Rolling back is explicit via [`rollback_to`]. The vector index exists iff
//! the chunks table exists — both live in the same migration.

use anyhow::{bail, Result};
use sqlx::PgPool;

use crate::config::Config;

struct Migration {
    version: i64,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core schema",
        up: r#"
        CREATE EXTENSION IF NOT EXISTS vector;

        CREATE TABLE events (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            year INTEGER,
            event_date DATE,
            start_date DATE,
            end_date DATE,
            category TEXT,
            department TEXT,
            status TEXT NOT NULL DEFAULT 'planned',
            chunk_timeline JSONB NOT NULL DEFAULT '[]',
            decision_summaries JSONB NOT NULL DEFAULT '[]',
            action_items JSONB NOT NULL DEFAULT '[]',
            parent_chunk_ids JSONB NOT NULL DEFAULT '[]',
            child_chunk_ids JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX idx_events_year ON events(year);

        CREATE TABLE documents (
            id UUID PRIMARY KEY,
            event_id UUID REFERENCES events(id),
            drive_id TEXT UNIQUE,
            drive_name TEXT,
            display_name TEXT,
            path TEXT,
            mime_type TEXT,
            storage_url TEXT,
            doc_type TEXT NOT NULL DEFAULT 'other',
            doc_category TEXT,
            meeting_subtype TEXT,
            access_level INTEGER NOT NULL DEFAULT 1,
            standardized_name TEXT,
            time_decay_date DATE,
            department TEXT,
            year INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            raw_content TEXT,
            parsed_content TEXT,
            preprocessed_content TEXT,
            metadata JSONB NOT NULL DEFAULT '{}',
            error_message TEXT,
            processed_at TIMESTAMPTZ,
            current_step INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX idx_documents_status ON documents(status);
        CREATE INDEX idx_documents_year ON documents(year);

        CREATE TABLE document_chunks (
            id UUID PRIMARY KEY,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            parent_chunk_id UUID REFERENCES document_chunks(id) ON DELETE CASCADE,
            related_event_id UUID REFERENCES events(id),
            inferred_event_title TEXT,
            is_parent BOOLEAN NOT NULL DEFAULT FALSE,
            chunk_index INTEGER NOT NULL,
            chunk_type TEXT NOT NULL DEFAULT 'text',
            content TEXT NOT NULL,
            parent_content TEXT NOT NULL DEFAULT '',
            section_header TEXT,
            embedding vector(768),
            access_level INTEGER NOT NULL DEFAULT 1,
            metadata JSONB NOT NULL DEFAULT '{}',
            token_count INTEGER NOT NULL DEFAULT 0,
            start_char INTEGER NOT NULL DEFAULT 0,
            end_char INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT chunk_hierarchy CHECK (is_parent = (parent_chunk_id IS NULL))
        );
        CREATE INDEX idx_chunks_parent ON document_chunks(parent_chunk_id);
        CREATE INDEX idx_chunks_event ON document_chunks(related_event_id);

        CREATE TABLE reference_links (
            id UUID PRIMARY KEY,
            description TEXT,
            url TEXT NOT NULL UNIQUE,
            file_type TEXT,
            file_name TEXT NOT NULL,
            access_level INTEGER NOT NULL DEFAULT 1,
            event_id UUID REFERENCES events(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE chat_logs (
            id UUID PRIMARY KEY,
            session_id TEXT NOT NULL,
            user_level INTEGER NOT NULL DEFAULT 1,
            query TEXT NOT NULL,
            rewritten_query TEXT,
            response TEXT,
            chunks JSONB NOT NULL DEFAULT '[]',
            sources JSONB NOT NULL DEFAULT '[]',
            turn_index INTEGER NOT NULL DEFAULT 0,
            retrieval_ms BIGINT NOT NULL DEFAULT 0,
            generation_ms BIGINT NOT NULL DEFAULT 0,
            total_ms BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX idx_chat_logs_session ON chat_logs(session_id);
        "#,
        down: r#"
        DROP TABLE IF EXISTS chat_logs;
        DROP TABLE IF EXISTS reference_links;
        DROP TABLE IF EXISTS document_chunks;
        DROP TABLE IF EXISTS documents;
        DROP TABLE IF EXISTS events;
        "#,
    },
    Migration {
        version: 2,
        name: "task queue",
        up: r#"
        CREATE TABLE tasks (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'PENDING',
            progress INTEGER NOT NULL DEFAULT 0,
            step TEXT,
            result JSONB,
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            lease_expires_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX idx_tasks_state ON tasks(state);
        "#,
        down: "DROP TABLE IF EXISTS tasks;",
    },
];

/// Apply all pending migrations in version order, then make sure the HNSW
/// index exists with the configured build parameters.
pub async fn run_migrations(config: &Config, pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in split_statements(migration.up) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version = migration.version, name = migration.name, "migration applied");
    }

    ensure_hnsw_index(config, pool).await?;
    Ok(())
}

/// Explicitly roll back every migration with version > `target`, newest
/// first.
pub async fn rollback_to(pool: &PgPool, target: i64) -> Result<()> {
    let applied: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version DESC")
            .fetch_all(pool)
            .await?;

    for version in applied {
        if version <= target {
            break;
        }
        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == version) else {
            bail!("no down migration known for version {}", version);
        };

        let mut tx = pool.begin().await?;
        for statement in split_statements(migration.down) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version, "migration rolled back");
    }

    Ok(())
}

/// Create the cosine HNSW index over child embeddings if it is missing.
/// Build parameters are tuned for up to ~10^6 vectors.
async fn ensure_hnsw_index(config: &Config, pool: &PgPool) -> Result<()> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE indexname = 'idx_chunks_embedding_hnsw')",
    )
    .fetch_one(pool)
    .await?;

    if !exists {
        let ddl = format!(
            "CREATE INDEX idx_chunks_embedding_hnsw ON document_chunks \
             USING hnsw (embedding vector_cosine_ops) WITH (m = {}, ef_construction = {})",
            config.index.hnsw_m, config.index.hnsw_ef_construction
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    Ok(())
}

/// Rebuild the HNSW index. Triggered by the `rebuild_hnsw_index` task after
/// large ingestion runs. CONCURRENTLY keeps searches and chunk writes
/// flowing during the rebuild; it must not run inside a transaction, so the
/// statement goes straight to the pool.
pub async fn rebuild_hnsw_index(pool: &PgPool) -> Result<()> {
    sqlx::query("REINDEX INDEX CONCURRENTLY idx_chunks_embedding_hnsw")
        .execute(pool)
        .await?;
    Ok(())
}

/// Split a migration script into single statements. sqlx's simple query
/// protocol will not run multi-statement strings through `query()`, so the
/// runner feeds them one at a time. Semicolons only terminate statements at
/// top level here; none of our DDL embeds them in literals.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_unique() {
        let mut versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let original = versions.clone();
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions, original, "migration versions must be sorted and unique");
    }

    #[test]
    fn every_migration_has_a_down() {
        for m in MIGRATIONS {
            assert!(!m.down.trim().is_empty(), "migration {} lacks down SQL", m.version);
        }
    }

    #[test]
    fn split_statements_drops_blanks() {
        let stmts = split_statements("CREATE TABLE a (x INT);\n\nCREATE INDEX i ON a(x);\n");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE"));
        assert!(stmts[1].starts_with("CREATE INDEX"));
    }
}
