//! Idempotent schema creation for both engines.
//!
//! The statement set is dialect-parameterised the same way for SQLite and
//! PostgreSQL; everything is `CREATE ... IF NOT EXISTS` so migration can
//! run on every startup.

use crate::Dialect;

pub fn statements(dialect: Dialect) -> Vec<String> {
    let id = match dialect {
        Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
    };

    let mut ddl = vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id {id},
                folder_id TEXT UNIQUE NOT NULL,
                path TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                signing_key TEXT,
                verifying_key TEXT,
                content_key TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                file_count BIGINT NOT NULL DEFAULT 0,
                total_size BIGINT NOT NULL DEFAULT 0,
                segment_count BIGINT NOT NULL DEFAULT 0,
                encryption_enabled INTEGER NOT NULL DEFAULT 1,
                redundancy_level INTEGER NOT NULL DEFAULT 1,
                target_group TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'added',
                created_at BIGINT NOT NULL,
                last_indexed BIGINT,
                CHECK (redundancy_level >= 1),
                CHECK (state IN ('added','indexing','indexed','segmenting','segmented',
                                 'uploading','uploaded','published','error'))
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id {id},
                file_id TEXT UNIQUE NOT NULL,
                folder_id TEXT NOT NULL,
                path TEXT NOT NULL,
                size BIGINT NOT NULL,
                hash TEXT NOT NULL,
                mime_type TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                previous_version INTEGER,
                change_kind TEXT NOT NULL,
                segment_size INTEGER NOT NULL,
                total_segments INTEGER NOT NULL DEFAULT 0,
                uploaded_segments INTEGER NOT NULL DEFAULT 0,
                encryption_key_ref TEXT,
                modified_at BIGINT NOT NULL,
                indexed_at BIGINT NOT NULL,
                UNIQUE (folder_id, path, version),
                CHECK (change_kind IN ('added','modified','deleted','unchanged'))
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                id {id},
                segment_id TEXT NOT NULL,
                file_id TEXT,
                packed_segment_id TEXT,
                segment_index INTEGER NOT NULL,
                redundancy_index INTEGER NOT NULL DEFAULT 0,
                size BIGINT NOT NULL,
                compressed_size BIGINT,
                hash TEXT NOT NULL,
                offset_start BIGINT NOT NULL DEFAULT 0,
                offset_end BIGINT NOT NULL DEFAULT 0,
                message_id TEXT,
                subject TEXT NOT NULL,
                target_group TEXT NOT NULL,
                nonce TEXT NOT NULL,
                upload_state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                packing_index INTEGER,
                UNIQUE (segment_id, redundancy_index),
                CHECK (upload_state IN ('pending','uploading','uploaded','failed','cancelled'))
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS packed_segments (
                id {id},
                packed_segment_id TEXT UNIQUE NOT NULL,
                total_size BIGINT NOT NULL,
                file_count INTEGER NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                message_id TEXT
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS shares (
                id {id},
                share_id TEXT UNIQUE NOT NULL,
                folder_id TEXT NOT NULL,
                folder_version INTEGER NOT NULL DEFAULT 1,
                kind TEXT NOT NULL DEFAULT 'full',
                tier TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                master_key TEXT,
                passphrase_hash TEXT,
                passphrase_salt TEXT,
                key_salt TEXT,
                wrapped_keys TEXT NOT NULL DEFAULT '{{}}',
                allowed_users TEXT NOT NULL DEFAULT '[]',
                denied_users TEXT NOT NULL DEFAULT '[]',
                index_refs TEXT NOT NULL DEFAULT '[]',
                expires_at BIGINT,
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                CHECK (kind IN ('full','partial','incremental')),
                CHECK (tier IN ('open','member','passphrase'))
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS commitments (
                id {id},
                commitment_id TEXT UNIQUE NOT NULL,
                share_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                commitment_hash TEXT NOT NULL,
                wrapped_key TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '{{"read":true}}',
                granted_at BIGINT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at BIGINT,
                UNIQUE (share_id, user_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id {id},
                message_id TEXT UNIQUE NOT NULL,
                target_group TEXT NOT NULL,
                subject TEXT NOT NULL,
                size BIGINT NOT NULL,
                lines INTEGER NOT NULL,
                server TEXT NOT NULL,
                posted_at BIGINT NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS upload_queue (
                id {id},
                queue_id TEXT UNIQUE NOT NULL,
                entity_id TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                state TEXT NOT NULL DEFAULT 'queued',
                progress REAL NOT NULL DEFAULT 0.0,
                total_size BIGINT NOT NULL DEFAULT 0,
                transferred BIGINT NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                session_id TEXT,
                worker_id TEXT,
                error TEXT,
                queued_at BIGINT NOT NULL,
                started_at BIGINT,
                completed_at BIGINT,
                CHECK (priority BETWEEN 1 AND 10),
                CHECK (state IN ('queued','running','completed','failed',
                                 'cancelled','retrying','paused'))
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS download_progress (
                id {id},
                share_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                verified_segments TEXT NOT NULL DEFAULT '[]',
                updated_at BIGINT NOT NULL,
                UNIQUE (share_id, file_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS server_health (
                id {id},
                server_id TEXT UNIQUE NOT NULL,
                response_time_ema REAL NOT NULL DEFAULT 0.0,
                failure_rate_ema REAL NOT NULL DEFAULT 0.0,
                last_success BIGINT,
                last_failure BIGINT,
                unhealthy_since BIGINT,
                updated_at BIGINT NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id {id},
                operation_id TEXT UNIQUE NOT NULL,
                entity_id TEXT,
                operation_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'started',
                error TEXT,
                duration_ms BIGINT,
                started_at BIGINT NOT NULL,
                completed_at BIGINT,
                CHECK (state IN ('started','running','completed','failed','cancelled'))
            )
            "#
        ),
    ];

    ddl.extend(
        [
            "CREATE INDEX IF NOT EXISTS idx_files_folder_path ON files (folder_id, path)",
            "CREATE INDEX IF NOT EXISTS idx_files_folder_version ON files (folder_id, version)",
            "CREATE INDEX IF NOT EXISTS idx_segments_file ON segments (file_id, segment_index)",
            "CREATE INDEX IF NOT EXISTS idx_segments_packed ON segments (packed_segment_id)",
            "CREATE INDEX IF NOT EXISTS idx_segments_state ON segments (upload_state)",
            "CREATE INDEX IF NOT EXISTS idx_queue_lease ON upload_queue (state, priority, queued_at)",
            "CREATE INDEX IF NOT EXISTS idx_commitments_share ON commitments (share_id, user_id)",
            "CREATE INDEX IF NOT EXISTS idx_shares_folder ON shares (folder_id)",
        ]
        .into_iter()
        .map(String::from),
    );

    ddl
}
