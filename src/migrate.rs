// Copyright 2026 Colloquy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered, named, idempotent schema migrations. Migrations are additive
//! only and are never rewritten once released; each one must be safe to
//! run against a store created at any historical schema version.

use anyhow::Context;
use anyhow::Result;
use rusqlite::Connection;
use rusqlite::params;
use tracing::error;

use crate::model::now_ms;

pub struct Migration {
    pub name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_base",
        apply: base,
    },
    Migration {
        name: "0002_attachments",
        apply: attachments,
    },
    Migration {
        name: "0003_tool_runs",
        apply: tool_runs,
    },
    Migration {
        name: "0004_organize",
        apply: organize,
    },
    Migration {
        name: "0005_search",
        apply: search,
    },
    Migration {
        name: "0006_model_override",
        apply: model_override,
    },
    Migration {
        name: "0007_templates",
        apply: templates,
    },
];

/// Applies every migration not yet recorded in `schema_migrations`, in
/// registration order. Each migration commits atomically with its ledger
/// row; a failed migration is rolled back and never recorded as applied.
pub fn apply_all(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\n  name TEXT PRIMARY KEY,\n  applied_at INTEGER NOT NULL\n);",
    )
    .context("create migration ledger")?;

    let mut applied = 0usize;
    for migration in MIGRATIONS {
        if is_applied(conn, migration.name)? {
            continue;
        }
        conn.execute_batch("BEGIN IMMEDIATE")
            .with_context(|| format!("begin migration {}", migration.name))?;
        let result = (migration.apply)(conn).and_then(|()| {
            conn.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                params![migration.name, now_ms()],
            )
            .context("record migration")?;
            Ok(())
        });
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .with_context(|| format!("commit migration {}", migration.name))?;
                applied += 1;
            }
            Err(err) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    error!(migration = migration.name, %rollback, "rollback failed");
                }
                return Err(err.context(format!("apply migration {}", migration.name)));
            }
        }
    }
    Ok(applied)
}

fn is_applied(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .context("check migration ledger")?;
    Ok(count > 0)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name=?1",
            params![name],
            |row| row.get(0),
        )
        .context("check table")?;
    Ok(count > 0)
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .context("table info")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])
            .with_context(|| format!("add {table}.{column} column"))?;
    }
    Ok(())
}

fn base(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL,
  last_used_at INTEGER NOT NULL,
  message_count INTEGER NOT NULL DEFAULT 0,
  archived INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
  rowid INTEGER PRIMARY KEY,
  id TEXT UNIQUE NOT NULL,
  conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  tool_call_id TEXT,
  tool_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_last_used ON conversations(last_used_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_conv_time ON messages(conversation_id, created_at, id);
"#,
    )
    .context("create base schema")?;
    Ok(())
}

fn attachments(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS attachments (
  id TEXT PRIMARY KEY,
  message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  data BLOB NOT NULL,
  mime_type TEXT NOT NULL,
  file_name TEXT,
  is_image INTEGER NOT NULL DEFAULT 0,
  byte_len INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
"#,
    )
    .context("create attachments schema")?;
    Ok(())
}

fn tool_runs(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS tool_runs (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  message_id TEXT REFERENCES messages(id) ON DELETE SET NULL,
  tool_name TEXT NOT NULL,
  server_id TEXT NOT NULL,
  server_name TEXT,
  input TEXT NOT NULL,
  output TEXT NOT NULL,
  is_error INTEGER NOT NULL DEFAULT 0,
  duration_ms INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_runs_conv ON tool_runs(conversation_id);
CREATE INDEX IF NOT EXISTS idx_tool_runs_message ON tool_runs(message_id);
CREATE INDEX IF NOT EXISTS idx_tool_runs_tool ON tool_runs(tool_name);
CREATE INDEX IF NOT EXISTS idx_tool_runs_created ON tool_runs(created_at);
"#,
    )
    .context("create tool_runs schema")?;
    Ok(())
}

fn organize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS folders (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  color TEXT,
  created_at INTEGER NOT NULL
);
"#,
    )
    .context("create folders schema")?;
    add_column(conn, "conversations", "favorite", "INTEGER NOT NULL DEFAULT 0")?;
    add_column(
        conn,
        "conversations",
        "folder_id",
        "TEXT REFERENCES folders(id) ON DELETE SET NULL",
    )?;
    add_column(conn, "conversations", "tags", "TEXT NOT NULL DEFAULT '[]'")?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_conversations_folder ON conversations(folder_id);",
    )
    .context("index conversations.folder_id")?;
    Ok(())
}

// The index is an external-content FTS5 table over messages; the triggers
// are the only writers, so it can never drift from the primary table.
fn search(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
  content,
  role UNINDEXED,
  content='messages',
  content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
  INSERT INTO message_fts(rowid, content, role) VALUES (new.rowid, new.content, new.role);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
  INSERT INTO message_fts(message_fts, rowid, content, role)
  VALUES ('delete', old.rowid, old.content, old.role);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
  INSERT INTO message_fts(message_fts, rowid, content, role)
  VALUES ('delete', old.rowid, old.content, old.role);
  INSERT INTO message_fts(rowid, content, role) VALUES (new.rowid, new.content, new.role);
END;

INSERT INTO message_fts(message_fts) VALUES ('rebuild');
"#,
    )
    .context("create search index")?;
    Ok(())
}

fn model_override(conn: &Connection) -> Result<()> {
    add_column(conn, "conversations", "model_provider", "TEXT")?;
    add_column(conn, "conversations", "model_id", "TEXT")?;
    Ok(())
}

fn templates(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS templates (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  prompt TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
"#,
    )
    .context("create templates schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn schema_dump(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare(
                "SELECT name, COALESCE(sql, '') FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .expect("prepare dump");
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("dump schema");
        rows.map(|row| row.expect("row")).collect()
    }

    #[test]
    fn migration_names_are_unique_and_ordered() {
        let mut seen = HashSet::new();
        let mut previous = "";
        for migration in MIGRATIONS {
            assert!(seen.insert(migration.name), "duplicate {}", migration.name);
            assert!(migration.name > previous, "out of order {}", migration.name);
            previous = migration.name;
        }
    }

    #[test]
    fn apply_all_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        let first = apply_all(&conn).expect("first run");
        assert_eq!(first, MIGRATIONS.len());
        let second = apply_all(&conn).expect("second run");
        assert_eq!(second, 0);
        let third = apply_all(&conn).expect("third run");
        assert_eq!(third, 0);
    }

    #[test]
    fn fresh_and_remigrated_schemas_match() {
        let once = Connection::open_in_memory().expect("open");
        apply_all(&once).expect("migrate once");

        let twice = Connection::open_in_memory().expect("open");
        apply_all(&twice).expect("migrate");
        apply_all(&twice).expect("re-migrate");

        assert_eq!(schema_dump(&once), schema_dump(&twice));
    }

    #[test]
    fn migrates_historical_base_schema() {
        // A store created before attachments/tool runs/search existed.
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE schema_migrations (name TEXT PRIMARY KEY, applied_at INTEGER NOT NULL);",
        )
        .expect("ledger");
        base(&conn).expect("base schema");
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES ('0001_base', 0)",
            [],
        )
        .expect("record base");

        let applied = apply_all(&conn).expect("catch up");
        assert_eq!(applied, MIGRATIONS.len() - 1);
        assert!(table_exists(&conn, "message_fts").expect("probe fts"));
        assert!(column_exists(&conn, "conversations", "model_id").expect("probe column"));
    }

    #[test]
    fn column_probe_sees_added_columns() {
        let conn = Connection::open_in_memory().expect("open");
        apply_all(&conn).expect("migrate");
        assert!(column_exists(&conn, "conversations", "tags").expect("probe"));
        assert!(!column_exists(&conn, "conversations", "nonexistent").expect("probe"));
    }
}
