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

//! Append-only audit ledger of tool executions. Records are never
//! updated; they leave the table only through a conversation cascade or
//! an explicit retention prune.

use anyhow::Context;
use anyhow::Result;
use rusqlite::Row;
use rusqlite::params;
use tracing::error;

use crate::engine::Engine;
use crate::model::NewToolRun;
use crate::model::ToolErrorRate;
use crate::model::ToolRun;
use crate::model::ToolUsage;
use crate::model::new_id;
use crate::model::now_ms;

const TOOL_RUN_COLUMNS: &str = "id, conversation_id, message_id, tool_name, server_id, \
     server_name, input, output, is_error, duration_ms, created_at";

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn map_tool_run(row: &Row<'_>) -> rusqlite::Result<ToolRun> {
    Ok(ToolRun {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        message_id: row.get(2)?,
        tool_name: row.get(3)?,
        server_id: row.get(4)?,
        server_name: row.get(5)?,
        input: row.get(6)?,
        output: row.get(7)?,
        is_error: row.get(8)?,
        duration_ms: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn record(engine: &Engine, new: NewToolRun) -> Result<ToolRun> {
    let run = build(new);
    engine
        .conn
        .execute(
            &format!(
                "INSERT INTO tool_runs ({TOOL_RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            run_params(&run),
        )
        .context("insert tool run")?;
    Ok(run)
}

/// Inserts every record or none of them.
pub fn record_batch(engine: &Engine, batch: Vec<NewToolRun>) -> Result<Vec<ToolRun>> {
    let runs: Vec<ToolRun> = batch.into_iter().map(build).collect();
    engine.with_tx(|conn| {
        let mut stmt = conn
            .prepare(&format!(
                "INSERT INTO tool_runs ({TOOL_RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ))
            .context("prepare batch insert")?;
        for run in &runs {
            stmt.execute(run_params(run)).context("insert tool run")?;
        }
        Ok(())
    })?;
    Ok(runs)
}

fn build(new: NewToolRun) -> ToolRun {
    ToolRun {
        id: new_id(),
        conversation_id: new.conversation_id,
        message_id: new.message_id,
        tool_name: new.tool_name,
        server_id: new.server_id,
        server_name: new.server_name,
        input: new.input,
        output: new.output,
        is_error: new.is_error,
        duration_ms: new.duration_ms,
        created_at: now_ms(),
    }
}

fn run_params(run: &ToolRun) -> [&dyn rusqlite::ToSql; 11] {
    [
        &run.id,
        &run.conversation_id,
        &run.message_id,
        &run.tool_name,
        &run.server_id,
        &run.server_name,
        &run.input,
        &run.output,
        &run.is_error,
        &run.duration_ms,
        &run.created_at,
    ]
}

pub fn by_conversation(engine: &Engine, conversation_id: &str) -> Vec<ToolRun> {
    load_where(
        engine,
        "conversation_id = ?1",
        params![conversation_id],
        None,
    )
}

pub fn by_message(engine: &Engine, message_id: &str) -> Vec<ToolRun> {
    load_where(engine, "message_id = ?1", params![message_id], None)
}

pub fn by_tool(engine: &Engine, tool_name: &str) -> Vec<ToolRun> {
    load_where(engine, "tool_name = ?1", params![tool_name], None)
}

pub fn by_server(engine: &Engine, server_id: &str) -> Vec<ToolRun> {
    load_where(engine, "server_id = ?1", params![server_id], None)
}

pub fn recent(engine: &Engine, limit: usize) -> Vec<ToolRun> {
    load_where(engine, "1=1", params![], Some(limit))
}

pub fn errors(engine: &Engine, limit: usize) -> Vec<ToolRun> {
    load_where(engine, "is_error = 1", params![], Some(limit))
}

fn load_where(
    engine: &Engine,
    where_sql: &str,
    params: impl rusqlite::Params,
    limit: Option<usize>,
) -> Vec<ToolRun> {
    let result = (|| -> Result<Vec<ToolRun>> {
        let mut sql = format!(
            "SELECT {TOOL_RUN_COLUMNS} FROM tool_runs WHERE {where_sql} \
             ORDER BY created_at DESC, id DESC"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit.max(1)));
        }
        let mut stmt = engine.conn.prepare(&sql).context("prepare tool run query")?;
        let rows = stmt.query_map(params, map_tool_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    })();
    match result {
        Ok(runs) => runs,
        Err(err) => {
            error!(error = %err, "failed to load tool runs");
            Vec::new()
        }
    }
}

/// Run count per tool, most used first. Read-only aggregation.
pub fn usage_stats(engine: &Engine) -> Vec<ToolUsage> {
    let result = (|| -> Result<Vec<ToolUsage>> {
        let mut stmt = engine.conn.prepare(
            "SELECT tool_name, COUNT(*) AS runs FROM tool_runs \
             GROUP BY tool_name ORDER BY runs DESC, tool_name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ToolUsage {
                tool_name: row.get(0)?,
                runs: row.get(1)?,
            })
        })?;
        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    })();
    match result {
        Ok(usage) => usage,
        Err(err) => {
            error!(error = %err, "failed to aggregate tool usage");
            Vec::new()
        }
    }
}

/// Errors over total per tool. Read-only aggregation.
pub fn error_stats(engine: &Engine) -> Vec<ToolErrorRate> {
    let result = (|| -> Result<Vec<ToolErrorRate>> {
        let mut stmt = engine.conn.prepare(
            "SELECT tool_name, SUM(is_error) AS errors, COUNT(*) AS total \
             FROM tool_runs GROUP BY tool_name ORDER BY tool_name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let errors: i64 = row.get(1)?;
            let total: i64 = row.get(2)?;
            Ok(ToolErrorRate {
                tool_name: row.get(0)?,
                errors,
                total,
                rate: if total > 0 {
                    errors as f64 / total as f64
                } else {
                    0.0
                },
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    })();
    match result {
        Ok(stats) => stats,
        Err(err) => {
            error!(error = %err, "failed to aggregate tool errors");
            Vec::new()
        }
    }
}

pub fn delete(engine: &Engine, id: &str) -> Result<()> {
    engine
        .conn
        .execute("DELETE FROM tool_runs WHERE id = ?1", params![id])
        .context("delete tool run")?;
    Ok(())
}

pub fn delete_for_conversation(engine: &Engine, conversation_id: &str) -> Result<usize> {
    let removed = engine
        .conn
        .execute(
            "DELETE FROM tool_runs WHERE conversation_id = ?1",
            params![conversation_id],
        )
        .context("delete conversation tool runs")?;
    Ok(removed)
}

/// Removes every run older than `days` days, returning the count. The
/// only bulk delete on the ledger; callers invoke it explicitly.
pub fn prune_older_than(engine: &Engine, days: u32) -> Result<usize> {
    let cutoff = now_ms() - i64::from(days) * DAY_MS;
    let removed = engine
        .conn
        .execute(
            "DELETE FROM tool_runs WHERE created_at < ?1",
            params![cutoff],
        )
        .context("prune tool runs")?;
    Ok(removed)
}
