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

//! One-time ingestion of the legacy flat-file store: two JSON documents,
//! an array of conversations and an array of messages with optional
//! embedded attachments. Guarded by a persisted marker; once that is
//! set this module never does anything again. Inserts use conflict
//! ignore semantics so a crash mid-import re-runs cleanly, and message
//! counts are recomputed from the rows actually present rather than
//! trusted from the legacy records.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::Connection;
use rusqlite::params;
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use tracing::warn;

use crate::engine::Engine;
use crate::model::Role;
use crate::model::new_id;
use crate::model::now_ms;

const MARKER_KEY: &str = "legacy_imported";
const CONVERSATIONS_FILE: &str = "conversations.json";
const MESSAGES_FILE: &str = "messages.json";
const PLACEHOLDER_TITLE: &str = "Imported conversation";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConversation {
    id: String,
    title: String,
    #[serde(default)]
    summary: String,
    created_at: Option<LegacyStamp>,
    last_used_at: Option<LegacyStamp>,
    #[serde(default)]
    #[allow(dead_code)]
    message_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyMessage {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    timestamp: Option<LegacyStamp>,
    tool_call_id: Option<String>,
    tool_name: Option<String>,
    #[serde(default)]
    attachments: Vec<LegacyAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAttachment {
    data: String,
    mime_type: String,
    file_name: Option<String>,
    #[serde(default)]
    is_image: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyStamp {
    Number(f64),
    Text(String),
}

impl LegacyStamp {
    // Numbers at or above 10^12 are already milliseconds; smaller ones
    // are seconds.
    fn to_millis(&self) -> Option<i64> {
        match self {
            LegacyStamp::Number(value) => {
                if *value >= 1e12 {
                    Some(*value as i64)
                } else {
                    Some((*value * 1000.0) as i64)
                }
            }
            LegacyStamp::Text(text) => OffsetDateTime::parse(text, &Rfc3339)
                .ok()
                .map(|stamp| (stamp.unix_timestamp_nanos() / 1_000_000) as i64),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ImportReport {
    pub conversations: usize,
    pub messages: usize,
    pub attachments: usize,
    pub placeholders: usize,
}

/// Runs the import once per store lifetime. Returns `Ok(None)` when the
/// marker is already set or there is nothing to import. Safe to call on
/// every startup.
pub fn run_if_needed(engine: &Engine, dir: &Path) -> Result<Option<ImportReport>> {
    if engine.meta_get(MARKER_KEY)?.is_some() {
        return Ok(None);
    }

    let conversations_path = dir.join(CONVERSATIONS_FILE);
    let messages_path = dir.join(MESSAGES_FILE);
    if !conversations_path.exists() && !messages_path.exists() {
        engine.meta_set(MARKER_KEY, &now_ms().to_string())?;
        return Ok(None);
    }

    info!(dir = %dir.display(), "importing legacy store");
    let conversations: Vec<LegacyConversation> = read_array(&conversations_path);
    let messages: Vec<LegacyMessage> = read_array(&messages_path);

    let report = engine.with_tx(|conn| {
        let report = insert_all(conn, &conversations, &messages)?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![MARKER_KEY, now_ms().to_string()],
        )
        .context("set import marker")?;
        Ok(report)
    })?;
    Ok(Some(report))
}

fn read_array<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    if !path.exists() {
        return Vec::new();
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable legacy file; skipping");
            return Vec::new();
        }
    };
    match serde_json::from_str(&text) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed legacy file; skipping");
            Vec::new()
        }
    }
}

fn insert_all(
    conn: &Connection,
    conversations: &[LegacyConversation],
    messages: &[LegacyMessage],
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut known: HashSet<String> = existing_conversation_ids(conn)?;

    for conversation in conversations {
        let created = stamp_or_now(&conversation.created_at);
        let last_used = conversation
            .last_used_at
            .as_ref()
            .and_then(LegacyStamp::to_millis)
            .unwrap_or(created);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO conversations \
                 (id, title, summary, created_at, last_used_at, message_count, archived) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)",
                params![
                    conversation.id,
                    conversation.title,
                    conversation.summary,
                    created,
                    last_used,
                ],
            )
            .context("import conversation")?;
        report.conversations += inserted;
        known.insert(conversation.id.clone());
    }

    // Placeholders for messages whose conversation is missing entirely;
    // their timestamps come from the orphan messages themselves.
    let mut orphans: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    for message in messages {
        if known.contains(&message.conversation_id) {
            continue;
        }
        let stamp = stamp_or_now(&message.timestamp);
        let entry = orphans
            .entry(message.conversation_id.as_str())
            .or_insert((stamp, stamp));
        entry.0 = entry.0.min(stamp);
        entry.1 = entry.1.max(stamp);
    }
    for (conversation_id, (created, last_used)) in &orphans {
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO conversations \
                 (id, title, summary, created_at, last_used_at, message_count, archived) \
                 VALUES (?1, ?2, '', ?3, ?4, 0, 0)",
                params![conversation_id, PLACEHOLDER_TITLE, created, last_used],
            )
            .context("insert placeholder conversation")?;
        report.placeholders += inserted;
        known.insert((*conversation_id).to_string());
    }

    for message in messages {
        let Some(role) = Role::parse(&message.role) else {
            warn!(id = %message.id, role = %message.role, "unknown role; skipping message");
            continue;
        };
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO messages \
                 (id, conversation_id, role, content, created_at, tool_call_id, tool_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id,
                    message.conversation_id,
                    role,
                    message.content,
                    stamp_or_now(&message.timestamp),
                    message.tool_call_id,
                    message.tool_name,
                ],
            )
            .context("import message")?;
        report.messages += inserted;
        if inserted == 0 {
            continue;
        }
        for attachment in &message.attachments {
            let data = match BASE64.decode(attachment.data.as_bytes()) {
                Ok(data) => data,
                Err(err) => {
                    warn!(message_id = %message.id, error = %err, "undecodable attachment; skipping");
                    continue;
                }
            };
            conn.execute(
                "INSERT OR IGNORE INTO attachments \
                 (id, message_id, data, mime_type, file_name, is_image, byte_len) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_id(),
                    message.id,
                    data,
                    attachment.mime_type,
                    attachment.file_name,
                    attachment.is_image,
                    data.len() as i64,
                ],
            )
            .context("import attachment")?;
            report.attachments += 1;
        }
    }

    // Historical counts are not trusted; recompute from what landed.
    conn.execute(
        "UPDATE conversations SET message_count = \
         (SELECT COUNT(*) FROM messages WHERE messages.conversation_id = conversations.id)",
        [],
    )
    .context("recompute message counts")?;

    Ok(report)
}

fn existing_conversation_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM conversations")
        .context("list conversations")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ids = HashSet::new();
    for row in rows {
        ids.insert(row?);
    }
    Ok(ids)
}

fn stamp_or_now(stamp: &Option<LegacyStamp>) -> i64 {
    stamp
        .as_ref()
        .and_then(LegacyStamp::to_millis)
        .unwrap_or_else(now_ms)
}
