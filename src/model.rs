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

//! Shared domain types used across the store modules. All values are
//! transient copies of database rows, never shared mutable state.

use rusqlite::types::FromSql;
use rusqlite::types::FromSqlError;
use rusqlite::types::FromSqlResult;
use rusqlite::types::ToSqlOutput;
use rusqlite::types::ValueRef;
use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(text: &str) -> Option<Role> {
        match text {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl rusqlite::ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Role::parse(text).ok_or(FromSqlError::InvalidType)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub message_count: i64,
    pub archived: bool,
    pub favorite: bool,
    pub folder_id: Option<String>,
    pub tags: Vec<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

/// Input for [`crate::message::append`]. Timestamp defaults to now.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: Option<i64>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub attachments: Vec<NewAttachment>,
}

impl NewMessage {
    pub fn text(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            created_at: None,
            tool_call_id: None,
            tool_name: None,
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub is_image: bool,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub data: Vec<u8>,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub is_image: bool,
    pub byte_len: i64,
}

/// Attachment row without the payload, for size/listing queries.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentInfo {
    pub id: String,
    pub message_id: String,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub is_image: bool,
    pub byte_len: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRun {
    pub id: String,
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub tool_name: String,
    pub server_id: String,
    pub server_name: Option<String>,
    pub input: String,
    pub output: String,
    pub is_error: bool,
    pub duration_ms: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewToolRun {
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub tool_name: String,
    pub server_id: String,
    pub server_name: Option<String>,
    pub input: String,
    pub output: String,
    pub is_error: bool,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub created_at: i64,
}

/// Keyset-pagination cursor: the `(created_at, id)` key of the oldest
/// message already shown in the current scroll direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: i64,
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    /// Messages in ascending chronological order, ties broken by id.
    pub messages: Vec<Message>,
    /// True if older messages remain beyond this page.
    pub more: bool,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message: Message,
    /// Relevance, positive with higher-is-better. See [`crate::search`].
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub runs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolErrorRate {
    pub tool_name: String,
    pub errors: i64,
    pub total: i64,
    pub rate: f64,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
