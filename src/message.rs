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

//! Append-heavy message write path and the keyset-paginated read path.
//! Messages in a conversation are totally ordered by `(created_at, id)`;
//! ties on the timestamp are broken by ascending id so pagination stays
//! stable for rows created in the same instant.

use anyhow::Context;
use anyhow::Result;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use tracing::error;

use crate::engine::Engine;
use crate::model::Attachment;
use crate::model::AttachmentInfo;
use crate::model::Cursor;
use crate::model::Message;
use crate::model::MessagePage;
use crate::model::NewMessage;
use crate::model::new_id;
use crate::model::now_ms;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, created_at, tool_call_id, tool_name";

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        tool_call_id: row.get(5)?,
        tool_name: row.get(6)?,
    })
}

/// Inserts the message and its attachments in one transaction, bumping
/// the parent's message count and last-used timestamp. The search index
/// is mirrored by database triggers, not here.
pub fn append(engine: &Engine, new: NewMessage) -> Result<Message> {
    let message = Message {
        id: new_id(),
        conversation_id: new.conversation_id.clone(),
        role: new.role,
        content: new.content.clone(),
        created_at: new.created_at.unwrap_or_else(now_ms),
        tool_call_id: new.tool_call_id.clone(),
        tool_name: new.tool_name.clone(),
    };
    engine.with_tx(|conn| {
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, \
             tool_call_id, tool_name) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.role,
                message.content,
                message.created_at,
                message.tool_call_id,
                message.tool_name,
            ],
        )
        .context("insert message")?;
        for attachment in &new.attachments {
            conn.execute(
                "INSERT INTO attachments (id, message_id, data, mime_type, file_name, \
                 is_image, byte_len) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_id(),
                    message.id,
                    attachment.data,
                    attachment.mime_type,
                    attachment.file_name,
                    attachment.is_image,
                    attachment.data.len() as i64,
                ],
            )
            .context("insert attachment")?;
        }
        conn.execute(
            "UPDATE conversations SET message_count = message_count + 1, \
             last_used_at = MAX(last_used_at, ?2) WHERE id = ?1",
            params![message.conversation_id, message.created_at],
        )
        .context("bump message count")?;
        Ok(())
    })?;
    Ok(message)
}

/// Keyset pagination over one conversation's history. `cursor` is the
/// `(created_at, id)` key of the oldest message already shown, or `None`
/// for the most recent page. Results come back in ascending order for
/// display; internally the query scans descending from the cursor so the
/// LIMIT bounds the nearest older rows. Cost is O(limit) no matter how
/// deep into history the cursor points.
pub fn load_page(
    engine: &Engine,
    conversation_id: &str,
    cursor: Option<&Cursor>,
    limit: usize,
) -> MessagePage {
    match try_load_page(engine, conversation_id, cursor, limit) {
        Ok(page) => page,
        Err(err) => {
            error!(conversation_id, error = %err, "failed to load message page");
            MessagePage::default()
        }
    }
}

fn try_load_page(
    engine: &Engine,
    conversation_id: &str,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Result<MessagePage> {
    let limit = limit.max(1);
    let fetch = (limit + 1) as i64;
    let mut messages = match cursor {
        Some(cursor) => {
            let mut stmt = engine
                .conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = ?1 \
                       AND (created_at < ?2 OR (created_at = ?2 AND id < ?3)) \
                     ORDER BY created_at DESC, id DESC LIMIT ?4"
                ))
                .context("prepare page query")?;
            let rows = stmt.query_map(
                params![conversation_id, cursor.created_at, cursor.id, fetch],
                map_message,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt = engine
                .conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))
                .context("prepare page query")?;
            let rows = stmt.query_map(params![conversation_id, fetch], map_message)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };

    let more = messages.len() > limit;
    messages.truncate(limit);
    let next_cursor = if more {
        messages.last().map(|oldest| Cursor {
            created_at: oldest.created_at,
            id: oldest.id.clone(),
        })
    } else {
        None
    };
    messages.reverse();
    Ok(MessagePage {
        messages,
        more,
        next_cursor,
    })
}

pub fn load(engine: &Engine, id: &str) -> Option<Message> {
    let result = engine
        .conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            map_message,
        )
        .optional();
    match result {
        Ok(message) => message,
        Err(err) => {
            error!(id, error = %err, "failed to load message");
            None
        }
    }
}

/// Full replace of content, role, and tool metadata (user edit). The
/// update trigger re-mirrors the search index in the same transaction.
pub fn update(engine: &Engine, message: &Message) -> Result<()> {
    let updated = engine
        .conn
        .execute(
            "UPDATE messages SET role = ?2, content = ?3, tool_call_id = ?4, \
             tool_name = ?5 WHERE id = ?1",
            params![
                message.id,
                message.role,
                message.content,
                message.tool_call_id,
                message.tool_name,
            ],
        )
        .context("update message")?;
    if updated == 0 {
        anyhow::bail!("message {} not found", message.id);
    }
    Ok(())
}

/// Removes the message and its attachments in one transaction. Tool runs
/// that pointed at it are kept with the back-reference nulled; the parent
/// conversation's count is decremented.
pub fn delete(engine: &Engine, id: &str) -> Result<()> {
    engine.with_tx(|conn| {
        let conversation_id: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("find message")?;
        let Some(conversation_id) = conversation_id else {
            anyhow::bail!("message {id} not found");
        };
        conn.execute(
            "UPDATE tool_runs SET message_id = NULL WHERE message_id = ?1",
            params![id],
        )
        .context("detach tool runs")?;
        conn.execute("DELETE FROM attachments WHERE message_id = ?1", params![id])
            .context("delete attachments")?;
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
            .context("delete message")?;
        conn.execute(
            "UPDATE conversations SET message_count = MAX(message_count - 1, 0) WHERE id = ?1",
            params![conversation_id],
        )
        .context("drop message count")?;
        Ok(())
    })
}

/// Newest message's content with whitespace flattened and truncated to
/// `max_len` characters. One indexed row fetch, for sidebar previews.
pub fn last_preview(engine: &Engine, conversation_id: &str, max_len: usize) -> Option<String> {
    let result: Result<Option<String>> = (|| {
        let content: Option<String> = engine
            .conn
            .query_row(
                "SELECT content FROM messages WHERE conversation_id = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()
            .context("load preview")?;
        Ok(content.map(|content| flatten_preview(&content, max_len)))
    })();
    match result {
        Ok(preview) => preview,
        Err(err) => {
            error!(conversation_id, error = %err, "failed to load preview");
            None
        }
    }
}

fn flatten_preview(content: &str, max_len: usize) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(max_len).collect()
}

pub fn attachments_for(engine: &Engine, message_id: &str) -> Vec<Attachment> {
    let result = (|| -> Result<Vec<Attachment>> {
        let mut stmt = engine.conn.prepare(
            "SELECT id, message_id, data, mime_type, file_name, is_image, byte_len \
             FROM attachments WHERE message_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                data: row.get(2)?,
                mime_type: row.get(3)?,
                file_name: row.get(4)?,
                is_image: row.get(5)?,
                byte_len: row.get(6)?,
            })
        })?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    })();
    match result {
        Ok(attachments) => attachments,
        Err(err) => {
            error!(message_id, error = %err, "failed to load attachments");
            Vec::new()
        }
    }
}

/// Attachment listing without payloads; sizes come from the denormalized
/// byte_len column.
pub fn attachment_info_for(engine: &Engine, message_id: &str) -> Vec<AttachmentInfo> {
    let result = (|| -> Result<Vec<AttachmentInfo>> {
        let mut stmt = engine.conn.prepare(
            "SELECT id, message_id, mime_type, file_name, is_image, byte_len \
             FROM attachments WHERE message_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(AttachmentInfo {
                id: row.get(0)?,
                message_id: row.get(1)?,
                mime_type: row.get(2)?,
                file_name: row.get(3)?,
                is_image: row.get(4)?,
                byte_len: row.get(5)?,
            })
        })?;
        let mut infos = Vec::new();
        for row in rows {
            infos.push(row?);
        }
        Ok(infos)
    })();
    match result {
        Ok(infos) => infos,
        Err(err) => {
            error!(message_id, error = %err, "failed to list attachments");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::conversation;
    use crate::model::NewAttachment;
    use crate::model::Role;

    use super::*;

    fn engine() -> Engine {
        Engine::open_in_memory().expect("open")
    }

    fn seed(engine: &Engine) -> String {
        conversation::create(engine, "test").expect("conversation").id
    }

    fn append_at(engine: &Engine, conversation_id: &str, content: &str, at: i64) -> Message {
        let mut new = NewMessage::text(conversation_id, Role::User, content);
        new.created_at = Some(at);
        append(engine, new).expect("append")
    }

    fn walk_all_pages(engine: &Engine, conversation_id: &str, page_size: usize) -> Vec<Message> {
        let mut collected = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = load_page(engine, conversation_id, cursor.as_ref(), page_size);
            // Older pages are prepended: each page is older than the last.
            let mut merged = page.messages.clone();
            merged.extend(collected);
            collected = merged;
            if !page.more {
                break;
            }
            cursor = page.next_cursor;
            assert!(cursor.is_some(), "more=true must come with a cursor");
        }
        collected
    }

    #[test]
    fn pagination_yields_every_message_once_in_order() {
        let engine = engine();
        let conversation_id = seed(&engine);
        // Deliberate timestamp ties: three messages per instant.
        let mut expected = Vec::new();
        for i in 0..25i64 {
            let message = append_at(&engine, &conversation_id, &format!("m{i}"), i / 3);
            expected.push(message);
        }
        expected.sort_by(|a, b| {
            (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str()))
        });
        let expected_ids: Vec<&str> = expected.iter().map(|m| m.id.as_str()).collect();

        for page_size in [1usize, 7, 100, 30] {
            let collected = walk_all_pages(&engine, &conversation_id, page_size);
            let ids: Vec<&str> = collected.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, expected_ids, "page_size {page_size}");
        }
    }

    #[test]
    fn tie_break_is_ascending_id_and_cursor_resumes() {
        let engine = engine();
        let conversation_id = seed(&engine);
        let m1 = append_at(&engine, &conversation_id, "hello world", 0);
        let m2 = append_at(&engine, &conversation_id, "goodbye world", 0);
        let m3 = append_at(&engine, &conversation_id, "hello again", 1);

        // Within the t=0 tie, ascending id order decides.
        let (older, newer) = if m1.id < m2.id { (m1, m2) } else { (m2, m1) };

        let first = load_page(&engine, &conversation_id, None, 2);
        assert!(first.more);
        let ids: Vec<&str> = first.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), m3.id.as_str()]);

        let second = load_page(&engine, &conversation_id, first.next_cursor.as_ref(), 2);
        assert!(!second.more);
        assert_eq!(second.next_cursor, None);
        let ids: Vec<&str> = second.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![older.id.as_str()]);
    }

    #[test]
    fn page_query_uses_the_keyset_index() {
        let engine = engine();
        let mut stmt = engine
            .conn
            .prepare(
                "EXPLAIN QUERY PLAN SELECT id FROM messages \
                 WHERE conversation_id = ?1 \
                   AND (created_at < ?2 OR (created_at = ?2 AND id < ?3)) \
                 ORDER BY created_at DESC, id DESC LIMIT ?4",
            )
            .expect("prepare");
        let details: Vec<String> = stmt
            .query_map(params!["c", 0i64, "m", 10i64], |row| {
                row.get::<_, String>(3)
            })
            .expect("plan")
            .map(|row| row.expect("row"))
            .collect();
        let plan = details.join("\n");
        assert!(
            plan.contains("idx_messages_conv_time"),
            "expected keyset index in plan: {plan}"
        );
    }

    #[test]
    fn append_bumps_count_and_last_used() {
        let engine = engine();
        let conversation_id = seed(&engine);
        append_at(&engine, &conversation_id, "one", 100);
        append_at(&engine, &conversation_id, "two", 200);

        let loaded = conversation::load(&engine, &conversation_id).expect("found");
        assert_eq!(loaded.message_count, 2);
        assert!(loaded.last_used_at >= 200);
    }

    #[test]
    fn delete_decrements_count_and_removes_attachments() {
        let engine = engine();
        let conversation_id = seed(&engine);
        let mut new = NewMessage::text(&conversation_id, Role::User, "with attachment");
        new.attachments.push(NewAttachment {
            data: vec![1, 2, 3, 4],
            mime_type: "image/png".to_string(),
            file_name: Some("pixel.png".to_string()),
            is_image: true,
        });
        let message = append(&engine, new).expect("append");

        let infos = attachment_info_for(&engine, &message.id);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].byte_len, 4);

        delete(&engine, &message.id).expect("delete");
        assert!(load(&engine, &message.id).is_none());
        assert!(attachments_for(&engine, &message.id).is_empty());
        let loaded = conversation::load(&engine, &conversation_id).expect("found");
        assert_eq!(loaded.message_count, 0);
    }

    #[test]
    fn update_replaces_content() {
        let engine = engine();
        let conversation_id = seed(&engine);
        let mut message = append_at(&engine, &conversation_id, "tpyo", 0);
        message.content = "typo".to_string();
        update(&engine, &message).expect("update");
        let loaded = load(&engine, &message.id).expect("found");
        assert_eq!(loaded.content, "typo");
        assert_eq!(loaded.created_at, 0);
    }

    #[test]
    fn last_preview_flattens_and_truncates() {
        let engine = engine();
        let conversation_id = seed(&engine);
        append_at(&engine, &conversation_id, "old", 0);
        append_at(&engine, &conversation_id, "a\nmulti\n  line   answer", 1);

        let preview = last_preview(&engine, &conversation_id, 12).expect("preview");
        assert_eq!(preview, "a multi line");
        assert_eq!(last_preview(&engine, "missing", 10), None);
    }

    #[test]
    fn append_to_missing_conversation_fails() {
        let engine = engine();
        let new = NewMessage::text("no-such-conversation", Role::User, "hi");
        assert!(append(&engine, new).is_err());
    }
}
