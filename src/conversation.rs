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

//! Conversation lifecycle plus the folder/template satellite entities.
//! Read operations absorb faults (logged, empty result); write
//! operations report failure to the caller.

use anyhow::Context;
use anyhow::Result;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use tracing::error;

use crate::engine::Engine;
use crate::model::Conversation;
use crate::model::Folder;
use crate::model::Template;
use crate::model::new_id;
use crate::model::now_ms;

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub include_archived: bool,
    pub folder_id: Option<String>,
    pub favorites_only: bool,
}

const CONVERSATION_COLUMNS: &str = "id, title, summary, created_at, last_used_at, message_count, \
     archived, favorite, folder_id, tags, model_provider, model_id";

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let tags_json: String = row.get(9)?;
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        created_at: row.get(3)?,
        last_used_at: row.get(4)?,
        message_count: row.get(5)?,
        archived: row.get(6)?,
        favorite: row.get(7)?,
        folder_id: row.get(8)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        model_provider: row.get(10)?,
        model_id: row.get(11)?,
    })
}

pub fn create(engine: &Engine, title: &str) -> Result<Conversation> {
    let now = now_ms();
    let conversation = Conversation {
        id: new_id(),
        title: title.to_string(),
        summary: String::new(),
        created_at: now,
        last_used_at: now,
        message_count: 0,
        archived: false,
        favorite: false,
        folder_id: None,
        tags: Vec::new(),
        model_provider: None,
        model_id: None,
    };
    engine
        .conn
        .execute(
            "INSERT INTO conversations (id, title, summary, created_at, last_used_at, \
             message_count, archived, favorite, folder_id, tags, model_provider, model_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, NULL, '[]', NULL, NULL)",
            params![
                conversation.id,
                conversation.title,
                conversation.summary,
                conversation.created_at,
                conversation.last_used_at,
            ],
        )
        .context("insert conversation")?;
    Ok(conversation)
}

pub fn load(engine: &Engine, id: &str) -> Option<Conversation> {
    let result = engine
        .conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            map_conversation,
        )
        .optional();
    match result {
        Ok(conversation) => conversation,
        Err(err) => {
            error!(id, error = %err, "failed to load conversation");
            None
        }
    }
}

/// Most recently used first; archived rows excluded unless asked for.
pub fn load_all(engine: &Engine, filter: &ConversationFilter) -> Vec<Conversation> {
    match try_load_all(engine, filter) {
        Ok(conversations) => conversations,
        Err(err) => {
            error!(error = %err, "failed to load conversations");
            Vec::new()
        }
    }
}

fn try_load_all(engine: &Engine, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
    let mut sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE 1=1"
    );
    let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
    if !filter.include_archived {
        sql.push_str(" AND archived = 0");
    }
    if let Some(folder_id) = &filter.folder_id {
        sql.push_str(" AND folder_id = ?");
        params_vec.push(rusqlite::types::Value::from(folder_id.clone()));
    }
    if filter.favorites_only {
        sql.push_str(" AND favorite = 1");
    }
    sql.push_str(" ORDER BY last_used_at DESC, id DESC");

    let mut stmt = engine.conn.prepare(&sql).context("prepare load_all")?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), map_conversation)?;
    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(row?);
    }
    Ok(conversations)
}

/// Full replace of the mutable fields. `created_at` and `message_count`
/// are never written here; the count is owned by the message write path.
pub fn update(engine: &Engine, conversation: &Conversation) -> Result<()> {
    let tags_json = serde_json::to_string(&conversation.tags).context("serialize tags")?;
    let updated = engine
        .conn
        .execute(
            "UPDATE conversations SET title = ?2, summary = ?3, last_used_at = ?4, \
             archived = ?5, favorite = ?6, folder_id = ?7, tags = ?8, \
             model_provider = ?9, model_id = ?10 WHERE id = ?1",
            params![
                conversation.id,
                conversation.title,
                conversation.summary,
                conversation.last_used_at,
                conversation.archived,
                conversation.favorite,
                conversation.folder_id,
                tags_json,
                conversation.model_provider,
                conversation.model_id,
            ],
        )
        .context("update conversation")?;
    if updated == 0 {
        anyhow::bail!("conversation {} not found", conversation.id);
    }
    Ok(())
}

pub fn set_archived(engine: &Engine, id: &str, archived: bool) -> Result<()> {
    set_flag(engine, id, "archived", archived)
}

pub fn set_favorite(engine: &Engine, id: &str, favorite: bool) -> Result<()> {
    set_flag(engine, id, "favorite", favorite)
}

fn set_flag(engine: &Engine, id: &str, column: &str, value: bool) -> Result<()> {
    let updated = engine
        .conn
        .execute(
            &format!("UPDATE conversations SET {column} = ?2 WHERE id = ?1"),
            params![id, value],
        )
        .with_context(|| format!("set {column}"))?;
    if updated == 0 {
        anyhow::bail!("conversation {id} not found");
    }
    Ok(())
}

pub fn set_folder(engine: &Engine, id: &str, folder_id: Option<&str>) -> Result<()> {
    let updated = engine
        .conn
        .execute(
            "UPDATE conversations SET folder_id = ?2 WHERE id = ?1",
            params![id, folder_id],
        )
        .context("set folder")?;
    if updated == 0 {
        anyhow::bail!("conversation {id} not found");
    }
    Ok(())
}

/// Tags are an ordered set: duplicates dropped, first occurrence wins.
pub fn set_tags(engine: &Engine, id: &str, tags: &[String]) -> Result<()> {
    let mut deduped: Vec<&String> = Vec::new();
    for tag in tags {
        if !deduped.contains(&tag) {
            deduped.push(tag);
        }
    }
    let tags_json = serde_json::to_string(&deduped).context("serialize tags")?;
    let updated = engine
        .conn
        .execute(
            "UPDATE conversations SET tags = ?2 WHERE id = ?1",
            params![id, tags_json],
        )
        .context("set tags")?;
    if updated == 0 {
        anyhow::bail!("conversation {id} not found");
    }
    Ok(())
}

pub fn set_model(
    engine: &Engine,
    id: &str,
    provider: Option<&str>,
    model: Option<&str>,
) -> Result<()> {
    let updated = engine
        .conn
        .execute(
            "UPDATE conversations SET model_provider = ?2, model_id = ?3 WHERE id = ?1",
            params![id, provider, model],
        )
        .context("set model override")?;
    if updated == 0 {
        anyhow::bail!("conversation {id} not found");
    }
    Ok(())
}

/// Advances last_used_at to now.
pub fn touch(engine: &Engine, id: &str) -> Result<()> {
    engine
        .conn
        .execute(
            "UPDATE conversations SET last_used_at = ?2 WHERE id = ?1",
            params![id, now_ms()],
        )
        .context("touch conversation")?;
    Ok(())
}

/// Removes the conversation and everything referencing it, in one
/// transaction. Dependents are walked explicitly in a fixed order; the
/// message deletes fire the search-index triggers, so no index entry
/// survives either.
pub fn delete(engine: &Engine, id: &str) -> Result<()> {
    engine.with_tx(|conn| {
        delete_tree(conn, id)?;
        Ok(())
    })
}

pub(crate) fn delete_tree(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM tool_runs WHERE conversation_id = ?1", params![id])
        .context("delete tool runs")?;
    conn.execute(
        "DELETE FROM attachments WHERE message_id IN \
         (SELECT id FROM messages WHERE conversation_id = ?1)",
        params![id],
    )
    .context("delete attachments")?;
    conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])
        .context("delete messages")?;
    conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])
        .context("delete conversation")?;
    Ok(())
}

/// Case-insensitive substring match over titles. Content search lives in
/// [`crate::search`].
pub fn search_titles(engine: &Engine, needle: &str) -> Vec<Conversation> {
    match try_search_titles(engine, needle) {
        Ok(conversations) => conversations,
        Err(err) => {
            error!(error = %err, "failed to search titles");
            Vec::new()
        }
    }
}

fn try_search_titles(engine: &Engine, needle: &str) -> Result<Vec<Conversation>> {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let mut stmt = engine
        .conn
        .prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE title LIKE '%' || ?1 || '%' ESCAPE '\\' \
             ORDER BY last_used_at DESC, id DESC"
        ))
        .context("prepare title search")?;
    let rows = stmt.query_map(params![escaped], map_conversation)?;
    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(row?);
    }
    Ok(conversations)
}

pub fn create_folder(engine: &Engine, name: &str, color: Option<&str>) -> Result<Folder> {
    let folder = Folder {
        id: new_id(),
        name: name.to_string(),
        color: color.map(str::to_string),
        created_at: now_ms(),
    };
    engine
        .conn
        .execute(
            "INSERT INTO folders (id, name, color, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![folder.id, folder.name, folder.color, folder.created_at],
        )
        .context("insert folder")?;
    Ok(folder)
}

pub fn load_folders(engine: &Engine) -> Vec<Folder> {
    let result = (|| -> Result<Vec<Folder>> {
        let mut stmt = engine
            .conn
            .prepare("SELECT id, name, color, created_at FROM folders ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Folder {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut folders = Vec::new();
        for row in rows {
            folders.push(row?);
        }
        Ok(folders)
    })();
    match result {
        Ok(folders) => folders,
        Err(err) => {
            error!(error = %err, "failed to load folders");
            Vec::new()
        }
    }
}

/// Deleting a folder nulls the back-reference on its conversations; the
/// conversations themselves are untouched.
pub fn delete_folder(engine: &Engine, id: &str) -> Result<()> {
    engine.with_tx(|conn| {
        conn.execute(
            "UPDATE conversations SET folder_id = NULL WHERE folder_id = ?1",
            params![id],
        )
        .context("detach conversations")?;
        conn.execute("DELETE FROM folders WHERE id = ?1", params![id])
            .context("delete folder")?;
        Ok(())
    })
}

pub fn create_template(engine: &Engine, name: &str, prompt: &str) -> Result<Template> {
    let template = Template {
        id: new_id(),
        name: name.to_string(),
        prompt: prompt.to_string(),
        created_at: now_ms(),
    };
    engine
        .conn
        .execute(
            "INSERT INTO templates (id, name, prompt, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![template.id, template.name, template.prompt, template.created_at],
        )
        .context("insert template")?;
    Ok(template)
}

pub fn load_templates(engine: &Engine) -> Vec<Template> {
    let result = (|| -> Result<Vec<Template>> {
        let mut stmt = engine
            .conn
            .prepare("SELECT id, name, prompt, created_at FROM templates ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Template {
                id: row.get(0)?,
                name: row.get(1)?,
                prompt: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut templates = Vec::new();
        for row in rows {
            templates.push(row?);
        }
        Ok(templates)
    })();
    match result {
        Ok(templates) => templates,
        Err(err) => {
            error!(error = %err, "failed to load templates");
            Vec::new()
        }
    }
}

pub fn delete_template(engine: &Engine, id: &str) -> Result<()> {
    engine
        .conn
        .execute("DELETE FROM templates WHERE id = ?1", params![id])
        .context("delete template")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::open_in_memory().expect("open")
    }

    #[test]
    fn create_then_load_round_trips() {
        let engine = engine();
        let created = create(&engine, "Trip planning").expect("create");
        let loaded = load(&engine, &created.id).expect("found");
        assert_eq!(loaded.title, "Trip planning");
        assert_eq!(loaded.message_count, 0);
        assert!(!loaded.archived);
        assert!(loaded.tags.is_empty());
    }

    #[test]
    fn load_all_hides_archived_by_default() {
        let engine = engine();
        let keep = create(&engine, "keep").expect("create");
        let hide = create(&engine, "hide").expect("create");
        set_archived(&engine, &hide.id, true).expect("archive");

        let visible = load_all(&engine, &ConversationFilter::default());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, keep.id);

        let all = load_all(
            &engine,
            &ConversationFilter {
                include_archived: true,
                ..Default::default()
            },
        );
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn folder_filter_and_unfiling() {
        let engine = engine();
        let folder = create_folder(&engine, "Work", Some("#ff8800")).expect("folder");
        let filed = create(&engine, "filed").expect("create");
        create(&engine, "loose").expect("create");
        set_folder(&engine, &filed.id, Some(&folder.id)).expect("file");

        let in_folder = load_all(
            &engine,
            &ConversationFilter {
                folder_id: Some(folder.id.clone()),
                ..Default::default()
            },
        );
        assert_eq!(in_folder.len(), 1);
        assert_eq!(in_folder[0].id, filed.id);

        delete_folder(&engine, &folder.id).expect("delete folder");
        let after = load(&engine, &filed.id).expect("still there");
        assert_eq!(after.folder_id, None);
    }

    #[test]
    fn update_replaces_mutable_fields() {
        let engine = engine();
        let mut conversation = create(&engine, "old title").expect("create");
        conversation.title = "new title".to_string();
        conversation.summary = "a summary".to_string();
        conversation.favorite = true;
        conversation.tags = vec!["rust".to_string(), "storage".to_string()];
        conversation.model_provider = Some("anthropic".to_string());
        conversation.model_id = Some("claude-sonnet".to_string());
        update(&engine, &conversation).expect("update");

        let loaded = load(&engine, &conversation.id).expect("found");
        assert_eq!(loaded.title, "new title");
        assert_eq!(loaded.summary, "a summary");
        assert!(loaded.favorite);
        assert_eq!(loaded.tags, vec!["rust", "storage"]);
        assert_eq!(loaded.model_provider.as_deref(), Some("anthropic"));
        assert_eq!(loaded.created_at, conversation.created_at);
    }

    #[test]
    fn tags_are_deduplicated_in_order() {
        let engine = engine();
        let conversation = create(&engine, "tagged").expect("create");
        let tags = vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ];
        set_tags(&engine, &conversation.id, &tags).expect("set tags");
        let loaded = load(&engine, &conversation.id).expect("found");
        assert_eq!(loaded.tags, vec!["b", "a", "c"]);
    }

    #[test]
    fn update_of_missing_conversation_fails() {
        let engine = engine();
        let ghost = Conversation {
            id: "no-such-id".to_string(),
            title: String::new(),
            summary: String::new(),
            created_at: 0,
            last_used_at: 0,
            message_count: 0,
            archived: false,
            favorite: false,
            folder_id: None,
            tags: Vec::new(),
            model_provider: None,
            model_id: None,
        };
        assert!(update(&engine, &ghost).is_err());
        assert!(set_archived(&engine, "no-such-id", true).is_err());
    }

    #[test]
    fn delete_leaves_no_rows_referencing_the_conversation() {
        use crate::ledger;
        use crate::message;
        use crate::model::NewAttachment;
        use crate::model::NewMessage;
        use crate::model::NewToolRun;
        use crate::model::Role;

        let engine = engine();
        let doomed = create(&engine, "doomed").expect("create");
        let survivor = create(&engine, "survivor").expect("create");

        for i in 0..3 {
            let mut new = NewMessage::text(&doomed.id, Role::User, format!("xylophone {i}"));
            new.attachments.push(NewAttachment {
                data: vec![i as u8; 8],
                mime_type: "application/octet-stream".to_string(),
                file_name: None,
                is_image: false,
            });
            let message = message::append(&engine, new).expect("append");
            ledger::record(
                &engine,
                NewToolRun {
                    conversation_id: doomed.id.clone(),
                    message_id: Some(message.id),
                    tool_name: "search".to_string(),
                    server_id: "srv".to_string(),
                    server_name: None,
                    input: "{}".to_string(),
                    output: "{}".to_string(),
                    is_error: false,
                    duration_ms: 1,
                },
            )
            .expect("record");
        }
        message::append(
            &engine,
            NewMessage::text(&survivor.id, Role::User, "xylophone kept"),
        )
        .expect("append survivor");

        delete(&engine, &doomed.id).expect("delete");

        let count = |sql: &str| -> i64 {
            engine
                .conn
                .query_row(sql, rusqlite::params![doomed.id], |row| row.get(0))
                .expect("count")
        };
        assert_eq!(count("SELECT COUNT(*) FROM conversations WHERE id = ?1"), 0);
        assert_eq!(
            count("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1"),
            0
        );
        assert_eq!(
            count(
                "SELECT COUNT(*) FROM attachments WHERE message_id IN \
                 (SELECT id FROM messages WHERE conversation_id = ?1)"
            ),
            0
        );
        assert_eq!(
            count("SELECT COUNT(*) FROM tool_runs WHERE conversation_id = ?1"),
            0
        );
        // The index entries went with the rows: only the survivor's
        // message still matches.
        let hits = crate::search::search(&engine, "xylophone", None, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.conversation_id, survivor.id);
    }

    #[test]
    fn title_search_is_substring_and_literal() {
        let engine = engine();
        create(&engine, "Plan 100% of the trip").expect("create");
        create(&engine, "Unrelated").expect("create");

        let hits = search_titles(&engine, "100%");
        assert_eq!(hits.len(), 1);
        // The % must not act as a wildcard.
        let none = search_titles(&engine, "100%x");
        assert!(none.is_empty());
    }
}
