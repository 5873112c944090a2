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

//! Full-text search over message content. The index is an FTS5
//! external-content table mirrored from `messages` by triggers, so there
//! is no write path here and the index can never lag the primary table.
//!
//! Ranking: FTS5 `bm25()` is non-positive with lower-is-better; hits are
//! ordered by it ascending and the value is negated before being handed
//! to callers, so [`SearchHit::score`] is positive with higher-is-better.

use anyhow::Context;
use anyhow::Result;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use tracing::error;

use crate::engine::Engine;
use crate::model::Message;
use crate::model::SearchHit;

/// Ranked matches for `query`, optionally scoped to one conversation.
/// Empty and whitespace-only queries return no results without touching
/// the index. Query text is matched literally: FTS5 operators and
/// punctuation carry no special meaning here.
pub fn search(
    engine: &Engine,
    query: &str,
    conversation_id: Option<&str>,
    limit: usize,
) -> Vec<SearchHit> {
    let Some(match_query) = sanitize_match_query(query) else {
        return Vec::new();
    };
    match try_search(engine, &match_query, conversation_id, limit) {
        Ok(hits) => hits,
        Err(err) => {
            error!(query, error = %err, "search failed");
            Vec::new()
        }
    }
}

fn try_search(
    engine: &Engine,
    match_query: &str,
    conversation_id: Option<&str>,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let scope_sql = if conversation_id.is_some() {
        "messages.conversation_id = ?"
    } else {
        "1=1"
    };
    let sql = format!(
        "SELECT messages.id, messages.conversation_id, messages.role, messages.content, \
                messages.created_at, messages.tool_call_id, messages.tool_name, \
                bm25(message_fts) AS rank \
         FROM message_fts \
         JOIN messages ON message_fts.rowid = messages.rowid \
         WHERE ({scope_sql}) AND message_fts MATCH ? \
         ORDER BY rank ASC, messages.id ASC \
         LIMIT ?"
    );

    let mut params: Vec<SqlValue> = Vec::new();
    if let Some(conversation_id) = conversation_id {
        params.push(SqlValue::from(conversation_id.to_string()));
    }
    params.push(SqlValue::from(match_query.to_string()));
    params.push(SqlValue::from(limit.max(1) as i64));

    let mut stmt = engine.conn.prepare(&sql).context("prepare search")?;
    let rows = stmt.query_map(params_from_iter(params), |row| {
        let rank: f64 = row.get(7)?;
        Ok(SearchHit {
            message: Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
                tool_call_id: row.get(5)?,
                tool_name: row.get(6)?,
            },
            score: -rank,
        })
    })?;

    let mut hits = Vec::new();
    for row in rows {
        hits.push(row?);
    }
    Ok(hits)
}

/// Reduces the raw query to bare alphanumeric terms, each double-quoted
/// so FTS5 treats it as literal text. Returns `None` when nothing
/// searchable remains.
fn sanitize_match_query(query: &str) -> Option<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    for ch in query.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            terms.push(format!("\"{current}\""));
            current.clear();
        }
    }
    if !current.is_empty() {
        terms.push(format!("\"{current}\""));
    }
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use crate::conversation;
    use crate::message;
    use crate::model::NewMessage;
    use crate::model::Role;

    use super::*;

    fn engine() -> Engine {
        Engine::open_in_memory().expect("open")
    }

    fn seed(engine: &Engine) -> String {
        conversation::create(engine, "test").expect("conversation").id
    }

    fn say(engine: &Engine, conversation_id: &str, content: &str) -> crate::model::Message {
        message::append(engine, NewMessage::text(conversation_id, Role::User, content))
            .expect("append")
    }

    #[test]
    fn sanitizer_quotes_terms_and_drops_operators() {
        assert_eq!(
            sanitize_match_query("PostgreSQL database"),
            Some("\"PostgreSQL\" \"database\"".to_string())
        );
        assert_eq!(
            sanitize_match_query("\"hello\" AND (world*)"),
            Some("\"hello\" \"AND\" \"world\"".to_string())
        );
        assert_eq!(sanitize_match_query(""), None);
        assert_eq!(sanitize_match_query("   \t\n"), None);
        assert_eq!(sanitize_match_query("()*:^"), None);
    }

    #[test]
    fn search_finds_and_ranks_matches() {
        let engine = engine();
        let conversation_id = seed(&engine);
        say(
            &engine,
            &conversation_id,
            "PostgreSQL is a powerful relational database",
        );

        let hits = search(&engine, "PostgreSQL database", None, 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
        assert!(hits[0].message.content.contains("PostgreSQL"));

        assert!(search(&engine, "nonexistent_token_xyz", None, 10).is_empty());
        assert!(search(&engine, "", None, 10).is_empty());
    }

    #[test]
    fn index_tracks_inserts_updates_and_deletes() {
        let engine = engine();
        let conversation_id = seed(&engine);
        let mut message = say(&engine, &conversation_id, "the zanzibar protocol");

        assert_eq!(search(&engine, "zanzibar", None, 10).len(), 1);

        message.content = "the madagascar protocol".to_string();
        message::update(&engine, &message).expect("update");
        assert!(search(&engine, "zanzibar", None, 10).is_empty());
        assert_eq!(search(&engine, "madagascar", None, 10).len(), 1);

        message::delete(&engine, &message.id).expect("delete");
        assert!(search(&engine, "madagascar", None, 10).is_empty());
    }

    #[test]
    fn conversation_scope_restricts_results() {
        let engine = engine();
        let here = seed(&engine);
        let there = seed(&engine);
        say(&engine, &here, "apples in the orchard");
        say(&engine, &there, "apples in the basket");

        assert_eq!(search(&engine, "apples", None, 10).len(), 2);
        let scoped = search(&engine, "apples", Some(&here), 10);
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].message.conversation_id, here);
    }

    #[test]
    fn repeated_terms_rank_higher() {
        let engine = engine();
        let conversation_id = seed(&engine);
        say(&engine, &conversation_id, "ferris mentioned once in passing");
        let heavy = say(
            &engine,
            &conversation_id,
            "ferris ferris ferris everywhere",
        );

        let hits = search(&engine, "ferris", None, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message.id, heavy.id);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn operator_heavy_queries_do_not_error() {
        let engine = engine();
        let conversation_id = seed(&engine);
        say(&engine, &conversation_id, "hello world");

        let hits = search(&engine, "\"hello\" OR -(world:^)", None, 10);
        // "OR" is just a literal term here and does not appear in the
        // content, so the conjunction finds nothing.
        assert!(hits.is_empty());
        let hits = search(&engine, "hello (world)", None, 10);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn limit_caps_results() {
        let engine = engine();
        let conversation_id = seed(&engine);
        for i in 0..5 {
            say(&engine, &conversation_id, &format!("common term number {i}"));
        }
        assert_eq!(search(&engine, "common", None, 3).len(), 3);
    }
}
