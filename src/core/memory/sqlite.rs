use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::ConversationMemory;
use super::types::{Message, Role, ToolCall};
use crate::core::error::MemoryError;

/// Relational conversation log: one row per message keyed by
/// `(agent_id, session_id, seq)`.
pub struct SqliteMemory {
    db: Arc<Mutex<Connection>>,
}

impl SqliteMemory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MemoryError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, MemoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self, MemoryError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                name TEXT,
                content TEXT NOT NULL,
                tool_call TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (agent_id, session_id, seq)
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn insert_batch(
    db: &mut Connection,
    agent_id: &str,
    session_id: &str,
    messages: &[Message],
) -> Result<(), MemoryError> {
    let tx = db.transaction()?;
    {
        let last: Option<i64> = tx
            .query_row(
                "SELECT MAX(seq) FROM agent_messages WHERE agent_id = ?1 AND session_id = ?2",
                params![agent_id, session_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let mut seq = last.unwrap_or(0);

        let mut stmt = tx.prepare(
            "INSERT INTO agent_messages (agent_id, session_id, seq, role, name, content, tool_call)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for message in messages {
            seq += 1;
            let tool_call = message
                .tool_call
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            stmt.execute(params![
                agent_id,
                session_id,
                seq,
                message.role.as_str(),
                message.name,
                message.content,
                tool_call
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl ConversationMemory for SqliteMemory {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(
        &self,
        agent_id: &str,
        session_id: &str,
        message: &Message,
    ) -> Result<(), MemoryError> {
        let mut db = self.db.lock().await;
        insert_batch(&mut db, agent_id, session_id, std::slice::from_ref(message))
    }

    async fn append_all(
        &self,
        agent_id: &str,
        session_id: &str,
        messages: &[Message],
    ) -> Result<(), MemoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut db = self.db.lock().await;
        insert_batch(&mut db, agent_id, session_id, messages)
    }

    async fn load(
        &self,
        agent_id: &str,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, MemoryError> {
        let db = self.db.lock().await;
        // Newest first under a window, then flipped back to chronological order.
        let (sql, window) = if limit > 0 {
            (
                "SELECT role, name, content, tool_call FROM agent_messages
                 WHERE agent_id = ?1 AND session_id = ?2 ORDER BY seq DESC LIMIT ?3",
                limit,
            )
        } else {
            (
                "SELECT role, name, content, tool_call FROM agent_messages
                 WHERE agent_id = ?1 AND session_id = ?2 ORDER BY seq ASC LIMIT ?3",
                -1,
            )
        };

        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map(params![agent_id, session_id, window], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (role, name, content, tool_call) = row?;
            let role = Role::from_name(&role)
                .ok_or_else(|| MemoryError::Corrupt(format!("unknown role '{}'", role)))?;
            let tool_call = match tool_call {
                Some(raw) => Some(serde_json::from_str::<ToolCall>(&raw)?),
                None => None,
            };
            results.push(Message {
                role,
                name,
                content,
                tool_call,
            });
        }
        if limit > 0 {
            results.reverse();
        }
        Ok(results)
    }
}
