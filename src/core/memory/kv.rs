use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::ConversationMemory;
use super::types::{Message, Role, ToolCall};
use crate::core::error::MemoryError;

const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_messages");

// Unit separator keeps agent, session and sequence apart in the key.
const SEP: char = '\u{1f}';
const SEP_END: char = '\u{20}';

#[derive(Serialize, Deserialize)]
struct StoredMessage {
    role: Role,
    #[serde(default)]
    name: Option<String>,
    content: String,
    #[serde(default)]
    tool_call: Option<ToolCall>,
    created_at: chrono::DateTime<chrono::Utc>,
}

fn kv_err<E: Into<redb::Error>>(e: E) -> MemoryError {
    MemoryError::Kv(e.into())
}

/// Embedded key-value conversation log. Keys sort as
/// `agent SEP session SEP zero-padded-seq`, so a prefix range scan yields a
/// session in append order.
pub struct KvMemory {
    db: Arc<Database>,
}

impl KvMemory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MemoryError> {
        let db = Database::create(path).map_err(kv_err)?;
        let write_txn = db.begin_write().map_err(kv_err)?;
        write_txn.open_table(MESSAGES_TABLE).map_err(kv_err)?;
        write_txn.commit().map_err(kv_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// A separator inside either part would let one session's range cover
    /// another's keys.
    fn check_parts(agent_id: &str, session_id: &str) -> Result<(), MemoryError> {
        for part in [agent_id, session_id] {
            if part.chars().any(|c| c.is_control()) {
                return Err(MemoryError::InvalidKey(part.to_string()));
            }
        }
        Ok(())
    }

    fn bounds(agent_id: &str, session_id: &str) -> (String, String) {
        (
            format!("{agent_id}{SEP}{session_id}{SEP}"),
            format!("{agent_id}{SEP}{session_id}{SEP_END}"),
        )
    }

    fn key(agent_id: &str, session_id: &str, seq: u64) -> String {
        format!("{agent_id}{SEP}{session_id}{SEP}{seq:020}")
    }

    fn parse_seq(key: &str) -> u64 {
        key.rsplit(SEP).next().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn write_batch(
        &self,
        agent_id: &str,
        session_id: &str,
        messages: &[Message],
    ) -> Result<(), MemoryError> {
        Self::check_parts(agent_id, session_id)?;
        let (lo, hi) = Self::bounds(agent_id, session_id);
        let write_txn = self.db.begin_write().map_err(kv_err)?;
        {
            let mut table = write_txn.open_table(MESSAGES_TABLE).map_err(kv_err)?;
            let mut seq = match table
                .range(lo.as_str()..hi.as_str())
                .map_err(kv_err)?
                .next_back()
            {
                Some(entry) => {
                    let (key, _) = entry.map_err(kv_err)?;
                    Self::parse_seq(key.value())
                }
                None => 0,
            };

            let now = chrono::Utc::now();
            for message in messages {
                seq += 1;
                let stored = StoredMessage {
                    role: message.role,
                    name: message.name.clone(),
                    content: message.content.clone(),
                    tool_call: message.tool_call.clone(),
                    created_at: now,
                };
                let value = serde_json::to_vec(&stored)?;
                let key = Self::key(agent_id, session_id, seq);
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(kv_err)?;
            }
        }
        write_txn.commit().map_err(kv_err)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationMemory for KvMemory {
    fn backend_name(&self) -> &'static str {
        "redb"
    }

    async fn append(
        &self,
        agent_id: &str,
        session_id: &str,
        message: &Message,
    ) -> Result<(), MemoryError> {
        self.write_batch(agent_id, session_id, std::slice::from_ref(message))
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
        self.write_batch(agent_id, session_id, messages)
    }

    async fn load(
        &self,
        agent_id: &str,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, MemoryError> {
        Self::check_parts(agent_id, session_id)?;
        let (lo, hi) = Self::bounds(agent_id, session_id);
        let read_txn = self.db.begin_read().map_err(kv_err)?;
        let table = read_txn.open_table(MESSAGES_TABLE).map_err(kv_err)?;
        let range = table.range(lo.as_str()..hi.as_str()).map_err(kv_err)?;

        let mut raw = Vec::new();
        if limit > 0 {
            for entry in range.rev().take(limit as usize) {
                let (_, value) = entry.map_err(kv_err)?;
                raw.push(value.value().to_vec());
            }
            raw.reverse();
        } else {
            for entry in range {
                let (_, value) = entry.map_err(kv_err)?;
                raw.push(value.value().to_vec());
            }
        }

        let mut results = Vec::with_capacity(raw.len());
        for bytes in raw {
            let stored: StoredMessage = serde_json::from_slice(&bytes)?;
            results.push(Message {
                role: stored.role,
                name: stored.name,
                content: stored.content,
                tool_call: stored.tool_call,
            });
        }
        Ok(results)
    }
}
