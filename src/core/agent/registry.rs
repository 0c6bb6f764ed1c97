use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::AgentDefinition;

/// In-memory index of loaded agent definitions.
///
/// Readers (webhook and trigger lookups) share the lock; register and remove
/// take it exclusively. Handles returned by `get` are cheap clones so callers
/// release the lock before doing any blocking work.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<AgentDefinition>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces. Returns the previous definition, if any.
    pub async fn insert(&self, agent: AgentDefinition) -> Option<Arc<AgentDefinition>> {
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), Arc::new(agent))
    }

    pub async fn remove(&self, agent_id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.write().await.remove(agent_id)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Sorted by id so listings are stable.
    pub async fn list(&self) -> Vec<Arc<AgentDefinition>> {
        let agents = self.agents.read().await;
        let mut out: Vec<_> = agents.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

/// Reads every `*.toml` / `*.json` definition in `dir`. Files that fail to
/// parse are skipped with a warning.
pub fn load_definitions(dir: &Path) -> anyhow::Result<Vec<AgentDefinition>> {
    let mut defs = Vec::new();
    if !dir.exists() {
        return Ok(defs);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("toml") | Some("json")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        match AgentDefinition::from_file(&path) {
            Ok(def) => {
                info!("Loaded agent definition [{}] from {}", def.id, path.display());
                defs.push(def);
            }
            Err(e) => warn!("Skipping agent definition {}: {}", path.display(), e),
        }
    }
    Ok(defs)
}
