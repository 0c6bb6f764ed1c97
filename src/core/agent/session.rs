use super::{AgentDefinition, SessionScope};

/// Derives the memory session for a run. The same agent and trigger kind
/// always land in the same session so repeated firings append to one history.
pub fn session_for(agent: &AgentDefinition, trigger_kind: &str) -> String {
    match agent.memory.session_scope {
        SessionScope::Agent => agent.id.clone(),
        SessionScope::Trigger => format!("{}:{}", agent.id, trigger_kind),
        SessionScope::Namespace => agent.memory.namespace.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::test_agent;

    #[test]
    fn default_scope_is_one_session_per_agent() {
        let agent = test_agent("a1");
        assert_eq!(session_for(&agent, "cron"), "a1");
        assert_eq!(session_for(&agent, "webhook"), "a1");
    }

    #[test]
    fn trigger_scope_splits_by_kind() {
        let mut agent = test_agent("a1");
        agent.memory.session_scope = SessionScope::Trigger;
        assert_eq!(session_for(&agent, "cron"), "a1:cron");
        assert_eq!(session_for(&agent, "cron"), session_for(&agent, "cron"));
        assert_ne!(session_for(&agent, "cron"), session_for(&agent, "webhook"));
    }

    #[test]
    fn namespace_scope_uses_namespace() {
        let mut agent = test_agent("a1");
        agent.memory.session_scope = SessionScope::Namespace;
        agent.memory.namespace = "support-desk".into();
        assert_eq!(session_for(&agent, "manual"), "support-desk");
    }
}
