use crate::config::SecurityConfig;

/// Action and command allow-lists. Empty lists permit everything.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    allow_actions: Vec<String>,
    command_prefixes: Vec<String>,
}

impl Policy {
    pub fn new(security: &SecurityConfig) -> Self {
        Self {
            allow_actions: security.allow_actions.clone(),
            command_prefixes: security.command_allowlist.clone(),
        }
    }

    /// Exact match on the verb.
    pub fn is_action_allowed(&self, action: &str) -> bool {
        self.allow_actions.is_empty() || self.allow_actions.iter().any(|a| a == action)
    }

    /// Byte-prefix match; not shell aware, so `say hi; stop` passes a `say` prefix.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.command_prefixes.is_empty()
            || self
                .command_prefixes
                .iter()
                .any(|prefix| command.as_bytes().starts_with(prefix.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(actions: &[&str], prefixes: &[&str]) -> Policy {
        Policy::new(&SecurityConfig {
            allow_actions: actions.iter().map(|s| s.to_string()).collect(),
            command_allowlist: prefixes.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn empty_lists_allow_everything() {
        let open = policy(&[], &[]);
        assert!(open.is_action_allowed("START"));
        assert!(open.is_action_allowed("anything"));
        assert!(open.is_command_allowed("op everyone"));
        assert!(open.is_command_allowed(""));
    }

    #[test]
    fn action_list_is_exact_match() {
        let p = policy(&["STATS", "LIST"], &[]);
        assert!(p.is_action_allowed("STATS"));
        assert!(p.is_action_allowed("LIST"));
        assert!(!p.is_action_allowed("START"));
        assert!(!p.is_action_allowed("stats"));
        assert!(!p.is_action_allowed("STATS "));
        assert!(!p.is_action_allowed(""));
    }

    #[test]
    fn command_list_is_prefix_match() {
        let p = policy(&[], &["say ", "list"]);
        assert!(p.is_command_allowed("say hello"));
        assert!(p.is_command_allowed("list"));
        assert!(p.is_command_allowed("listx"));
        assert!(p.is_command_allowed("say hi; stop"));
        assert!(!p.is_command_allowed("say"));
        assert!(!p.is_command_allowed("stop"));
        assert!(!p.is_command_allowed(" say hi"));
    }
}
