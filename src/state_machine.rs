use std::collections::HashMap;

use crate::log::LogCommand;

/// The replicated key-value mapping. Unknown keys read as the empty string; only `Put` commands
/// mutate it, `NoOp` and the sentinel are ignored on apply.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    data: HashMap<String, String>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }

    pub fn apply(&mut self, command: &LogCommand) {
        if let LogCommand::Put { key, value, .. } = command {
            self.data.insert(key.clone(), value.clone());
        }
    }
}
