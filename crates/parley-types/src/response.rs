use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Message, ToolExecutionResult};

/// Terminal artifact of one conversation loop run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub response: String,
    pub conversation_history: Vec<Message>,
    pub used_tools: bool,
    pub tools_used: BTreeSet<String>,
    pub function_executions: Vec<ToolExecutionResult>,
}

impl AgentResponse {
    pub fn failed_executions(&self) -> impl Iterator<Item = &ToolExecutionResult> {
        self.function_executions.iter().filter(|r| !r.success)
    }
}
