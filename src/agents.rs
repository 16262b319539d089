//! Built-in coding agents and how to invoke them.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{BuildError, BuildResult};
use crate::supervisor::ProcessCommand;

/// Agent used when neither the project nor the preferences name one.
pub const DEFAULT_AGENT_ID: &str = "claude-code";

/// Placeholder in argument templates replaced by the prompt.
pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";

/// Non-interactive invocation of one agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub command: String,
    /// Argument template; one element must be [`PROMPT_PLACEHOLDER`].
    pub print_args: Vec<String>,
}

impl AgentDefinition {
    pub fn new(id: &str, name: &str, command: &str, print_args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            command: command.to_string(),
            print_args: print_args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build the process command for a prompt, substituting the placeholder.
    pub fn command_for(&self, prompt: &str, working_directory: &Path) -> ProcessCommand {
        ProcessCommand {
            executable: self.command.clone(),
            args: self
                .print_args
                .iter()
                .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt))
                .collect(),
            working_directory: working_directory.to_path_buf(),
        }
    }
}

/// The agents the orchestrator knows how to drive.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    agents: Vec<AgentDefinition>,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::built_in()
    }
}

impl AgentCatalog {
    pub fn built_in() -> Self {
        Self {
            agents: vec![
                AgentDefinition::new("claude-code", "Claude Code", "claude", &["-p", PROMPT_PLACEHOLDER]),
                AgentDefinition::new("amp", "Amp", "amp", &["--execute", PROMPT_PLACEHOLDER]),
                AgentDefinition::new("opencode", "OpenCode", "opencode", &["run", PROMPT_PLACEHOLDER]),
                AgentDefinition::new("codex", "Codex", "codex", &["exec", PROMPT_PLACEHOLDER]),
                AgentDefinition::new("droid", "Droid", "droid", &[PROMPT_PLACEHOLDER]),
                AgentDefinition::new("cursor", "Cursor Agent", "agent", &["-p", PROMPT_PLACEHOLDER]),
            ],
        }
    }

    /// Add or replace an agent definition.
    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.retain(|a| a.id != agent.id);
        self.agents.push(agent);
        self
    }

    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.id.as_str())
    }

    /// Look up `id` and apply any configured executable override.
    pub fn resolve(
        &self,
        id: &str,
        agent_paths: &HashMap<String, String>,
    ) -> BuildResult<AgentDefinition> {
        let mut agent = self
            .get(id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownAgent(id.to_string()))?;
        if let Some(path) = agent_paths.get(id).filter(|p| !p.trim().is_empty()) {
            agent.command = path.clone();
        }
        Ok(agent)
    }
}

/// Pick the agent id for a run: explicit override, then project setting,
/// then the preferred default, then [`DEFAULT_AGENT_ID`].
pub fn select_agent_id<'a>(
    override_id: Option<&'a str>,
    project_agent: Option<&'a str>,
    default_agent: Option<&'a str>,
) -> &'a str {
    override_id
        .or(project_agent)
        .or(default_agent)
        .unwrap_or(DEFAULT_AGENT_ID)
}
