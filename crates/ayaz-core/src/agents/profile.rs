//! Agent profile — an agent's role, goal, backstory and model

use serde::{Deserialize, Serialize};

use crate::inputs::{InputError, WorkflowInputs, interpolate};

/// A named role configuration, as declared in `agents.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: String,
    pub goal: String,
    pub backstory: String,
    /// Model override for this agent; the crew's default model when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
    #[serde(default = "default_verbose")]
    pub verbose: bool,
}

fn default_verbose() -> bool {
    true
}

impl AgentProfile {
    pub fn new(
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            llm: None,
            verbose: true,
        }
    }

    /// Role with inputs interpolated, used for display and as the training key
    pub fn display_role(&self, inputs: &WorkflowInputs) -> String {
        interpolate(&self.role, inputs)
            .unwrap_or_else(|_| self.role.clone())
            .trim()
            .to_string()
    }

    /// Build the persona prompt for this agent.
    ///
    /// `suggestions` come from training and are appended as mandatory instructions.
    pub fn system_prompt(
        &self,
        inputs: &WorkflowInputs,
        suggestions: &[String],
    ) -> Result<String, InputError> {
        let role = interpolate(self.role.trim(), inputs)?;
        let goal = interpolate(self.goal.trim(), inputs)?;
        let backstory = interpolate(self.backstory.trim(), inputs)?;

        let mut prompt = format!("You are {}. {}\nYour personal goal is: {}\n", role, backstory, goal);

        if !suggestions.is_empty() {
            prompt.push_str("\nYou MUST follow these instructions:\n");
            for suggestion in suggestions {
                prompt.push_str(" - ");
                prompt.push_str(suggestion.trim());
                prompt.push('\n');
            }
        }

        prompt.push_str(
            "\nAnswer with your complete final answer only. \
             Do not mention tools you do not have.\n",
        );
        Ok(prompt)
    }
}
