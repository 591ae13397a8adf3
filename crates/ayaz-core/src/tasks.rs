//! Task definitions — a unit of declarative work handed to one agent

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::inputs::{InputError, WorkflowInputs, interpolate};

/// A task as declared in `tasks.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub expected_output: String,
    /// Name of the agent (key in `agents.yaml`) that performs this task
    pub agent: String,
    /// Tasks whose outputs feed this one. When unset, every earlier output is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    /// Write the raw output here after the task completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

/// A task together with its key in `tasks.yaml`
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTask {
    pub name: String,
    pub spec: TaskSpec,
}

impl TaskSpec {
    pub fn new(
        description: impl Into<String>,
        expected_output: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            expected_output: expected_output.into(),
            agent: agent.into(),
            context: None,
            output_file: None,
        }
    }

    /// Description with inputs interpolated
    pub fn interpolated_description(&self, inputs: &WorkflowInputs) -> Result<String, InputError> {
        interpolate(self.description.trim(), inputs)
    }

    /// Expected output with inputs interpolated
    pub fn interpolated_expected_output(
        &self,
        inputs: &WorkflowInputs,
    ) -> Result<String, InputError> {
        interpolate(self.expected_output.trim(), inputs)
    }

    /// Output file path with inputs interpolated
    pub fn interpolated_output_file(
        &self,
        inputs: &WorkflowInputs,
    ) -> Result<Option<PathBuf>, InputError> {
        self.output_file
            .as_ref()
            .map(|p| interpolate(&p.to_string_lossy(), inputs).map(PathBuf::from))
            .transpose()
    }

    /// Render the prompt an agent receives for this task
    pub fn prompt(&self, inputs: &WorkflowInputs, context: &str) -> Result<String, InputError> {
        let mut prompt = format!(
            "Current Task: {}\n\n\
             This is the expected criteria for your final answer: {}\n\
             You MUST return the actual complete content as the final answer, not a summary.",
            self.interpolated_description(inputs)?,
            self.interpolated_expected_output(inputs)?,
        );

        if !context.trim().is_empty() {
            prompt.push_str("\n\nThis is the context you're working with:\n");
            prompt.push_str(context.trim());
        }

        prompt.push_str("\n\nBegin! This is VERY important to you, give your best Final Answer.");
        Ok(prompt)
    }
}
