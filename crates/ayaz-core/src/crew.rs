//! Sequential crew execution
//!
//! Runs the project's tasks strictly in order. Each task is performed by its
//! agent in a single model call; its output becomes context for later tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::{AgentProfile, AgentRoster};
use crate::inputs::WorkflowInputs;
use crate::project::CrewProject;
use crate::providers::{ChatMessage, ChatUsage, LlmProvider};
use crate::tasks::NamedTask;

/// Separator placed between earlier task outputs in a task's context
pub const CONTEXT_SEPARATOR: &str = "\n\n----------\n\n";

/// Result of one executed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub expected_output: String,
    /// Role of the agent that produced the output
    pub agent: String,
    pub raw: String,
    #[serde(default)]
    pub usage: ChatUsage,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Result of a full crew run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewOutput {
    /// Output of the last task
    pub raw: String,
    pub tasks_output: Vec<TaskOutput>,
    pub token_usage: ChatUsage,
}

impl CrewOutput {
    fn from_tasks(tasks_output: Vec<TaskOutput>) -> Self {
        let token_usage = tasks_output
            .iter()
            .fold(ChatUsage::default(), |acc, t| acc + t.usage);
        let raw = tasks_output
            .last()
            .map(|t| t.raw.clone())
            .unwrap_or_default();
        Self {
            raw,
            tasks_output,
            token_usage,
        }
    }
}

impl std::fmt::Display for CrewOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    /// Index of the first task executed in this run
    pub start_index: usize,
    /// True when re-running from a stored kickoff
    pub replay: bool,
}

/// Observers of a crew run. Every method defaults to doing nothing.
#[async_trait]
pub trait CrewHooks: Send {
    async fn on_run_start(&mut self, _run: RunInfo, _inputs: &WorkflowInputs) -> Result<()> {
        Ok(())
    }

    async fn on_task_start(
        &mut self,
        _index: usize,
        _task: &NamedTask,
        _agent: &AgentProfile,
        _inputs: &WorkflowInputs,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_task_complete(
        &mut self,
        _index: usize,
        _output: &TaskOutput,
        _run: RunInfo,
        _inputs: &WorkflowInputs,
    ) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
pub struct NoHooks;

impl CrewHooks for NoHooks {}

/// Fans every event out to several hooks, in order
pub struct HookChain<'a> {
    hooks: Vec<&'a mut (dyn CrewHooks + 'a)>,
}

impl<'a> HookChain<'a> {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn with(mut self, hook: &'a mut (dyn CrewHooks + 'a)) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl Default for HookChain<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CrewHooks for HookChain<'_> {
    async fn on_run_start(&mut self, run: RunInfo, inputs: &WorkflowInputs) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.on_run_start(run, inputs).await?;
        }
        Ok(())
    }

    async fn on_task_start(
        &mut self,
        index: usize,
        task: &NamedTask,
        agent: &AgentProfile,
        inputs: &WorkflowInputs,
    ) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.on_task_start(index, task, agent, inputs).await?;
        }
        Ok(())
    }

    async fn on_task_complete(
        &mut self,
        index: usize,
        output: &TaskOutput,
        run: RunInfo,
        inputs: &WorkflowInputs,
    ) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.on_task_complete(index, output, run, inputs).await?;
        }
        Ok(())
    }
}

/// The execution engine: agents, ordered tasks and the models they talk to
pub struct Crew {
    agents: AgentRoster,
    tasks: Vec<NamedTask>,
    provider: Arc<dyn LlmProvider>,
    agent_providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// Trained instructions, keyed by agent role
    suggestions: HashMap<String, Vec<String>>,
}

impl Crew {
    pub fn new(project: CrewProject, provider: Arc<dyn LlmProvider>) -> Self {
        info!(
            "Crew assembled: {} agents, {} tasks, model {}",
            project.agents.len(),
            project.tasks.len(),
            provider.model()
        );
        Self {
            agents: project.agents,
            tasks: project.tasks,
            provider,
            agent_providers: HashMap::new(),
            suggestions: HashMap::new(),
        }
    }

    /// Route one agent's calls to a different provider
    pub fn with_agent_provider(
        mut self,
        agent: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        self.agent_providers.insert(agent.into(), provider);
        self
    }

    /// Instructions learned in training, keyed by agent role
    pub fn with_trained_suggestions(mut self, suggestions: HashMap<String, Vec<String>>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn agents(&self) -> &AgentRoster {
        &self.agents
    }

    pub fn tasks(&self) -> &[NamedTask] {
        &self.tasks
    }

    /// The crew's default provider
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    fn provider_for(&self, agent: &str) -> &Arc<dyn LlmProvider> {
        self.agent_providers.get(agent).unwrap_or(&self.provider)
    }

    pub(crate) fn agent_for(&self, index: usize) -> Result<(&NamedTask, &AgentProfile)> {
        let task = self
            .tasks
            .get(index)
            .ok_or_else(|| anyhow!("task index {} out of range", index))?;
        let agent = self
            .agents
            .get(&task.spec.agent)
            .ok_or_else(|| anyhow!("task '{}' has no agent '{}'", task.name, task.spec.agent))?;
        Ok((task, agent))
    }

    /// Run every task in order
    pub async fn kickoff(
        &self,
        inputs: &WorkflowInputs,
        hooks: &mut dyn CrewHooks,
    ) -> Result<CrewOutput> {
        let run = RunInfo {
            start_index: 0,
            replay: false,
        };
        self.run(run, Vec::new(), inputs, hooks).await
    }

    /// Re-run from `start_index`, using `prior_outputs` as the earlier tasks' results
    pub async fn replay_from(
        &self,
        start_index: usize,
        prior_outputs: Vec<TaskOutput>,
        inputs: &WorkflowInputs,
        hooks: &mut dyn CrewHooks,
    ) -> Result<CrewOutput> {
        if start_index >= self.tasks.len() {
            bail!(
                "cannot replay from task {}: the crew has {} tasks",
                start_index,
                self.tasks.len()
            );
        }
        if prior_outputs.len() != start_index {
            bail!(
                "replaying from task {} needs {} earlier outputs, found {}",
                start_index,
                start_index,
                prior_outputs.len()
            );
        }
        let run = RunInfo {
            start_index,
            replay: true,
        };
        self.run(run, prior_outputs, inputs, hooks).await
    }

    async fn run(
        &self,
        run: RunInfo,
        mut outputs: Vec<TaskOutput>,
        inputs: &WorkflowInputs,
        hooks: &mut dyn CrewHooks,
    ) -> Result<CrewOutput> {
        info!(
            "Crew run starting at task {} of {} (replay={})",
            run.start_index + 1,
            self.tasks.len(),
            run.replay
        );
        hooks.on_run_start(run, inputs).await?;

        for index in run.start_index..self.tasks.len() {
            let task = self.start_task(index, inputs, hooks).await?;
            let output = self
                .execute_task(index, inputs, &outputs)
                .await
                .with_context(|| format!("task '{}' failed", task.name))?;

            self.finish_task(index, &output, run, inputs, hooks).await?;
            outputs.push(output);
        }

        let output = CrewOutput::from_tasks(outputs);
        info!(
            "Crew run complete ({} input tokens, {} output tokens)",
            output.token_usage.input_tokens, output.token_usage.output_tokens
        );
        Ok(output)
    }

    /// Announce task `index` to the hooks
    pub(crate) async fn start_task(
        &self,
        index: usize,
        inputs: &WorkflowInputs,
        hooks: &mut dyn CrewHooks,
    ) -> Result<&NamedTask> {
        let (task, agent) = self.agent_for(index)?;
        hooks.on_task_start(index, task, agent, inputs).await?;
        Ok(task)
    }

    /// Write the task's output file, if it has one, then report completion
    pub(crate) async fn finish_task(
        &self,
        index: usize,
        output: &TaskOutput,
        run: RunInfo,
        inputs: &WorkflowInputs,
        hooks: &mut dyn CrewHooks,
    ) -> Result<()> {
        self.write_output_file(index, inputs, output).await?;
        hooks.on_task_complete(index, output, run, inputs).await
    }

    /// Context for task `index`: the outputs it names, or every earlier output
    pub(crate) fn context_for(&self, index: usize, outputs: &[TaskOutput]) -> String {
        let Some(task) = self.tasks.get(index) else {
            return String::new();
        };
        let selected: Vec<&str> = match &task.spec.context {
            Some(names) => outputs
                .iter()
                .filter(|o| names.contains(&o.name))
                .map(|o| o.raw.as_str())
                .collect(),
            None => outputs.iter().map(|o| o.raw.as_str()).collect(),
        };
        selected.join(CONTEXT_SEPARATOR)
    }

    /// System and user prompts for task `index`
    pub(crate) fn prompts_for(
        &self,
        index: usize,
        inputs: &WorkflowInputs,
        outputs: &[TaskOutput],
    ) -> Result<(String, String)> {
        let (task, agent) = self.agent_for(index)?;
        let role = agent.display_role(inputs);
        let suggestions = self
            .suggestions
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let system = agent.system_prompt(inputs, suggestions)?;
        let user = task.spec.prompt(inputs, &self.context_for(index, outputs))?;
        Ok((system, user))
    }

    /// Execute task `index` once, given the outputs of the tasks before it
    pub(crate) async fn execute_task(
        &self,
        index: usize,
        inputs: &WorkflowInputs,
        outputs: &[TaskOutput],
    ) -> Result<TaskOutput> {
        let (task, agent) = self.agent_for(index)?;
        let (system, user) = self.prompts_for(index, inputs, outputs)?;
        let provider = self.provider_for(&task.spec.agent);

        debug!(
            "Executing task '{}' with agent '{}' on {}",
            task.name,
            task.spec.agent,
            provider.model()
        );
        let started = Instant::now();
        let response = provider.chat(&[ChatMessage::user(user)], &system).await?;

        Ok(TaskOutput {
            task_id: Uuid::new_v4().to_string(),
            name: task.name.clone(),
            description: task.spec.interpolated_description(inputs)?,
            expected_output: task.spec.interpolated_expected_output(inputs)?,
            agent: agent.display_role(inputs),
            raw: response.text.trim().to_string(),
            usage: response.usage,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Ask the task's agent to improve `initial` according to human feedback
    pub(crate) async fn revise_task(
        &self,
        index: usize,
        inputs: &WorkflowInputs,
        outputs: &[TaskOutput],
        initial: &TaskOutput,
        feedback: &str,
    ) -> Result<TaskOutput> {
        let (task, _) = self.agent_for(index)?;
        let (system, user) = self.prompts_for(index, inputs, outputs)?;
        let provider = self.provider_for(&task.spec.agent);

        let messages = [
            ChatMessage::user(user),
            ChatMessage::assistant(initial.raw.clone()),
            ChatMessage::user(format!(
                "Human feedback on your answer:\n{}\n\n\
                 Revise your final answer so it fully addresses this feedback. \
                 Return the complete improved answer only.",
                feedback.trim()
            )),
        ];

        let started = Instant::now();
        let response = provider.chat(&messages, &system).await?;

        Ok(TaskOutput {
            raw: response.text.trim().to_string(),
            usage: initial.usage + response.usage,
            duration_ms: initial.duration_ms + started.elapsed().as_millis() as u64,
            ..initial.clone()
        })
    }

    async fn write_output_file(
        &self,
        index: usize,
        inputs: &WorkflowInputs,
        output: &TaskOutput,
    ) -> Result<()> {
        let (task, _) = self.agent_for(index)?;
        let Some(path) = task.spec.interpolated_output_file(inputs)? else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        tokio::fs::write(&path, &output.raw)
            .await
            .with_context(|| format!("Failed to write output of '{}' to {}", task.name, path.display()))?;
        info!("Wrote output of '{}' to {}", task.name, path.display());
        Ok(())
    }
}
