//! Recording the latest kickoff and replaying it from a given task

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use ayaz_store::{KickoffStore, StoredTaskOutput};

use crate::crew::{Crew, CrewHooks, CrewOutput, RunInfo, TaskOutput};
use crate::inputs::WorkflowInputs;

/// Input keys never written to the kickoff store
const UNSTORED_INPUTS: [&str; 1] = ["auth_token"];

/// Hook that persists every completed task of a run into the kickoff store
pub struct KickoffRecorder {
    store: KickoffStore,
}

impl KickoffRecorder {
    pub fn new(store: KickoffStore) -> Self {
        Self { store }
    }
}

fn storable_inputs(inputs: &WorkflowInputs) -> WorkflowInputs {
    UNSTORED_INPUTS
        .iter()
        .fold(inputs.clone(), |acc, key| acc.without(key))
}

#[async_trait]
impl CrewHooks for KickoffRecorder {
    async fn on_run_start(&mut self, run: RunInfo, _inputs: &WorkflowInputs) -> Result<()> {
        if !run.replay {
            self.store.reset()?;
            debug!("Kickoff store reset for a new run");
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
        let record = StoredTaskOutput {
            task_index: index,
            task_id: output.task_id.clone(),
            task_name: output.name.clone(),
            expected_output: output.expected_output.clone(),
            output: serde_json::to_value(output)?,
            inputs: serde_json::to_value(storable_inputs(inputs))?,
            was_replayed: run.replay,
            timestamp: Utc::now(),
        };
        self.store.upsert(&record)
    }
}

/// Re-run the latest kickoff starting at the task with id `task_id`.
///
/// Earlier outputs come from the store; `overrides` (freshly prompted
/// inputs) take precedence over the stored inputs.
pub async fn replay(
    crew: &Crew,
    store: &KickoffStore,
    task_id: &str,
    overrides: &WorkflowInputs,
    hooks: &mut dyn CrewHooks,
) -> Result<CrewOutput> {
    let task_id = task_id.trim();
    let stored = store.load()?;
    let index = stored
        .iter()
        .position(|s| s.task_id == task_id)
        .ok_or_else(|| {
            anyhow!(
                "task with id {} not found in the latest kickoff. \
                 Run `ayaz log-tasks-outputs` to list the stored task ids",
                task_id
            )
        })?;

    for (expected, record) in stored[..=index].iter().enumerate() {
        if record.task_index != expected {
            bail!(
                "the stored kickoff is incomplete: task {} is missing",
                expected + 1
            );
        }
    }

    let start = &stored[index];
    if crew
        .tasks()
        .get(index)
        .map(|t| t.name != start.task_name)
        .unwrap_or(true)
    {
        bail!(
            "the stored kickoff does not match the current crew (task {} is '{}')",
            index + 1,
            start.task_name
        );
    }

    let prior = stored[..index]
        .iter()
        .map(|record| {
            serde_json::from_value::<TaskOutput>(record.output.clone())
                .with_context(|| format!("stored output of '{}' is corrupt", record.task_name))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut inputs: WorkflowInputs = serde_json::from_value(start.inputs.clone())
        .context("stored kickoff inputs are corrupt")?;
    inputs.merge(overrides);

    info!(
        "Replaying from task {} ('{}'), reusing {} stored output(s)",
        index + 1,
        start.task_name,
        prior.len()
    );
    crew.replay_from(index, prior, &inputs, hooks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crew::tests::{ScriptedProvider, crew_with, inputs};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_recorder_stores_every_task() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));
        let mut recorder = KickoffRecorder::new(store.clone());

        let output = crew.kickoff(&inputs(), &mut recorder).await.unwrap();

        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[1].task_id, output.tasks_output[1].task_id);
        assert_eq!(stored[1].task_name, "process_email");
        assert!(!stored[1].was_replayed);

        let inputs: WorkflowInputs = serde_json::from_value(stored[0].inputs.clone()).unwrap();
        assert_eq!(inputs.get("action"), Some("Schedule a meeting with the team"));
        assert_eq!(inputs.get("auth_token"), None);
    }

    #[tokio::test]
    async fn test_new_kickoff_replaces_previous() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));
        let mut recorder = KickoffRecorder::new(store.clone());

        let first = crew.kickoff(&inputs(), &mut recorder).await.unwrap();
        let second = crew.kickoff(&inputs(), &mut recorder).await.unwrap();

        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0].task_id, second.tasks_output[0].task_id);
        assert!(store.find(&first.tasks_output[0].task_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_from_stored_task() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));
        let mut recorder = KickoffRecorder::new(store.clone());
        let first = crew.kickoff(&inputs(), &mut recorder).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new("replayed"));
        let crew = crew_with(provider.clone());
        let mut overrides = WorkflowInputs::new();
        overrides.insert("auth_token", "fresh-token");
        overrides.insert("user_email", "grace@example.com");

        let target = first.tasks_output[2].task_id.clone();
        let output = replay(&crew, &store, &target, &overrides, &mut recorder)
            .await
            .unwrap();

        assert_eq!(provider.calls().len(), 3);
        assert_eq!(output.tasks_output[1], first.tasks_output[1]);
        assert_ne!(output.tasks_output[2].task_id, target);
        assert_eq!(output.raw, "replayed answer 3");

        let calls = provider.calls();
        assert!(calls[0].1[0].content.contains("m answer 2"));
        assert!(calls[2].1[0].content.contains("grace@example.com"));

        let stored = store.load().unwrap();
        assert_eq!(stored.len(), 5);
        assert!(!stored[1].was_replayed);
        assert!(stored[2].was_replayed);
        assert!(stored[4].was_replayed);
        let stored_inputs: WorkflowInputs =
            serde_json::from_value(stored[2].inputs.clone()).unwrap();
        assert_eq!(stored_inputs.get("user_email"), Some("grace@example.com"));
        assert_eq!(stored_inputs.get("auth_token"), None);
    }

    #[tokio::test]
    async fn test_replay_keeps_stored_context_when_skipped() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));
        let mut recorder = KickoffRecorder::new(store.clone());
        let mut original = inputs();
        original.insert("context", "Q3 budget is 10k");
        let first = crew.kickoff(&original, &mut recorder).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new("replayed"));
        let crew = crew_with(provider.clone());
        let credentials = crate::inputs::Credentials {
            email: "ada@example.com".to_string(),
            auth_token: "new-token".to_string(),
        };
        let overrides = WorkflowInputs::replay_overrides(
            &credentials,
            "Schedule a meeting with the team",
            None,
            2026,
        );

        replay(
            &crew,
            &store,
            &first.tasks_output[0].task_id,
            &overrides,
            &mut recorder,
        )
        .await
        .unwrap();

        let prompt = &provider.calls()[0].1[0].content;
        assert!(prompt.contains("Additional context from the user: Q3 budget is 10k"));

        let stored: WorkflowInputs =
            serde_json::from_value(store.load().unwrap()[0].inputs.clone()).unwrap();
        assert_eq!(stored.get("context"), Some("Q3 budget is 10k"));
    }

    #[tokio::test]
    async fn test_replay_unknown_task_id() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));

        let err = replay(
            &crew,
            &store,
            "does-not-exist",
            &WorkflowInputs::new(),
            &mut crate::crew::NoHooks,
        )
        .await
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("task with id does-not-exist not found in the latest kickoff")
        );
    }

    #[tokio::test]
    async fn test_replay_first_task_reruns_everything() {
        let store = KickoffStore::in_memory().unwrap();
        let crew = crew_with(Arc::new(ScriptedProvider::new("m")));
        let mut recorder = KickoffRecorder::new(store.clone());
        let first = crew.kickoff(&inputs(), &mut recorder).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new("again"));
        let crew = crew_with(provider.clone());
        replay(
            &crew,
            &store,
            &first.tasks_output[0].task_id,
            &inputs(),
            &mut recorder,
        )
        .await
        .unwrap();

        assert_eq!(provider.calls().len(), 5);
        assert!(store.load().unwrap().iter().all(|s| s.was_replayed));
    }
}
