//! Human-in-the-loop training
//!
//! Runs the crew several times, collects feedback on every task output and
//! distils it into standing instructions per agent.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crew::{Crew, CrewHooks, RunInfo, TaskOutput};
use crate::evaluation::extract_json_object;
use crate::inputs::WorkflowInputs;
use crate::providers::ChatMessage;

/// Where human feedback comes from
#[async_trait]
pub trait FeedbackSource: Send {
    /// Feedback on one task output; an empty string means "no changes"
    async fn feedback(&mut self, iteration: u32, output: &TaskOutput) -> Result<String>;
}

/// One task execution observed during training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub iteration: u32,
    pub task: String,
    pub agent: String,
    pub initial_output: String,
    pub human_feedback: String,
    pub improved_output: String,
}

/// What training learned about one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTrainingResult {
    pub suggestions: Vec<String>,
    pub quality: f64,
    pub final_summary: String,
}

/// Outcome of a training session
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub results: BTreeMap<String, AgentTrainingResult>,
    pub records: Vec<TrainingRecord>,
    pub results_file: PathBuf,
    pub records_file: PathBuf,
}

/// `trained.json` -> `trained.records.json`
pub fn records_path(filename: &Path) -> PathBuf {
    let stem = filename
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "training".to_string());
    filename.with_file_name(format!("{}.records.json", stem))
}

/// Check training arguments before any work starts
pub fn validate_training_args(iterations: u32, filename: &Path) -> Result<()> {
    if iterations == 0 {
        bail!("the number of training iterations must be a positive integer");
    }
    let is_json = filename
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        bail!(
            "the training file name must end with .json (got {})",
            filename.display()
        );
    }
    Ok(())
}

/// Train the crew for `iterations` runs and write the results to `filename`
pub async fn train(
    crew: &Crew,
    iterations: u32,
    filename: &Path,
    inputs: &WorkflowInputs,
    feedback: &mut dyn FeedbackSource,
    hooks: &mut dyn CrewHooks,
) -> Result<TrainingSummary> {
    validate_training_args(iterations, filename)?;
    info!(
        "Training crew for {} iteration(s), results go to {}",
        iterations,
        filename.display()
    );

    let mut records = Vec::new();
    let run = RunInfo {
        start_index: 0,
        replay: false,
    };

    for iteration in 1..=iterations {
        info!("Training iteration {}/{}", iteration, iterations);
        hooks.on_run_start(run, inputs).await?;
        let mut outputs: Vec<TaskOutput> = Vec::with_capacity(crew.tasks().len());

        for index in 0..crew.tasks().len() {
            let task = crew.start_task(index, inputs, hooks).await?;
            let initial = crew
                .execute_task(index, inputs, &outputs)
                .await
                .with_context(|| format!("task '{}' failed", task.name))?;
            let human_feedback = feedback.feedback(iteration, &initial).await?;

            let improved = if human_feedback.trim().is_empty() {
                initial.clone()
            } else {
                debug!("Revising '{}' with human feedback", task.name);
                crew.revise_task(index, inputs, &outputs, &initial, &human_feedback)
                    .await
                    .with_context(|| format!("revising task '{}' failed", task.name))?
            };

            records.push(TrainingRecord {
                iteration,
                task: task.name.clone(),
                agent: initial.agent.clone(),
                initial_output: initial.raw.clone(),
                human_feedback: human_feedback.trim().to_string(),
                improved_output: improved.raw.clone(),
            });

            crew.finish_task(index, &improved, run, inputs, hooks).await?;
            outputs.push(improved);
        }
    }

    let mut results = BTreeMap::new();
    for agent in agents_in_order(&records) {
        let agent_records: Vec<&TrainingRecord> =
            records.iter().filter(|r| r.agent == agent).collect();
        let result = summarize_agent(crew, &agent, &agent_records).await?;
        info!(
            "Agent '{}': quality {:.1}, {} suggestion(s)",
            agent,
            result.quality,
            result.suggestions.len()
        );
        results.insert(agent, result);
    }

    let records_file = records_path(filename);
    write_json(filename, &results)?;
    write_json(&records_file, &records)?;
    info!(
        "Training complete: {} agent(s) written to {}",
        results.len(),
        filename.display()
    );

    Ok(TrainingSummary {
        results,
        records,
        results_file: filename.to_path_buf(),
        records_file,
    })
}

fn agents_in_order(records: &[TrainingRecord]) -> Vec<String> {
    let mut agents: Vec<String> = Vec::new();
    for record in records {
        if !agents.contains(&record.agent) {
            agents.push(record.agent.clone());
        }
    }
    agents
}

async fn summarize_agent(
    crew: &Crew,
    agent: &str,
    records: &[&TrainingRecord],
) -> Result<AgentTrainingResult> {
    let mut transcript = String::new();
    for record in records {
        transcript.push_str(&format!(
            "Iteration {} / task {}\nInitial output:\n{}\nHuman feedback:\n{}\nImproved output:\n{}\n\n",
            record.iteration,
            record.task,
            record.initial_output,
            if record.human_feedback.is_empty() {
                "(none)"
            } else {
                record.human_feedback.as_str()
            },
            record.improved_output
        ));
    }

    let prompt = format!(
        "Assess the quality of the training data below, produced by the agent \
         \"{agent}\", based on the human feedback it received.\n\n{transcript}\
         Reply with a JSON object only, in this exact shape:\n\
         {{\"suggestions\": [\"<actionable instruction>\", ...], \
         \"quality\": <score from 0 to 10>, \
         \"final_summary\": \"<one paragraph>\"}}\n\
         Suggestions must be concrete instructions the agent can follow in \
         future tasks. Do not include anything else."
    );

    let response = crew
        .provider()
        .chat(
            &[ChatMessage::user(prompt)],
            "You are an expert evaluator of AI agent work. You answer in JSON.",
        )
        .await
        .with_context(|| format!("summarizing training for '{}' failed", agent))?;

    parse_training_result(&response.text)
        .with_context(|| format!("could not read the training summary for '{}'", agent))
}

fn parse_training_result(text: &str) -> Result<AgentTrainingResult> {
    let json = extract_json_object(text)
        .ok_or_else(|| anyhow!("no JSON object in model reply: {}", text.trim()))?;
    let mut result: AgentTrainingResult = serde_json::from_str(json)?;
    result.suggestions.retain(|s| !s.trim().is_empty());
    if !(0.0..=10.0).contains(&result.quality) {
        warn!("Training quality {} out of range, clamping", result.quality);
        result.quality = result.quality.clamp(0.0, 10.0);
    }
    Ok(result)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Suggestions per agent role from a training result file. A missing file yields none.
pub fn load_trained_suggestions(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    if !path.exists() {
        debug!("No trained agents file at {}", path.display());
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let results: BTreeMap<String, AgentTrainingResult> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse trained agents file {}", path.display()))?;

    info!(
        "Loaded trained suggestions for {} agent(s) from {}",
        results.len(),
        path.display()
    );
    Ok(results
        .into_iter()
        .map(|(agent, result)| (agent.trim().to_string(), result.suggestions))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crew::NoHooks;
    use crate::crew::tests::{ScriptedProvider, crew_with, inputs};
    use std::sync::Arc;

    /// Gives feedback only on the tasks named in `on`
    struct CannedFeedback {
        on: Vec<&'static str>,
        asked: Vec<(u32, String)>,
    }

    #[async_trait]
    impl FeedbackSource for CannedFeedback {
        async fn feedback(&mut self, iteration: u32, output: &TaskOutput) -> Result<String> {
            self.asked.push((iteration, output.name.clone()));
            if self.on.contains(&output.name.as_str()) {
                Ok("Be more specific about times".to_string())
            } else {
                Ok(String::new())
            }
        }
    }

    const SUMMARY: &str = "Here you go:\n```json\n{\"suggestions\": [\"Always state the time zone\", \" \"], \"quality\": 7.5, \"final_summary\": \"Good.\"}\n```";

    #[test]
    fn test_records_path() {
        assert_eq!(
            records_path(Path::new("out/trained.json")),
            PathBuf::from("out/trained.records.json")
        );
    }

    #[test]
    fn test_validate() {
        assert!(validate_training_args(1, Path::new("a.json")).is_ok());
        assert!(validate_training_args(1, Path::new("a.JSON")).is_ok());
        assert!(validate_training_args(0, Path::new("a.json")).is_err());
        let err = validate_training_args(2, Path::new("a.txt")).unwrap_err();
        assert!(err.to_string().contains("must end with .json"));
        assert!(validate_training_args(2, Path::new("json")).is_err());
    }

    #[test]
    fn test_parse_training_result() {
        let result = parse_training_result(SUMMARY).unwrap();
        assert_eq!(result.suggestions, vec!["Always state the time zone"]);
        assert_eq!(result.quality, 7.5);
        assert_eq!(result.final_summary, "Good.");

        let clamped = parse_training_result(
            r#"{"suggestions": [], "quality": 42, "final_summary": ""}"#,
        )
        .unwrap();
        assert_eq!(clamped.quality, 10.0);

        assert!(parse_training_result("no json here").is_err());
    }

    #[tokio::test]
    async fn test_train_writes_results_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("trained.json");

        // 5 tasks + 1 revision, then 5 agent summaries
        let mut replies: Vec<&str> = vec!["plan", "emails", "slot", "revised slot", "doc", "sheet"];
        replies.extend([SUMMARY; 5]);
        let provider = Arc::new(ScriptedProvider::new("m").with_replies(&replies));
        let crew = crew_with(provider.clone());
        let mut feedback = CannedFeedback {
            on: vec!["schedule_meeting"],
            asked: Vec::new(),
        };

        let summary = train(&crew, 1, &file, &inputs(), &mut feedback, &mut NoHooks)
            .await
            .unwrap();

        assert_eq!(feedback.asked.len(), 5);
        assert_eq!(summary.records.len(), 5);
        let meeting = &summary.records[2];
        assert_eq!(meeting.initial_output, "slot");
        assert_eq!(meeting.improved_output, "revised slot");
        assert_eq!(meeting.human_feedback, "Be more specific about times");
        assert_eq!(summary.records[1].improved_output, "emails");

        // the revised output is what later tasks see
        let calls = provider.calls();
        assert!(calls[4].1[0].content.contains("revised slot"));

        assert_eq!(summary.results.len(), 5);
        let loaded = load_trained_suggestions(&file).unwrap();
        assert_eq!(
            loaded.get("Calendar Manager"),
            Some(&vec!["Always state the time zone".to_string()])
        );
        assert!(summary.records_file.exists());
        let records: Vec<TrainingRecord> =
            serde_json::from_str(&std::fs::read_to_string(&summary.records_file).unwrap())
                .unwrap();
        assert_eq!(records, summary.records);
    }

    #[tokio::test]
    async fn test_train_runs_every_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("t.json");
        let mut replies: Vec<&str> = vec!["out"; 10];
        replies.extend([SUMMARY; 5]);
        let provider = Arc::new(ScriptedProvider::new("m").with_replies(&replies));
        let crew = crew_with(provider.clone());
        let mut feedback = CannedFeedback {
            on: vec![],
            asked: Vec::new(),
        };

        let summary = train(&crew, 2, &file, &inputs(), &mut feedback, &mut NoHooks)
            .await
            .unwrap();

        assert_eq!(summary.records.len(), 10);
        assert_eq!(summary.records[9].iteration, 2);
        assert_eq!(provider.calls().len(), 15);
    }

    #[tokio::test]
    async fn test_train_writes_task_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("trained.json");
        let mut project = crate::project::CrewProject::bundled().unwrap();
        project.tasks[3].spec.output_file = Some(dir.path().join("docs").join("summary.md"));

        let mut replies: Vec<&str> = vec!["plan", "emails", "slot", "draft doc", "better doc", "sheet"];
        replies.extend([SUMMARY; 5]);
        let crew = Crew::new(
            project,
            Arc::new(ScriptedProvider::new("m").with_replies(&replies)),
        );
        let mut feedback = CannedFeedback {
            on: vec!["generate_document"],
            asked: Vec::new(),
        };

        train(&crew, 1, &file, &inputs(), &mut feedback, &mut NoHooks)
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("docs").join("summary.md")).unwrap();
        assert_eq!(written, "better doc");
    }

    #[tokio::test]
    async fn test_train_rejects_bad_arguments_before_running() {
        let provider = Arc::new(ScriptedProvider::new("m"));
        let crew = crew_with(provider.clone());
        let mut feedback = CannedFeedback {
            on: vec![],
            asked: Vec::new(),
        };

        let err = train(&crew, 1, Path::new("out.txt"), &inputs(), &mut feedback, &mut NoHooks)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".json"));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_load_trained_suggestions_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_trained_suggestions(&dir.path().join("none.json")).unwrap();
        assert!(loaded.is_empty());
    }
}
