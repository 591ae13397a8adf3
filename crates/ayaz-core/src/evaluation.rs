//! Crew evaluation: run the crew repeatedly and score each task with an LLM judge

use std::fmt::Write as _;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::crew::{Crew, CrewHooks, TaskOutput};
use crate::inputs::WorkflowInputs;
use crate::providers::{ChatMessage, LlmProvider};

const EVALUATOR_SYSTEM: &str = "You are an expert evaluator of AI agent work. \
    You compare a task's output with its description and expected output and answer in JSON.";

/// Find the first balanced JSON object in `text`.
///
/// Models tend to wrap JSON in prose or code fences; braces inside JSON
/// strings are skipped.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            let candidate = &text[start..start + end];
            if serde_json::from_str::<serde_json::Value>(candidate)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the object starting at `s[0] == '{'`, if it closes
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct QualityScore {
    quality: f64,
}

/// Score a single task output from 1 to 10
pub async fn evaluate_task(evaluator: &dyn LlmProvider, output: &TaskOutput) -> Result<f64> {
    let prompt = format!(
        "Based on the task description and the expected output, evaluate the \
         performance of the agent on this task, using a score from 1 to 10 that \
         reflects completion, quality and overall performance.\n\n\
         Task description: {}\n\
         Expected output: {}\n\
         Agent: {}\n\
         Actual output:\n{}\n\n\
         Reply with a JSON object only: {{\"quality\": <score from 1 to 10>}}",
        output.description, output.expected_output, output.agent, output.raw
    );

    let response = evaluator
        .chat(&[ChatMessage::user(prompt)], EVALUATOR_SYSTEM)
        .await
        .with_context(|| format!("evaluating task '{}' failed", output.name))?;

    let json = extract_json_object(&response.text).ok_or_else(|| {
        anyhow!(
            "evaluator returned no score for task '{}': {}",
            output.name,
            response.text.trim()
        )
    })?;
    let score: QualityScore = serde_json::from_str(json)
        .with_context(|| format!("evaluator returned an invalid score for '{}'", output.name))?;

    if !score.quality.is_finite() {
        bail!("evaluator returned a non-numeric score for '{}'", output.name);
    }
    let quality = score.quality.clamp(1.0, 10.0);
    debug!("Task '{}' scored {:.1}", output.name, quality);
    Ok(quality)
}

/// Scores of every task across every test run
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub tasks: Vec<String>,
    pub agents: Vec<String>,
    /// `scores[task][run]`
    pub scores: Vec<Vec<f64>>,
    /// Wall-clock seconds per run
    pub execution_secs: Vec<f64>,
}

impl TestReport {
    fn new(crew: &Crew) -> Self {
        let tasks: Vec<String> = crew.tasks().iter().map(|t| t.name.clone()).collect();
        Self {
            scores: vec![Vec::new(); tasks.len()],
            agents: vec![String::new(); tasks.len()],
            tasks,
            execution_secs: Vec::new(),
        }
    }

    pub fn runs(&self) -> usize {
        self.execution_secs.len()
    }

    /// Mean score of one run across all tasks
    pub fn crew_score(&self, run: usize) -> f64 {
        mean(self.scores.iter().filter_map(|s| s.get(run).copied()))
    }

    /// Mean score of one task across all runs
    pub fn task_average(&self, task: usize) -> f64 {
        self.scores
            .get(task)
            .map(|s| mean(s.iter().copied()))
            .unwrap_or_default()
    }

    pub fn crew_average(&self) -> f64 {
        mean((0..self.runs()).map(|run| self.crew_score(run)))
    }

    pub fn average_execution_secs(&self) -> f64 {
        mean(self.execution_secs.iter().copied())
    }

    /// Render the report as a text table
    pub fn render(&self) -> String {
        let runs = self.runs();
        let label_width = self
            .tasks
            .iter()
            .map(String::len)
            .chain(["Crew".len(), "Execution Time (s)".len()])
            .max()
            .unwrap_or(0);
        let col = 10;

        let mut out = String::new();
        let _ = writeln!(out, "Tasks Scores (1-10 Higher is better)");
        let _ = write!(out, "{:<label_width$}", "Tasks/Crew/Agents");
        for run in 1..=runs {
            let _ = write!(out, " {:>col$}", format!("Run {}", run));
        }
        let _ = writeln!(out, " {:>col$}  Agents", "Avg. Total");

        for (i, task) in self.tasks.iter().enumerate() {
            let _ = write!(out, "{:<label_width$}", task);
            for score in &self.scores[i] {
                let _ = write!(out, " {:>col$.1}", score);
            }
            let _ = writeln!(out, " {:>col$.1}  {}", self.task_average(i), self.agents[i]);
        }

        let _ = write!(out, "{:<label_width$}", "Crew");
        for run in 0..runs {
            let _ = write!(out, " {:>col$.1}", self.crew_score(run));
        }
        let _ = writeln!(out, " {:>col$.1}", self.crew_average());

        let _ = write!(out, "{:<label_width$}", "Execution Time (s)");
        for secs in &self.execution_secs {
            let _ = write!(out, " {:>col$.0}", secs);
        }
        let _ = writeln!(out, " {:>col$.0}", self.average_execution_secs());
        out
    }
}

impl std::fmt::Display for TestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Run the crew `iterations` times and score every task with `evaluator`
pub async fn test_crew(
    crew: &Crew,
    iterations: u32,
    evaluator: &dyn LlmProvider,
    inputs: &WorkflowInputs,
    hooks: &mut dyn CrewHooks,
) -> Result<TestReport> {
    if iterations == 0 {
        bail!("the number of test iterations must be a positive integer");
    }
    info!(
        "Testing crew for {} iteration(s), evaluator model {}",
        iterations,
        evaluator.model()
    );

    let mut report = TestReport::new(crew);
    for run in 1..=iterations {
        info!("Test run {}/{}", run, iterations);
        let started = Instant::now();
        let output = crew.kickoff(inputs, hooks).await?;
        report.execution_secs.push(started.elapsed().as_secs_f64());

        for (i, task_output) in output.tasks_output.iter().enumerate() {
            let score = evaluate_task(evaluator, task_output).await?;
            report.scores[i].push(score);
            report.agents[i] = task_output.agent.clone();
        }
    }

    info!("Crew average score: {:.1}", report.crew_average());
    Ok(report)
}
