use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;

use ayaz_core::crew::{CrewHooks, RunInfo, TaskOutput};
use ayaz_core::{AgentProfile, NamedTask, WorkflowInputs};

/// Prints task progress for verbose agents
pub struct ConsoleReporter<W> {
    out: W,
    total: usize,
    verbose: bool,
}

impl ConsoleReporter<std::io::Stdout> {
    pub fn stdout(total: usize) -> Self {
        Self::new(std::io::stdout(), total)
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W, total: usize) -> Self {
        Self {
            out,
            total,
            verbose: false,
        }
    }
}

#[async_trait]
impl<W: Write + Send> CrewHooks for ConsoleReporter<W> {
    async fn on_run_start(&mut self, run: RunInfo, _inputs: &WorkflowInputs) -> Result<()> {
        if run.replay {
            writeln!(
                self.out,
                "Replaying from task {} of {}",
                run.start_index + 1,
                self.total
            )?;
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
        self.verbose = agent.verbose;
        if !self.verbose {
            return Ok(());
        }
        writeln!(
            self.out,
            "\n[{}/{}] {}\n# Agent: {}",
            index + 1,
            self.total,
            task.name,
            agent.display_role(inputs)
        )?;
        if let Ok(description) = task.spec.interpolated_description(inputs) {
            writeln!(self.out, "## Task: {}", description)?;
        }
        self.out.flush()?;
        Ok(())
    }

    async fn on_task_complete(
        &mut self,
        _index: usize,
        output: &TaskOutput,
        _run: RunInfo,
        _inputs: &WorkflowInputs,
    ) -> Result<()> {
        if self.verbose {
            writeln!(self.out, "## Final Answer:\n{}", output.raw)?;
            self.out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ayaz_core::TaskSpec;

    fn task() -> NamedTask {
        NamedTask {
            name: "process_email".to_string(),
            spec: TaskSpec::new("Handle {action}", "Replies", "email_processor"),
        }
    }

    fn output() -> TaskOutput {
        TaskOutput {
            task_id: "id".to_string(),
            name: "process_email".to_string(),
            description: "d".to_string(),
            expected_output: "e".to_string(),
            agent: "Email Processor".to_string(),
            raw: "Two replies drafted".to_string(),
            usage: Default::default(),
            duration_ms: 3,
        }
    }

    const RUN: RunInfo = RunInfo {
        start_index: 0,
        replay: false,
    };

    #[tokio::test]
    async fn test_verbose_agent_is_reported() {
        let mut inputs = WorkflowInputs::new();
        inputs.insert("action", "the inbox");
        let agent = AgentProfile::new("Email Processor", "g", "b");
        let mut reporter = ConsoleReporter::new(Vec::new(), 5);

        reporter.on_run_start(RUN, &inputs).await.unwrap();
        reporter.on_task_start(1, &task(), &agent, &inputs).await.unwrap();
        reporter.on_task_complete(1, &output(), RUN, &inputs).await.unwrap();

        let printed = String::from_utf8(reporter.out).unwrap();
        assert!(printed.contains("[2/5] process_email"));
        assert!(printed.contains("# Agent: Email Processor"));
        assert!(printed.contains("## Task: Handle the inbox"));
        assert!(printed.contains("## Final Answer:\nTwo replies drafted"));
        assert!(!printed.contains("Replaying"));
    }

    #[tokio::test]
    async fn test_quiet_agent_prints_nothing() {
        let inputs = WorkflowInputs::new();
        let mut agent = AgentProfile::new("Email Processor", "g", "b");
        agent.verbose = false;
        let mut reporter = ConsoleReporter::new(Vec::new(), 5);

        reporter.on_task_start(0, &task(), &agent, &inputs).await.unwrap();
        reporter.on_task_complete(0, &output(), RUN, &inputs).await.unwrap();

        assert!(reporter.out.is_empty());
    }

    #[tokio::test]
    async fn test_replay_banner() {
        let mut reporter = ConsoleReporter::new(Vec::new(), 5);
        let run = RunInfo {
            start_index: 2,
            replay: true,
        };
        reporter.on_run_start(run, &WorkflowInputs::new()).await.unwrap();
        assert_eq!(String::from_utf8(reporter.out).unwrap(), "Replaying from task 3 of 5\n");
    }
}
