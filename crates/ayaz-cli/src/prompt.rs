//! Interactive prompts: credentials, the requested action and training feedback
//!
//! Lines are read through tokio so a pending prompt never blocks the runtime;
//! Ctrl+C stays observable while the user is typing.

use std::io::{IsTerminal, Stdout, Write};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

use ayaz_core::crew::TaskOutput;
use ayaz_core::{Credentials, FeedbackSource, WorkflowInputs, validate_email};

const EXAMPLE_ACTIONS: [&str; 4] = [
    "Schedule a meeting with the team",
    "Process emails from yesterday",
    "Create a document for project X",
    "Update the project spreadsheet",
];

/// What the user typed before a run
pub struct Request {
    pub credentials: Credentials,
    pub action: String,
    pub context: Option<String>,
}

/// Line-oriented console over any async reader and writer pair
pub struct Console<R, W> {
    input: R,
    output: W,
    /// Secrets go through a hidden terminal prompt when set
    interactive: bool,
}

impl Console<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()),
            output: std::io::stdout(),
            interactive: std::io::stdin().is_terminal(),
        }
    }
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            interactive: false,
        }
    }

    pub fn say(&mut self, text: &str) -> Result<()> {
        writeln!(self.output, "{}", text)?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            bail!("input closed before a value was entered");
        }
        Ok(line.trim().to_string())
    }

    pub async fn ask(&mut self, prompt: &str) -> Result<String> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        self.read_line().await
    }

    pub async fn read_secret(&mut self, prompt: &str) -> Result<String> {
        if self.interactive {
            let secret = inquire::Password::new(prompt.trim_end())
                .without_confirmation()
                .with_display_mode(inquire::PasswordDisplayMode::Hidden)
                .prompt()?;
            return Ok(secret.trim().to_string());
        }
        self.ask(prompt).await
    }

    /// Email (re-prompted until valid) and password
    pub async fn prompt_credentials(&mut self) -> Result<Credentials> {
        self.say("\n=== User Authentication ===")?;
        let email = loop {
            let email = self.ask("Please enter your email: ").await?;
            match validate_email(&email) {
                Ok(()) => break email,
                Err(e) => self.say(&format!("{}. Please try again.", e))?,
            }
        };
        let auth_token = self.read_secret("Please enter your password: ").await?;
        Ok(Credentials { email, auth_token })
    }

    /// The requested action (re-prompted until non-empty) and optional context
    pub async fn prompt_action(&mut self) -> Result<(String, Option<String>)> {
        self.say("\n=== Action Input ===")?;
        self.say("What would you like me to do? Examples:")?;
        for (i, example) in EXAMPLE_ACTIONS.iter().enumerate() {
            self.say(&format!("{}. {}", i + 1, example))?;
        }

        let action = loop {
            let action = self.ask("\nPlease describe your request: ").await?;
            if !action.is_empty() {
                break action;
            }
            self.say("The request cannot be empty.")?;
        };

        let context = self
            .ask("Any additional context? (press Enter to skip): ")
            .await?;
        let context = (!context.is_empty()).then_some(context);
        Ok((action, context))
    }

    pub async fn prompt_request(&mut self) -> Result<Request> {
        let credentials = self.prompt_credentials().await?;
        let (action, context) = self.prompt_action().await?;
        Ok(Request {
            credentials,
            action,
            context,
        })
    }

    /// Credentials and action, assembled into workflow inputs
    pub async fn prompt_workflow_inputs(&mut self, current_year: i32) -> Result<WorkflowInputs> {
        let request = self.prompt_request().await?;
        Ok(WorkflowInputs::for_workflow(
            &request.credentials,
            &request.action,
            request.context.as_deref(),
            current_year,
        ))
    }

    /// Like [`Self::prompt_workflow_inputs`], but a skipped context is left
    /// out so the stored kickoff's context is reused
    pub async fn prompt_replay_overrides(&mut self, current_year: i32) -> Result<WorkflowInputs> {
        let request = self.prompt_request().await?;
        Ok(WorkflowInputs::replay_overrides(
            &request.credentials,
            &request.action,
            request.context.as_deref(),
            current_year,
        ))
    }
}

#[async_trait]
impl<R, W> FeedbackSource for Console<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    async fn feedback(&mut self, iteration: u32, output: &TaskOutput) -> Result<String> {
        self.say(&format!(
            "\n=== Training iteration {}: {} ({}) ===",
            iteration, output.name, output.agent
        ))?;
        self.say(&output.raw)?;
        self.ask("\nProvide feedback to improve this result (press Enter to accept): ")
            .await
    }
}
