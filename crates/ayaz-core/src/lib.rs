//! ayaz-core — the Ayaz multi-agent office workflow engine
//!
//! Loads the crew definition, talks to watsonx.ai or Gemini, runs tasks in
//! sequence and supports training, evaluation and replay of the latest run.

pub mod agents;
pub mod crew;
pub mod evaluation;
pub mod inputs;
pub mod project;
pub mod providers;
pub mod replay;
pub mod settings;
pub mod tasks;
pub mod training;

pub use agents::{AgentProfile, AgentRoster};
pub use crew::{Crew, CrewHooks, CrewOutput, HookChain, NoHooks, RunInfo, TaskOutput};
pub use evaluation::{TestReport, test_crew};
pub use inputs::{Credentials, InputError, NO_CONTEXT, WorkflowInputs, validate_email};
pub use project::{CrewProject, ProjectError};
pub use providers::{LlmProvider, ProviderOptions, build_failover_provider, build_provider};
pub use replay::{KickoffRecorder, replay};
pub use settings::{Backend, ProviderSettings, SettingsError};
pub use tasks::{NamedTask, TaskSpec};
pub use training::{FeedbackSource, TrainingSummary, load_trained_suggestions, train};
