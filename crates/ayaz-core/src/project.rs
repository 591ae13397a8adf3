//! The Ayaz crew definition: which agents and tasks exist, loaded from YAML
//!
//! `agents.yaml` and `tasks.yaml` are read from a project directory when
//! present; otherwise the definitions compiled into the binary are used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agents::{AgentProfile, AgentRoster};
use crate::tasks::{NamedTask, TaskSpec};

pub const AGENTS_FILE: &str = "agents.yaml";
pub const TASKS_FILE: &str = "tasks.yaml";

/// The crew's agents, in declaration order
pub const AGENT_NAMES: [&str; 5] = [
    "Supervisor_agent",
    "email_processor",
    "calendar_manager",
    "document_manager",
    "spreadsheet_manager",
];

/// The crew's tasks, in execution order
pub const TASK_NAMES: [&str; 5] = [
    "orchestrate_workflow",
    "process_email",
    "schedule_meeting",
    "generate_document",
    "update_spreadsheet",
];

const BUNDLED_AGENTS: &str = include_str!("../config/agents.yaml");
const BUNDLED_TASKS: &str = include_str!("../config/tasks.yaml");

pub fn bundled_agents_yaml() -> &'static str {
    BUNDLED_AGENTS
}

pub fn bundled_tasks_yaml() -> &'static str {
    BUNDLED_TASKS
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {file}: {source}")]
    Parse {
        file: String,
        source: serde_yml::Error,
    },
    #[error("agent '{0}' is not defined in agents.yaml")]
    MissingAgent(String),
    #[error("task '{0}' is not defined in tasks.yaml")]
    MissingTask(String),
    #[error("task '{task}' is assigned to unknown agent '{agent}'")]
    UnknownAgent { task: String, agent: String },
    #[error("task '{task}' uses '{context}' as context, but that task does not run before it")]
    InvalidContext { task: String, context: String },
}

/// Validated agents and tasks, ready to build a crew from
#[derive(Debug, Clone)]
pub struct CrewProject {
    pub agents: AgentRoster,
    pub tasks: Vec<NamedTask>,
}

impl CrewProject {
    /// Load from `dir`, falling back to the bundled definition for any missing file
    pub fn load(dir: Option<&Path>) -> Result<Self, ProjectError> {
        let agents_yaml = read_or_bundled(dir, AGENTS_FILE, BUNDLED_AGENTS)?;
        let tasks_yaml = read_or_bundled(dir, TASKS_FILE, BUNDLED_TASKS)?;
        Self::from_yaml(&agents_yaml, &tasks_yaml)
    }

    /// The definition compiled into the binary
    pub fn bundled() -> Result<Self, ProjectError> {
        Self::from_yaml(BUNDLED_AGENTS, BUNDLED_TASKS)
    }

    pub fn from_yaml(agents_yaml: &str, tasks_yaml: &str) -> Result<Self, ProjectError> {
        let mut agent_defs: BTreeMap<String, AgentProfile> = serde_yml::from_str(agents_yaml)
            .map_err(|source| ProjectError::Parse {
                file: AGENTS_FILE.to_string(),
                source,
            })?;
        let mut task_defs: BTreeMap<String, TaskSpec> =
            serde_yml::from_str(tasks_yaml).map_err(|source| ProjectError::Parse {
                file: TASKS_FILE.to_string(),
                source,
            })?;

        let mut agents = AgentRoster::new();
        for name in AGENT_NAMES {
            let profile = agent_defs
                .remove(name)
                .ok_or_else(|| ProjectError::MissingAgent(name.to_string()))?;
            agents.add(name, profile);
        }
        for extra in agent_defs.keys() {
            warn!("Ignoring agent '{}' in {}: not part of the crew", extra, AGENTS_FILE);
        }

        let mut tasks: Vec<NamedTask> = Vec::with_capacity(TASK_NAMES.len());
        for name in TASK_NAMES {
            let spec = task_defs
                .remove(name)
                .ok_or_else(|| ProjectError::MissingTask(name.to_string()))?;

            if agents.get(&spec.agent).is_none() {
                return Err(ProjectError::UnknownAgent {
                    task: name.to_string(),
                    agent: spec.agent.clone(),
                });
            }
            if let Some(context) = &spec.context {
                for dep in context {
                    if !tasks.iter().any(|t| &t.name == dep) {
                        return Err(ProjectError::InvalidContext {
                            task: name.to_string(),
                            context: dep.clone(),
                        });
                    }
                }
            }

            tasks.push(NamedTask {
                name: name.to_string(),
                spec,
            });
        }
        for extra in task_defs.keys() {
            warn!("Ignoring task '{}' in {}: not part of the crew", extra, TASKS_FILE);
        }

        debug!(
            "Crew project loaded: {} agents, {} tasks",
            agents.len(),
            tasks.len()
        );
        Ok(Self { agents, tasks })
    }
}

fn read_or_bundled(
    dir: Option<&Path>,
    file: &str,
    bundled: &'static str,
) -> Result<String, ProjectError> {
    if let Some(dir) = dir {
        let path = dir.join(file);
        if path.exists() {
            info!("Loading {} from {}", file, path.display());
            return std::fs::read_to_string(&path).map_err(|source| ProjectError::Read {
                path: path.clone(),
                source,
            });
        }
        debug!("{} not found, using bundled definition", path.display());
    }
    Ok(bundled.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENTS: &str = r#"
Supervisor_agent: {role: Supervisor, goal: g, backstory: b}
email_processor: {role: Email, goal: g, backstory: b}
calendar_manager: {role: Calendar, goal: g, backstory: b, llm: "gemini/gemini-1.5-pro"}
document_manager: {role: Docs, goal: g, backstory: b}
spreadsheet_manager: {role: Sheets, goal: g, backstory: b, verbose: false}
"#;

    fn tasks_yaml(extra_context: &str) -> String {
        format!(
            r#"
orchestrate_workflow: {{description: d, expected_output: e, agent: Supervisor_agent}}
process_email: {{description: d, expected_output: e, agent: email_processor}}
schedule_meeting: {{description: d, expected_output: e, agent: calendar_manager{}}}
generate_document: {{description: d, expected_output: e, agent: document_manager}}
update_spreadsheet: {{description: d, expected_output: e, agent: spreadsheet_manager}}
"#,
            extra_context
        )
    }

    #[test]
    fn test_bundled_project_is_valid() {
        let project = CrewProject::bundled().unwrap();
        assert_eq!(project.agents.names(), AGENT_NAMES.to_vec());
        let names: Vec<&str> = project.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, TASK_NAMES.to_vec());
        assert_eq!(project.tasks[0].spec.agent, "Supervisor_agent");
        assert_eq!(project.tasks[4].spec.agent, "spreadsheet_manager");
    }

    #[test]
    fn test_from_yaml_keeps_task_order() {
        let project = CrewProject::from_yaml(AGENTS, &tasks_yaml("")).unwrap();
        assert_eq!(project.tasks.len(), 5);
        assert_eq!(project.tasks[2].name, "schedule_meeting");
        assert_eq!(
            project.agents.get("calendar_manager").unwrap().llm.as_deref(),
            Some("gemini/gemini-1.5-pro")
        );
        assert!(!project.agents.get("spreadsheet_manager").unwrap().verbose);
    }

    #[test]
    fn test_missing_agent() {
        let agents = AGENTS.replace("document_manager", "doc_writer");
        let err = CrewProject::from_yaml(&agents, &tasks_yaml("")).unwrap_err();
        assert!(matches!(err, ProjectError::MissingAgent(name) if name == "document_manager"));
    }

    #[test]
    fn test_missing_task() {
        let tasks = tasks_yaml("").replace("process_email:", "triage_email:");
        let err = CrewProject::from_yaml(AGENTS, &tasks).unwrap_err();
        assert!(matches!(err, ProjectError::MissingTask(name) if name == "process_email"));
    }

    #[test]
    fn test_unknown_agent_reference() {
        let tasks = tasks_yaml("").replace("agent: email_processor", "agent: mailer");
        let err = CrewProject::from_yaml(AGENTS, &tasks).unwrap_err();
        assert_eq!(
            err.to_string(),
            "task 'process_email' is assigned to unknown agent 'mailer'"
        );
    }

    #[test]
    fn test_context_must_run_earlier() {
        let ok = CrewProject::from_yaml(AGENTS, &tasks_yaml(", context: [process_email]")).unwrap();
        assert_eq!(
            ok.tasks[2].spec.context,
            Some(vec!["process_email".to_string()])
        );

        let err = CrewProject::from_yaml(AGENTS, &tasks_yaml(", context: [generate_document]"))
            .unwrap_err();
        assert!(matches!(err, ProjectError::InvalidContext { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = CrewProject::from_yaml("- not a map", &tasks_yaml("")).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse agents.yaml"));
    }

    #[test]
    fn test_load_from_dir_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(AGENTS_FILE), AGENTS).unwrap();

        let project = CrewProject::load(Some(dir.path())).unwrap();
        assert_eq!(project.agents.get("email_processor").unwrap().role, "Email");
        // tasks.yaml is absent, so the bundled tasks are used
        assert!(project.tasks[0].spec.description.contains("{action}"));
    }

    #[test]
    fn test_load_without_dir_uses_bundled() {
        let project = CrewProject::load(None).unwrap();
        assert_eq!(project.agents.len(), 5);
    }
}
