use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// A persisted one-shot task. Task CRUD belongs to an external collaborator;
/// the scheduler only reads enabled future tasks and fires each once.
/// `repeat` is parsed for compatibility but carries one-shot-only semantics
/// (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    pub role_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ai_prompt: String,
    pub trigger_time: String,
    #[serde(default)]
    pub repeat: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTask {
    /// Prompt handed to the dispatcher: the AI prompt when set, otherwise
    /// the plain message.
    pub fn prompt(&self) -> &str {
        if self.ai_prompt.is_empty() {
            &self.message
        } else {
            &self.ai_prompt
        }
    }

    /// Trigger time parsed as local wall-clock time. Accepts RFC3339 or a
    /// naive ISO timestamp (the legacy task files carry the latter).
    pub fn trigger_time_local(&self) -> Option<DateTime<Local>> {
        parse_local_timestamp(&self.trigger_time)
    }
}

pub fn parse_local_timestamp(raw: &str) -> Option<DateTime<Local>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Local));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Local.from_local_datetime(&naive).single();
        }
    }
    None
}

/// Read-only view over the task collaborator's `scheduled.json`.
pub struct TaskStore {
    tasks_file: PathBuf,
}

impl TaskStore {
    pub fn new(tasks_file: PathBuf) -> Self {
        Self { tasks_file }
    }

    /// All persisted tasks; a missing file means no tasks.
    pub fn load(&self) -> Result<Vec<ScheduledTask>> {
        if !self.tasks_file.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.tasks_file)
            .with_context(|| format!("Failed to read tasks file {:?}", self.tasks_file))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse tasks file {:?}", self.tasks_file))
    }
}
