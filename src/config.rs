use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Tuning knobs for the memory subsystem.
///
/// `context_window` and `summary_threshold` both default to 60 but are
/// deliberately independent: one sizes the served context block, the other
/// gates core-memory compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTuning {
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: u32,
    #[serde(default = "default_bridge_gap_secs")]
    pub bridge_gap_secs: i64,
}

fn default_context_window() -> usize {
    60
}

fn default_summary_threshold() -> u32 {
    60
}

fn default_bridge_gap_secs() -> i64 {
    1200
}

impl Default for MemoryTuning {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            summary_threshold: default_summary_threshold(),
            bridge_gap_secs: default_bridge_gap_secs(),
        }
    }
}

/// Fixed worker identities whose role profiles carry the credentials used
/// for background passes (bridging memory, emotion classification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentities {
    #[serde(default = "default_bridge_worker")]
    pub bridge_role_id: String,
    #[serde(default = "default_classifier_worker")]
    pub classifier_role_id: String,
}

fn default_bridge_worker() -> String {
    "worker_bridge".to_string()
}

fn default_classifier_worker() -> String {
    "worker_classifier".to_string()
}

impl Default for WorkerIdentities {
    fn default() -> Self {
        Self {
            bridge_role_id: default_bridge_worker(),
            classifier_role_id: default_classifier_worker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTuning {
    #[serde(default = "default_moment_check_interval_hours")]
    pub moment_check_interval_hours: u64,
    #[serde(default = "default_moment_post_probability")]
    pub moment_post_probability: f64,
}

fn default_moment_check_interval_hours() -> u64 {
    3
}

fn default_moment_post_probability() -> f64 {
    0.3
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            moment_check_interval_hours: default_moment_check_interval_hours(),
            moment_post_probability: default_moment_post_probability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Role/task data lives in a file tree owned by the CRUD collaborator;
    // the core only reads profiles and task records from it.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Global AI endpoint defaults (OpenAI-compatible). Per-role overrides
    // layer on top of these, see gateway::AiSettings::resolve.
    #[serde(default)]
    pub ai_api_url: String,
    #[serde(default = "default_ai_model")]
    pub ai_model: String,
    #[serde(default)]
    pub ai_api_key: Option<String>,
    #[serde(default = "default_ai_temperature")]
    pub ai_temperature: f32,

    /// Roles whose `gender` equals this marker get the physiological-cycle
    /// narrative in their chat context.
    #[serde(default = "default_cycle_gender_marker")]
    pub cycle_gender_marker: String,

    #[serde(default)]
    pub memory: MemoryTuning,
    #[serde(default)]
    pub workers: WorkerIdentities,
    #[serde(default)]
    pub scheduler: SchedulerTuning,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_path() -> String {
    "companion_memory.db".to_string()
}

fn default_ai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_ai_temperature() -> f32 {
    0.7
}

fn default_cycle_gender_marker() -> String {
    "female".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            ai_api_url: String::new(),
            ai_model: default_ai_model(),
            ai_api_key: None,
            ai_temperature: default_ai_temperature(),
            cycle_gender_marker: default_cycle_gender_marker(),
            memory: MemoryTuning::default(),
            workers: WorkerIdentities::default(),
            scheduler: SchedulerTuning::default(),
        }
    }
}

impl AppConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable).
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load config from companion_config.toml, falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to the executable).
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = env::var("COMPANION_BIND") {
            config.bind_addr = addr;
        }

        if let Ok(dir) = env::var("COMPANION_DATA_DIR") {
            config.data_dir = dir;
        }

        if let Ok(path) = env::var("COMPANION_DATABASE_PATH") {
            config.database_path = path;
        }

        if let Ok(url) = env::var("COMPANION_AI_API_URL") {
            config.ai_api_url = url;
        }

        if let Ok(model) = env::var("COMPANION_AI_MODEL") {
            config.ai_model = model;
        }

        if let Ok(key) = env::var("COMPANION_AI_API_KEY") {
            config.ai_api_key = Some(key);
        }

        if let Ok(temperature) = env::var("COMPANION_AI_TEMPERATURE") {
            if let Ok(value) = temperature.parse() {
                config.ai_temperature = value;
            }
        }

        config
    }

    pub fn roles_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("roles")
    }

    pub fn tasks_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tasks").join("scheduled.json")
    }
}
