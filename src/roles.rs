use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Per-role proactive-message configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_minutes: u64,
    #[serde(default = "default_quiet_start")]
    pub quiet_hours_start: u32,
    #[serde(default = "default_quiet_end")]
    pub quiet_hours_end: u32,
    #[serde(default)]
    pub trigger_prompt: String,
}

fn default_min_interval() -> u64 {
    30
}

fn default_max_interval() -> u64 {
    120
}

fn default_quiet_start() -> u32 {
    23
}

fn default_quiet_end() -> u32 {
    7
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_minutes: default_min_interval(),
            max_interval_minutes: default_max_interval(),
            quiet_hours_start: default_quiet_start(),
            quiet_hours_end: default_quiet_end(),
            trigger_prompt: String::new(),
        }
    }
}

/// Cycle parameters stored on the profile. Lengths are lazily initialized
/// with randomized defaults the first time the cycle is queried; the
/// advancing `last_period_start` lives in the memory store's meta table
/// (the profile value only seeds the first computation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenstruationCycle {
    #[serde(default)]
    pub cycle_length: Option<u32>,
    #[serde(default)]
    pub period_length: Option<u32>,
    #[serde(default)]
    pub last_period_start: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub ai_api_url: Option<String>,
    #[serde(default)]
    pub ai_api_key: Option<String>,
    #[serde(default)]
    pub ai_temperature: Option<f32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub menstruation_cycle: Option<MenstruationCycle>,
    #[serde(default)]
    pub proactive_config: ProactiveConfig,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RoleProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            persona: String::new(),
            system_prompt: String::new(),
            ai_model: None,
            ai_api_url: None,
            ai_api_key: None,
            ai_temperature: None,
            gender: None,
            menstruation_cycle: None,
            proactive_config: ProactiveConfig::default(),
            metadata: HashMap::new(),
        }
    }

    /// String-valued metadata lookup (non-string values are ignored).
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.as_str())
    }
}

/// File-backed role collaborator: one `profile.json` per role directory.
/// Profile CRUD itself is owned by an external service; the core reads
/// profiles and writes back only cycle-parameter initialization.
pub struct RoleStore {
    roles_dir: PathBuf,
}

impl RoleStore {
    pub fn new(roles_dir: PathBuf) -> Self {
        Self { roles_dir }
    }

    pub fn roles_dir(&self) -> &PathBuf {
        &self.roles_dir
    }

    fn profile_path(&self, role_id: &str) -> PathBuf {
        self.roles_dir.join(role_id).join("profile.json")
    }

    /// Directory holding the role's emoji assets for one emotion tag.
    pub fn emoji_dir(&self, role_id: &str, emotion: &str) -> PathBuf {
        self.roles_dir.join(role_id).join("emojis").join(emotion)
    }

    pub fn load(&self, role_id: &str) -> Result<Option<RoleProfile>> {
        let path = self.profile_path(role_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read role profile {:?}", path))?;
        let mut profile: RoleProfile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse role profile {:?}", path))?;
        if profile.id.is_empty() {
            profile.id = role_id.to_string();
        }
        Ok(Some(profile))
    }

    pub fn save(&self, profile: &RoleProfile) -> Result<()> {
        let path = self.profile_path(&profile.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create role directory {:?}", parent))?;
        }
        let contents =
            serde_json::to_string_pretty(profile).context("Failed to serialize role profile")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write role profile {:?}", path))?;
        Ok(())
    }

    /// All roles with a readable profile, in directory order. Unparseable
    /// profiles are skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<RoleProfile>> {
        let mut roles = Vec::new();
        if !self.roles_dir.exists() {
            return Ok(roles);
        }
        for entry in fs::read_dir(&self.roles_dir)
            .with_context(|| format!("Failed to read roles directory {:?}", self.roles_dir))?
        {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let role_id = entry.file_name().to_string_lossy().to_string();
            match self.load(&role_id) {
                Ok(Some(profile)) => roles.push(profile),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Skipping unreadable role profile '{}': {}", role_id, error);
                }
            }
        }
        Ok(roles)
    }
}
