use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const SETTINGS_FILE: &str = "call_sync.toml";
const ENV_PREFIX: &str = "CALL_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub page_limit: u32,
    pub activity_tick_ms: u64,
    pub activity_rank_ttl_ms: u64,
    pub blockchain_merge_debounce_ms: u64,
    pub member_event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_limit: 100,
            activity_tick_ms: 10_000,
            activity_rank_ttl_ms: 60_000,
            blockchain_merge_debounce_ms: 1_000,
            member_event_buffer: 256,
        }
    }
}

impl EngineSettings {
    pub fn activity_tick(&self) -> Duration {
        Duration::from_millis(self.activity_tick_ms.max(1))
    }

    pub fn activity_rank_ttl(&self) -> Duration {
        Duration::from_millis(self.activity_rank_ttl_ms)
    }

    pub fn blockchain_merge_debounce(&self) -> Duration {
        Duration::from_millis(self.blockchain_merge_debounce_ms)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Defaults, then `call_sync.toml` if present, then `CALL_SYNC__*` env vars.
pub fn load_settings() -> EngineSettings {
    let mut settings = match load_settings_from(Path::new(SETTINGS_FILE)) {
        Ok(settings) => settings,
        Err(SettingsError::Read { .. }) => EngineSettings::default(),
        Err(err) => {
            warn!("settings: {err}; falling back to defaults");
            EngineSettings::default()
        }
    };
    apply_overrides(&mut settings, std::env::vars());
    settings
}

pub fn load_settings_from(path: &Path) -> Result<EngineSettings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<EngineSettings>(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn apply_overrides<I>(settings: &mut EngineSettings, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: HashMap<String, String> = vars
        .into_iter()
        .filter_map(|(key, value)| Some((key.strip_prefix(ENV_PREFIX)?.to_ascii_lowercase(), value)))
        .collect();

    override_value(&vars, "page_limit", &mut settings.page_limit);
    override_value(&vars, "activity_tick_ms", &mut settings.activity_tick_ms);
    override_value(&vars, "activity_rank_ttl_ms", &mut settings.activity_rank_ttl_ms);
    override_value(
        &vars,
        "blockchain_merge_debounce_ms",
        &mut settings.blockchain_merge_debounce_ms,
    );
    override_value(&vars, "member_event_buffer", &mut settings.member_event_buffer);
}

fn override_value<T: FromStr>(vars: &HashMap<String, String>, key: &str, target: &mut T) {
    let Some(raw) = vars.get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "settings: ignoring unparseable override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
