use std::{env, path::PathBuf, time::Duration};

use color_eyre::Result;
use config::{Environment, File};
use directories::ProjectDirs;
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer};
use strum::Display;

const DEFAULT_CONFIG: &str = include_str!("../.config/config.json5");

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub config_dir: PathBuf,
}

/// What the flush cycle does with a sale the server answered with a rejection.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectedSalePolicy {
    /// Keep it queued and try again on the next flush, same as a transport failure.
    #[default]
    Retry,
    /// Move it to the parked list, where the operator can inspect or discard it.
    Park,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(deserialize_with = "human_duration")]
    pub debounce: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub saved_display: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub refresh_interval: Duration,
    #[serde(default)]
    pub rejected_sales: RejectedSalePolicy,
    #[serde(default = "default_store_file")]
    pub store_file: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            saved_display: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
            rejected_sales: RejectedSalePolicy::default(),
            store_file: default_store_file(),
        }
    }
}

fn default_store_file() -> String {
    "cantina-sync.sqlite".into()
}

fn human_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default, flatten)]
    pub config: AppConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase().to_string();
    pub static ref DATA_FOLDER: Option<PathBuf> =
        env::var(format!("{}_DATA", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_CONFIG", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
}

impl Config {
    pub fn new() -> Result<Self, config::ConfigError> {
        let data_dir = get_data_dir();
        let config_dir = get_config_dir();

        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.to_string_lossy().to_string())?
            .set_default("config_dir", config_dir.to_string_lossy().to_string())?
            .add_source(File::from_str(DEFAULT_CONFIG, config::FileFormat::Json5));

        let config_files = [
            ("config.json5", config::FileFormat::Json5),
            ("config.json", config::FileFormat::Json),
            ("config.yaml", config::FileFormat::Yaml),
            ("config.toml", config::FileFormat::Toml),
        ];
        for (file, format) in &config_files {
            let source = config::File::from(config_dir.join(file))
                .format(*format)
                .required(false);
            builder = builder.add_source(source);
        }

        builder
            .add_source(Environment::with_prefix(&PROJECT_NAME).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn store_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.sync.store_file)
    }
}

pub fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("plus.lit", "", env!("CARGO_PKG_NAME"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn from_json5(extra: &str) -> Config {
        config::Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, config::FileFormat::Json5))
            .add_source(File::from_str(extra, config::FileFormat::Json5))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn embedded_defaults_match_code_defaults() {
        let config = from_json5("{}");
        let fallback = SyncConfig::default();

        assert_eq!(config.sync.debounce, fallback.debounce);
        assert_eq!(config.sync.saved_display, fallback.saved_display);
        assert_eq!(config.sync.refresh_interval, fallback.refresh_interval);
        assert_eq!(config.sync.rejected_sales, RejectedSalePolicy::Retry);
        assert_eq!(config.sync.store_file, "cantina-sync.sqlite");
    }

    #[test]
    fn user_file_overrides_durations_and_policy() {
        let config = from_json5(
            r#"{ "sync": { "debounce": "1s 200ms", "rejected_sales": "park" } }"#,
        );

        assert_eq!(config.sync.debounce, Duration::from_millis(1200));
        assert_eq!(config.sync.rejected_sales, RejectedSalePolicy::Park);
        assert_eq!(config.sync.saved_display, Duration::from_secs(2));
    }
}
