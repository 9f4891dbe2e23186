// External crates
use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::instrument;

/// Top-level configuration document.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tailf: TailfConfig,
    pub kafka: KafkaConfig,
}

/// One `[[tailf.files]]` entry: which files to follow and where their lines go.
///
/// `prefix` carries both the watched directory and the basename prefix in a
/// single string, e.g. `/var/log/app-`. `time_pattern` is a strftime-style
/// pattern (`%Y-%m-%d`) naming the rotation bucket.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSpecConfig {
    pub topic: String,
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    pub time_pattern: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailfConfig {
    pub files: Vec<FileSpecConfig>,
    pub position_file: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default = "default_max_batch_lines")]
    pub max_batch_lines: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
    // The key has carried this spelling since the first deployment; renaming
    // it would break every config in the field.
    #[serde(rename = "from_begining")]
    pub from_beginning: bool,
    #[serde(default)]
    pub delete_old_tailed_files: bool,
    #[serde(default)]
    pub post_delete_command: Option<String>,
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub producer_type: ProducerType,
    #[serde(default = "default_produce")]
    pub produce: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Sync,
    Async,
}

fn default_flush_interval() -> u64 {
    1
}

fn default_max_batch_lines() -> usize {
    1024
}

fn default_max_batches() -> usize {
    10
}

fn default_produce() -> bool {
    true
}

impl Config {
    /// Load and parse the configuration file.
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {:?}", path_ref))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse TOML from {:?}", path_ref))?;

        config.validate()?;

        tracing::debug!(
            configuration_file_path = %path_ref.display(),
            files = config.tailf.files.len(),
            "Configuration file loaded"
        );
        Ok(config)
    }

    /// Cross-field rules serde cannot express. Paths, topics and patterns end
    /// up space-separated in the position file, so none of them may contain
    /// whitespace.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.tailf.files.is_empty(),
            "tailf.files must list at least one file spec"
        );
        ensure!(
            !self.tailf.position_file.is_empty(),
            "tailf.position_file must not be empty"
        );
        ensure!(
            no_whitespace(&self.tailf.position_file),
            "tailf.position_file must not contain whitespace"
        );
        ensure!(
            self.tailf.flush_interval >= 1,
            "tailf.flush_interval must be at least 1 second"
        );
        ensure!(
            self.tailf.max_batch_lines >= 1,
            "tailf.max_batch_lines must be at least 1"
        );
        ensure!(
            self.tailf.max_batches >= 1,
            "tailf.max_batches must be at least 1"
        );
        ensure!(
            !self.kafka.brokers.is_empty(),
            "kafka.brokers must list at least one broker"
        );

        for (i, spec) in self.tailf.files.iter().enumerate() {
            ensure!(
                !spec.topic.is_empty() && no_whitespace(&spec.topic),
                "tailf.files[{i}].topic must be non-empty and contain no whitespace"
            );
            ensure!(
                !spec.prefix.is_empty() && no_whitespace(&spec.prefix),
                "tailf.files[{i}].prefix must be non-empty and contain no whitespace"
            );
            ensure!(
                no_whitespace(&spec.suffix),
                "tailf.files[{i}].suffix must contain no whitespace"
            );
            ensure!(
                !spec.time_pattern.is_empty() && no_whitespace(&spec.time_pattern),
                "tailf.files[{i}].time_pattern must be non-empty and contain no whitespace"
            );
        }

        Ok(())
    }
}

fn no_whitespace(s: &str) -> bool {
    !s.chars().any(char::is_whitespace)
}
