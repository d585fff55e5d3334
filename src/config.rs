use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::execution::RunnerOptions;

pub const CONFIG_FILE: &str = "testloop.toml";
pub const DEFAULT_FILTER_FILE: &str = "testloop.filters";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub project: Project,
    #[serde(default)]
    pub runner: RunnerSection,
    pub worker: WorkerSection,
    #[serde(default)]
    pub watch: WatchSection,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Project {
    pub name: String,
    /// Class output directories, as glob patterns
    #[serde(default = "default_class_dirs")]
    pub class_dirs: Vec<String>,
    #[serde(default)]
    pub filter_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    /// Program and arguments; `$VAR` and `~` are expanded
    pub command: Vec<String>,
    /// Keep healthy workers alive between dispatches
    #[serde(default)]
    pub reuse: bool,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_class_dirs() -> Vec<String> {
    vec!["target/classes".to_string(), "target/test-classes".to_string()]
}

fn default_concurrency() -> usize {
    RunnerOptions::default().concurrency
}

fn default_batch_size() -> usize {
    1
}

fn default_event_capacity() -> usize {
    4096
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    300
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&content, base_dir)
    }

    pub fn parse(content: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: Config = toml::from_str(content).with_context(|| format!("Failed to parse {}", CONFIG_FILE))?;
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.runner.concurrency == 0 {
            anyhow::bail!("runner.concurrency must be at least 1");
        }
        if self.runner.batch_size == 0 {
            anyhow::bail!("runner.batch_size must be at least 1");
        }
        if self.worker.command.iter().all(|part| part.trim().is_empty()) {
            anyhow::bail!("worker.command must name a program");
        }
        if self.project.class_dirs.is_empty() {
            anyhow::bail!("project.class_dirs must list at least one directory");
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Expand `project.class_dirs` into directories. Plain paths are kept
    /// even when they do not exist yet, since the build may not have run.
    pub fn class_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();

        for pattern in &self.project.class_dirs {
            let full = self.base_dir.join(pattern);
            let full_str = full.to_string_lossy();

            if !is_glob(pattern) {
                dirs.push(full);
                continue;
            }

            let matches = glob::glob(&full_str)
                .with_context(|| format!("Invalid class_dirs pattern: {}", pattern))?;
            for entry in matches.flatten() {
                if entry.is_dir() {
                    dirs.push(entry);
                }
            }
        }

        dirs.sort();
        dirs.dedup();
        Ok(dirs)
    }

    pub fn filter_file(&self) -> PathBuf {
        let name = self.project.filter_file.as_deref().unwrap_or(DEFAULT_FILTER_FILE);
        self.base_dir.join(name)
    }

    pub fn worker_command(&self) -> Result<Vec<String>> {
        self.worker
            .command
            .iter()
            .map(|part| {
                shellexpand::full(part)
                    .map(|expanded| expanded.into_owned())
                    .with_context(|| format!("Failed to expand worker command argument '{}'", part))
            })
            .collect()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.shutdown_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            concurrency: self.runner.concurrency,
            batch_size: self.runner.batch_size,
            event_capacity: self.runner.event_capacity,
        }
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[project]
name = "acme"

[worker]
command = ["java", "-cp", "lib/*", "org.acme.WorkerMain"]
"#;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[project]
name = "acme"
class_dirs = ["build/classes", "modules/*/target/classes"]
filter_file = "acme.filters"

[runner]
concurrency = 4
batch_size = 2

[worker]
command = ["java", "WorkerMain"]
reuse = true
shutdown_timeout_ms = 500

[watch]
debounce_ms = 100
"#;

        let config = Config::parse(toml_content, PathBuf::from("/work")).unwrap();
        assert_eq!(config.project.name, "acme");
        assert_eq!(config.project.class_dirs.len(), 2);
        assert_eq!(config.runner.concurrency, 4);
        assert_eq!(config.runner.batch_size, 2);
        assert_eq!(config.runner.event_capacity, 4096);
        assert!(config.worker.reuse);
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(500));
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.filter_file(), PathBuf::from("/work/acme.filters"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(MINIMAL, PathBuf::from("/work")).unwrap();
        assert_eq!(config.project.class_dirs, default_class_dirs());
        assert_eq!(config.runner.batch_size, 1);
        assert!(config.runner.concurrency >= 1);
        assert!(!config.worker.reuse);
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.filter_file(), PathBuf::from("/work/testloop.filters"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let content = format!("{MINIMAL}\n[runner]\nconcurrency = 0\n");
        assert!(Config::parse(&content, PathBuf::from(".")).is_err());
    }

    #[test]
    fn test_rejects_empty_command() {
        let content = r#"
[project]
name = "acme"

[worker]
command = []
"#;
        assert!(Config::parse(content, PathBuf::from(".")).is_err());
    }

    #[test]
    fn test_class_dirs_expand_globs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("modules/core/target/classes")).unwrap();
        fs::create_dir_all(dir.path().join("modules/web/target/classes")).unwrap();

        let content = r#"
[project]
name = "acme"
class_dirs = ["modules/*/target/classes", "legacy/bin"]

[worker]
command = ["worker"]
"#;
        let config = Config::parse(content, dir.path().to_path_buf()).unwrap();
        let dirs = config.class_dirs().unwrap();

        assert_eq!(
            dirs,
            vec![
                dir.path().join("legacy/bin"),
                dir.path().join("modules/core/target/classes"),
                dir.path().join("modules/web/target/classes"),
            ]
        );
    }

    #[test]
    fn test_worker_command_expands_env() {
        std::env::set_var("TESTLOOP_TEST_CLASSPATH", "/opt/acme/lib");
        let content = r#"
[project]
name = "acme"

[worker]
command = ["java", "-cp", "$TESTLOOP_TEST_CLASSPATH", "WorkerMain"]
"#;
        let config = Config::parse(content, PathBuf::from(".")).unwrap();
        assert_eq!(
            config.worker_command().unwrap(),
            vec!["java", "-cp", "/opt/acme/lib", "WorkerMain"]
        );
    }
}
