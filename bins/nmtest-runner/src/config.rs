// Runner configuration: defaults < JSON file < NMTEST_* environment < CLI flags
use crate::compiler::{CompilerSearch, DEFAULT_ARTIFACT_PREFIX};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/nmtest.json";
pub const DEFAULT_ENTRY_EXPORT: &str = "main";
pub const DEFAULT_NODE_COMMAND: &str = "node";

/// How aggregated results are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResultOrder {
    /// Grouped by shard, discovery order within each shard
    #[default]
    Shard,
    /// Original discovery order across all inputs
    Discovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Where to start looking for compiler artifacts
    pub compiler_dir: Option<PathBuf>,
    /// Install location of the runner, searched after the working directory
    pub install_dir: Option<PathBuf>,
    /// Worker count; `None` means one per available CPU
    pub jobs: Option<usize>,
    pub entry_export: String,
    pub profile: Option<String>,
    pub node_command: String,
    pub artifact_prefix: String,
    pub result_order: ResultOrder,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            compiler_dir: None,
            install_dir: None,
            jobs: None,
            entry_export: DEFAULT_ENTRY_EXPORT.to_string(),
            profile: None,
            node_command: DEFAULT_NODE_COMMAND.to_string(),
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
            result_order: ResultOrder::default(),
        }
    }
}

impl RunnerConfig {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Runner config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// File layer plus environment layer. An explicit path must exist; the
    /// default `config/nmtest.json` under `working_dir` is optional.
    pub fn load_layered(explicit: Option<&Path>, working_dir: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(&working_dir.join(path))?,
            None => {
                let default_path = working_dir.join(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::load(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `NMTEST_*` variables, read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("NMTEST_COMPILER_DIR") {
            self.compiler_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("NMTEST_INSTALL_DIR") {
            self.install_dir = Some(PathBuf::from(dir));
        }
        if let Some(jobs) = lookup("NMTEST_JOBS") {
            let jobs = jobs
                .trim()
                .parse::<usize>()
                .with_context(|| format!("NMTEST_JOBS must be a non-negative integer, got {:?}", jobs))?;
            self.jobs = Some(jobs);
        }
        if let Some(node) = lookup("NMTEST_NODE") {
            self.node_command = node;
        }
        if let Some(profile) = lookup("NMTEST_PROFILE") {
            self.profile = (!profile.is_empty()).then_some(profile);
        }
        Ok(())
    }

    /// Compiler lookup parameters rooted at an explicit working directory.
    pub fn compiler_search(&self, working_dir: &Path) -> CompilerSearch {
        CompilerSearch {
            hint: self.compiler_dir.clone(),
            install_dir: self.install_dir.clone(),
            prefix: self.artifact_prefix.clone(),
            ..CompilerSearch::new(working_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.entry_export, "main");
        assert_eq!(config.node_command, "node");
        assert_eq!(config.artifact_prefix, "nepl-web-");
        assert_eq!(config.result_order, ResultOrder::Shard);
        assert!(config.jobs.is_none());
    }

    #[test]
    fn test_load_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nmtest.json");
        fs::write(&path, r#"{ "jobs": 4, "result_order": "discovery" }"#).unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.jobs, Some(4));
        assert_eq!(config.result_order, ResultOrder::Discovery);
        assert_eq!(config.entry_export, "main");
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(RunnerConfig::load(&tmp.path().join("absent.json")).is_err());

        let path = tmp.path().join("bad.json");
        fs::write(&path, "{ jobs: ").unwrap();
        let err = RunnerConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse"));
    }

    #[test]
    fn test_layered_uses_default_path_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            RunnerConfig::load_layered(None, tmp.path()).unwrap().entry_export,
            "main"
        );

        fs::create_dir(tmp.path().join("config")).unwrap();
        fs::write(
            tmp.path().join(DEFAULT_CONFIG_PATH),
            r#"{ "entry_export": "run" }"#,
        )
        .unwrap();
        let config = RunnerConfig::load_layered(None, tmp.path()).unwrap();
        assert_eq!(config.entry_export, "run");

        assert!(RunnerConfig::load_layered(Some(Path::new("nope.json")), tmp.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        config
            .apply_env(env_of(&[
                ("NMTEST_COMPILER_DIR", "/opt/web/dist"),
                ("NMTEST_JOBS", " 3 "),
                ("NMTEST_NODE", "/usr/local/bin/node"),
                ("NMTEST_PROFILE", "debug"),
            ]))
            .unwrap();
        assert_eq!(config.compiler_dir, Some(PathBuf::from("/opt/web/dist")));
        assert_eq!(config.jobs, Some(3));
        assert_eq!(config.node_command, "/usr/local/bin/node");
        assert_eq!(config.profile.as_deref(), Some("debug"));

        config.apply_env(env_of(&[("NMTEST_PROFILE", "")])).unwrap();
        assert!(config.profile.is_none());
    }

    #[test]
    fn test_env_rejects_bad_jobs() {
        let mut config = RunnerConfig::default();
        let err = config
            .apply_env(env_of(&[("NMTEST_JOBS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("NMTEST_JOBS"));
    }

    #[test]
    fn test_compiler_search() {
        let mut config = RunnerConfig::default();
        config.compiler_dir = Some(PathBuf::from("web/dist"));
        let search = config.compiler_search(Path::new("/work"));
        assert_eq!(search.working_dir, PathBuf::from("/work"));
        assert_eq!(search.prefix, "nepl-web-");
        assert_eq!(search.candidate_dirs()[0], PathBuf::from("/work/web/dist"));
    }
}
