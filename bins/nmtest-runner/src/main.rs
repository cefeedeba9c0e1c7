mod compiler;
mod config;
mod engine;
mod evaluator;
mod executor;
mod extract;
mod scheduler;
mod value;
mod wasi;


use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use compiler::ScriptLoader;
use config::{ResultOrder, RunnerConfig};
use nmtest_common::TestCase;
use scheduler::RunPlan;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "nmtest")]
#[command(about = "Run doctests embedded in .nepl sources and .n.md documents", long_about = None)]
struct Cli {
    /// Input file (.nepl or .n.md); repeatable
    #[arg(short, long = "input")]
    inputs: Vec<PathBuf>,

    /// Directory whose .nepl and .n.md files are all added as inputs
    #[arg(long)]
    tests_dir: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of workers (defaults to available CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Directory to start the compiler artifact search from
    #[arg(long)]
    compiler_dir: Option<PathBuf>,

    /// Install location searched after the working directory
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Compile every test with this profile
    #[arg(long)]
    profile: Option<String>,

    /// Export called for tests with a return expectation
    #[arg(long)]
    entry: Option<String>,

    /// Result ordering in the report
    #[arg(long, value_enum)]
    result_order: Option<ResultOrder>,

    /// JSON config file (defaults to config/nmtest.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    /// Flags take precedence over every other configuration layer.
    fn apply_to(&self, config: &mut RunnerConfig) {
        if let Some(dir) = &self.compiler_dir {
            config.compiler_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.install_dir {
            config.install_dir = Some(dir.clone());
        }
        if let Some(jobs) = self.jobs {
            config.jobs = Some(jobs);
        }
        if let Some(profile) = &self.profile {
            config.profile = Some(profile.clone());
        }
        if let Some(entry) = &self.entry {
            config.entry_export = entry.clone();
        }
        if let Some(order) = self.result_order {
            config.result_order = order;
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let working_dir = std::env::current_dir().context("Failed to resolve working directory")?;

    let mut config = RunnerConfig::load_layered(cli.config.as_deref(), &working_dir)?;
    cli.apply_to(&mut config);
    if config.install_dir.is_none() {
        config.install_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
    }

    let inputs = collect_inputs(&cli, &working_dir)?;
    if inputs.is_empty() {
        error!("No inputs: pass -i FILE or --tests-dir DIR");
        return Ok(ExitCode::from(2));
    }

    let tests = extract_all(&inputs)?;
    info!(files = inputs.len(), tests = tests.len(), "Extracted tests");

    let loader = Arc::new(ScriptLoader::new(config.node_command.clone()));
    let plan = RunPlan::from_config(&config, &working_dir);
    let report = scheduler::run_all(tests, plan, loader).await?;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    match &cli.output {
        Some(path) => {
            let path = working_dir.join(path);
            write_report(&path, &json)?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }

    for result in report.results.iter().filter(|r| !r.ok) {
        warn!(
            test = %result.name(),
            file = %result.test.source_file.display(),
            line = result.test.line,
            reason = %result.reason,
            "FAILED"
        );
    }
    eprintln!(
        "summary: total={} passed={} failed={}",
        report.summary.total, report.summary.passed, report.summary.failed
    );

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Explicit inputs first, then the sorted contents of `--tests-dir`.
fn collect_inputs(cli: &Cli, working_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    for input in &cli.inputs {
        let path = working_dir.join(input);
        if extract::origin_for(&path).is_some() {
            inputs.push(path);
        } else {
            warn!(path = %path.display(), "Ignoring input that is neither .nepl nor .n.md");
        }
    }

    if let Some(dir) = &cli.tests_dir {
        let dir = working_dir.join(dir);
        let mut found: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read tests directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && extract::origin_for(path).is_some())
            .collect();
        found.sort();
        inputs.extend(found);
    }

    Ok(inputs)
}

fn extract_all(inputs: &[PathBuf]) -> Result<Vec<TestCase>> {
    let mut tests = Vec::new();
    for path in inputs {
        let found = extract::extract_file(path)
            .with_context(|| format!("Failed to extract tests from {}", path.display()))?;
        tests.extend(found);
    }
    Ok(tests)
}

/// Write the JSON report, creating missing parent directories.
fn write_report(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
}
