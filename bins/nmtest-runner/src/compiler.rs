/// Compiler Adapter - Locating and Loading the External Compiler
///
/// **Responsibility:**
/// Find a loader-script / payload artifact pair produced by the compiler's
/// web build, load it once, and expose its compile entry points.
///
/// **Lookup order** (deduplicated after lexical normalization):
/// 1. the hint, `hint/dist`, `hint/web/dist`
/// 2. sibling transforms when the hint already ends in `web/dist` or `dist`
/// 3. the working directory, `dist`, `web/dist` under it
/// 4. the install directory, `dist`, `web/dist` under it, and the same two
///    one level up
///
/// Capabilities are probed once at load time. A missing optional entry point
/// is an explicit `None`, never re-probed per call.

use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_ARTIFACT_PREFIX: &str = "nepl-web-";
const SCRIPT_SUFFIX: &str = ".js";
const PAYLOAD_SUFFIX: &str = "_bg.wasm";

pub type CompileFn = Box<dyn Fn(&str) -> Result<Vec<u8>, String> + Send>;
pub type ProfileCompileFn = Box<dyn Fn(&str, &str) -> Result<Vec<u8>, String> + Send>;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no usable compiler artifacts found\n{}", describe_attempts(.tried, .failures))]
    NoArtifacts {
        tried: Vec<PathBuf>,
        failures: Vec<String>,
    },
}

fn describe_attempts(tried: &[PathBuf], failures: &[String]) -> String {
    let mut out = String::from("searched:");
    for dir in tried {
        out.push_str(&format!("\n  {}", dir.display()));
    }
    if !failures.is_empty() {
        out.push_str("\nload failures:");
        for failure in failures {
            out.push_str(&format!("\n  {}", failure));
        }
    }
    out
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct CompileError(pub String);

#[derive(Debug, Error, Clone, PartialEq)]
#[error("compiler at {loader} does not support profile compilation (requested profile `{profile}`)")]
pub struct ProfileUnsupported {
    pub loader: String,
    pub profile: String,
}

/// Where to look and what to look for.
#[derive(Debug, Clone)]
pub struct CompilerSearch {
    pub hint: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub prefix: String,
}

impl CompilerSearch {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            hint: None,
            working_dir: working_dir.into(),
            install_dir: None,
            prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
        }
    }

    /// Ranked, deduplicated candidate directories.
    pub fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(hint) = &self.hint {
            let hint = normalize(&self.working_dir.join(hint));
            push_with_dist(&mut dirs, &hint);
            if hint.ends_with("web/dist") {
                let root = normalize(&hint.join("../.."));
                dirs.push(root.join("dist"));
                dirs.push(root);
            } else if hint.ends_with("dist") {
                let parent = normalize(&hint.join(".."));
                dirs.push(parent.join("web/dist"));
                dirs.push(parent);
            }
        }

        push_with_dist(&mut dirs, &normalize(&self.working_dir));

        if let Some(install) = &self.install_dir {
            let install = normalize(&self.working_dir.join(install));
            push_with_dist(&mut dirs, &install);
            let up = normalize(&install.join(".."));
            dirs.push(up.join("dist"));
            dirs.push(up.join("web/dist"));
        }

        let mut seen = std::collections::HashSet::new();
        dirs.retain(|d| seen.insert(d.clone()));
        dirs
    }
}

fn push_with_dist(dirs: &mut Vec<PathBuf>, base: &Path) {
    dirs.push(base.to_path_buf());
    dirs.push(base.join("dist"));
    dirs.push(base.join("web/dist"));
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// A loader script and the binary payload it initializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    pub script: PathBuf,
    pub payload: PathBuf,
}

/// Find the artifact pair in `dir`, preferring names with a shared stem
/// (`{prefix}X.js` with `{prefix}X_bg.wasm`) and falling back to the first
/// of each kind.
pub fn find_pair(dir: &Path, prefix: &str) -> Option<ArtifactPair> {
    let entries = fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with(prefix))
        .collect();
    names.sort();

    let scripts: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| n.ends_with(SCRIPT_SUFFIX))
        .collect();
    let payloads: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| n.ends_with(PAYLOAD_SUFFIX))
        .collect();

    let paired = scripts.iter().find_map(|script| {
        let stem = &script[..script.len() - SCRIPT_SUFFIX.len()];
        payloads
            .iter()
            .find(|payload| &payload[..payload.len() - PAYLOAD_SUFFIX.len()] == stem)
            .map(|payload| (*script, *payload))
    });

    let (script, payload) = paired.or_else(|| Some((*scripts.first()?, *payloads.first()?)))?;
    Some(ArtifactPair {
        script: dir.join(script),
        payload: dir.join(payload),
    })
}

/// Entry points exposed by a loaded compiler.
pub struct CompilerCapabilities {
    pub compile: CompileFn,
    pub compile_with_profile: Option<ProfileCompileFn>,
}

impl std::fmt::Debug for CompilerCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerCapabilities")
            .field("has_profile_compile", &self.compile_with_profile.is_some())
            .finish_non_exhaustive()
    }
}

/// Turns an artifact pair into callable compile entry points.
pub trait CompilerLoader: Send + Sync {
    fn load(&self, pair: &ArtifactPair) -> anyhow::Result<CompilerCapabilities>;
}

/// A loaded compiler instance. Owned by exactly one execution context.
pub struct Compiler {
    origin: ArtifactPair,
    caps: CompilerCapabilities,
    profile: Option<String>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("origin", &self.origin)
            .field("profile", &self.profile)
            .field("has_profile_compile", &self.caps.compile_with_profile.is_some())
            .finish()
    }
}

impl Compiler {
    pub fn new(origin: ArtifactPair, caps: CompilerCapabilities) -> Self {
        Self {
            origin,
            caps,
            profile: None,
        }
    }

    /// Route every compile through `compile_with_profile`. Fails up front if
    /// the compiler does not expose it.
    pub fn with_profile(mut self, profile: Option<String>) -> Result<Self, ProfileUnsupported> {
        if let Some(name) = &profile {
            if self.caps.compile_with_profile.is_none() {
                return Err(ProfileUnsupported {
                    loader: self.origin.script.display().to_string(),
                    profile: name.clone(),
                });
            }
        }
        self.profile = profile;
        Ok(self)
    }

    pub fn origin(&self) -> &ArtifactPair {
        &self.origin
    }

    pub fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError> {
        let compiled = match (&self.profile, &self.caps.compile_with_profile) {
            (Some(profile), Some(compile)) => compile(source, profile),
            _ => (self.caps.compile)(source),
        };
        compiled.map_err(CompileError)
    }
}

/// Walk the candidate directories and load the first pair that works.
pub fn locate_and_load(
    search: &CompilerSearch,
    loader: &dyn CompilerLoader,
) -> Result<Compiler, LookupError> {
    let tried = search.candidate_dirs();
    let mut failures = Vec::new();

    for dir in &tried {
        let Some(pair) = find_pair(dir, &search.prefix) else {
            continue;
        };
        debug!(script = %pair.script.display(), payload = %pair.payload.display(), "Found compiler artifacts");
        match loader.load(&pair) {
            Ok(caps) => {
                info!(dir = %dir.display(), "Loaded compiler");
                return Ok(Compiler::new(pair, caps));
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Compiler artifacts failed to load");
                failures.push(format!("{}: {:#}", dir.display(), e));
            }
        }
    }

    Err(LookupError::NoArtifacts { tried, failures })
}

/// Node driver: imports the loader script, initializes it with the payload,
/// then either reports which entry points exist or compiles stdin to stdout.
const DRIVER_JS: &str = r#"
import { readFileSync } from 'node:fs';
import { pathToFileURL } from 'node:url';
const env = process.env;
const mod = await import(pathToFileURL(env.NMTEST_LOADER).href);
mod.initSync({ module: readFileSync(env.NMTEST_PAYLOAD) });
if (env.NMTEST_MODE === 'probe') {
  process.stdout.write(JSON.stringify({
    compile: typeof mod.compile_source === 'function',
    compile_with_profile: typeof mod.compile_source_with_profile === 'function',
  }));
} else {
  const source = readFileSync(0, 'utf8');
  let bytes;
  try {
    bytes = env.NMTEST_MODE === 'profile'
      ? mod.compile_source_with_profile(source, env.NMTEST_PROFILE)
      : mod.compile_source(source);
  } catch (e) {
    process.stderr.write(String(e && e.message ? e.message : e));
    process.exit(1);
  }
  process.stdout.write(Buffer.from(bytes));
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProbeReport {
    pub compile: bool,
    pub compile_with_profile: bool,
}

pub fn parse_probe(stdout: &str) -> anyhow::Result<ProbeReport> {
    let report: ProbeReport = serde_json::from_str(stdout.trim())
        .map_err(|e| anyhow::anyhow!("unreadable probe output {:?}: {}", stdout.trim(), e))?;
    if !report.compile {
        anyhow::bail!("loader script does not export compile_source");
    }
    Ok(report)
}

/// Default loader: drives the artifact pair through a `node` subprocess.
#[derive(Debug, Clone)]
pub struct ScriptLoader {
    node: String,
}

impl ScriptLoader {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }
}

impl CompilerLoader for ScriptLoader {
    fn load(&self, pair: &ArtifactPair) -> anyhow::Result<CompilerCapabilities> {
        let probe = run_driver(&self.node, pair, "probe", None, "")
            .map_err(|e| anyhow::anyhow!("probe failed: {}", e))?;
        let report = parse_probe(&String::from_utf8_lossy(&probe))?;
        debug!(?report, "Probed compiler capabilities");

        let (node, loader) = (self.node.clone(), pair.clone());
        let compile: CompileFn =
            Box::new(move |source: &str| run_driver(&node, &loader, "compile", None, source));

        let compile_with_profile = report.compile_with_profile.then(|| {
            let (node, loader) = (self.node.clone(), pair.clone());
            Box::new(move |source: &str, profile: &str| {
                run_driver(&node, &loader, "profile", Some(profile), source)
            }) as ProfileCompileFn
        });

        Ok(CompilerCapabilities {
            compile,
            compile_with_profile,
        })
    }
}

fn run_driver(
    node: &str,
    pair: &ArtifactPair,
    mode: &str,
    profile: Option<&str>,
    stdin: &str,
) -> Result<Vec<u8>, String> {
    let mut command = Command::new(node);
    command
        .args(["--input-type=module", "-e", DRIVER_JS])
        .env("NMTEST_LOADER", &pair.script)
        .env("NMTEST_PAYLOAD", &pair.payload)
        .env("NMTEST_MODE", mode)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(profile) = profile {
        command.env("NMTEST_PROFILE", profile);
    }

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", node, e))?;
    if let Some(mut input) = child.stdin.take() {
        input
            .write_all(stdin.as_bytes())
            .map_err(|e| format!("failed to write source to compiler: {}", e))?;
    }
    let output = child
        .wait_with_output()
        .map_err(|e| format!("compiler process failed: {}", e))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("compiler exited with {}", output.status)
        } else {
            stderr
        })
    }
}
