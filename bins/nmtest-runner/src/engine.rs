/// Execution Engine - Running Compiled Modules
///
/// **Core Responsibility:**
/// Execute a compiled binary module and capture raw outcomes.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (simulated WASI process, direct entry call)
/// - Engine does NOT know expectations or attributes
/// - Engine returns raw outcomes for the evaluator to judge
///
/// **Two modes:**
/// 1. Sandboxed run: `_start` under a simulated WASI process with captured
///    stdio. Traps become exit codes.
/// 2. Direct call: instantiate with the least permissive import shape that
///    links, call the entry export with no arguments, and hand back its
///    return value (plus linear memory when a string must be decoded).

use crate::wasi::{self, HasProcess, SimulatedProcess};
use nmtest_common::RuntimeSnapshot;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::debug;
use wasmi::core::{Trap, F32, F64};
use wasmi::{Caller, Engine, Extern, Instance, Linker, Module, Store};

const START_EXPORT: &str = "_start";
const MEMORY_EXPORT: &str = "memory";

/// Trap messages that carry an explicit exit status, e.g.
/// `Exited with i32 exit status 3` or `wasi exited with exit code: 3`.
static EXIT_IN_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)exit (?:status|code):?\s*(-?\d+)").expect("static regex")
});

/// Outcome of a sandboxed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub trapped: Option<String>,
}

impl SandboxOutcome {
    fn aborted(reason: String) -> Self {
        Self {
            exit_code: 1,
            trapped: Some(reason),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            trapped: self.trapped.clone(),
        }
    }
}

/// Value returned by an entry function, after narrowing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnValue {
    I32(i32),
    F64(f64),
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnValue::I32(v) => write!(f, "i32 {}", v),
            ReturnValue::F64(v) => write!(f, "f64 {}", v),
        }
    }
}

/// Outcome of a direct entry call.
#[derive(Debug, Clone, Default)]
pub struct DirectOutcome {
    pub value: Option<ReturnValue>,
    /// Copy of the exported linear memory, taken only when requested
    pub memory: Option<Vec<u8>>,
    /// Text printed through the `env` / WASI imports, if any were linked
    pub stdout: String,
    pub failure: Option<DirectFailure>,
}

impl DirectOutcome {
    pub fn ok(&self) -> bool {
        self.failure.is_none()
    }

    fn failed(failure: DirectFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectFailure {
    /// The bytes are not a valid module
    InvalidModule(String),
    /// No import shape could instantiate the module
    Instantiate(Vec<String>),
    MissingEntry(String),
    UnsupportedSignature(String),
    Trap(String),
}

impl DirectFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            DirectFailure::InvalidModule(_) => "invalid module",
            DirectFailure::Instantiate(_) => "instantiate error",
            DirectFailure::MissingEntry(_) => "missing entry export",
            DirectFailure::UnsupportedSignature(_) => "unsupported entry signature",
            DirectFailure::Trap(_) => "trap",
        }
    }
}

impl fmt::Display for DirectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectFailure::InvalidModule(e) => write!(f, "invalid module: {}", e),
            DirectFailure::Instantiate(attempts) => {
                write!(f, "no import shape could instantiate the module")?;
                for attempt in attempts {
                    write!(f, "\n  {}", attempt)?;
                }
                Ok(())
            }
            DirectFailure::MissingEntry(name) => write!(f, "export `{}` not found", name),
            DirectFailure::UnsupportedSignature(name) => {
                write!(f, "export `{}` must take no arguments and return i32, i64, f32 or f64", name)
            }
            DirectFailure::Trap(msg) => write!(f, "{}", msg),
        }
    }
}

/// Import namespaces offered to a direct-call module, least permissive
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportShape {
    Empty,
    Env,
    Sandbox,
    EnvAndSandbox,
}

impl ImportShape {
    pub const ALL: [ImportShape; 4] = [
        ImportShape::Empty,
        ImportShape::Env,
        ImportShape::Sandbox,
        ImportShape::EnvAndSandbox,
    ];

    fn wants_env(self) -> bool {
        matches!(self, ImportShape::Env | ImportShape::EnvAndSandbox)
    }

    fn wants_sandbox(self) -> bool {
        matches!(self, ImportShape::Sandbox | ImportShape::EnvAndSandbox)
    }
}

impl fmt::Display for ImportShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportShape::Empty => "empty",
            ImportShape::Env => "env",
            ImportShape::Sandbox => "wasi",
            ImportShape::EnvAndSandbox => "env+wasi",
        };
        f.write_str(name)
    }
}

/// Store data for every run. Direct calls reuse the simulated process so
/// anything printed through imports lands in one buffer.
#[derive(Debug)]
struct HostState {
    process: SimulatedProcess,
}

impl HasProcess for HostState {
    fn process(&self) -> &SimulatedProcess {
        &self.process
    }

    fn process_mut(&mut self) -> &mut SimulatedProcess {
        &mut self.process
    }
}

/// Run `_start` under the simulated WASI process.
pub fn run_sandboxed(engine: &Engine, wasm: &[u8], stdin: &str) -> SandboxOutcome {
    let module = match Module::new(engine, wasm) {
        Ok(module) => module,
        Err(e) => return SandboxOutcome::aborted(format!("invalid module: {}", e)),
    };

    let mut store = Store::new(
        engine,
        HostState {
            process: SimulatedProcess::new(stdin),
        },
    );
    let mut linker = Linker::<HostState>::new(engine);
    if let Err(e) = wasi::add_to_linker(&mut linker) {
        return SandboxOutcome::aborted(format!("failed to link host: {}", e));
    }

    let result = start_module(&linker, &mut store, &module);

    // proc_exit unwinds through a trap; the recorded code is authoritative
    let process = &store.data().process;
    let (exit_code, trapped) = match (result, process.exit_code) {
        (_, Some(code)) => (code, None),
        (Ok(()), None) => (0, None),
        (Err(msg), None) => (exit_code_from_trap(&msg), Some(msg)),
    };
    debug!(exit_code, trapped = trapped.is_some(), "sandboxed run finished");

    SandboxOutcome {
        exit_code,
        stdout: process.stdout_text(),
        stderr: process.stderr_text(),
        trapped,
    }
}

fn start_module(
    linker: &Linker<HostState>,
    store: &mut Store<HostState>,
    module: &Module,
) -> Result<(), String> {
    let pre = linker
        .instantiate(&mut *store, module)
        .map_err(|e| format!("instantiation failed: {}", e))?;
    let instance = pre.start(&mut *store).map_err(|e| e.to_string())?;
    let start = instance
        .get_typed_func::<(), ()>(&*store, START_EXPORT)
        .map_err(|_| format!("export `{}` not found", START_EXPORT))?;
    start.call(&mut *store, ()).map_err(|e| e.to_string())
}

/// Map a trap message to a process exit code: an explicit status in the
/// message wins, anything else is 1.
pub fn exit_code_from_trap(message: &str) -> i32 {
    EXIT_IN_MESSAGE
        .captures(message)
        .and_then(|caps| caps[1].parse::<i32>().ok())
        .unwrap_or(1)
}

/// Instantiate and call `entry`, returning its narrowed result.
pub fn run_direct(engine: &Engine, wasm: &[u8], entry: &str, want_memory: bool) -> DirectOutcome {
    let module = match Module::new(engine, wasm) {
        Ok(module) => module,
        Err(e) => return DirectOutcome::failed(DirectFailure::InvalidModule(e.to_string())),
    };

    let mut attempts = Vec::new();
    for shape in ImportShape::ALL {
        let mut store = Store::new(
            engine,
            HostState {
                process: SimulatedProcess::new(""),
            },
        );
        match instantiate_with(engine, &mut store, &module, shape) {
            Ok(instance) => {
                debug!(%shape, entry, "module instantiated");
                return call_entry(&mut store, instance, entry, want_memory);
            }
            Err(e) => attempts.push(format!("{}: {}", shape, e)),
        }
    }
    DirectOutcome::failed(DirectFailure::Instantiate(attempts))
}

fn instantiate_with(
    engine: &Engine,
    store: &mut Store<HostState>,
    module: &Module,
    shape: ImportShape,
) -> anyhow::Result<Instance> {
    let mut linker = Linker::<HostState>::new(engine);
    if shape.wants_env() {
        add_env_imports(&mut linker)?;
    }
    if shape.wants_sandbox() {
        wasi::add_to_linker(&mut linker)?;
    }
    let pre = linker
        .instantiate(&mut *store, module)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    pre.start(&mut *store).map_err(|e| anyhow::anyhow!("{}", e))
}

/// `env.print_i32` and `env.print_str`, both writing to captured stdout.
fn add_env_imports(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "print_i32",
        |mut caller: Caller<'_, HostState>, value: i32| {
            let line = format!("{}\n", value);
            caller.data_mut().process.write(1, line.as_bytes());
        },
    )?;
    linker.func_wrap(
        "env",
        "print_str",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> Result<(), Trap> {
            let memory = caller
                .get_export(MEMORY_EXPORT)
                .and_then(Extern::into_memory)
                .ok_or_else(|| Trap::new("print_str: memory export not found"))?;
            let text = decode_length_prefixed(memory.data(&caller), ptr as u32)
                .ok_or_else(|| Trap::new("print_str: string out of bounds"))?;
            caller.data_mut().process.write(1, text.as_bytes());
            Ok(())
        },
    )?;
    Ok(())
}

fn call_entry(
    store: &mut Store<HostState>,
    instance: Instance,
    entry: &str,
    want_memory: bool,
) -> DirectOutcome {
    if instance.get_export(&*store, entry).is_none() {
        return DirectOutcome::failed(DirectFailure::MissingEntry(entry.to_string()));
    }

    let called = if let Ok(f) = instance.get_typed_func::<(), i32>(&*store, entry) {
        f.call(&mut *store, ()).map(ReturnValue::I32).map_err(|e| e.to_string())
    } else if let Ok(f) = instance.get_typed_func::<(), i64>(&*store, entry) {
        // Wide results are narrowed to their low 32 bits
        f.call(&mut *store, ())
            .map(|v| ReturnValue::I32(v as i32))
            .map_err(|e| e.to_string())
    } else if let Ok(f) = instance.get_typed_func::<(), F64>(&*store, entry) {
        f.call(&mut *store, ())
            .map(|v| ReturnValue::F64(v.to_float()))
            .map_err(|e| e.to_string())
    } else if let Ok(f) = instance.get_typed_func::<(), F32>(&*store, entry) {
        f.call(&mut *store, ())
            .map(|v| ReturnValue::F64(f64::from(v.to_float())))
            .map_err(|e| e.to_string())
    } else {
        return DirectOutcome::failed(DirectFailure::UnsupportedSignature(entry.to_string()));
    };

    let stdout = store.data().process.stdout_text();
    match called {
        Ok(value) => DirectOutcome {
            value: Some(value),
            memory: want_memory
                .then(|| instance.get_memory(&*store, MEMORY_EXPORT))
                .flatten()
                .map(|m| m.data(&*store).to_vec()),
            stdout,
            failure: None,
        },
        Err(msg) => DirectOutcome {
            stdout,
            ..DirectOutcome::failed(DirectFailure::Trap(msg))
        },
    }
}

/// Read a string stored as a 4-byte little-endian length followed by that
/// many UTF-8 bytes. Invalid UTF-8 is replaced rather than rejected.
pub fn decode_length_prefixed(memory: &[u8], ptr: u32) -> Option<String> {
    let start = ptr as usize;
    let header = memory.get(start..start.checked_add(4)?)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let body_start = start + 4;
    let body = memory.get(body_start..body_start.checked_add(len)?)?;
    Some(String::from_utf8_lossy(body).into_owned())
}
