/// Test Executor - Per-Test Orchestration
///
/// **Responsibility:**
/// Run one test case end to end: compile, execute, evaluate.
///
/// **Dispatch order** (first match wins):
/// 1. `skip` → pass, nothing compiled
/// 2. `compile_fail` → pass iff compilation fails
/// 3. `compile_ok` → pass iff compilation succeeds
/// 4. compile error → fail
/// 5. return expectation → direct call
/// 6. otherwise → sandboxed run
///
/// This module is the glue layer; it knows nothing about:
/// - How modules execute (engine's job)
/// - How outcomes are judged (evaluator's job)

use crate::compiler::Compiler;
use crate::engine;
use crate::evaluator::{self, Verdict};
use nmtest_common::types::{ATTR_COMPILE_FAIL, ATTR_COMPILE_OK, ATTR_SKIP};
use nmtest_common::{ReturnSpec, RuntimeSnapshot, TestCase, TestResult};
use std::time::Instant;
use tracing::{debug, warn};
use wasmi::Engine;

/// Everything a test needs from its execution context. One per shard.
pub struct TestExecutor<'a> {
    compiler: &'a Compiler,
    engine: Engine,
    entry: String,
}

impl<'a> TestExecutor<'a> {
    pub fn new(compiler: &'a Compiler, entry: impl Into<String>) -> Self {
        Self {
            compiler,
            engine: Engine::default(),
            entry: entry.into(),
        }
    }

    pub fn run(&self, test: TestCase) -> TestResult {
        let start = Instant::now();
        let (verdict, runtime) = self.judge(&test);

        if verdict.ok {
            debug!(test = %test.name, reason = %verdict.reason, "Test passed");
        } else {
            warn!(
                test = %test.name,
                file = %test.source_file.display(),
                line = test.line,
                reason = %verdict.reason,
                "Test failed"
            );
        }

        let mut result = verdict.into_result(test);
        if let Some(runtime) = runtime {
            result = result.with_runtime(runtime);
        }
        result.with_duration_ms(start.elapsed().as_millis() as u64)
    }

    fn judge(&self, test: &TestCase) -> (Verdict, Option<RuntimeSnapshot>) {
        if test.has_attr(ATTR_SKIP) {
            return (Verdict::pass("skipped"), None);
        }

        let compiled = self.compiler.compile(&test.code);

        if test.has_attr(ATTR_COMPILE_FAIL) {
            let verdict = match compiled {
                Ok(_) => Verdict::fail("expected compile_fail but compiled"),
                Err(e) => Verdict::pass("compile_fail ok").with_detail(Some(e.to_string())),
            };
            return (verdict, None);
        }

        if test.has_attr(ATTR_COMPILE_OK) {
            let verdict = match compiled {
                Ok(_) => Verdict::pass("compile_ok ok"),
                Err(e) => Verdict::fail("compile error").with_detail(Some(e.to_string())),
            };
            return (verdict, None);
        }

        let wasm = match compiled {
            Ok(wasm) => wasm,
            Err(e) => {
                return (
                    Verdict::fail("compile error").with_detail(Some(e.to_string())),
                    None,
                )
            }
        };

        match &test.ret {
            Some(spec) => (self.run_direct(spec, &wasm), None),
            None => self.run_sandboxed(test, &wasm),
        }
    }

    fn run_direct(&self, spec: &ReturnSpec, wasm: &[u8]) -> Verdict {
        let want_memory = matches!(spec, ReturnSpec::Str(_));
        let outcome = engine::run_direct(&self.engine, wasm, &self.entry, want_memory);
        debug!(entry = %self.entry, ok = outcome.ok(), value = ?outcome.value, "Direct call finished");
        evaluator::evaluate_direct(spec, &outcome)
    }

    fn run_sandboxed(&self, test: &TestCase, wasm: &[u8]) -> (Verdict, Option<RuntimeSnapshot>) {
        let stdin = test.stdin.as_deref().unwrap_or("");
        let outcome = engine::run_sandboxed(&self.engine, wasm, stdin);
        debug!(
            test = %test.name,
            exit_code = outcome.exit_code,
            stdout_bytes = outcome.stdout.len(),
            stderr_bytes = outcome.stderr.len(),
            "Sandboxed run finished"
        );
        (
            evaluator::evaluate_sandboxed(test, &outcome),
            Some(outcome.snapshot()),
        )
    }
}
