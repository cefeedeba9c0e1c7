/// Test Evaluator - Judging Raw Outcomes
///
/// **Core Responsibility:**
/// Compare raw engine outcomes against a test case's expectations.
///
/// **Critical Properties:**
/// - Knows nothing about compilers or module instantiation
/// - Pure functions: (test case, raw outcome) → verdict
///
/// **Normalization Rules (opt-in per test, fixed order):**
/// 1. `strip_ansi`: drop ANSI escape sequences
/// 2. `normalize_newlines`: CRLF/CR → LF, then drop exactly one trailing LF
///
/// Without either attribute the comparison is byte-exact, so `"abc\n"` never
/// matches `"abc"`.
///
/// **Return Values:**
/// - I32 compares as signed 32-bit
/// - F64 compares with relative tolerance 1e-9; NaN equals NaN, infinities
///   compare by equality
/// - Str decodes a length-prefixed string at the returned pointer

use crate::engine::{decode_length_prefixed, DirectOutcome, ReturnValue, SandboxOutcome};
use nmtest_common::types::{ATTR_NORMALIZE_NEWLINES, ATTR_SHOULD_PANIC, ATTR_STRIP_ANSI};
use nmtest_common::{Attributes, Payload, ReturnSpec, TestCase, TestResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

const F64_RELATIVE_TOLERANCE: f64 = 1e-9;

/// CSI sequences (colors, cursor movement) and OSC sequences (titles,
/// hyperlinks) terminated by BEL or ST.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("static regex")
});

/// Outcome of judging one test. Converted into a `TestResult` by the
/// executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub ok: bool,
    pub reason: String,
    pub detail: Option<String>,
    pub payloads: Option<(Payload, Payload)>,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            ok: true,
            reason: reason.into(),
            detail: None,
            payloads: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            ..Self::pass(reason)
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    fn with_payloads(mut self, expected: Payload, actual: Payload) -> Self {
        self.payloads = Some((expected, actual));
        self
    }

    pub fn into_result(self, test: TestCase) -> TestResult {
        let mut result = if self.ok {
            TestResult::pass(test, self.reason)
        } else {
            TestResult::fail(test, self.reason)
        };
        if let Some(detail) = self.detail {
            result = result.with_detail(detail);
        }
        if let Some((expected, actual)) = self.payloads {
            result = result.with_payloads(expected, actual);
        }
        result
    }
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// CRLF and lone CR become LF, then one trailing LF (if any) is dropped.
pub fn normalize_newlines(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n").replace('\r', "\n");
    if out.ends_with('\n') {
        out.pop();
    }
    out
}

/// Apply the normalizations requested by `attributes`.
pub fn normalize(text: &str, attributes: &Attributes) -> String {
    let mut out = text.to_string();
    if attributes.has(ATTR_STRIP_ANSI) {
        out = strip_ansi(&out);
    }
    if attributes.has(ATTR_NORMALIZE_NEWLINES) {
        out = normalize_newlines(&out);
    }
    out
}

/// Judge a sandboxed run.
pub fn evaluate_sandboxed(test: &TestCase, outcome: &SandboxOutcome) -> Verdict {
    if test.has_attr(ATTR_SHOULD_PANIC) {
        return if outcome.exit_code != 0 {
            Verdict::pass("should_panic ok")
        } else {
            Verdict::fail("expected panic but exit_code=0")
        };
    }

    let attrs = &test.attributes;
    let actual_stdout = normalize(&outcome.stdout, attrs);
    let actual_stderr = normalize(&outcome.stderr, attrs);

    if let Some(expected) = &test.stdout {
        let expected = normalize(expected, attrs);
        if expected != actual_stdout {
            return Verdict::fail("stdout mismatch").with_payloads(
                Payload {
                    stdout: Some(expected),
                    ..Default::default()
                },
                Payload {
                    stdout: Some(actual_stdout),
                    ..Default::default()
                },
            );
        }
    }

    if let Some(expected) = &test.stderr {
        let expected = normalize(expected, attrs);
        if expected != actual_stderr {
            return Verdict::fail("stderr mismatch").with_payloads(
                Payload {
                    stderr: Some(expected),
                    ..Default::default()
                },
                Payload {
                    stderr: Some(actual_stderr),
                    ..Default::default()
                },
            );
        }
    }

    if test.stdout.is_none() && test.stderr.is_none() && outcome.exit_code != 0 {
        return Verdict::fail("nonzero exit without expectation")
            .with_detail(outcome.trapped.clone());
    }

    Verdict::pass("ok")
}

/// Actual return value in the shape of the expectation it is checked
/// against.
#[derive(Debug, Clone, PartialEq)]
pub enum ActualReturn {
    I32(i32),
    F64(f64),
    Str(String),
    /// The value could not be read as the expected kind
    Undecodable(String),
}

impl fmt::Display for ActualReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActualReturn::I32(v) => write!(f, "i32 {}", v),
            ActualReturn::F64(v) => write!(f, "f64 {}", v),
            ActualReturn::Str(s) => write!(f, "str {:?}", s),
            ActualReturn::Undecodable(why) => write!(f, "undecodable ({})", why),
        }
    }
}

/// Read `value` as the kind `spec` asks for.
pub fn decode_actual(spec: &ReturnSpec, value: ReturnValue, memory: Option<&[u8]>) -> ActualReturn {
    match (spec, value) {
        (ReturnSpec::Str(_), ReturnValue::I32(ptr)) => {
            let Some(memory) = memory else {
                return ActualReturn::Undecodable("module exports no memory".to_string());
            };
            decode_length_prefixed(memory, ptr as u32)
                .map(ActualReturn::Str)
                .unwrap_or_else(|| {
                    ActualReturn::Undecodable(format!("string at {:#x} is out of bounds", ptr as u32))
                })
        }
        (ReturnSpec::Str(_), ReturnValue::F64(v)) => {
            ActualReturn::Undecodable(format!("expected a pointer, got f64 {}", v))
        }
        (_, ReturnValue::I32(v)) => ActualReturn::I32(v),
        (_, ReturnValue::F64(v)) => ActualReturn::F64(v),
    }
}

pub fn f64_matches(expected: f64, actual: f64) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if expected.is_infinite() || actual.is_infinite() {
        return expected == actual;
    }
    (expected - actual).abs() <= F64_RELATIVE_TOLERANCE * expected.abs().max(1.0)
}

pub fn return_matches(spec: &ReturnSpec, actual: &ActualReturn) -> bool {
    match (spec, actual) {
        (ReturnSpec::I32(e), ActualReturn::I32(a)) => e == a,
        // A float result satisfies an integer expectation only when integral
        (ReturnSpec::I32(e), ActualReturn::F64(a)) => a.fract() == 0.0 && *a == f64::from(*e),
        (ReturnSpec::F64(e), ActualReturn::F64(a)) => f64_matches(*e, *a),
        (ReturnSpec::F64(e), ActualReturn::I32(a)) => f64_matches(*e, f64::from(*a)),
        (ReturnSpec::Str(e), ActualReturn::Str(a)) => e == a,
        _ => false,
    }
}

/// Judge a direct-call run against its return expectation.
pub fn evaluate_direct(spec: &ReturnSpec, outcome: &DirectOutcome) -> Verdict {
    if let Some(failure) = &outcome.failure {
        return Verdict::fail(failure.reason()).with_detail(Some(failure.to_string()));
    }
    let Some(value) = outcome.value else {
        return Verdict::fail("missing return value");
    };

    let actual = decode_actual(spec, value, outcome.memory.as_deref());
    if return_matches(spec, &actual) {
        return Verdict::pass("ok");
    }

    Verdict::fail("return mismatch").with_payloads(
        Payload {
            ret: Some(spec.to_string()),
            ..Default::default()
        },
        Payload {
            ret: Some(actual.to_string()),
            stdout: (!outcome.stdout.is_empty()).then(|| outcome.stdout.clone()),
            ..Default::default()
        },
    )
}
