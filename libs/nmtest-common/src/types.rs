use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Attribute names the comparator acts on. Anything else is kept on the
/// test case but ignored.
pub const ATTR_COMPILE_FAIL: &str = "compile_fail";
pub const ATTR_COMPILE_OK: &str = "compile_ok";
pub const ATTR_SHOULD_PANIC: &str = "should_panic";
pub const ATTR_SKIP: &str = "skip";
pub const ATTR_STRIP_ANSI: &str = "strip_ansi";
pub const ATTR_NORMALIZE_NEWLINES: &str = "normalize_newlines";

/// Where a test case was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// `//:` doc-comment block at the top of a `.nepl` source file
    #[serde(rename = "nepl")]
    CommentBlock,
    /// Fenced code block inside a `.n.md` document
    #[serde(rename = "nmd")]
    FencedBlock,
}

impl Origin {
    pub fn tag(&self) -> &'static str {
        match self {
            Origin::CommentBlock => "nepl",
            Origin::FencedBlock => "nmd",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Set of boolean switches attached to a test declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeSet<String>);

impl Attributes {
    /// Parse a comma-separated tag list such as `compile_fail, skip`.
    /// Empty entries are dropped and duplicates collapse.
    pub fn parse(text: &str) -> Self {
        Self(
            text.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Typed expectation for the value returned by a direct entry call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ReturnSpec {
    I32(i32),
    F64(f64),
    Str(String),
}

impl fmt::Display for ReturnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnSpec::I32(v) => write!(f, "i32 {}", v),
            ReturnSpec::F64(v) => write!(f, "f64 {}", v),
            ReturnSpec::Str(s) => write!(f, "str {:?}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub origin: Origin,
    pub source_file: PathBuf,
    /// `{origin}:{basename}:{ordinal}`
    pub name: String,
    /// 1-based line of the declaration
    pub line: usize,
    pub attributes: Attributes,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub ret: Option<ReturnSpec>,
    pub code: String,
}

impl TestCase {
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.has(name)
    }
}

/// What a sandboxed run left behind, kept on the result for diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub trapped: Option<String>,
}

/// Expected or actual payload attached to a mismatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(flatten)]
    pub test: TestCase,
    pub ok: bool,
    pub reason: String,
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Payload>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn pass(test: TestCase, reason: impl Into<String>) -> Self {
        Self::new(test, true, reason)
    }

    pub fn fail(test: TestCase, reason: impl Into<String>) -> Self {
        Self::new(test, false, reason)
    }

    fn new(test: TestCase, ok: bool, reason: impl Into<String>) -> Self {
        Self {
            test,
            ok,
            reason: reason.into(),
            detail: None,
            runtime: None,
            expected: None,
            actual: None,
            duration_ms: 0,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeSnapshot) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_payloads(mut self, expected: Payload, actual: Payload) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.test.name
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Summary {
    pub fn of(results: &[TestResult]) -> Self {
        let passed = results.iter().filter(|r| r.ok).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: Summary,
    pub results: Vec<TestResult>,
}

impl RunReport {
    pub fn new(results: Vec<TestResult>) -> Self {
        Self {
            summary: Summary::of(&results),
            results,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }
}
