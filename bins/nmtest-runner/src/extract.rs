//! Doctest discovery.
//!
//! Two source formats carry `neplg2:test` declarations:
//!
//! - `.nepl` sources: the leading `//:` doc-comment block. Every test in the
//!   block compiles the whole file; the block only contributes expectations.
//!
//!   ```text
//!   //: neplg2:test[normalize_newlines]
//!   //: stdin: "3"
//!   //: stdout: mlstr:
//!   //: ##: first line
//!   //: ##: second line
//!   ```
//!
//! - `.n.md` documents: a declaration at column 0, optional metadata lines,
//!   then a fenced code block holding the test program. Lines prefixed with
//!   `//:|` are hidden from rendered docs but still compiled.
//!
//! Recognised metadata keys are `stdin`, `stdout`, `stderr` and `ret` /
//! `result`. Unknown keys and free text between declarations are skipped.

use crate::value::{load_value, parse_return_spec};
use nmtest_common::{Attributes, Origin, TestCase};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

static DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^neplg2:test(?:\[(.*)\])?\s*$").expect("static regex"));
static KEY_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([a-zA-Z_]+)\s*:\s*(.*)$").expect("static regex"));
static BLOCK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*##:\s?(.*)$").expect("static regex"));
static FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```([^\s`]*)\s*$").expect("static regex"));
static HIDDEN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*//:\|\s?").expect("static regex"));

const DOC_PREFIX: &str = "//:";
const MLSTR: &str = "mlstr:";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("doctest missing fence in {} around line {line}", path.display())]
    MissingFence { path: PathBuf, line: usize },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Pick the extraction format from a file name.
pub fn origin_for(path: &Path) -> Option<Origin> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".n.md") {
        Some(Origin::FencedBlock)
    } else if name.ends_with(".nepl") {
        Some(Origin::CommentBlock)
    } else {
        None
    }
}

/// Read a file and extract its tests. Files of unknown type yield nothing.
pub fn extract_file(path: &Path) -> Result<Vec<TestCase>, ExtractError> {
    let Some(origin) = origin_for(path) else {
        return Ok(Vec::new());
    };
    let content = fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    extract_tests(path, &content, origin)
}

/// Extract every test declared in `content`, in discovery order.
pub fn extract_tests(
    path: &Path,
    content: &str,
    origin: Origin,
) -> Result<Vec<TestCase>, ExtractError> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let mut scanner = Scanner::new(path, &lines);

    match origin {
        Origin::CommentBlock => Ok(scanner.comment_block(content)),
        Origin::FencedBlock => scanner.fenced_blocks(),
    }
}

/// Expectations gathered from the metadata lines of one declaration.
#[derive(Default)]
struct Metadata {
    stdin: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    ret: Option<String>,
}

impl Metadata {
    fn set(&mut self, key: &str, text: String) {
        match key {
            "stdin" => self.stdin = Some(text),
            "stdout" => self.stdout = Some(text),
            "stderr" => self.stderr = Some(text),
            "ret" | "result" => self.ret = Some(text),
            _ => {}
        }
    }
}

fn is_text_key(key: &str) -> bool {
    matches!(key, "stdin" | "stdout" | "stderr")
}

struct Scanner<'a> {
    path: &'a Path,
    base_dir: PathBuf,
    basename: String,
    lines: &'a [&'a str],
    pos: usize,
    tests: Vec<TestCase>,
}

impl<'a> Scanner<'a> {
    fn new(path: &'a Path, lines: &'a [&'a str]) -> Self {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            base_dir,
            basename,
            lines,
            pos: 0,
            tests: Vec::new(),
        }
    }

    fn comment_block(&mut self, whole_file: &str) -> Vec<TestCase> {
        // Only the leading doc block is scanned
        while let Some(body) = self.doc_line(self.pos) {
            let Some(attrs) = parse_declaration(body.trim_start()) else {
                self.pos += 1;
                continue;
            };
            let line = self.pos + 1;
            self.pos += 1;

            let mut meta = Metadata::default();
            while let Some(body) = self.doc_line(self.pos) {
                if parse_declaration(body.trim()).is_some() {
                    break;
                }
                self.pos += 1;
                self.read_metadata(body, &mut meta, |raw| doc_body(raw).unwrap_or(""));
            }

            self.push(Origin::CommentBlock, line, attrs, meta, whole_file.to_string());
        }
        std::mem::take(&mut self.tests)
    }

    fn fenced_blocks(&mut self) -> Result<Vec<TestCase>, ExtractError> {
        let lines = self.lines;
        while self.pos < lines.len() {
            let Some(attrs) = parse_declaration(lines[self.pos].trim_end()) else {
                self.pos += 1;
                continue;
            };
            let line = self.pos + 1;
            self.pos += 1;

            let mut meta = Metadata::default();
            while self.pos < lines.len() && !lines[self.pos].starts_with("```") {
                let body = lines[self.pos].trim_end();
                self.pos += 1;
                self.read_metadata(body, &mut meta, |raw| raw);
            }

            let opens = self
                .lines
                .get(self.pos)
                .is_some_and(|l| FENCE_OPEN.is_match(l));
            if !opens {
                return Err(ExtractError::MissingFence {
                    path: self.path.to_path_buf(),
                    line: self.pos + 1,
                });
            }
            self.pos += 1;

            let mut code = Vec::new();
            while self.pos < lines.len() && !lines[self.pos].starts_with("```") {
                code.push(HIDDEN_LINE.replace(lines[self.pos], "").into_owned());
                self.pos += 1;
            }
            // Closing fence
            if self.pos < lines.len() {
                self.pos += 1;
            }

            self.push(Origin::FencedBlock, line, attrs, meta, code.join("\n"));
        }
        Ok(std::mem::take(&mut self.tests))
    }

    /// Apply one `key: value` line. `mlstr:` values consume the following
    /// `##:` lines, seen through `strip` (which removes the format's prefix).
    fn read_metadata(&mut self, body: &str, meta: &mut Metadata, strip: impl Fn(&str) -> &str) {
        let Some(caps) = KEY_VALUE.captures(body) else {
            return;
        };
        let key = &caps[1];
        let value = &caps[2];

        if is_text_key(key) && value.trim() == MLSTR {
            let mut block = Vec::new();
            while let Some(raw) = self.lines.get(self.pos) {
                let Some(m) = BLOCK_LINE.captures(strip(raw)) else {
                    break;
                };
                block.push(m.get(1).map_or("", |g| g.as_str()).to_string());
                self.pos += 1;
            }
            meta.set(key, block.join("\n"));
        } else if is_text_key(key) {
            meta.set(key, load_value(value, &self.base_dir));
        } else {
            meta.set(key, value.to_string());
        }
    }

    fn doc_line(&self, idx: usize) -> Option<&'a str> {
        self.lines.get(idx).and_then(|l| doc_body(l))
    }

    fn push(&mut self, origin: Origin, line: usize, attrs: Attributes, meta: Metadata, code: String) {
        let ordinal = self.tests.len();
        self.tests.push(TestCase {
            origin,
            source_file: self.path.to_path_buf(),
            name: format!("{}:{}:{}", origin, self.basename, ordinal),
            line,
            attributes: attrs,
            stdin: meta.stdin,
            stdout: meta.stdout,
            stderr: meta.stderr,
            ret: meta.ret.as_deref().and_then(parse_return_spec),
            code,
        });
    }
}

/// Text after the `//:` prefix, or `None` for non-doc lines.
fn doc_body(line: &str) -> Option<&str> {
    line.strip_prefix(DOC_PREFIX).map(str::trim_end)
}

fn parse_declaration(text: &str) -> Option<Attributes> {
    let caps = DECLARATION.captures(text)?;
    Some(Attributes::parse(caps.get(1).map_or("", |m| m.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmtest_common::ReturnSpec;

    fn nmd(content: &str) -> Vec<TestCase> {
        extract_tests(Path::new("docs/guide.n.md"), content, Origin::FencedBlock).unwrap()
    }

    fn nepl(content: &str) -> Vec<TestCase> {
        extract_tests(Path::new("lib/io.nepl"), content, Origin::CommentBlock).unwrap()
    }

    #[test]
    fn test_origin_for() {
        assert_eq!(origin_for(Path::new("a/b.n.md")), Some(Origin::FencedBlock));
        assert_eq!(origin_for(Path::new("b.nepl")), Some(Origin::CommentBlock));
        assert_eq!(origin_for(Path::new("README.md")), None);
    }

    #[test]
    fn test_fenced_basic() {
        let tests = nmd(r#"# Title

Some prose.

neplg2:test[normalize_newlines]
stdin: "5"
stdout: "10\n"
```neplg2
#entry main
fn main <()->()> ():
    print 10
```

More prose.

neplg2:test
```
fn main <()->i32> ():
    0
```
"#);
        assert_eq!(tests.len(), 2);

        let first = &tests[0];
        assert_eq!(first.name, "nmd:guide.n.md:0");
        assert_eq!(first.origin, Origin::FencedBlock);
        assert_eq!(first.line, 5);
        assert!(first.has_attr("normalize_newlines"));
        assert_eq!(first.stdin.as_deref(), Some("5"));
        assert_eq!(first.stdout.as_deref(), Some("10\n"));
        assert_eq!(first.code, "#entry main\nfn main <()->()> ():\n    print 10");

        let second = &tests[1];
        assert_eq!(second.name, "nmd:guide.n.md:1");
        assert!(second.attributes.is_empty());
        assert!(second.stdout.is_none());
    }

    #[test]
    fn test_fenced_hidden_lines_are_compiled() {
        let tests = nmd("neplg2:test\n```neplg2\n//:| #entry main\n  //:|#indent 4\nfn main <()->()> ():\n```\n");
        assert_eq!(tests[0].code, "#entry main\n#indent 4\nfn main <()->()> ():");
    }

    #[test]
    fn test_fenced_crlf_input() {
        let tests = nmd("neplg2:test[skip]\r\nstdout: \"x\"\r\n```\r\nbody\r\n```\r\n");
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].code, "body");
        assert_eq!(tests[0].stdout.as_deref(), Some("x"));
        assert!(tests[0].has_attr("skip"));
    }

    #[test]
    fn test_fenced_mlstr() {
        let tests = nmd(
            "neplg2:test\nstdout: mlstr:\n##: line one\n##:line two\n  ##:   indented\nstderr: \"e\"\n```\ncode\n```\n",
        );
        assert_eq!(tests[0].stdout.as_deref(), Some("line one\nline two\n  indented"));
        assert_eq!(tests[0].stderr.as_deref(), Some("e"));
    }

    #[test]
    fn test_fenced_mlstr_for_stdin_and_stderr() {
        let tests = nmd(
            "neplg2:test\nstdin: mlstr:\n##: 1 2\n##: 3\nstderr: mlstr:\n##: warn: a\n##:\nstdout: \"6\"\n```\ncode\n```\n",
        );
        assert_eq!(tests[0].stdin.as_deref(), Some("1 2\n3"));
        assert_eq!(tests[0].stderr.as_deref(), Some("warn: a\n"));
        assert_eq!(tests[0].stdout.as_deref(), Some("6"));
    }

    #[test]
    fn test_fenced_ret_spec() {
        let tests = nmd("neplg2:test\nret: 42\n```\nx\n```\nneplg2:test\nresult: \"hi\"\n```\ny\n```\n");
        assert_eq!(tests[0].ret, Some(ReturnSpec::I32(42)));
        assert_eq!(tests[1].ret, Some(ReturnSpec::Str("hi".into())));
    }

    #[test]
    fn test_fenced_missing_fence_is_fatal() {
        let err = extract_tests(
            Path::new("bad.n.md"),
            "neplg2:test\nstdout: \"x\"\n",
            Origin::FencedBlock,
        )
        .unwrap_err();
        match err {
            ExtractError::MissingFence { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fenced_declaration_must_start_line() {
        let tests = nmd("  neplg2:test\n```\nx\n```\n");
        assert!(tests.is_empty());
    }

    #[test]
    fn test_fenced_file_backed_expectation() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("out.txt"), "expected text").unwrap();
        let doc = tmp.path().join("doc.n.md");
        fs::write(&doc, "neplg2:test\nstdout: out.txt\n```\ncode\n```\n").unwrap();

        let tests = extract_file(&doc).unwrap();
        assert_eq!(tests[0].stdout.as_deref(), Some("expected text"));
    }

    #[test]
    fn test_comment_block_basic() {
        let source = "//: Module docs.\n//:\n//: neplg2:test[should_panic]\n//: stdin: \"1\"\n//: neplg2:test\n//: stdout: \"ok\"\n\n#entry main\nfn main <()->()> ():\n    ()\n";
        let tests = nepl(source);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name, "nepl:io.nepl:0");
        assert_eq!(tests[0].line, 3);
        assert!(tests[0].has_attr("should_panic"));
        assert_eq!(tests[0].stdin.as_deref(), Some("1"));
        assert!(tests[0].stdout.is_none());
        assert_eq!(tests[1].name, "nepl:io.nepl:1");
        assert_eq!(tests[1].stdout.as_deref(), Some("ok"));
        // The whole compilation unit is the code
        assert_eq!(tests[0].code, source);
        assert_eq!(tests[1].code, source);
    }

    #[test]
    fn test_comment_block_mlstr() {
        let source = "//: neplg2:test\n//: stdout: mlstr:\n//: ##: a\n//: ##: b\n//: stderr: \"\"\nfn main <()->()> ():\n";
        let tests = nepl(source);
        assert_eq!(tests[0].stdout.as_deref(), Some("a\nb"));
        assert_eq!(tests[0].stderr.as_deref(), Some(""));
    }

    #[test]
    fn test_comment_block_mlstr_for_stdin_and_stderr() {
        let source = "//: neplg2:test\n//: stdin: mlstr:\n//: ##: x\n//: ##: y\n//: stderr: mlstr:\n//: ##: oops\nfn main <()->()> ():\n";
        let tests = nepl(source);
        assert_eq!(tests[0].stdin.as_deref(), Some("x\ny"));
        assert_eq!(tests[0].stderr.as_deref(), Some("oops"));
        assert!(tests[0].stdout.is_none());
    }

    #[test]
    fn test_comment_block_stops_at_first_code_line() {
        let source = "//: neplg2:test\nfn main <()->()> ():\n//: neplg2:test\n";
        let tests = nepl(source);
        assert_eq!(tests.len(), 1);
    }

    #[test]
    fn test_names_unique_and_increasing() {
        let mut doc = String::new();
        for i in 0..5 {
            doc.push_str(&format!("text {i}\n\nneplg2:test\n```\nbody {i}\n```\n"));
        }
        let tests = nmd(&doc);
        let names: Vec<_> = tests.iter().map(|t| t.name.clone()).collect();
        assert_eq!(
            names,
            (0..5).map(|i| format!("nmd:guide.n.md:{i}")).collect::<Vec<_>>()
        );
        assert_eq!(tests[3].code, "body 3");
    }
}
