// Metadata value resolution: literal, quoted, or file-backed text, and the
// typed return-value expectation parsed from `ret:` / `result:` lines.

use nmtest_common::ReturnSpec;
use std::fs;
use std::path::Path;

/// Resolve a raw metadata value to literal text.
///
/// - `"..."` is decoded as a JSON string literal; when that fails the
///   surrounding quotes are stripped and the rest is taken verbatim.
/// - A value naming an existing regular file under `base_dir` yields the
///   file's contents (invalid UTF-8 is replaced, not rejected).
/// - Anything else is the trimmed value itself.
pub fn load_value(raw: &str, base_dir: &Path) -> String {
    let value = raw.trim();
    if value.starts_with('"') {
        return unquote(value);
    }

    let candidate = base_dir.join(value);
    if !value.is_empty() && candidate.is_file() {
        if let Ok(bytes) = fs::read(&candidate) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }

    value.to_string()
}

fn unquote(value: &str) -> String {
    match serde_json::from_str::<String>(value) {
        Ok(decoded) => decoded,
        Err(_) => {
            let inner = &value[1..];
            inner.strip_suffix('"').unwrap_or(inner).to_string()
        }
    }
}

/// Parse a `ret:` value into a typed expectation.
///
/// Priority: quoted string, IEEE special (`nan`, `inf`, `infinity`, signed),
/// float (token contains `.`, `e` or `E`), then i32. A token that does not
/// parse as a number produces `None` and the test falls back to a standard
/// I/O check.
pub fn parse_return_spec(raw: &str) -> Option<ReturnSpec> {
    let token = raw.trim();
    if token.is_empty() {
        return None;
    }
    if token.starts_with('"') {
        return Some(ReturnSpec::Str(unquote(token)));
    }

    if let Some(special) = parse_special_float(token) {
        return Some(ReturnSpec::F64(special));
    }

    if token.contains(['.', 'e', 'E']) {
        return token.parse::<f64>().ok().map(ReturnSpec::F64);
    }

    // Out-of-range integers wrap to their low 32 bits
    token
        .parse::<i64>()
        .ok()
        .map(|v| ReturnSpec::I32(v as i32))
}

fn parse_special_float(token: &str) -> Option<f64> {
    match token.to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}
