//! Weft path expressions.
//!
//! This crate is the single place that deals with dynamic object shapes:
//! a small path language evaluated against `serde_json::Value`, used both for
//! reading values out of live objects (output/health extraction) and for
//! substituting `$(path)` placeholders while rendering template skeletons.
//!
//! Supported forms: `spec.foo.bar`, `items[2].name`, and the single-field
//! filter `status.conditions[?(@.type=="Ready")]`. A leading `$.` or `.` is
//! accepted and ignored.

#![forbid(unsafe_code)]

use serde_json::Value as Json;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("invalid path {path:?}: {detail}")]
    Invalid { path: String, detail: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("no value at path {0}")]
    MissingValue(String),
    #[error("value at path {0} is not a scalar and cannot be interpolated")]
    NonScalar(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    /// `[?(@.key=="value")]` — first array element whose `key` equals `value`.
    Filter { key: String, value: String },
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    source: String,
    segments: Vec<Segment>,
}

impl Path {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        let mut cur = root;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => cur = cur.as_object()?.get(k)?,
                Segment::Index(i) => cur = cur.as_array()?.get(*i)?,
                Segment::Filter { key, value } => {
                    cur = cur
                        .as_array()?
                        .iter()
                        .find(|e| e.get(key).and_then(|v| v.as_str()) == Some(value.as_str()))?;
                }
            }
        }
        Some(cur)
    }
}

fn invalid(path: &str, detail: impl Into<String>) -> PathError {
    PathError::Invalid { path: path.to_string(), detail: detail.into() }
}

pub fn parse(path: &str) -> Result<Path, PathError> {
    let source = path.to_string();
    let s = path.strip_prefix("$.").or_else(|| path.strip_prefix('.')).unwrap_or(path);
    if s.is_empty() {
        return Err(PathError::Empty);
    }
    let chars: Vec<char> = s.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let start = i;
        while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
            if chars[i] == ']' {
                return Err(invalid(path, "unmatched ']'"));
            }
            i += 1;
        }
        let key: String = chars[start..i].iter().collect();
        if key.is_empty() {
            return Err(invalid(path, "empty key segment"));
        }
        segments.push(Segment::Key(key));
        // Zero or more bracket suffixes on this segment.
        while i < chars.len() && chars[i] == '[' {
            let close = find_bracket_end(&chars, i).ok_or_else(|| invalid(path, "unmatched '['"))?;
            let body: String = chars[i + 1..close].iter().collect();
            segments.push(parse_bracket(path, &body)?);
            i = close + 1;
        }
        if i < chars.len() {
            if chars[i] != '.' {
                return Err(invalid(path, format!("unexpected character {:?}", chars[i])));
            }
            i += 1;
            if i == chars.len() {
                return Err(invalid(path, "trailing '.'"));
            }
        }
    }
    Ok(Path { source, segments })
}

fn find_bracket_end(chars: &[char], open: usize) -> Option<usize> {
    let mut in_str = false;
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            '"' => in_str = !in_str,
            ']' if !in_str => return Some(j),
            _ => {}
        }
        j += 1;
    }
    None
}

fn parse_bracket(path: &str, body: &str) -> Result<Segment, PathError> {
    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
        let idx = body.parse::<usize>().map_err(|e| invalid(path, e.to_string()))?;
        return Ok(Segment::Index(idx));
    }
    // Filter: ?(@.key=="value")
    let inner = body
        .strip_prefix("?(")
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| invalid(path, format!("unsupported bracket expression [{body}]")))?;
    let (lhs, rhs) = inner
        .split_once("==")
        .ok_or_else(|| invalid(path, "filter must compare with =="))?;
    let key = lhs
        .trim()
        .strip_prefix("@.")
        .ok_or_else(|| invalid(path, "filter key must start with @."))?;
    let value = rhs
        .trim()
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .ok_or_else(|| invalid(path, "filter value must be double-quoted"))?;
    if key.is_empty() {
        return Err(invalid(path, "empty filter key"));
    }
    Ok(Segment::Filter { key: key.to_string(), value: value.to_string() })
}

/// Evaluate a path against a root value. `Ok(None)` means the path is valid
/// but nothing lives there.
pub fn eval<'a>(root: &'a Json, path: &str) -> Result<Option<&'a Json>, PathError> {
    Ok(parse(path)?.eval(root))
}

// ---- placeholder rendering ----

/// Substitute every `$(path)` placeholder in `skeleton` with values from
/// `ctx`. A string that is exactly one placeholder splices the full value
/// (any JSON type); embedded placeholders must resolve to scalars.
pub fn render(skeleton: &Json, ctx: &Json) -> Result<Json, RenderError> {
    match skeleton {
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, ctx)?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for v in items {
                out.push(render(v, ctx)?);
            }
            Ok(Json::Array(out))
        }
        Json::String(s) => render_string(s, ctx),
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, ctx: &Json) -> Result<Json, RenderError> {
    let spans = find_placeholders(s);
    if spans.is_empty() {
        return Ok(Json::String(s.to_string()));
    }
    // Whole-string placeholder splices the value verbatim.
    if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == s.len() {
        let expr = &spans[0].2;
        let value = eval(ctx, expr)?.ok_or_else(|| RenderError::MissingValue(expr.clone()))?;
        return Ok(value.clone());
    }
    let mut out = String::with_capacity(s.len());
    let mut cursor = 0usize;
    for (start, end, expr) in &spans {
        out.push_str(&s[cursor..*start]);
        let value = eval(ctx, expr)?.ok_or_else(|| RenderError::MissingValue(expr.clone()))?;
        match value {
            Json::String(v) => out.push_str(v),
            Json::Number(n) => out.push_str(&n.to_string()),
            Json::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            _ => return Err(RenderError::NonScalar(expr.clone())),
        }
        cursor = *end;
    }
    out.push_str(&s[cursor..]);
    Ok(Json::String(out))
}

/// Byte spans of `$(...)` placeholders, paren-depth aware so filter
/// expressions containing parentheses survive.
fn find_placeholders(s: &str) -> Vec<(usize, usize, String)> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'(' {
            let mut depth = 1usize;
            let mut in_str = false;
            let mut j = i + 2;
            while j < bytes.len() {
                match bytes[j] {
                    b'"' => in_str = !in_str,
                    b'(' if !in_str => depth += 1,
                    b')' if !in_str => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            if j < bytes.len() && depth == 0 {
                out.push((i, j + 1, s[i + 2..j].to_string()));
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}
