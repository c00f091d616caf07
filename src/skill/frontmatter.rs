//! SKILL.md front matter parsing.
//!
//! The front matter is a deliberately small YAML subset: scalar strings,
//! booleans, integers, ordered sequences (inline `[a, b]` or block `- a`),
//! and nested mappings by indentation. This is not a YAML 1.2 parser and
//! does not try to be one; anchors, multi-line scalars, flow mappings and
//! tabs are rejected.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FrontMatterError {
    #[error("missing front matter block (expected leading `---` line)")]
    MissingBlock,

    #[error("unterminated front matter block (no closing `---` line)")]
    Unterminated,

    #[error("line {0}: tabs are not allowed in front matter indentation")]
    Tab(usize),

    #[error("line {0}: expected `key: value`")]
    ExpectedKeyValue(usize),

    #[error("line {0}: unexpected indentation")]
    UnexpectedIndent(usize),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("line {0}: unterminated quoted string")]
    UnterminatedString(usize),

    #[error("line {0}: unterminated inline sequence")]
    UnterminatedSequence(usize),
}

/// A parsed front matter value. Mappings preserve declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Seq(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// String rendering used for fields that accept any scalar.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Split a SKILL.md document into its front matter source and Markdown body.
///
/// The opening line must be exactly `---`; the block runs to the next `---`
/// line. Everything after it is the body.
pub fn split_document(content: &str) -> Result<(&str, &str), FrontMatterError> {
    let mut lines = content.split_inclusive('\n');
    let first = lines.next().ok_or(FrontMatterError::MissingBlock)?;
    if first.trim_end() != "---" {
        return Err(FrontMatterError::MissingBlock);
    }

    let mut offset = first.len();
    for line in lines {
        if line.trim_end() == "---" {
            let front = &content[first.len()..offset];
            let body = &content[offset + line.len()..];
            return Ok((front, body));
        }
        offset += line.len();
    }
    Err(FrontMatterError::Unterminated)
}

struct Line<'a> {
    number: usize,
    indent: usize,
    text: &'a str,
}

/// Parse front matter source into an ordered top-level mapping.
pub fn parse(src: &str) -> Result<Vec<(String, Value)>, FrontMatterError> {
    let mut lines = Vec::new();
    for (idx, raw) in src.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw.trim_end();
        let stripped = trimmed.trim_start();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indent = trimmed.len() - stripped.len();
        if trimmed[..indent].contains('\t') {
            return Err(FrontMatterError::Tab(number));
        }
        lines.push(Line {
            number,
            indent,
            text: stripped,
        });
    }

    let mut pos = 0;
    let map = parse_mapping(&lines, &mut pos, 0)?;
    if pos < lines.len() {
        return Err(FrontMatterError::UnexpectedIndent(lines[pos].number));
    }
    Ok(map)
}

fn parse_mapping(
    lines: &[Line],
    pos: &mut usize,
    indent: usize,
) -> Result<Vec<(String, Value)>, FrontMatterError> {
    let mut entries: Vec<(String, Value)> = Vec::new();

    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            return Err(FrontMatterError::UnexpectedIndent(line.number));
        }
        if line.text.starts_with("- ") || line.text == "-" {
            break;
        }

        let colon = line
            .text
            .find(':')
            .ok_or(FrontMatterError::ExpectedKeyValue(line.number))?;
        let key = unquote(line.text[..colon].trim(), line.number)?;
        if key.is_empty() {
            return Err(FrontMatterError::ExpectedKeyValue(line.number));
        }
        if entries.iter().any(|(k, _)| *k == key) {
            return Err(FrontMatterError::DuplicateKey(key));
        }
        let rest = line.text[colon + 1..].trim();
        *pos += 1;

        let value = if !rest.is_empty() {
            parse_scalar_or_inline(rest, line.number)?
        } else if let Some(next) = lines.get(*pos) {
            if next.indent > indent {
                if next.text.starts_with("- ") || next.text == "-" {
                    parse_sequence(lines, pos, next.indent)?
                } else {
                    Value::Map(parse_mapping(lines, pos, next.indent)?)
                }
            } else if next.indent == indent && (next.text.starts_with("- ") || next.text == "-") {
                // Block sequences may sit at the same indent as their key.
                parse_sequence(lines, pos, next.indent)?
            } else {
                Value::Str(String::new())
            }
        } else {
            Value::Str(String::new())
        };

        entries.push((key, value));
    }

    Ok(entries)
}

fn parse_sequence(
    lines: &[Line],
    pos: &mut usize,
    indent: usize,
) -> Result<Value, FrontMatterError> {
    let mut items = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent != indent || !(line.text.starts_with("- ") || line.text == "-") {
            break;
        }
        let item = line.text.strip_prefix('-').unwrap().trim();
        if item.is_empty() {
            return Err(FrontMatterError::ExpectedKeyValue(line.number));
        }
        items.push(parse_scalar_or_inline(item, line.number)?);
        *pos += 1;
    }
    Ok(Value::Seq(items))
}

fn parse_scalar_or_inline(text: &str, number: usize) -> Result<Value, FrontMatterError> {
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or(FrontMatterError::UnterminatedSequence(number))?;
        let mut items = Vec::new();
        for part in split_inline(inner, number)? {
            let part = part.trim();
            if !part.is_empty() {
                items.push(parse_scalar(part, number)?);
            }
        }
        return Ok(Value::Seq(items));
    }
    parse_scalar(text, number)
}

fn parse_scalar(text: &str, number: usize) -> Result<Value, FrontMatterError> {
    if text.starts_with('"') || text.starts_with('\'') {
        return Ok(Value::Str(unquote(text, number)?));
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    Ok(Value::Str(text.to_string()))
}

fn unquote(text: &str, number: usize) -> Result<String, FrontMatterError> {
    for quote in ['"', '\''] {
        if let Some(inner) = text.strip_prefix(quote) {
            return inner
                .strip_suffix(quote)
                .map(|s| s.to_string())
                .ok_or(FrontMatterError::UnterminatedString(number));
        }
    }
    Ok(text.to_string())
}

/// Split an inline sequence body on commas, respecting quoted segments.
fn split_inline(inner: &str, number: usize) -> Result<Vec<&str>, FrontMatterError> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (idx, c) in inner.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                ',' => {
                    parts.push(&inner[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    if quote.is_some() {
        return Err(FrontMatterError::UnterminatedString(number));
    }
    parts.push(&inner[start..]);
    Ok(parts)
}
