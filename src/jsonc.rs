//! Commented-JSON document editing.
//!
//! Settings and keybindings files tolerate `//` and `/* */` comments and
//! trailing commas. The filter layer edits such documents structurally
//! (remove a top-level key, replace a key's value) while leaving every
//! other byte untouched, and optionally reformats the whole document with
//! a 4-space indent that keeps comments in place.

use serde_json::Value;

use crate::errors::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Punct(u8),
    Str,
    Scalar,
    LineComment,
    BlockComment,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokKind,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, SyncError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'{' | b'}' | b'[' | b']' | b':' | b',' => {
                tokens.push(Token {
                    kind: TokKind::Punct(c),
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
            b'"' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' => i += 2,
                        b'"' => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                if i > bytes.len() {
                    return Err(SyncError::Document("unterminated string".into()));
                }
                tokens.push(Token {
                    kind: TokKind::Str,
                    start,
                    end: i.min(bytes.len()),
                });
            }
            b'/' => {
                let start = i;
                if i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                    tokens.push(Token {
                        kind: TokKind::LineComment,
                        start,
                        end: i,
                    });
                } else if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                    i += 2;
                    while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                        i += 1;
                    }
                    if i + 1 >= bytes.len() {
                        return Err(SyncError::Document("unterminated block comment".into()));
                    }
                    i += 2;
                    tokens.push(Token {
                        kind: TokKind::BlockComment,
                        start,
                        end: i,
                    });
                } else {
                    return Err(SyncError::Document("stray '/'".into()));
                }
            }
            _ => {
                let start = i;
                while i < bytes.len()
                    && !matches!(
                        bytes[i],
                        b' ' | b'\t'
                            | b'\r'
                            | b'\n'
                            | b'{'
                            | b'}'
                            | b'['
                            | b']'
                            | b':'
                            | b','
                            | b'"'
                            | b'/'
                    )
                {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokKind::Scalar,
                    start,
                    end: i,
                });
            }
        }
    }
    Ok(tokens)
}

/// A top-level object member located in the source text.
#[derive(Debug, Clone)]
struct Member {
    key: String,
    /// Byte span from the key's opening quote through the value's last byte.
    start: usize,
    end: usize,
    /// Byte span of the value alone.
    value_start: usize,
    value_end: usize,
    /// Position of the separating comma after the value, if any.
    comma_after: Option<usize>,
    /// Position of the separating comma before the key, if any.
    comma_before: Option<usize>,
}

fn decode_key(raw: &str) -> Result<String, SyncError> {
    serde_json::from_str::<String>(raw)
        .map_err(|e| SyncError::Document(format!("bad member key {}: {}", raw, e)))
}

/// Locate the top-level members of an object document. Returns an empty
/// list when the document's root is not an object.
fn top_level_members(text: &str, tokens: &[Token]) -> Result<Vec<Member>, SyncError> {
    let mut members = Vec::new();
    let mut it = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| !matches!(t.kind, TokKind::LineComment | TokKind::BlockComment));

    match it.next() {
        Some((_, t)) if t.kind == TokKind::Punct(b'{') => {}
        _ => return Ok(members),
    }

    let mut pending_comma: Option<usize> = None;
    loop {
        let (_, key_tok) = match it.next() {
            Some(pair) => pair,
            None => return Err(SyncError::Document("unterminated object".into())),
        };
        match key_tok.kind {
            TokKind::Punct(b'}') => break,
            TokKind::Str => {}
            _ => return Err(SyncError::Document("expected member key".into())),
        }
        let key = decode_key(&text[key_tok.start..key_tok.end])?;

        match it.next() {
            Some((_, t)) if t.kind == TokKind::Punct(b':') => {}
            _ => return Err(SyncError::Document("expected ':' after key".into())),
        }

        // Consume one balanced value.
        let mut depth = 0usize;
        let mut value_start = None;
        let mut value_end = 0usize;
        loop {
            let (_, t) = match it.next() {
                Some(pair) => pair,
                None => return Err(SyncError::Document("unterminated value".into())),
            };
            if value_start.is_none() {
                value_start = Some(t.start);
            }
            match t.kind {
                TokKind::Punct(b'{') | TokKind::Punct(b'[') => depth += 1,
                TokKind::Punct(b'}') | TokKind::Punct(b']') => {
                    if depth == 0 {
                        return Err(SyncError::Document("unbalanced value".into()));
                    }
                    depth -= 1;
                }
                _ => {}
            }
            value_end = t.end;
            if depth == 0 {
                break;
            }
        }
        let value_start = value_start.unwrap_or(value_end);

        // Separator: comma, or the closing brace.
        let mut comma_after = None;
        let mut done = false;
        match it.next() {
            Some((_, t)) if t.kind == TokKind::Punct(b',') => comma_after = Some(t.start),
            Some((_, t)) if t.kind == TokKind::Punct(b'}') => done = true,
            _ => return Err(SyncError::Document("expected ',' or '}'".into())),
        }

        members.push(Member {
            key,
            start: key_tok.start,
            end: value_end,
            value_start,
            value_end,
            comma_after,
            comma_before: pending_comma,
        });
        pending_comma = comma_after;
        if done {
            break;
        }
    }
    Ok(members)
}

/// Parse tolerant JSON (comments and trailing commas allowed) into a value.
pub fn parse(text: &str) -> Result<Value, SyncError> {
    let tokens = tokenize(text)?;
    let mut plain = String::with_capacity(text.len());
    let kept: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t.kind, TokKind::LineComment | TokKind::BlockComment))
        .collect();
    for (i, t) in kept.iter().enumerate() {
        // Drop trailing commas before a closing bracket.
        if t.kind == TokKind::Punct(b',')
            && matches!(
                kept.get(i + 1).map(|n| n.kind),
                Some(TokKind::Punct(b'}')) | Some(TokKind::Punct(b']'))
            )
        {
            continue;
        }
        plain.push_str(&text[t.start..t.end]);
        plain.push(' ');
    }
    serde_json::from_str(plain.trim())
        .map_err(|e| SyncError::Document(format!("invalid JSON: {}", e)))
}

/// Serialize a value with the 4-space style used for settings documents.
pub fn to_pretty(value: &Value) -> String {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    serde::Serialize::serialize(value, &mut ser).expect("serializing a Value cannot fail");
    String::from_utf8(buf).expect("serde_json emits UTF-8")
}

/// An editable commented-JSON document.
#[derive(Debug, Clone)]
pub struct JsoncDocument {
    text: String,
}

impl JsoncDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn parse(&self) -> Result<Value, SyncError> {
        if self.text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        parse(&self.text)
    }

    fn members(&self) -> Result<Vec<Member>, SyncError> {
        let tokens = tokenize(&self.text)?;
        top_level_members(&self.text, &tokens)
    }

    pub fn top_level_keys(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.members()?.into_iter().map(|m| m.key).collect())
    }

    /// Remove a top-level key and its value, taking one adjacent comma with
    /// it. Returns false when the key is not present.
    pub fn remove_key(&mut self, key: &str) -> Result<bool, SyncError> {
        let members = self.members()?;
        let member = match members.iter().find(|m| m.key == key) {
            Some(m) => m,
            None => return Ok(false),
        };

        let (mut start, mut end) = (member.start, member.end);
        if let Some(comma) = member.comma_after {
            end = comma + 1;
        } else if let Some(comma) = member.comma_before {
            start = comma;
        }

        // Swallow the whitespace-only remainder of the line, so removal does
        // not leave a blank line behind.
        let bytes = self.text.as_bytes();
        let mut line_start = start;
        while line_start > 0 && matches!(bytes[line_start - 1], b' ' | b'\t') {
            line_start -= 1;
        }
        let mut line_end = end;
        while line_end < bytes.len() && matches!(bytes[line_end], b' ' | b'\t') {
            line_end += 1;
        }
        if line_end < bytes.len() && bytes[line_end] == b'\r' {
            line_end += 1;
        }
        if (line_start == 0 || bytes[line_start - 1] == b'\n')
            && line_end < bytes.len()
            && bytes[line_end] == b'\n'
        {
            line_end += 1;
            start = line_start;
            end = line_end;
        }

        self.text.replace_range(start..end, "");
        Ok(true)
    }

    /// Replace the value of a top-level key, or insert the member after the
    /// last existing one when the key is absent.
    pub fn set_key(&mut self, key: &str, value: &Value) -> Result<(), SyncError> {
        let members = self.members()?;
        let rendered = indent_lines(&to_pretty(value), "    ");

        if let Some(member) = members.iter().find(|m| m.key == key) {
            let range = member.value_start..member.value_end;
            self.text.replace_range(range, rendered.trim_start());
            return Ok(());
        }

        let encoded_key = serde_json::to_string(key)
            .map_err(|e| SyncError::Document(format!("bad member key {}: {}", key, e)))?;
        let piece = format!("    {}: {}", encoded_key, rendered);
        match members.last() {
            Some(last) => {
                let anchor = last.comma_after.map(|c| c + 1).unwrap_or(last.end);
                let mut insertion = String::new();
                if last.comma_after.is_none() {
                    insertion.push(',');
                }
                insertion.push('\n');
                insertion.push_str(piece.trim_end());
                self.text.insert_str(anchor, &insertion);
            }
            None => {
                // Empty or blank object document.
                let tokens = tokenize(&self.text)?;
                let open = tokens.iter().find(|t| t.kind == TokKind::Punct(b'{'));
                match open {
                    Some(t) => {
                        let at = t.end;
                        self.text.insert_str(at, &format!("\n{}\n", piece.trim_end()));
                    }
                    None => {
                        self.text = format!("{{\n{}\n}}", piece.trim_end());
                    }
                }
            }
        }
        Ok(())
    }

    /// Reformat the whole document with 4-space indentation, keeping
    /// comments where they were (trailing comments stay trailing).
    pub fn format(&mut self) -> Result<(), SyncError> {
        let tokens = tokenize(&self.text)?;
        if tokens.is_empty() {
            return Ok(());
        }
        let text = &self.text;
        let mut out = String::with_capacity(text.len());
        let mut indent: usize = 0;
        let mut at_line_start = true;
        let mut prev_end: usize = 0;
        let mut prev_kind: Option<TokKind> = None;

        let push_indent = |out: &mut String, indent: usize| {
            for _ in 0..indent {
                out.push_str("    ");
            }
        };

        let mut i = 0;
        while i < tokens.len() {
            let t = tokens[i];
            let raw = &text[t.start..t.end];
            match t.kind {
                TokKind::Punct(b'{') | TokKind::Punct(b'[') => {
                    if at_line_start {
                        push_indent(&mut out, indent);
                    }
                    out.push_str(raw);
                    indent += 1;
                    // Collapse an immediately-following close into {} / [].
                    let close = match t.kind {
                        TokKind::Punct(b'{') => b'}',
                        _ => b']',
                    };
                    if let Some(n) = tokens.get(i + 1) {
                        if n.kind == TokKind::Punct(close) {
                            out.push(close as char);
                            indent -= 1;
                            prev_end = n.end;
                            prev_kind = Some(n.kind);
                            at_line_start = false;
                            i += 2;
                            continue;
                        }
                    }
                    out.push('\n');
                    at_line_start = true;
                }
                TokKind::Punct(b'}') | TokKind::Punct(b']') => {
                    indent = indent.saturating_sub(1);
                    if !at_line_start {
                        out.push('\n');
                    }
                    push_indent(&mut out, indent);
                    out.push_str(raw);
                    at_line_start = false;
                }
                TokKind::Punct(b',') => {
                    out.push(',');
                    out.push('\n');
                    at_line_start = true;
                }
                TokKind::Punct(b':') => {
                    out.push_str(": ");
                    at_line_start = false;
                }
                TokKind::Str | TokKind::Scalar => {
                    if at_line_start {
                        push_indent(&mut out, indent);
                        at_line_start = false;
                    }
                    out.push_str(raw);
                }
                TokKind::LineComment | TokKind::BlockComment => {
                    let trailing = prev_kind.is_some()
                        && !text[prev_end..t.start].contains('\n')
                        && !at_line_start;
                    if trailing {
                        out.push(' ');
                        out.push_str(raw);
                    } else {
                        if !at_line_start {
                            out.push('\n');
                        }
                        push_indent(&mut out, indent);
                        out.push_str(raw);
                    }
                    if t.kind == TokKind::LineComment {
                        out.push('\n');
                        at_line_start = true;
                    } else if !trailing {
                        out.push('\n');
                        at_line_start = true;
                    }
                }
                TokKind::Punct(_) => unreachable!("tokenizer emits known punctuation only"),
            }
            prev_end = t.end;
            prev_kind = Some(t.kind);
            i += 1;
        }
        out.push('\n');
        self.text = out;
        Ok(())
    }
}

/// Re-indent the tail lines of a rendered value so nested content lines up
/// under a top-level member.
fn indent_lines(rendered: &str, pad: &str) -> String {
    let mut lines = rendered.lines();
    let mut out = String::new();
    if let Some(first) = lines.next() {
        out.push_str(first);
    }
    for line in lines {
        out.push('\n');
        out.push_str(pad);
        out.push_str(line);
    }
    out
}
