//! Property exclusion and merge over settings documents.
//!
//! Exclusion keeps user-marked top-level keys out of the uploaded copy;
//! merge repopulates those keys from the local copy when applying a remote
//! update. Both operate on commented-JSON text and leave all bytes outside
//! the edited regions alone (see [`crate::jsonc`]).

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::errors::SyncError;
use crate::jsonc::JsoncDocument;

/// Match a glob against a settings key or a lowercased extension id.
/// `*` and `?` stay within a path segment, `**` spans segments, `[...]`
/// classes pass through. Case-sensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match glob_to_regex(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            warn!(pattern, error = %e, "ignoring unparsable exclusion pattern");
            false
        }
    }
}

pub fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, text))
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for inner in chars.by_ref() {
                    re.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Whether the document asks to be reformatted after an edit. Read from the
/// `[json]` language block, then `[jsonc]`, then the top level; absent
/// means "format".
fn format_on_save(parsed: &Value) -> bool {
    for scope in ["[json]", "[jsonc]"] {
        if let Some(flag) = parsed.get(scope).and_then(|o| o.get("editor.formatOnSave")) {
            return flag.as_bool().unwrap_or(true);
        }
    }
    match parsed.get("editor.formatOnSave") {
        Some(flag) => flag.as_bool().unwrap_or(true),
        None => true,
    }
}

/// Remove every top-level key of `parsed` matching `patterns` from `text`.
/// Reformats the document afterwards when any key was removed and the
/// document's own format-on-save flag allows it.
pub fn exclude(text: &str, parsed: &Value, patterns: &[String]) -> Result<String, SyncError> {
    if patterns.is_empty() {
        return Ok(text.to_string());
    }
    let obj = match parsed.as_object() {
        Some(obj) => obj,
        None => return Ok(text.to_string()),
    };

    let mut targets: Vec<&String> = obj.keys().filter(|k| matches_any(patterns, k)).collect();
    targets.sort();

    let mut doc = JsoncDocument::new(text);
    let mut removed = false;
    for key in targets {
        removed |= doc.remove_key(key)?;
    }
    if removed && format_on_save(parsed) {
        doc.format()?;
    }
    Ok(doc.into_text())
}

/// Overlay the destination's values for excluded keys onto the source text.
///
/// For every key of either side matching `patterns`: when the destination
/// holds a different value, that value replaces the source's; when the
/// destination lacks the key, it is removed from the source text. Used on
/// download so locally-excluded keys survive the incoming remote copy.
pub fn merge(
    source_text: &str,
    dest_text: &str,
    patterns: &[String],
) -> Result<String, SyncError> {
    if patterns.is_empty() {
        return Ok(source_text.to_string());
    }
    let source = JsoncDocument::new(source_text).parse()?;
    let dest = JsoncDocument::new(dest_text).parse()?;
    let (source_obj, dest_obj) = match (source.as_object(), dest.as_object()) {
        (Some(s), Some(d)) => (s, d),
        _ => return Ok(source_text.to_string()),
    };

    let mut keys: Vec<&String> = source_obj
        .keys()
        .chain(dest_obj.keys())
        .filter(|k| matches_any(patterns, k))
        .collect();
    keys.sort();
    keys.dedup();

    let mut doc = JsoncDocument::new(source_text);
    let mut edited = false;
    for key in keys {
        match dest_obj.get(key.as_str()) {
            Some(dest_value) => {
                if source_obj.get(key.as_str()) != Some(dest_value) {
                    doc.set_key(key, dest_value)?;
                    edited = true;
                }
            }
            None => {
                edited |= doc.remove_key(key)?;
            }
        }
    }
    if edited {
        let merged = doc.parse()?;
        if format_on_save(&merged) {
            doc.format()?;
        }
    }
    Ok(doc.into_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_semantics() {
        assert!(glob_match("window.*", "window.zoomLevel"));
        assert!(glob_match("a.*", "a.b"));
        assert!(!glob_match("window.*", "editor.fontSize"));
        assert!(glob_match("**", "anything.at.all"));
        assert!(glob_match("sync?ng", "syncing"));
        assert!(glob_match("[st]ync", "sync"));
        // Case-sensitive.
        assert!(!glob_match("Window.*", "window.zoomLevel"));
    }

    #[test]
    fn test_exclude_removes_matching_keys() {
        let text = r#"{
    // local proxy, never uploaded
    "http.proxy": "http://10.0.0.1:8080",
    "editor.fontSize": 14
}"#;
        let parsed = crate::jsonc::parse(text).unwrap();
        let out = exclude(text, &parsed, &["http.*".to_string()]).unwrap();
        let v = crate::jsonc::parse(&out).unwrap();
        assert!(v.get("http.proxy").is_none());
        assert_eq!(v["editor.fontSize"], json!(14));
    }

    #[test]
    fn test_exclude_is_idempotent() {
        let text = "{\n    \"a.secret\": 1,\n    \"b\": 2\n}";
        let parsed = crate::jsonc::parse(text).unwrap();
        let patterns = vec!["a.*".to_string()];
        let once = exclude(text, &parsed, &patterns).unwrap();
        let parsed_once = crate::jsonc::parse(&once).unwrap();
        let twice = exclude(&once, &parsed_once, &patterns).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_exclude_honors_format_on_save_false() {
        let text = "{\"editor.formatOnSave\":false,\"x.y\":1,\"keep\":2}";
        let parsed = crate::jsonc::parse(text).unwrap();
        let out = exclude(text, &parsed, &["x.*".to_string()]).unwrap();
        // Removal happened but the document was not reformatted.
        assert!(!out.contains("x.y"));
        assert!(!out.contains("\n"));
    }

    #[test]
    fn test_exclude_reads_language_block_first() {
        let parsed = json!({
            "[json]": {"editor.formatOnSave": false},
            "editor.formatOnSave": true
        });
        assert!(!format_on_save(&parsed));
        assert!(format_on_save(&json!({})));
    }

    #[test]
    fn test_merge_restores_destination_values() {
        let source = "{\n    \"http.proxy\": \"stripped\",\n    \"theme\": \"light\"\n}";
        let dest = "{\n    \"http.proxy\": \"http://10.0.0.1:8080\",\n    \"theme\": \"dark\"\n}";
        let patterns = vec!["http.*".to_string()];
        let out = merge(source, dest, &patterns).unwrap();
        let v = crate::jsonc::parse(&out).unwrap();
        assert_eq!(v["http.proxy"], json!("http://10.0.0.1:8080"));
        // Non-matching keys come from the source.
        assert_eq!(v["theme"], json!("light"));
    }

    #[test]
    fn test_merge_removes_key_absent_in_destination() {
        let source = "{\n    \"http.proxy\": \"remote-only\",\n    \"theme\": \"light\"\n}";
        let dest = "{\n    \"theme\": \"dark\"\n}";
        let out = merge(source, dest, &["http.*".to_string()]).unwrap();
        let v = crate::jsonc::parse(&out).unwrap();
        assert!(v.get("http.proxy").is_none());
    }

    #[test]
    fn test_merge_adds_destination_only_key() {
        let source = "{\n    \"theme\": \"light\"\n}";
        let dest = "{\n    \"window.zoom\": 2\n}";
        let out = merge(source, dest, &["window.*".to_string()]).unwrap();
        let v = crate::jsonc::parse(&out).unwrap();
        assert_eq!(v["window.zoom"], json!(2));
    }

    #[test]
    fn test_merge_then_exclude_roundtrip() {
        let patterns = vec!["private.*".to_string()];
        let dest = "{\n    \"private.key\": \"local\",\n    \"shared\": 1\n}";
        let source = "{\n    \"shared\": 1\n}";

        let merged = merge(source, dest, &patterns).unwrap();
        let merged_value = crate::jsonc::parse(&merged).unwrap();
        assert_eq!(merged_value["private.key"], json!("local"));

        let stripped = exclude(&merged, &merged_value, &patterns).unwrap();
        let v = crate::jsonc::parse(&stripped).unwrap();
        assert!(v.get("private.key").is_none());
        assert_eq!(v["shared"], json!(1));
    }
}
