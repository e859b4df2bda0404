//! Structural change counting between two JSON trees.
//!
//! Feeds the poka-yoke gate: the orchestrator counts atomic differences
//! between the local and remote copies of a setting and asks for
//! confirmation when the count reaches the configured threshold.
//!
//! Counting rules:
//! - a changed, added, or removed leaf (or whole subtree) contributes 1;
//! - objects are compared key by key;
//! - arrays are compared by a caller-supplied identity key when every
//!   element carries it (extension lists use `id`), positionally otherwise;
//! - moving items inside a keyed array is never a change.

use serde_json::Value;

/// Count atomic differences between two JSON-like values. `None` stands for
/// an absent document; two absent documents are identical.
pub fn count(a: Option<&Value>, b: Option<&Value>, array_key: Option<&str>) -> usize {
    match (a, b) {
        (None, None) => 0,
        (Some(x), None) | (None, Some(x)) => {
            if x.is_null() {
                0
            } else {
                1
            }
        }
        (Some(x), Some(y)) => count_values(x, y, array_key),
    }
}

fn count_values(a: &Value, b: &Value, array_key: Option<&str>) -> usize {
    if a == b {
        return 0;
    }
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut n = 0;
            for (key, va) in ma {
                match mb.get(key) {
                    // The identity key compares case-insensitively, matching
                    // how keyed items are paired up.
                    Some(vb) if Some(key.as_str()) == array_key && same_identity(va, vb) => {}
                    Some(vb) => n += count_values(va, vb, array_key),
                    None => n += 1,
                }
            }
            for key in mb.keys() {
                if !ma.contains_key(key) {
                    n += 1;
                }
            }
            n
        }
        (Value::Array(xs), Value::Array(ys)) => match array_key {
            Some(key) if keyed(xs, key) && keyed(ys, key) => count_keyed(xs, ys, key),
            _ => count_positional(xs, ys, array_key),
        },
        // Type mismatch or differing scalar: one atomic change.
        _ => 1,
    }
}

/// Identity values (extension ids) are equal when they differ only by case.
fn same_identity(a: &Value, b: &Value) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => false,
    }
}

/// True when every array element is an object carrying the identity key.
fn keyed(items: &[Value], key: &str) -> bool {
    items
        .iter()
        .all(|v| v.get(key).map(Value::is_string).unwrap_or(false))
}

fn item_key(v: &Value, key: &str) -> String {
    // Identity keys (extension ids) compare case-insensitively.
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

/// Keyed comparison: pure moves count 0, per-item edits recurse, items
/// present on one side only count 1 each.
fn count_keyed(xs: &[Value], ys: &[Value], key: &str) -> usize {
    let mut n = 0;
    for x in xs {
        let kx = item_key(x, key);
        match ys.iter().find(|y| item_key(y, key) == kx) {
            Some(y) => n += count_values(x, y, Some(key)),
            None => n += 1,
        }
    }
    for y in ys {
        let ky = item_key(y, key);
        if !xs.iter().any(|x| item_key(x, key) == ky) {
            n += 1;
        }
    }
    n
}

fn count_positional(xs: &[Value], ys: &[Value], array_key: Option<&str>) -> usize {
    let shared = xs.len().min(ys.len());
    let mut n = xs.len().abs_diff(ys.len());
    for i in 0..shared {
        n += count_values(&xs[i], &ys[i], array_key);
    }
    n
}
