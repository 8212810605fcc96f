// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical JSON writer.
//!
//! Byte accounting and the frozen episode stream both depend on a single
//! pinned serialization. A default encoder's key order and whitespace are
//! not part of its contract, so this module hand-rolls the encoding:
//!
//! - Object keys sorted bytewise; no duplicates possible (`serde_json`
//!   maps collapse them at parse time).
//! - Minimal separators: `,` and `:`, no insignificant whitespace.
//! - Control characters and all non-ASCII code points escaped as
//!   lowercase `\uXXXX` (surrogate pairs above the BMP), with the usual
//!   short escapes for `"`, `\`, BS, FF, LF, CR, TAB.
//! - Numbers rendered through `serde_json`'s itoa/ryu formatting, which
//!   is stable across platforms.
//!
//! The writer is pure and infallible: every [`Value`] has exactly one
//! canonical rendering, and equal values render to equal bytes.

use serde_json::{Map, Value};
use std::fmt::Write as _;

/// Renders `value` in the canonical encoding.
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Renders a bare JSON object in the canonical encoding.
///
/// Identical to wrapping the map in [`Value::Object`] first, without the
/// clone that would require.
#[must_use]
pub fn object_to_canonical_string(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(map, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // itoa for integers, ryu shortest round-trip for floats.
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    // Bytewise key order regardless of the map's own iteration order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        if let Some(v) = map.get(*key) {
            write_value(v, out);
        }
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) >= 0x80 => write_escaped(c, out),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_escaped(c: char, out: &mut String) {
    let code = c as u32;
    if code > 0xffff {
        // Surrogate pair for astral code points.
        let v = code - 0x1_0000;
        let hi = 0xd800 + (v >> 10);
        let lo = 0xdc00 + (v & 0x3ff);
        let _ = write!(out, "\\u{hi:04x}\\u{lo:04x}");
    } else {
        let _ = write!(out, "\\u{code:04x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_minimal_separators() {
        let v = json!({"b": 1, "a": [1, 2], "c": {"y": null, "x": true}});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":[1,2],"b":1,"c":{"x":true,"y":null}}"#
        );
    }

    #[test]
    fn scalars_render_plainly() {
        assert_eq!(to_canonical_string(&json!(null)), "null");
        assert_eq!(to_canonical_string(&json!(true)), "true");
        assert_eq!(to_canonical_string(&json!(-42)), "-42");
        assert_eq!(to_canonical_string(&json!(0.5)), "0.5");
        assert_eq!(to_canonical_string(&json!("ok")), r#""ok""#);
    }

    #[test]
    fn non_ascii_is_ascii_escaped() {
        assert_eq!(to_canonical_string(&json!("\u{e9}")), r#""\u00e9""#);
        assert_eq!(
            to_canonical_string(&json!("\u{1f600}")),
            r#""\ud83d\ude00""#
        );
    }

    #[test]
    fn control_chars_escaped() {
        assert_eq!(
            to_canonical_string(&json!("a\nb\u{01}c")),
            r#""a\nb\u0001c""#
        );
        assert_eq!(to_canonical_string(&json!("q\"\\")), r#""q\"\\""#);
    }

    #[test]
    fn equal_values_equal_bytes() {
        // Same object, different literal key order.
        let a = json!({"v": 1, "api": "x"});
        let b = json!({"api": "x", "v": 1});
        assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn object_writer_matches_value_writer() {
        let v = json!({"k": [1, {"n": 2}], "m": "s"});
        let Value::Object(map) = &v else {
            unreachable!()
        };
        assert_eq!(object_to_canonical_string(map), to_canonical_string(&v));
    }
}
