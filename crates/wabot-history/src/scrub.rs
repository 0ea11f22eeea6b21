//! Base64 payload stripping.
//!
//! Image and audio skills store their raw payloads in tool responses. Sent
//! back to the model they cost thousands of tokens and carry no meaning, so
//! long base64 runs are replaced by a short marker.

use serde_json::Value;
use std::borrow::Cow;
use wabot_core::turn::Turn;

/// Characters inspected at the start of a candidate string.
const PREFIX_CHARS: usize = 200;
/// Minimum base64 run for a string to count as a payload.
const MIN_BASE64_RUN: usize = 100;

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')
}

fn looks_like_base64(s: &str, max_len: usize) -> bool {
    if s.len() <= max_len {
        return false;
    }
    let mut run = 0;
    for c in s.chars().take(PREFIX_CHARS) {
        if !is_base64_char(c) {
            return false;
        }
        run += 1;
    }
    run >= MIN_BASE64_RUN
}

fn marker(s: &str) -> String {
    format!("[base64 truncated: {} chars]", s.chars().count())
}

/// Replace payload strings anywhere inside `value`. Returns whether anything changed.
fn scrub_value(value: &mut Value, max_len: usize) -> bool {
    match value {
        Value::String(s) => {
            if looks_like_base64(s, max_len) {
                *s = marker(s);
                true
            } else {
                false
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| scrub_value(v, max_len) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| scrub_value(v, max_len) || changed),
        _ => false,
    }
}

/// Strip base64 payloads from a turn's content.
///
/// JSON content is walked recursively and re-serialized only if a field was
/// replaced. Plain text is replaced wholesale when it is itself a payload.
pub fn scrub_base64(content: &str, max_len: usize) -> Cow<'_, str> {
    match serde_json::from_str::<Value>(content) {
        Ok(mut value) => {
            if !scrub_value(&mut value, max_len) {
                return Cow::Borrowed(content);
            }
            match serde_json::to_string(&value) {
                Ok(s) => Cow::Owned(s),
                Err(_) => Cow::Borrowed(content),
            }
        }
        Err(_) if looks_like_base64(content, max_len) => Cow::Owned(marker(content)),
        Err(_) => Cow::Borrowed(content),
    }
}

/// Copy of `turns` with every content scrubbed.
pub fn scrub_turns(turns: &[Turn], max_len: usize) -> Vec<Turn> {
    turns
        .iter()
        .map(|turn| {
            let mut turn = turn.clone();
            if let Some(content) = turn.content.as_deref() {
                if let Cow::Owned(scrubbed) = scrub_base64(content, max_len) {
                    turn.content = Some(scrubbed);
                }
            }
            turn
        })
        .collect()
}
