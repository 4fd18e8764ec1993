//! Upload callback parsing.
//!
//! The same server family answers with two shapes: a nested
//! `{state, code, message, data: {...}}` envelope and a flat legacy object.
//! Both must resolve to the same canonical [`UploadedObject`]; numbers
//! arrive as numbers or strings depending on the endpoint's vintage.

use serde_json::Value;

use super::{UploadError, UploadedObject};

/// Parses a server callback payload into the canonical record.
///
/// # Errors
///
/// [`UploadError::Api`] when the envelope carries an explicit failure
/// state, [`UploadError::Protocol`] when neither shape yields a file id
/// and pick code.
pub fn parse_callback(value: &Value) -> Result<UploadedObject, UploadError> {
    if let Some(state) = value.get("state") {
        let ok = state.as_bool().unwrap_or(true);
        if !ok {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upload rejected")
                .to_string();
            return Err(UploadError::Api {
                status: None,
                message,
            });
        }
    }

    // Envelope shape nests the interesting fields under `data`; the flat
    // legacy shape keeps them at the top level.
    let body = value.get("data").unwrap_or(value);

    let file_id = string_field(body, &["file_id", "fileId", "fid"]);
    let pick_code = string_field(body, &["pick_code", "pickCode", "pc"]);
    let size = u64_field(body, &["file_size", "fileSize", "size"]).unwrap_or(0);
    let sha1 = string_field(body, &["sha1", "sha", "file_sha1"]);

    match (file_id, pick_code) {
        (Some(file_id), Some(pick_code)) => Ok(UploadedObject {
            file_id,
            pick_code,
            size,
            sha1,
        }),
        _ => Err(UploadError::Protocol {
            message: format!("callback missing file_id/pick_code: {value}"),
        }),
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        match value.get(name) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn u64_field(value: &Value, names: &[&str]) -> Option<u64> {
    for name in names {
        match value.get(name) {
            Some(Value::Number(n)) => return n.as_u64(),
            Some(Value::String(s)) => {
                if let Ok(n) = s.parse() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}
