//! Output formatting: human-readable by default, a JSON envelope when
//! `--json` or `STEROIDS_JSON` is set.

use serde_json::json;

/// Print a success payload.
pub fn emit(json_mode: bool, human: &str, payload: &serde_json::Value) {
    if json_mode {
        let envelope = json!({ "success": true, "data": payload });
        println!("{envelope}");
    } else if !human.is_empty() {
        println!("{human}");
    }
}

/// Report an error and return the process exit code.
///
/// Engine errors carry their own stable code and exit code; anything else
/// is a general failure.
pub fn report_error(err: &anyhow::Error, json_mode: bool) -> i32 {
    let (code, exit, details) = err.downcast_ref::<steroids_core::Error>().map_or_else(
        || ("GENERAL_ERROR", 1, serde_json::Value::Null),
        |engine_err| {
            (
                engine_err.code(),
                engine_err.exit_code(),
                json!({ "retryable": engine_err.is_retryable() }),
            )
        },
    );

    if json_mode {
        let envelope = json!({
            "success": false,
            "error": {
                "code": code,
                "message": err.to_string(),
                "details": details,
            }
        });
        eprintln!("{envelope}");
    } else {
        eprintln!("error: {err:#}");
    }
    exit
}
