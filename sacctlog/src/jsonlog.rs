// Structured logging: one JSON object per line on stdout, fields {ts, level, ...}.
//
// The callers pass a serde_json object with whatever fields the phase warrants (cluster, phase,
// month, start, end, exit_code, ...); ts and level are filled in here.  Timestamps are RFC 3339
// UTC with a trailing Z.

use crate::{now, rfc3339_utc};
use serde_json::Value;

pub fn info(fields: Value) {
    emit("INFO", fields);
}

pub fn warning(fields: Value) {
    emit("WARNING", fields);
}

pub fn error(fields: Value) {
    emit("ERROR", fields);
}

fn emit(level: &str, fields: Value) {
    match fields {
        Value::Object(mut map) => {
            map.insert("ts".to_string(), Value::String(rfc3339_utc(now())));
            map.insert("level".to_string(), Value::String(level.to_string()));
            println!("{}", Value::Object(map));
        }
        // Non-object payloads do not occur in this codebase; wrap rather than lose them.
        other => println!(
            "{}",
            serde_json::json!({"ts": rfc3339_utc(now()), "level": level, "msg": other})
        ),
    }
}

#[test]
fn test_emit_shapes() {
    // Just exercise both paths; output goes to the test harness's captured stdout.
    info(serde_json::json!({"cluster": "c1", "phase": "tick"}));
    error(serde_json::json!("plain"));
}
