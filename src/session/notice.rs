//! Structured messages the bridge itself sends to a client.
//!
//! Both are JSON-RPC 2.0 payloads so an editor-side client can surface them
//! without knowing about the bridge.

use serde_json::{json, Value};

use crate::adapter::ExitReport;

/// Notification method sent when the adapter could not be launched.
pub const SPAWN_FAILED_METHOD: &str = "bridge/spawnFailed";

/// Notification method sent when the adapter exited unexpectedly.
pub const ADAPTER_EXITED_METHOD: &str = "bridge/adapterExited";

/// JSON-RPC "internal error" code.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Spawn failure, as an error response when the first message was a
/// request (it had an `id`), otherwise as a notification.
#[must_use]
pub fn spawn_failed(request_id: Option<&Value>, capability: &str, message: &str) -> String {
    let data = json!({ "capability": capability, "message": message });
    match request_id {
        Some(id) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": INTERNAL_ERROR_CODE,
                "message": format!("failed to start adapter: {message}"),
                "data": data,
            },
        }),
        None => json!({
            "jsonrpc": "2.0",
            "method": SPAWN_FAILED_METHOD,
            "params": data,
        }),
    }
    .to_string()
}

/// Unexpected adapter exit, with whatever stderr was captured.
#[must_use]
pub fn adapter_exited(report: &ExitReport, stderr_tail: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": ADAPTER_EXITED_METHOD,
        "params": {
            "code": report.code,
            "reason": report.reason,
            "stderr": stderr_tail,
        },
    })
    .to_string()
}
