//! Built-in actions served by the `workhive-worker` daemon.
//!
//! Hosts with their own actions build their own daemon binary around
//! [`workhive_core::serve_stdio`]; this crate covers the common utilities
//! and the actions used to observe isolation.

use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use workhive_core::ipc::DAEMON_MARKER_ENV;
use workhive_core::{ActionContext, ActionRegistry, ActionResult, Parameters};

/// Registry holding every built-in action.
pub fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry);
    registry
}

/// Add the built-in actions to an existing registry.
pub fn register_builtins(registry: &mut ActionRegistry) {
    registry
        .register_fn("hash", hash)
        .register_fn("echo", echo)
        .register_fn("sleep", sleep)
        .register_fn("fail", fail)
        .register_fn("panic", panic)
        .register_fn("whoami", whoami)
        .register_fn("exit", exit);
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// `{"input": str}` -> hex SHA-256 of `input`.
fn hash(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let input: String = params.get("input")?;
    Ok(json!(sha256_hex(&input)))
}

/// Returns its parameters unchanged.
fn echo(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    Ok(serde_json::to_value(params)?)
}

/// `{"ms": u64}` -> sleeps, then returns `ms`.
fn sleep(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let ms: u64 = params.get("ms")?;
    thread::sleep(Duration::from_millis(ms));
    Ok(json!(ms))
}

fn fail(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let message = params
        .get_opt::<String>("message")?
        .unwrap_or_else(|| "requested failure".to_string());
    Err(message.into())
}

fn panic(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let message = params
        .get_opt::<String>("message")?
        .unwrap_or_else(|| "requested panic".to_string());
    panic!("{}", message);
}

/// Reports where it ran and bumps a counter in static state.
///
/// The counter lives in the context's statics, so it counts how many calls
/// have shared this slot. `{"sleep_ms": u64}` holds the slot a while first.
fn whoami(params: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
    use std::sync::atomic::{AtomicU64, Ordering};

    let hits = ctx.statics().get_or_init("whoami.hits", || AtomicU64::new(0))?;
    let count = hits.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(ms) = params.get_opt::<u64>("sleep_ms")? {
        thread::sleep(Duration::from_millis(ms));
    }

    Ok(json!({
        "pid": std::process::id(),
        "count": count,
        "strategy": ctx.strategy().to_string(),
        "item": ctx.item_id().as_u64(),
    }))
}

/// `{"code": i32}` -> terminates the daemon without replying.
///
/// Refuses to run outside a daemon, where it would take the host down.
fn exit(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    if std::env::var_os(DAEMON_MARKER_ENV).is_none() {
        return Err("exit is only available inside a daemon process".into());
    }
    let code = params.get_opt::<i32>("code")?.unwrap_or(1);
    tracing::warn!(code, "exiting daemon on request");
    std::process::exit(code);
}

/// Extract the pid a `whoami` result reports.
pub fn reported_pid(value: &Value) -> Option<u32> {
    value.get("pid")?.as_u64().map(|pid| pid as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vectors() {
        assert_eq!(
            sha256_hex("a"),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_builtin_names() {
        let registry = builtin_registry();
        assert_eq!(
            registry.names(),
            vec!["echo", "exit", "fail", "hash", "panic", "sleep", "whoami"]
        );
    }

    #[test]
    fn test_reported_pid() {
        assert_eq!(reported_pid(&json!({"pid": 42, "count": 1})), Some(42));
        assert_eq!(reported_pid(&json!({"count": 1})), None);
    }
}
