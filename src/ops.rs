//! Ops backing the web globals render modules may use, and the extension
//! that installs them together with `bootstrap.js`.

use std::time::Duration;

use anyhow::{anyhow, Error};
use deno_core::op2;

use crate::fetch::op_fetch;

// ============================================================================
// Console
// ============================================================================

/// Console levels as sent from `bootstrap.js`.
const LEVEL_DEBUG: u32 = 0;
const LEVEL_INFO: u32 = 1;
const LEVEL_WARN: u32 = 2;
const LEVEL_ERROR: u32 = 3;

#[op2(fast)]
pub fn op_console(level: u32, #[string] msg: &str) {
    match level {
        LEVEL_DEBUG => tracing::debug!(target: "ssr_bridge::console", "{}", msg),
        LEVEL_INFO => tracing::info!(target: "ssr_bridge::console", "{}", msg),
        LEVEL_WARN => tracing::warn!(target: "ssr_bridge::console", "{}", msg),
        LEVEL_ERROR => tracing::error!(target: "ssr_bridge::console", "{}", msg),
        _ => tracing::trace!(target: "ssr_bridge::console", "{}", msg),
    }
}

// ============================================================================
// Timers
// ============================================================================

#[op2(async)]
pub async fn op_sleep(millis: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
}

// ============================================================================
// Crypto
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

// ============================================================================
// Encoding
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> String {
    use base64::Engine;
    // Lenient: UTF-8 input is encoded as-is instead of rejecting non Latin-1.
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

deno_core::extension!(
    ssr_bridge,
    ops = [
        op_console,
        op_sleep,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_btoa,
        op_atob,
        op_fetch,
    ],
    esm_entry_point = "ext:ssr_bridge/bootstrap.js",
    esm = ["ext:ssr_bridge/bootstrap.js" = "src/bootstrap.js"],
);
