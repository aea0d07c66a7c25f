//! Tracing setup and log helpers
//!
//! Logs are structured: every line about a payment carries `session_id`,
//! `invoice_id` or `job` as fields rather than interpolated text. Secrets
//! (gateway credentials, callback tokens, the internal webhook token) are
//! never logged; identifiers that reach logs in full go through the
//! `mask_*` helpers.

use std::env;
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides `LOG_LEVEL`.
pub fn init_tracing() {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let default_directive = format!(
        "paysession_backend={},tower_http=info,sqlx=warn",
        level.to_lowercase()
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // try_init so tests and repeated calls don't panic
    if json {
        let _ = fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_target(true)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(true).try_init();
    }
}

/// Run an outbound call and log its latency and outcome.
pub async fn log_external_call<F, T, E>(service: &str, operation: &str, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = call.await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => info!(service, operation, elapsed_ms, outcome = "ok", "External call completed"),
        Err(e) => warn!(
            service,
            operation,
            elapsed_ms,
            outcome = "error",
            error = %e,
            "External call failed"
        ),
    }

    result
}

/// Keep the head and tail of an identifier, hide the middle.
///
/// `"INV-1234567890"` becomes `"INV-...7890"`. Short values are fully hidden.
pub fn mask_identifier(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// User identifiers are logged masked.
pub fn mask_user_id(user_id: &str) -> String {
    mask_identifier(user_id)
}
