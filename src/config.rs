use once_cell::sync::Lazy;
use std::fs;

/// Base URL of the external charging engine ("charge module").
pub static CHARGE_MODULE_ENDPOINT: Lazy<String> = Lazy::new(|| {
    std::env::var("CHARGE_MODULE_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://127.0.0.1:8020".to_string())
});

/// Optional bearer token presented to the charging engine. May be supplied
/// directly or via a file path in `CHARGE_MODULE_TOKEN_FILE`.
pub static CHARGE_MODULE_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("CHARGE_MODULE_TOKEN", "CHARGE_MODULE_TOKEN_FILE"));

/// Per-request timeout for charging engine calls. A timed-out call is treated
/// as a job failure and follows the normal retry policy.
pub static CHARGE_MODULE_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("CHARGE_MODULE_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// Number of concurrent pipeline workers consuming the job queue.
pub static BILLING_WORKER_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    std::env::var("BILLING_WORKER_CONCURRENCY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(4)
});

/// Idle poll interval for workers when the queue is empty.
pub static BILLING_JOB_POLL_INTERVAL_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_JOB_POLL_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(500)
});

/// Attempts a job is given before it is marked failed for good.
pub static BILLING_JOB_MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("BILLING_JOB_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

/// Linear backoff step between retries of a failed job, in seconds.
pub static BILLING_JOB_RETRY_BACKOFF_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_JOB_RETRY_BACKOFF_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// How many financial years a supplementary batch reaches back over.
pub static BILLING_SUPPLEMENTARY_YEARS: Lazy<i32> = Lazy::new(|| {
    std::env::var("BILLING_SUPPLEMENTARY_YEARS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(6)
});

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}
