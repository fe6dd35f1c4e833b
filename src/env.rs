/// Environment variable names used by this crate for convenient
/// configuration of the bundled Elasticsearch client.
///
/// These are purely helpers; the hook itself never reads the environment.

/// Elasticsearch base HTTP URL, e.g. `http://127.0.0.1:9200`.
pub const ELASTIC_HOOK_URL_ENV: &str = "ELASTIC_HOOK_URL";

/// Optional basic-auth user name.
pub const ELASTIC_HOOK_USERNAME_ENV: &str = "ELASTIC_HOOK_USERNAME";

/// Optional basic-auth password.
pub const ELASTIC_HOOK_PASSWORD_ENV: &str = "ELASTIC_HOOK_PASSWORD";

/// Per-request timeout in whole seconds.
pub const ELASTIC_HOOK_TIMEOUT_SECS_ENV: &str = "ELASTIC_HOOK_TIMEOUT_SECS";

/// Target index for demos and services that pick it from the environment.
pub const ELASTIC_HOOK_INDEX_ENV: &str = "ELASTIC_HOOK_INDEX";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
