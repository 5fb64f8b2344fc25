//! Test fixtures and data factories

use sync_worker::WorkerConfig;

/// Origin of the application under test.
pub const ORIGIN: &str = "http://localhost:3000";

/// Endpoint case writes go to.
pub const CASES: &str = "/api/v1/cases/";

/// Critical read endpoint served stale-while-revalidate.
pub const METRICS: &str = "/api/v1/dashboard/metrics";

pub const SHELL_HTML: &str = "<!DOCTYPE html><html><body><div id=\"app\"></div></body></html>";

pub const OFFLINE_HTML: &str =
    "<!DOCTYPE html><html><body><h1>You are offline</h1></body></html>";

pub const MANIFEST_JSON: &str = r#"{"name":"Case Desk","start_url":"/"}"#;

/// Worker configuration for the application, with a given cache generation.
pub fn app_config(cache_version: &str) -> WorkerConfig {
    WorkerConfig {
        origin: String::from(ORIGIN),
        cache_version: String::from(cache_version),
        ..WorkerConfig::default()
    }
}

/// Body the network serves for each precached shell asset.
pub fn shell_asset(path: &str) -> &'static str {
    match path {
        "/offline.html" => OFFLINE_HTML,
        "/manifest.json" => MANIFEST_JSON,
        _ => SHELL_HTML,
    }
}

/// JSON body for a new case.
pub fn case_payload(title: &str) -> String {
    serde_json::json!({
        "title": title,
        "priority": "high",
        "status": "open",
    })
    .to_string()
}

/// JSON body of the dashboard metrics endpoint.
pub fn metrics_body(open_cases: u32) -> String {
    serde_json::json!({
        "openCases": open_cases,
        "overdue": 2,
        "alerts": 1,
    })
    .to_string()
}
