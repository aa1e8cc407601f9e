//! Process configuration read from the environment (and a couple of CLI flags).

use std::time::Duration;

use reqwest::Url;
use tracing::warn;

use crate::audit::DEFAULT_AUDIT_LIMIT;
use crate::files::DEFAULT_RECONNECT_DELAY;

pub const PLACEHOLDER_BACKEND_URL: &str = "https://placeholder.supabase.co";
pub const PLACEHOLDER_BACKEND_KEY: &str = "placeholder-key";
/// Selects the in-process backend.
pub const MEMORY_BACKEND_URL: &str = "memory:";

const DEFAULT_HTTP_PORT: u16 = 3000;
const DEFAULT_FILES_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub backend_url: String,
    pub backend_key: String,
    pub files_url: String,
    pub http_port: u16,
    pub audit_limit: usize,
    pub reconnect_delay: Duration,
    pub secure_cookie: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: PLACEHOLDER_BACKEND_URL.to_string(),
            backend_key: PLACEHOLDER_BACKEND_KEY.to_string(),
            files_url: DEFAULT_FILES_URL.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            audit_limit: DEFAULT_AUDIT_LIMIT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            secure_cookie: false,
        }
    }
}

pub fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    args.windows(2).find(|w| w[0] == flag).and_then(|w| w[1].parse::<u16>().ok())
}

fn is_valid_url(s: &str) -> bool { Url::parse(s).is_ok() }

impl AppConfig {
    pub fn is_memory_backend(&self) -> bool { self.backend_url == MEMORY_BACKEND_URL }

    /// Build from a variable lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F, args: &[String]) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, fallback: &str| lookup(primary).or_else(|| lookup(fallback)).filter(|v| !v.trim().is_empty());
        let mut cfg = AppConfig::default();

        match get("ADMINPANEL_BACKEND_URL", "NEXT_PUBLIC_SUPABASE_URL") {
            Some(url) if url == MEMORY_BACKEND_URL || is_valid_url(&url) => cfg.backend_url = url,
            Some(url) => warn!(target: "startup", "backend url '{}' is not a valid URL; using placeholder", url),
            None => warn!(target: "startup", "backend url not configured; set ADMINPANEL_BACKEND_URL"),
        }
        if let Some(key) = get("ADMINPANEL_BACKEND_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY") {
            cfg.backend_key = key;
        }
        if let Some(url) = lookup("ADMINPANEL_FILES_URL").filter(|u| is_valid_url(u)) {
            cfg.files_url = url;
        }
        if let Some(port) = lookup("ADMINPANEL_HTTP_PORT").and_then(|p| p.parse::<u16>().ok()) {
            cfg.http_port = port;
        }
        if let Some(port) = parse_port_arg(args, "--port") {
            cfg.http_port = port;
        }
        if let Some(limit) = lookup("ADMINPANEL_AUDIT_LIMIT").and_then(|v| v.parse::<usize>().ok()).filter(|l| *l > 0) {
            cfg.audit_limit = limit;
        }
        if let Some(ms) = lookup("ADMINPANEL_RECONNECT_MS").and_then(|v| v.parse::<u64>().ok()) {
            cfg.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(b) = lookup("ADMINPANEL_SECURE_COOKIE").and_then(|v| parse_bool(&v)) {
            cfg.secure_cookie = b;
        }
        cfg
    }

    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_lookup(|k| std::env::var(k).ok(), &args)
    }
}
