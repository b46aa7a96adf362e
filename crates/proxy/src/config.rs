use std::fs;

use anyhow::Context;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub upstream_url: String,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".into(),
            upstream_url: "http://127.0.0.1:5000/api".into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    upstream_url: Option<String>,
    max_upload_bytes: Option<usize>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let raw = fs::read_to_string("proxy.toml").ok();
    resolve_settings(raw.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `proxy.toml`, then environment. Later `APP__*` names win over the short ones.
pub fn resolve_settings(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        let file_cfg: FileSettings = toml::from_str(raw).context("failed to parse proxy.toml")?;
        if let Some(v) = file_cfg.bind_addr {
            settings.bind_addr = v;
        }
        if let Some(v) = file_cfg.upstream_url {
            settings.upstream_url = v;
        }
        if let Some(v) = file_cfg.max_upload_bytes {
            settings.max_upload_bytes = v;
        }
    }

    if let Some(v) = env("PROXY_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("UPSTREAM_URL") {
        settings.upstream_url = v;
    }
    if let Some(v) = env("APP__UPSTREAM_URL") {
        settings.upstream_url = v;
    }

    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = v
            .trim()
            .parse()
            .with_context(|| format!("APP__MAX_UPLOAD_BYTES is not a byte count: '{v}'"))?;
    }

    settings.upstream_url = normalize_upstream_url(&settings.upstream_url)?;
    Ok(settings)
}

fn normalize_upstream_url(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed =
        Url::parse(trimmed).with_context(|| format!("invalid upstream url '{raw}'"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("upstream url must start with http:// or https://, got '{raw}'");
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
