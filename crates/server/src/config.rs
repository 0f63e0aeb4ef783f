use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use livekit_integration::{LiveKitConfig, DEFAULT_TOKEN_TTL_SECONDS};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub livekit_api_key: String,
    pub livekit_api_secret: String,
    pub livekit_url: String,
    pub livekit_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            livekit_api_key: "devkey".into(),
            livekit_api_secret: "devsecret".into(),
            livekit_url: "ws://127.0.0.1:7880".into(),
            livekit_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
        }
    }
}

impl Settings {
    pub fn livekit(&self) -> LiveKitConfig {
        LiveKitConfig {
            api_key: self.livekit_api_key.clone(),
            api_secret: self.livekit_api_secret.clone(),
            ttl_seconds: self.livekit_ttl_seconds,
            url: self.livekit_url.clone(),
        }
    }
}

/// Keys accepted in `server.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    livekit_api_key: Option<String>,
    livekit_api_secret: Option<String>,
    livekit_url: Option<String>,
    livekit_ttl_seconds: Option<i64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<FileSettings>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!("config: ignoring unreadable server.toml: {err}");
            return;
        }
    };
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.livekit_api_key {
        settings.livekit_api_key = v;
    }
    if let Some(v) = file_cfg.livekit_api_secret {
        settings.livekit_api_secret = v;
    }
    if let Some(v) = file_cfg.livekit_url {
        settings.livekit_url = v;
    }
    if let Some(v) = file_cfg.livekit_ttl_seconds {
        settings.livekit_ttl_seconds = v;
    }
}

/// Plain names first, `APP__*` names win.
fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let lookup = |plain: &str, prefixed: &str| var(prefixed).or_else(|| var(plain));

    if let Some(v) = lookup("SERVER_BIND", "APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("DATABASE_URL", "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("LIVEKIT_API_KEY", "APP__LIVEKIT_API_KEY") {
        settings.livekit_api_key = v;
    }
    if let Some(v) = lookup("LIVEKIT_API_SECRET", "APP__LIVEKIT_API_SECRET") {
        settings.livekit_api_secret = v;
    }
    if let Some(v) = lookup("LIVEKIT_URL", "APP__LIVEKIT_URL") {
        settings.livekit_url = v;
    }
    if let Some(v) = var("APP__LIVEKIT_TTL_SECONDS") {
        match v.parse::<i64>() {
            Ok(parsed) => settings.livekit_ttl_seconds = parsed,
            Err(_) => warn!(value = %v, "config: APP__LIVEKIT_TTL_SECONDS is not a number"),
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url(path);
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return sqlite_url(path);
    }
    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }
    sqlite_url(raw_database_url)
}

// Drive-letter paths keep a single colon so sqlx does not read `C:` as a host.
fn sqlite_url(path: &str) -> String {
    let path = path.replace('\\', "/");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
