use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use livekit_integration::DEFAULT_TOKEN_TTL_SECONDS;
use serde::Deserialize;
use shared::rules::TYPING_IDLE_TIMEOUT_MS;

use crate::view::ViewOptions;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub page_size: u32,
    pub typing_debounce_ms: u64,
    pub voice_session_path: PathBuf,
    pub voice_token_ttl_seconds: i64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            page_size: 50,
            typing_debounce_ms: TYPING_IDLE_TIMEOUT_MS,
            voice_session_path: PathBuf::from("./data/voice_session.json"),
            voice_token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
        }
    }
}

impl ClientSettings {
    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            page_size: self.page_size,
            typing_debounce: self.typing_debounce(),
        }
    }
}

/// Defaults, then `client.toml` if present, then `CLIENT__*` env vars.
pub fn load_client_settings() -> anyhow::Result<ClientSettings> {
    build_settings(
        File::with_name("client").required(false),
        Environment::with_prefix("CLIENT")
            .separator("__")
            .try_parsing(true),
    )
}

fn build_settings<F>(file: F, env: Environment) -> anyhow::Result<ClientSettings>
where
    F: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(file)
        .add_source(env)
        .build()
        .context("failed to read client settings")?
        .try_deserialize()
        .context("invalid client settings")
}

pub fn settings_from_toml(raw: &str) -> anyhow::Result<ClientSettings> {
    build_settings(
        File::from_str(raw, FileFormat::Toml),
        Environment::with_prefix("CLIENT")
            .separator("__")
            .source(Some(config::Map::new())),
    )
}
