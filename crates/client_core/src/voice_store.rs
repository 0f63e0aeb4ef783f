use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::VoiceSessionDescriptor;
use tokio::sync::Mutex;

/// Client-local durable slot holding at most one voice session descriptor.
#[async_trait]
pub trait VoiceSessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<VoiceSessionDescriptor>>;
    async fn save(&self, descriptor: &VoiceSessionDescriptor) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Descriptor kept as a JSON file, replaced atomically on every save.
pub struct FileVoiceSessionStore {
    path: PathBuf,
}

impl FileVoiceSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "voice_session".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl VoiceSessionStore for FileVoiceSessionStore {
    async fn load(&self) -> Result<Option<VoiceSessionDescriptor>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let descriptor = serde_json::from_slice(&raw)
            .with_context(|| format!("corrupt voice session file {}", self.path.display()))?;
        Ok(Some(descriptor))
    }

    async fn save(&self, descriptor: &VoiceSessionDescriptor) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let raw = serde_json::to_vec_pretty(descriptor)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, raw)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryVoiceSessionStore {
    slot: Mutex<Option<VoiceSessionDescriptor>>,
}

impl MemoryVoiceSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoiceSessionStore for MemoryVoiceSessionStore {
    async fn load(&self) -> Result<Option<VoiceSessionDescriptor>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, descriptor: &VoiceSessionDescriptor) -> Result<()> {
        *self.slot.lock().await = Some(descriptor.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{ChannelId, ServerId};

    fn descriptor(muted: bool) -> VoiceSessionDescriptor {
        VoiceSessionDescriptor {
            server_id: ServerId(1),
            channel_id: ChannelId(2),
            room_name: "1:2".into(),
            access_token: "token".into(),
            transport_url: "ws://localhost:7880".into(),
            display_name: "alice".into(),
            mic_muted: muted,
        }
    }

    #[tokio::test]
    async fn file_store_saves_replaces_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVoiceSessionStore::new(dir.path().join("state").join("voice.json"));

        assert_eq!(store.load().await.expect("empty"), None);
        store.save(&descriptor(false)).await.expect("save");
        store.save(&descriptor(true)).await.expect("replace");
        assert_eq!(store.load().await.expect("load"), Some(descriptor(true)));
        assert!(!dir.path().join("state").join("voice.json.tmp").exists());

        store.clear().await.expect("clear");
        store.clear().await.expect("clear twice");
        assert_eq!(store.load().await.expect("cleared"), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("voice.json");
        std::fs::write(&path, b"{not json").expect("write");
        let store = FileVoiceSessionStore::new(path);
        assert!(store.load().await.is_err());
    }
}
