use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key store is corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),
}

/// 客户端持久化的群组密钥（base64 原始密钥），按群组ID索引
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load(&self, group_id: &str) -> Result<Option<String>, KeyStoreError>;
    async fn save(&self, group_id: &str, exported_key: &str) -> Result<(), KeyStoreError>;
    async fn remove(&self, group_id: &str) -> Result<(), KeyStoreError>;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self, group_id: &str) -> Result<Option<String>, KeyStoreError> {
        Ok(self.keys.lock().await.get(group_id).cloned())
    }

    async fn save(&self, group_id: &str, exported_key: &str) -> Result<(), KeyStoreError> {
        self.keys
            .lock()
            .await
            .insert(group_id.to_string(), exported_key.to_string());
        Ok(())
    }

    async fn remove(&self, group_id: &str) -> Result<(), KeyStoreError> {
        self.keys.lock().await.remove(group_id);
        Ok(())
    }
}

/// JSON 文件存储：{ "group_id": "base64 key", ... }
pub struct FileKeyStore {
    path: PathBuf,
    // 读改写整个文件，串行化避免互相覆盖
    write_lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, KeyStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, keys: &HashMap<String, String>) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(keys)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self, group_id: &str) -> Result<Option<String>, KeyStoreError> {
        Ok(self.read_all().await?.remove(group_id))
    }

    async fn save(&self, group_id: &str, exported_key: &str) -> Result<(), KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut keys = self.read_all().await?;
        keys.insert(group_id.to_string(), exported_key.to_string());
        self.write_all(&keys).await
    }

    async fn remove(&self, group_id: &str) -> Result<(), KeyStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut keys = self.read_all().await?;
        if keys.remove(group_id).is_some() {
            self.write_all(&keys).await?;
        }
        Ok(())
    }
}
