use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures_util::future::join_all;
use rand::{RngCore, rngs::OsRng};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use tokio::sync::RwLock;

use super::key_store::{KeyStore, KeyStoreError};

/// 本地没有该群组密钥时的占位文本
pub const KEY_NOT_AVAILABLE: &str = "[Encrypted - Key not available]";
/// 密文格式错误或认证失败时的占位文本
pub const DECRYPTION_FAILED: &str = "[Decryption failed]";

const KEY_LEN: usize = 32;
const ENVELOPE_SEPARATOR: char = ':';

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no key available for group {0}")]
    KeyNotFound(String),
    #[error("invalid group key: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    EncryptionFailure,
    #[error("malformed ciphertext envelope")]
    MalformedEnvelope,
    #[error("decryption failed")]
    DecryptionFailure,
    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn key_from_exported(exported: &str) -> Result<LessSafeKey, CryptoError> {
    let raw = BASE64
        .decode(exported.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if raw.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, &raw)
        .map_err(|_| CryptoError::InvalidKey("rejected by AES-256-GCM".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// 生成新的 256 位群组密钥，返回 base64 原始密钥
pub fn generate_exported_key() -> String {
    BASE64.encode(random_bytes::<KEY_LEN>())
}

/// 群组密钥环：内存缓存 + 本地持久化，查找顺序为 缓存 -> 本地存储 -> 失败
pub struct GroupKeyRing {
    cache: RwLock<HashMap<String, Arc<LessSafeKey>>>,
    store: Arc<dyn KeyStore>,
}

impl GroupKeyRing {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// 为群组生成新密钥并保存，返回导出形式供创建群组时提交
    pub async fn generate_group_key(&self, group_id: &str) -> Result<String, CryptoError> {
        let exported = generate_exported_key();
        self.import_group_key(group_id, &exported).await?;
        Ok(exported)
    }

    /// 导入服务端下发的密钥，重复导入会覆盖
    pub async fn import_group_key(&self, group_id: &str, exported: &str) -> Result<(), CryptoError> {
        let key = key_from_exported(exported)?;
        self.store.save(group_id, exported.trim()).await?;
        self.cache
            .write()
            .await
            .insert(group_id.to_string(), Arc::new(key));
        tracing::debug!("Imported key for group {}", group_id);
        Ok(())
    }

    pub async fn has_group_key(&self, group_id: &str) -> bool {
        matches!(self.key_for(group_id).await, Ok(Some(_)))
    }

    pub async fn remove_group_key(&self, group_id: &str) -> Result<(), CryptoError> {
        self.cache.write().await.remove(group_id);
        self.store.remove(group_id).await?;
        Ok(())
    }

    async fn key_for(&self, group_id: &str) -> Result<Option<Arc<LessSafeKey>>, CryptoError> {
        if let Some(key) = self.cache.read().await.get(group_id) {
            return Ok(Some(key.clone()));
        }

        let Some(exported) = self.store.load(group_id).await? else {
            return Ok(None);
        };
        let key = Arc::new(key_from_exported(&exported)?);
        self.cache
            .write()
            .await
            .insert(group_id.to_string(), key.clone());
        Ok(Some(key))
    }

    /// 加密为 `base64(nonce):base64(ciphertext||tag)`，每次调用都使用新的随机 nonce
    pub async fn encrypt_message(&self, group_id: &str, plaintext: &str) -> Result<String, CryptoError> {
        let key = self
            .key_for(group_id)
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound(group_id.to_string()))?;

        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::EncryptionFailure)?;

        Ok(format!(
            "{}{}{}",
            BASE64.encode(nonce_bytes),
            ENVELOPE_SEPARATOR,
            BASE64.encode(in_out)
        ))
    }

    /// 解密，失败时返回具体错误
    pub async fn try_decrypt(&self, group_id: &str, envelope: &str) -> Result<String, CryptoError> {
        let key = self
            .key_for(group_id)
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound(group_id.to_string()))?;

        let (nonce_b64, ciphertext_b64) = envelope
            .split_once(ENVELOPE_SEPARATOR)
            .ok_or(CryptoError::MalformedEnvelope)?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|_| CryptoError::MalformedEnvelope)?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| CryptoError::MalformedEnvelope)?;
        let mut in_out = BASE64
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::MalformedEnvelope)?;

        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailure)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::DecryptionFailure)
    }

    /// 解密用于展示，任何失败都降级为占位文本而不是返回错误
    pub async fn decrypt_message(&self, group_id: &str, envelope: &str) -> String {
        match self.try_decrypt(group_id, envelope).await {
            Ok(plaintext) => plaintext,
            Err(CryptoError::KeyNotFound(_)) => KEY_NOT_AVAILABLE.to_string(),
            Err(e) => {
                tracing::warn!("Failed to decrypt message in group {}: {}", group_id, e);
                DECRYPTION_FAILED.to_string()
            }
        }
    }

    /// 并发解密一组密文，单条失败不影响其他消息
    pub async fn decrypt_all(&self, group_id: &str, envelopes: &[String]) -> Vec<String> {
        join_all(
            envelopes
                .iter()
                .map(|envelope| self.decrypt_message(group_id, envelope)),
        )
        .await
    }
}
