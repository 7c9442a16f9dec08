//! 客户端：群组密钥管理、消息加解密和接口封装。
//! 服务端只保存和转发密文。

mod api;
mod crypto;
mod key_store;
mod view;

pub use api::{ClientError, NewGroupParams, RadrClient};
pub use crypto::{
    CryptoError, DECRYPTION_FAILED, GroupKeyRing, KEY_NOT_AVAILABLE, generate_exported_key,
};
pub use key_store::{FileKeyStore, KeyStore, KeyStoreError, MemoryKeyStore};
pub use view::{ConversationView, FetchTicket};
