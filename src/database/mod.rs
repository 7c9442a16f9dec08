// 数据库模块
// 实体定义、存储接口，以及 Postgres / 内存两种实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Error as SqlxError;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// 群组实体，对应 radr_groups 表
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupEntity {
    pub id: String,
    pub creator_id: String,
    pub target_name: String,
    pub target_lat: f64,
    pub target_lng: f64,
    pub target_radius_km: f64,
    pub expires_at: DateTime<Utc>,
    /// base64 编码的原始 AES-256 密钥，服务端明文保存
    pub encryption_key: String,
    pub created_at: DateTime<Utc>,
}

impl GroupEntity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 群组成员实体，(group_id, user_id) 唯一
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberEntity {
    pub group_id: String,
    pub user_id: String,
    pub has_arrived: bool,
    pub arrived_at: Option<DateTime<Utc>>,
}

/// 消息类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// 客户端加密后的文本
    Text,
    /// 到达系统消息
    Arrival,
    /// 离开/被移除系统消息
    Leave,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Arrival => "arrival",
            MessageKind::Leave => "leave",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "arrival" => Some(MessageKind::Arrival),
            "leave" => Some(MessageKind::Leave),
            _ => None,
        }
    }
}

/// 消息实体，附带作者的显示信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity {
    pub id: i64,
    pub group_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub username: Option<String>,
    pub name: Option<String>,
}

/// 用户目录中的公开资料
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub name: Option<String>,
    pub country: Option<String>,
    pub profile_icon: Option<String>,
    pub profile_color: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

/// 成员名单中的一项
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberSummary {
    #[serde(skip)]
    pub group_id: String,
    pub user_id: String,
    pub username: String,
    pub name: Option<String>,
    pub has_arrived: bool,
    pub profile_icon: Option<String>,
    pub profile_color: Option<String>,
}

/// 某个用户视角下的群组
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub group: GroupEntity,
    pub has_arrived: bool,
    pub arrived_at: Option<DateTime<Utc>>,
    pub member_count: i64,
    pub arrived_count: i64,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub creator_id: String,
    pub target_name: String,
    pub target_lat: f64,
    pub target_lng: f64,
    pub target_radius_km: f64,
    pub expires_at: DateTime<Utc>,
    pub encryption_key: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: String,
    pub user_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// 存储接口
///
/// 每个方法都是一个原子操作：Postgres 实现中对应一个事务，
/// 内存实现中对应一次加锁。
#[async_trait]
pub trait RadrStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, SqlxError>;

    /// 按用户名批量解析，未知用户名直接忽略
    async fn find_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<UserProfile>, SqlxError>;

    /// 创建群组，同时写入创建者和受邀者的成员记录
    async fn create_group(
        &self,
        group: NewGroup,
        invitee_ids: &[String],
    ) -> Result<GroupEntity, SqlxError>;

    /// 不过滤过期群组
    async fn find_group(&self, group_id: &str) -> Result<Option<GroupEntity>, SqlxError>;

    /// 用户所在且未过期的群组，按创建时间倒序
    async fn list_groups_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupSummary>, SqlxError>;

    async fn find_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberEntity>, SqlxError>;

    async fn member_ids(&self, group_id: &str) -> Result<Vec<String>, SqlxError>;

    /// 幂等插入成员，返回本次真正新增的用户ID
    async fn add_members(
        &self,
        group_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<String>, SqlxError>;

    /// 删除成员并写入离开消息；成员不存在时返回 None 且不写消息
    async fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        leave_message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError>;

    /// 级联删除成员和消息
    async fn delete_group(&self, group_id: &str) -> Result<bool, SqlxError>;

    /// 仅当成员尚未到达时标记到达并写入到达消息；已到达时返回 None
    async fn mark_arrived(
        &self,
        group_id: &str,
        user_id: &str,
        arrival_message: NewMessage,
    ) -> Result<Option<(MemberEntity, MessageEntity)>, SqlxError>;

    /// 仅当作者仍是群组成员时写入消息，成员检查和写入是同一个原子操作；
    /// 作者不是成员时返回 None 且不写消息
    async fn insert_member_message(
        &self,
        message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError>;

    /// 按 created_at 升序
    async fn list_messages(&self, group_id: &str) -> Result<Vec<MessageEntity>, SqlxError>;

    async fn delete_message(&self, message_id: i64) -> Result<bool, SqlxError>;
}
