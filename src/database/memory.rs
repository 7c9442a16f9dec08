use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    GroupEntity, GroupSummary, MemberEntity, MemberSummary, MessageEntity, NewGroup, NewMessage,
    RadrStore, UserProfile,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserProfile>,
    groups: HashMap<String, GroupEntity>,
    // (group_id, user_id) -> 成员
    members: BTreeMap<(String, String), MemberEntity>,
    messages: BTreeMap<i64, MessageEntity>,
    next_message_id: i64,
}

impl MemoryState {
    fn push_message(&mut self, message: NewMessage) -> MessageEntity {
        self.next_message_id += 1;
        let author = self.users.get(&message.user_id);
        let entity = MessageEntity {
            id: self.next_message_id,
            group_id: message.group_id,
            user_id: message.user_id,
            kind: message.kind,
            content: message.content,
            metadata: message.metadata,
            created_at: Utc::now(),
            username: author.map(|u| u.username.clone()),
            name: author.and_then(|u| u.name.clone()),
        };
        self.messages.insert(entity.id, entity.clone());
        entity
    }

    fn insert_member(&mut self, group_id: &str, user_id: &str) -> bool {
        let key = (group_id.to_string(), user_id.to_string());
        if self.members.contains_key(&key) {
            return false;
        }
        self.members.insert(
            key,
            MemberEntity {
                group_id: group_id.to_string(),
                user_id: user_id.to_string(),
                has_arrived: false,
                arrived_at: None,
            },
        );
        true
    }

    fn members_of<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a MemberEntity> {
        self.members.values().filter(move |m| m.group_id == group_id)
    }
}

/// 内存存储实现，用于测试和本地开发；用户目录需要手动写入
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, profile: UserProfile) {
        let mut state = self.inner.lock().await;
        state.users.insert(profile.user_id.clone(), profile);
    }

    /// 直接写入一个群组（不写成员），用于构造过期等特殊数据
    pub async fn insert_group(&self, group: GroupEntity) {
        let mut state = self.inner.lock().await;
        state.groups.insert(group.id.clone(), group);
    }
}

#[async_trait]
impl RadrStore for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, SqlxError> {
        Ok(self.inner.lock().await.users.get(user_id).cloned())
    }

    async fn find_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<UserProfile>, SqlxError> {
        let state = self.inner.lock().await;
        Ok(state
            .users
            .values()
            .filter(|u| usernames.contains(&u.username))
            .cloned()
            .collect())
    }

    async fn create_group(
        &self,
        group: NewGroup,
        invitee_ids: &[String],
    ) -> Result<GroupEntity, SqlxError> {
        let mut state = self.inner.lock().await;

        let entity = GroupEntity {
            id: Uuid::new_v4().to_string(),
            creator_id: group.creator_id,
            target_name: group.target_name,
            target_lat: group.target_lat,
            target_lng: group.target_lng,
            target_radius_km: group.target_radius_km,
            expires_at: group.expires_at,
            encryption_key: group.encryption_key,
            created_at: Utc::now(),
        };
        state.groups.insert(entity.id.clone(), entity.clone());
        state.insert_member(&entity.id, &entity.creator_id);
        for user_id in invitee_ids {
            state.insert_member(&entity.id, user_id);
        }

        Ok(entity)
    }

    async fn find_group(&self, group_id: &str) -> Result<Option<GroupEntity>, SqlxError> {
        Ok(self.inner.lock().await.groups.get(group_id).cloned())
    }

    async fn list_groups_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupSummary>, SqlxError> {
        let state = self.inner.lock().await;

        let mut summaries: Vec<GroupSummary> = state
            .members
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|own| {
                let group = state.groups.get(&own.group_id)?;
                if group.is_expired(now) {
                    return None;
                }

                let mut roster: Vec<&MemberEntity> = state.members_of(&group.id).collect();
                roster.sort_by(|a, b| match (a.arrived_at, b.arrived_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => a.user_id.cmp(&b.user_id),
                });

                let members: Vec<MemberSummary> = roster
                    .iter()
                    .filter_map(|m| {
                        let user = state.users.get(&m.user_id)?;
                        Some(MemberSummary {
                            group_id: m.group_id.clone(),
                            user_id: m.user_id.clone(),
                            username: user.username.clone(),
                            name: user.name.clone(),
                            has_arrived: m.has_arrived,
                            profile_icon: user.profile_icon.clone(),
                            profile_color: user.profile_color.clone(),
                        })
                    })
                    .collect();

                Some(GroupSummary {
                    group: group.clone(),
                    has_arrived: own.has_arrived,
                    arrived_at: own.arrived_at,
                    member_count: roster.len() as i64,
                    arrived_count: roster.iter().filter(|m| m.has_arrived).count() as i64,
                    members,
                })
            })
            .collect();

        summaries.sort_by(|a, b| b.group.created_at.cmp(&a.group.created_at));
        Ok(summaries)
    }

    async fn find_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberEntity>, SqlxError> {
        let state = self.inner.lock().await;
        Ok(state
            .members
            .get(&(group_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn member_ids(&self, group_id: &str) -> Result<Vec<String>, SqlxError> {
        let state = self.inner.lock().await;
        Ok(state.members_of(group_id).map(|m| m.user_id.clone()).collect())
    }

    async fn add_members(
        &self,
        group_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<String>, SqlxError> {
        let mut state = self.inner.lock().await;
        Ok(user_ids
            .iter()
            .filter(|user_id| state.insert_member(group_id, user_id))
            .cloned()
            .collect())
    }

    async fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        leave_message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError> {
        let mut state = self.inner.lock().await;
        let key = (group_id.to_string(), user_id.to_string());
        if state.members.remove(&key).is_none() {
            return Ok(None);
        }
        Ok(Some(state.push_message(leave_message)))
    }

    async fn delete_group(&self, group_id: &str) -> Result<bool, SqlxError> {
        let mut state = self.inner.lock().await;
        if state.groups.remove(group_id).is_none() {
            return Ok(false);
        }
        state.members.retain(|(gid, _), _| gid != group_id);
        state.messages.retain(|_, m| m.group_id != group_id);
        Ok(true)
    }

    async fn mark_arrived(
        &self,
        group_id: &str,
        user_id: &str,
        arrival_message: NewMessage,
    ) -> Result<Option<(MemberEntity, MessageEntity)>, SqlxError> {
        let mut state = self.inner.lock().await;
        let key = (group_id.to_string(), user_id.to_string());

        let member = match state.members.get_mut(&key) {
            Some(member) if !member.has_arrived => {
                member.has_arrived = true;
                member.arrived_at = Some(Utc::now());
                member.clone()
            }
            _ => return Ok(None),
        };

        let message = state.push_message(arrival_message);
        Ok(Some((member, message)))
    }

    async fn insert_member_message(
        &self,
        message: NewMessage,
    ) -> Result<Option<MessageEntity>, SqlxError> {
        let mut state = self.inner.lock().await;
        let key = (message.group_id.clone(), message.user_id.clone());
        if !state.members.contains_key(&key) {
            return Ok(None);
        }
        Ok(Some(state.push_message(message)))
    }

    async fn list_messages(&self, group_id: &str) -> Result<Vec<MessageEntity>, SqlxError> {
        let state = self.inner.lock().await;
        let mut messages: Vec<MessageEntity> = state
            .messages
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn delete_message(&self, message_id: i64) -> Result<bool, SqlxError> {
        Ok(self.inner.lock().await.messages.remove(&message_id).is_some())
    }
}
