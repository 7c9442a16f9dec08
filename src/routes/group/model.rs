use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::common::MapLocation;
use crate::database::{
    GroupEntity, MemberEntity, MemberSummary, MessageKind, NewGroup, NewMessage, UserProfile,
};
use crate::error::{RadrError, RadrResult};
use crate::events::RadrEvent;
use crate::utils::Claims;

/// AES-256 原始密钥长度
const GROUP_KEY_LEN: usize = 32;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CreateGroupRequest {
    pub target_name: Option<String>,
    pub target_lat: Option<f64>,
    pub target_lng: Option<f64>,
    pub target_radius_km: Option<f64>,
    pub expires_in_hours: Option<i64>,
    #[serde(default)]
    pub invite_usernames: Vec<String>,
    /// 客户端生成的群组密钥（base64）
    pub encryption_key: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AddMembersRequest {
    #[serde(default)]
    pub usernames: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InviteRequest {
    pub username: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoveMemberRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddMembersResponse {
    /// 本次新加入的用户ID
    pub added: Vec<String>,
}

/// 群组基本信息，不含密钥
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupInfo {
    pub id: String,
    pub creator_id: String,
    pub target_name: String,
    pub target_lat: f64,
    pub target_lng: f64,
    pub target_radius_km: f64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<GroupEntity> for GroupInfo {
    fn from(group: GroupEntity) -> Self {
        Self {
            id: group.id,
            creator_id: group.creator_id,
            target_name: group.target_name,
            target_lat: group.target_lat,
            target_lng: group.target_lng,
            target_radius_km: group.target_radius_km,
            expires_at: group.expires_at,
            created_at: group.created_at,
        }
    }
}

/// 群组列表中的一项，密钥只通过这里下发给成员
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupListItem {
    #[serde(flatten)]
    pub info: GroupInfo,
    pub encryption_key: String,
    pub has_arrived: bool,
    pub arrived_at: Option<DateTime<Utc>>,
    pub member_count: i64,
    pub arrived_count: i64,
    pub is_creator: bool,
    pub members: Vec<MemberSummary>,
}

// ---- 公共校验，供到达检测和消息模块复用 ----

pub(crate) async fn load_group(state: &AppState, group_id: &str) -> RadrResult<GroupEntity> {
    state
        .store
        .find_group(group_id)
        .await?
        .ok_or_else(|| RadrError::not_found("Group not found"))
}

/// 过期群组对读写操作不可见
pub(crate) async fn load_active_group(
    state: &AppState,
    group_id: &str,
) -> RadrResult<GroupEntity> {
    let group = load_group(state, group_id).await?;
    if group.is_expired(Utc::now()) {
        return Err(RadrError::not_found("Group not found"));
    }
    Ok(group)
}

pub(crate) async fn require_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> RadrResult<MemberEntity> {
    state
        .store
        .find_member(group_id, user_id)
        .await?
        .ok_or_else(|| RadrError::forbidden("Not a member of this group"))
}

fn ensure_creator(group: &GroupEntity, actor: &Claims, msg: &str) -> RadrResult<()> {
    if group.creator_id != actor.sub {
        return Err(RadrError::forbidden(msg));
    }
    Ok(())
}

/// 显示名：name -> username -> "Someone"
pub(crate) async fn display_name_of(state: &AppState, user_id: &str) -> (String, Option<UserProfile>) {
    match state.store.find_user(user_id).await {
        Ok(Some(profile)) => (profile.display_name().to_string(), Some(profile)),
        Ok(None) => ("Someone".to_string(), None),
        Err(e) => {
            tracing::warn!("Failed to load profile of {}: {}", user_id, e);
            ("Someone".to_string(), None)
        }
    }
}

// 发起人的显示名，目录查不到时退回 token 中的用户名
async fn actor_name(state: &AppState, actor: &Claims) -> String {
    match display_name_of(state, &actor.sub).await {
        (name, Some(_)) => name,
        (_, None) => actor.username.clone(),
    }
}

fn normalize_usernames(usernames: &[String]) -> Vec<String> {
    let mut names: Vec<String> = usernames
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn validate_key(key: Option<&str>) -> RadrResult<String> {
    let key = key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RadrError::validation("Encryption key required"))?;

    match BASE64.decode(key) {
        Ok(raw) if raw.len() == GROUP_KEY_LEN => Ok(key.to_string()),
        _ => Err(RadrError::validation(
            "Encryption key must be a base64 encoded 256-bit key",
        )),
    }
}

fn emit_invites(state: &AppState, group: &GroupEntity, inviter_name: &str, user_ids: &[String]) {
    for user_id in user_ids {
        state.events.emit(RadrEvent::MemberInvited {
            group_id: group.id.clone(),
            group_name: group.target_name.clone(),
            inviter_name: inviter_name.to_string(),
            user_id: user_id.clone(),
        });
    }
}

pub async fn create_group(
    state: &AppState,
    actor: &Claims,
    req: CreateGroupRequest,
) -> RadrResult<GroupInfo> {
    let target_name = req
        .target_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RadrError::validation("Target location details required"))?
        .to_string();

    let target = match (req.target_lat, req.target_lng) {
        (Some(lat), Some(lng)) => MapLocation::new(lat, lng),
        _ => return Err(RadrError::validation("Target location details required")),
    };
    if !target.is_valid() {
        return Err(RadrError::validation("Invalid target coordinates"));
    }

    let encryption_key = validate_key(req.encryption_key.as_deref())?;

    let radius_km = req
        .target_radius_km
        .unwrap_or(state.config.default_group_radius_km);
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(RadrError::validation("Radius must be a positive number"));
    }

    let ttl_hours = req
        .expires_in_hours
        .unwrap_or(state.config.default_group_ttl_hours);
    if ttl_hours <= 0 {
        return Err(RadrError::validation("Expiry must be at least one hour"));
    }

    // 未知用户名直接跳过
    let invitee_ids: Vec<String> = state
        .store
        .find_users_by_usernames(&normalize_usernames(&req.invite_usernames))
        .await?
        .into_iter()
        .map(|u| u.user_id)
        .filter(|id| id != &actor.sub)
        .collect();

    let group = state
        .store
        .create_group(
            NewGroup {
                creator_id: actor.sub.clone(),
                target_name,
                target_lat: target.latitude,
                target_lng: target.longitude,
                target_radius_km: radius_km,
                expires_at: Utc::now() + Duration::hours(ttl_hours),
                encryption_key,
            },
            &invitee_ids,
        )
        .await?;

    tracing::info!(
        "Group {} created by {} with {} invitees",
        group.id,
        actor.sub,
        invitee_ids.len()
    );

    let inviter = actor_name(state, actor).await;
    emit_invites(state, &group, &inviter, &invitee_ids);

    Ok(GroupInfo::from(group))
}

pub async fn list_groups(state: &AppState, actor: &Claims) -> RadrResult<Vec<GroupListItem>> {
    let summaries = state
        .store
        .list_groups_for_user(&actor.sub, Utc::now())
        .await?;

    Ok(summaries
        .into_iter()
        .map(|s| GroupListItem {
            is_creator: s.group.creator_id == actor.sub,
            encryption_key: s.group.encryption_key.clone(),
            info: GroupInfo::from(s.group),
            has_arrived: s.has_arrived,
            arrived_at: s.arrived_at,
            member_count: s.member_count,
            arrived_count: s.arrived_count,
            members: s.members,
        })
        .collect())
}

pub async fn add_members(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
    req: AddMembersRequest,
) -> RadrResult<AddMembersResponse> {
    let usernames = normalize_usernames(&req.usernames);
    if usernames.is_empty() {
        return Err(RadrError::validation("Invalid usernames"));
    }

    let group = load_active_group(state, group_id).await?;
    ensure_creator(&group, actor, "Only the group creator can add members")?;

    let user_ids: Vec<String> = state
        .store
        .find_users_by_usernames(&usernames)
        .await?
        .into_iter()
        .map(|u| u.user_id)
        .collect();

    let added = state.store.add_members(&group.id, &user_ids).await?;
    tracing::debug!("Added {} members to group {}", added.len(), group.id);

    let inviter = actor_name(state, actor).await;
    emit_invites(state, &group, &inviter, &added);

    Ok(AddMembersResponse { added })
}

pub async fn invite_member(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
    req: InviteRequest,
) -> RadrResult<AddMembersResponse> {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return Err(RadrError::validation("Username required"));
    }

    let group = load_active_group(state, group_id).await?;
    ensure_creator(&group, actor, "Only the group creator can invite members")?;

    let user = state
        .store
        .find_users_by_usernames(std::slice::from_ref(&username))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RadrError::not_found("User not found"))?;

    let added = state.store.add_members(&group.id, &[user.user_id]).await?;

    let inviter = actor_name(state, actor).await;
    emit_invites(state, &group, &inviter, &added);

    Ok(AddMembersResponse { added })
}

pub async fn remove_member(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
    req: RemoveMemberRequest,
) -> RadrResult<()> {
    if req.user_id.trim().is_empty() {
        return Err(RadrError::validation("Invalid userId"));
    }

    let group = load_group(state, group_id).await?;
    ensure_creator(&group, actor, "Only the group creator can remove members")?;
    if req.user_id == group.creator_id {
        return Err(RadrError::forbidden("Cannot remove the group creator"));
    }

    let (name, _) = display_name_of(state, &req.user_id).await;
    let message = NewMessage {
        group_id: group.id.clone(),
        user_id: req.user_id.clone(),
        kind: MessageKind::Leave,
        content: format!("{name} was removed from the group"),
        metadata: serde_json::json!({}),
    };

    state
        .store
        .remove_member(&group.id, &req.user_id, message)
        .await?
        .ok_or_else(|| RadrError::not_found("User is not a member of this group"))?;

    tracing::info!("User {} removed from group {}", req.user_id, group.id);
    Ok(())
}

pub async fn leave_group(state: &AppState, actor: &Claims, group_id: &str) -> RadrResult<()> {
    let group = load_group(state, group_id).await?;
    if group.creator_id == actor.sub {
        return Err(RadrError::forbidden(
            "Group creator cannot leave. Delete the group instead.",
        ));
    }

    let (name, _) = display_name_of(state, &actor.sub).await;
    let message = NewMessage {
        group_id: group.id.clone(),
        user_id: actor.sub.clone(),
        kind: MessageKind::Leave,
        content: format!("{name} left the group"),
        metadata: serde_json::json!({}),
    };

    state
        .store
        .remove_member(&group.id, &actor.sub, message)
        .await?
        .ok_or_else(|| RadrError::forbidden("Not a member of this group"))?;

    tracing::info!("User {} left group {}", actor.sub, group.id);
    Ok(())
}

pub async fn delete_group(state: &AppState, actor: &Claims, group_id: &str) -> RadrResult<()> {
    let group = load_group(state, group_id).await?;
    ensure_creator(&group, actor, "Only the group creator can delete this group")?;

    if !state.store.delete_group(&group.id).await? {
        return Err(RadrError::not_found("Group not found"));
    }

    tracing::info!("Group {} deleted by {}", group.id, actor.sub);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestWorld, group_key};

    fn create_req(invites: &[&str]) -> CreateGroupRequest {
        CreateGroupRequest {
            target_name: Some("Cafe".into()),
            target_lat: Some(10.0),
            target_lng: Some(20.0),
            target_radius_km: Some(1.0),
            expires_in_hours: Some(2),
            invite_usernames: invites.iter().map(|s| s.to_string()).collect(),
            encryption_key: Some(group_key()),
        }
    }

    #[tokio::test]
    async fn create_requires_target_and_key() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");

        let mut req = create_req(&[]);
        req.encryption_key = None;
        let err = create_group(&world.state, &alice, req).await.unwrap_err();
        assert!(matches!(err, RadrError::Validation(_)));

        let mut req = create_req(&[]);
        req.target_lat = None;
        let err = create_group(&world.state, &alice, req).await.unwrap_err();
        assert!(matches!(err, RadrError::Validation(_)));

        let mut req = create_req(&[]);
        req.target_name = Some("   ".into());
        let err = create_group(&world.state, &alice, req).await.unwrap_err();
        assert!(matches!(err, RadrError::Validation(_)));

        let mut req = create_req(&[]);
        req.encryption_key = Some("bm90LWEta2V5".into());
        let err = create_group(&world.state, &alice, req).await.unwrap_err();
        assert!(matches!(err, RadrError::Validation(_)));
    }

    #[tokio::test]
    async fn create_applies_defaults_and_skips_unknown_invitees() {
        let mut world = TestWorld::new().await;
        let alice = world.claims("alice");

        let mut req = create_req(&["bob", "nobody", "bob"]);
        req.target_radius_km = None;
        req.expires_in_hours = None;
        let group = create_group(&world.state, &alice, req).await.unwrap();
        assert_eq!(group.target_radius_km, 10.0);
        assert!(group.expires_at > Utc::now() + Duration::hours(23));

        let ids = world.state.store.member_ids(&group.id).await.unwrap();
        assert_eq!(ids.len(), 2);

        let events = world.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RadrEvent::MemberInvited { user_id, inviter_name, .. }
                if user_id == "u-bob" && inviter_name == "Alice"
        ));
    }

    #[tokio::test]
    async fn list_distributes_key_and_roster() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let bob = world.claims("bob");
        let group = create_group(&world.state, &alice, create_req(&["bob"]))
            .await
            .unwrap();

        let listed = list_groups(&world.state, &bob).await.unwrap();
        assert_eq!(listed.len(), 1);
        let item = &listed[0];
        assert_eq!(item.info.id, group.id);
        assert_eq!(item.encryption_key, group_key());
        assert!(!item.is_creator);
        assert_eq!(item.member_count, 2);
        assert_eq!(item.arrived_count, 0);
        assert_eq!(item.members.len(), 2);

        let carol = world.claims("carol");
        assert!(list_groups(&world.state, &carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_groups_are_hidden_but_kept() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let group = create_group(&world.state, &alice, create_req(&["bob"]))
            .await
            .unwrap();

        world.expire_group(&group.id).await;

        assert!(list_groups(&world.state, &alice).await.unwrap().is_empty());
        assert!(list_groups(&world.state, &world.claims("bob")).await.unwrap().is_empty());
        assert!(world.state.store.find_group(&group.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_groups_refuse_new_members() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let group = create_group(&world.state, &alice, create_req(&[]))
            .await
            .unwrap();
        world.expire_group(&group.id).await;

        let req = AddMembersRequest {
            usernames: vec!["bob".into()],
        };
        let err = add_members(&world.state, &alice, &group.id, req).await.unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));

        let req = InviteRequest {
            username: "carol".into(),
        };
        let err = invite_member(&world.state, &alice, &group.id, req).await.unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));

        assert_eq!(world.state.store.member_ids(&group.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_groups_can_still_be_cleaned_up() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let group = create_group(&world.state, &alice, create_req(&["bob", "carol"]))
            .await
            .unwrap();
        world.expire_group(&group.id).await;

        leave_group(&world.state, &world.claims("bob"), &group.id)
            .await
            .unwrap();
        let req = RemoveMemberRequest {
            user_id: "u-carol".into(),
        };
        remove_member(&world.state, &alice, &group.id, req).await.unwrap();
        assert_eq!(world.state.store.member_ids(&group.id).await.unwrap(), vec!["u-alice".to_string()]);

        delete_group(&world.state, &alice, &group.id).await.unwrap();
        assert!(world.state.store.find_group(&group.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_creator_can_add_and_invites_are_idempotent() {
        let mut world = TestWorld::new().await;
        let alice = world.claims("alice");
        let bob = world.claims("bob");
        let group = create_group(&world.state, &alice, create_req(&[]))
            .await
            .unwrap();
        world.drain_events();

        let req = || AddMembersRequest {
            usernames: vec!["bob".into(), "ghost".into()],
        };

        let err = add_members(&world.state, &bob, &group.id, req()).await.unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));
        assert!(world.state.store.find_member(&group.id, "u-bob").await.unwrap().is_none());

        let first = add_members(&world.state, &alice, &group.id, req()).await.unwrap();
        let second = add_members(&world.state, &alice, &group.id, req()).await.unwrap();
        assert_eq!(first.added, vec!["u-bob".to_string()]);
        assert!(second.added.is_empty());
        assert_eq!(world.state.store.member_ids(&group.id).await.unwrap().len(), 2);
        assert_eq!(world.drain_events().len(), 1);

        let err = add_members(&world.state, &alice, "missing", req()).await.unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));
    }

    #[tokio::test]
    async fn single_invite_reports_unknown_user() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let group = create_group(&world.state, &alice, create_req(&[]))
            .await
            .unwrap();

        let err = invite_member(
            &world.state,
            &alice,
            &group.id,
            InviteRequest {
                username: "ghost".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));

        let ok = invite_member(
            &world.state,
            &alice,
            &group.id,
            InviteRequest {
                username: "carol".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(ok.added, vec!["u-carol".to_string()]);
    }

    #[tokio::test]
    async fn creator_is_protected() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let bob = world.claims("bob");
        let group = create_group(&world.state, &alice, create_req(&["bob"]))
            .await
            .unwrap();

        let err = leave_group(&world.state, &alice, &group.id).await.unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));

        let err = remove_member(
            &world.state,
            &alice,
            &group.id,
            RemoveMemberRequest {
                user_id: "u-alice".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));

        // 非创建者移除他人被拒绝，且不留下任何改动
        let err = remove_member(
            &world.state,
            &bob,
            &group.id,
            RemoveMemberRequest {
                user_id: "u-alice".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));
        assert_eq!(world.state.store.member_ids(&group.id).await.unwrap().len(), 2);
        assert!(world.state.store.list_messages(&group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_and_remove_write_leave_messages() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let bob = world.claims("bob");
        let group = create_group(&world.state, &alice, create_req(&["bob", "carol"]))
            .await
            .unwrap();

        leave_group(&world.state, &bob, &group.id).await.unwrap();
        remove_member(
            &world.state,
            &alice,
            &group.id,
            RemoveMemberRequest {
                user_id: "u-carol".into(),
            },
        )
        .await
        .unwrap();

        let messages = world.state.store.list_messages(&group.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Bob left the group", "carol was removed from the group"]
        );
        assert!(messages.iter().all(|m| m.kind == MessageKind::Leave));

        // 已经离开的人再次离开
        let err = leave_group(&world.state, &bob, &group.id).await.unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));
    }

    #[tokio::test]
    async fn delete_is_creator_only_and_cascades() {
        let world = TestWorld::new().await;
        let alice = world.claims("alice");
        let bob = world.claims("bob");
        let group = create_group(&world.state, &alice, create_req(&["bob"]))
            .await
            .unwrap();

        let err = delete_group(&world.state, &bob, &group.id).await.unwrap_err();
        assert!(matches!(err, RadrError::Forbidden(_)));

        delete_group(&world.state, &alice, &group.id).await.unwrap();
        assert!(world.state.store.find_group(&group.id).await.unwrap().is_none());
        assert!(world.state.store.member_ids(&group.id).await.unwrap().is_empty());

        let err = delete_group(&world.state, &alice, &group.id).await.unwrap_err();
        assert!(matches!(err, RadrError::NotFound(_)));
    }
}
