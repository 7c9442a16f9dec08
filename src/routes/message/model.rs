use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::database::{MessageEntity, MessageKind, NewMessage};
use crate::error::{RadrError, RadrResult};
use crate::events::RadrEvent;
use crate::routes::group::{display_name_of, load_active_group, require_member};
use crate::utils::Claims;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PostMessageRequest {
    /// 客户端加密后的密文，服务端不解析
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteMessageResponse {
    pub message_id: i64,
}

pub async fn post_message(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
    req: PostMessageRequest,
) -> RadrResult<MessageEntity> {
    let content = req
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| RadrError::validation("Message content required"))?;

    let group = load_active_group(state, group_id).await?;

    // 成员检查和写入在同一个原子操作里，已被移除的成员不会再写入消息
    let message = state
        .store
        .insert_member_message(NewMessage {
            group_id: group.id.clone(),
            user_id: actor.sub.clone(),
            kind: MessageKind::Text,
            content,
            metadata: serde_json::json!({}),
        })
        .await?
        .ok_or_else(|| RadrError::forbidden("Not a member of this group"))?;

    let sender_name = match display_name_of(state, &actor.sub).await {
        (name, Some(_)) => name,
        (_, None) => actor.username.clone(),
    };
    state.events.emit(RadrEvent::MessagePosted {
        group_id: group.id,
        group_name: group.target_name,
        sender_id: actor.sub.clone(),
        sender_name,
    });

    Ok(message)
}

pub async fn get_messages(
    state: &AppState,
    actor: &Claims,
    group_id: &str,
) -> RadrResult<Vec<MessageEntity>> {
    let group = load_active_group(state, group_id).await?;
    require_member(state, &group.id, &actor.sub).await?;

    Ok(state.store.list_messages(&group.id).await?)
}

/// 管理员硬删除
pub async fn delete_message(
    state: &AppState,
    actor: &Claims,
    message_id: i64,
) -> RadrResult<DeleteMessageResponse> {
    if !actor.is_admin {
        return Err(RadrError::forbidden("Admins only"));
    }

    if !state.store.delete_message(message_id).await? {
        return Err(RadrError::not_found("Message not found"));
    }

    tracing::info!("Message {} deleted by admin {}", message_id, actor.sub);
    Ok(DeleteMessageResponse { message_id })
}
