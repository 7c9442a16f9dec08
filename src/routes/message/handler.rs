use axum::{
    Extension,
    extract::{Json, Path, State},
};

use crate::AppState;
use crate::database::MessageEntity;
use crate::routes::{HandlerResult, created, ok};
use crate::utils::Claims;

use super::model::{self, DeleteMessageResponse, PostMessageRequest};

#[axum::debug_handler]
pub async fn post_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> HandlerResult<MessageEntity> {
    let message = model::post_message(&state, &claims, &group_id, req).await?;
    Ok(created(message))
}

#[axum::debug_handler]
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> HandlerResult<Vec<MessageEntity>> {
    Ok(ok(model::get_messages(&state, &claims, &group_id).await?))
}

#[axum::debug_handler]
pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<i64>,
) -> HandlerResult<DeleteMessageResponse> {
    Ok(ok(model::delete_message(&state, &claims, message_id).await?))
}
