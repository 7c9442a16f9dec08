use axum::{
    Extension,
    extract::{Json, Path, State},
};

use crate::AppState;
use crate::routes::{HandlerResult, Done, created, done, ok};
use crate::utils::Claims;

use super::model::{
    self, AddMembersRequest, AddMembersResponse, CreateGroupRequest, GroupInfo, GroupListItem,
    InviteRequest, RemoveMemberRequest,
};

#[axum::debug_handler]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> HandlerResult<GroupInfo> {
    let group = model::create_group(&state, &claims, req).await?;
    Ok(created(group))
}

#[axum::debug_handler]
pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> HandlerResult<Vec<GroupListItem>> {
    Ok(ok(model::list_groups(&state, &claims).await?))
}

#[axum::debug_handler]
pub async fn add_members(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<AddMembersRequest>,
) -> HandlerResult<AddMembersResponse> {
    Ok(ok(model::add_members(&state, &claims, &group_id, req).await?))
}

#[axum::debug_handler]
pub async fn invite_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<InviteRequest>,
) -> HandlerResult<AddMembersResponse> {
    Ok(ok(model::invite_member(&state, &claims, &group_id, req).await?))
}

#[axum::debug_handler]
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<RemoveMemberRequest>,
) -> HandlerResult<Done> {
    model::remove_member(&state, &claims, &group_id, req).await?;
    Ok(done("Member removed successfully"))
}

#[axum::debug_handler]
pub async fn leave_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> HandlerResult<Done> {
    model::leave_group(&state, &claims, &group_id).await?;
    Ok(done("Left group successfully"))
}

#[axum::debug_handler]
pub async fn delete_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> HandlerResult<Done> {
    model::delete_group(&state, &claims, &group_id).await?;
    Ok(done("Group deleted successfully"))
}
