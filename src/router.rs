use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
};

use crate::AppState;
use crate::middleware::{RateLimiter, auth_middleware, log_errors, rate_limit};
use crate::routes::{arrival, group, message, presence};

fn radr_routes() -> Router<AppState> {
    Router::new()
        // 位置
        .route("/radr/update", post(presence::update_presence))
        .route("/radr/nearby", get(presence::get_nearby))
        // 群组
        .route(
            "/radr/groups",
            post(group::create_group).get(group::list_groups),
        )
        .route("/radr/groups/{id}", delete(group::delete_group))
        .route("/radr/groups/{id}/invite", post(group::invite_member))
        .route("/radr/groups/{id}/add-members", post(group::add_members))
        .route("/radr/groups/{id}/remove-member", post(group::remove_member))
        .route("/radr/groups/{id}/leave", post(group::leave_group))
        // 到达检测
        .route("/radr/groups/{id}/check-arrival", post(arrival::check_arrival))
        // 消息
        .route(
            "/radr/groups/{id}/messages",
            post(message::post_message).get(message::get_messages),
        )
        .route("/radr/messages/{id}", delete(message::delete_message))
}

/// 构建完整路由，所有接口都需要认证
pub fn build_router(state: AppState, rate_limiter: Option<RateLimiter>) -> Router {
    let protected = radr_routes().layer(from_fn_with_state(state.clone(), auth_middleware));

    let router = Router::new()
        .nest(&state.config.api_base_uri, protected)
        .layer(from_fn(log_errors));

    let router = match rate_limiter {
        Some(limiter) => router.layer(from_fn_with_state(Arc::new(limiter), rate_limit)),
        None => router,
    };

    router.with_state(state)
}
