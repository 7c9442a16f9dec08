use axum::{
    Extension,
    extract::{Json, Query, State},
};
use chrono::Utc;

use crate::AppState;
use crate::common::MapLocation;
use crate::error::RadrError;
use crate::routes::{Done, HandlerResult, done, ok};
use crate::utils::Claims;

use super::model::{NearbyQuery, NearbyUser, PresenceRecord, UpdatePresenceRequest};

// 位置上报API
#[axum::debug_handler]
pub async fn update_presence(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdatePresenceRequest>,
) -> HandlerResult<Done> {
    if !MapLocation::new(req.lat, req.lng).is_valid() {
        return Err(RadrError::validation("Invalid coordinates"));
    }

    // 头像信息查询失败不影响位置更新
    let profile = match state.store.find_user(&claims.sub).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!("Failed to load profile of {}: {}", claims.sub, e);
            None
        }
    };

    state
        .presence
        .update(PresenceRecord {
            user_id: claims.sub.clone(),
            username: claims.username.clone(),
            lat: req.lat,
            lng: req.lng,
            last_seen: Utc::now(),
            profile_icon: profile.as_ref().and_then(|p| p.profile_icon.clone()),
            profile_color: profile.and_then(|p| p.profile_color),
        })
        .await;

    Ok(done("Location updated"))
}

// 获取附近用户API
#[axum::debug_handler]
pub async fn get_nearby(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NearbyQuery>,
) -> HandlerResult<Vec<NearbyUser>> {
    let origin = MapLocation::new(query.lat, query.lng);
    if !origin.is_valid() {
        return Err(RadrError::validation("Missing coordinates"));
    }

    let nearby = state
        .presence
        .nearby(&claims.sub, origin, state.config.nearby_radius_km, Utc::now())
        .await;

    Ok(ok(nearby))
}
