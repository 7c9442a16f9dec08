use axum::{
    Extension,
    extract::{Json, Path, State},
};

use crate::AppState;
use crate::routes::{HandlerResult, ok};
use crate::utils::Claims;

use super::model::{self, ArrivalResponse, CheckArrivalRequest};

#[axum::debug_handler]
pub async fn check_arrival(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<CheckArrivalRequest>,
) -> HandlerResult<ArrivalResponse> {
    let outcome = model::check_arrival(&state, &claims, &group_id, req).await?;
    Ok(ok(ArrivalResponse::from(outcome)))
}
