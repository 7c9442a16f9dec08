use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use crate::AppState;
use crate::error::RadrError;
use crate::utils::verify_token;

fn bearer_token(req: &Request<Body>) -> Option<Authorization<Bearer>> {
    req.headers().typed_get::<Authorization<Bearer>>()
}

/// 校验 Bearer token，并把 Claims 放入请求扩展
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, RadrError> {
    let Some(auth) = bearer_token(&req) else {
        tracing::debug!("Missing bearer token for {}", req.uri().path());
        return Err(RadrError::Unauthorized);
    };

    let claims = verify_token(auth.token(), &state.config).map_err(|e| {
        tracing::debug!("Token verification failed: {}", e);
        RadrError::Unauthorized
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
