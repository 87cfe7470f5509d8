//! Bearer-token authentication for axum

use std::sync::Arc;

use apiary_core::{AuthError, Identity, IdentityProvider};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::{AppState, ServerError};

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Verify a token and keep the session's rejection count current
///
/// A token that is signed by us but otherwise rejected (expired, mostly)
/// counts against its subject's session; the second consecutive rejection
/// removes that session.
pub async fn authenticate(state: &AppState, token: &str) -> Result<Identity, AuthError> {
    match state.identity.verify(token) {
        Ok(identity) => {
            state
                .registry
                .record_auth_success(&IdentityProvider::session_id_for(&identity));
            Ok(identity)
        }
        Err(e) => {
            if let Some(subject) = state.identity.subject_of_rejected(token) {
                let removed = state.registry.record_auth_rejection(&subject).await;
                debug!(session_id = %subject, removed, error = %e, "Token rejected");
            }
            Err(e)
        }
    }
}

/// Reject requests without a valid identity token
///
/// On success the verified [`Identity`] is attached to the request extensions.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let token = bearer_token(request.headers()).ok_or(AuthError::MissingToken)?;
    let identity = authenticate(&state, token).await?;

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
