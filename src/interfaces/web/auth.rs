use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::core::triggers::verify_webhook_token;

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Guards the administrative `/api` routes. Webhooks authenticate with their
/// own per-agent token and never pass through here.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        // No token configured: open access only on loopback.
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No admin token configured. Set api.admin_token before exposing the API on a non-loopback address.",
        );
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
        Some(token) if verify_webhook_token(expected, token) => next.run(req).await,
        Some(_) => unauthorized("Invalid admin token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::web::test_state;
    use axum::{Router, middleware, routing::get};
    use tower::util::ServiceExt;

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(state.clone(), require_admin))
            .with_state(state)
    }

    async fn status_for(state: AppState, bearer: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/api/ping");
        if let Some(token) = bearer {
            req = req.header("authorization", format!("Bearer {}", token));
        }
        protected_app(state)
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn loopback_without_token_is_open() {
        let (state, _dir) = test_state().await;
        assert_eq!(status_for(state, None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn public_host_without_token_is_closed() {
        let (mut state, _dir) = test_state().await;
        state.api_host = "0.0.0.0".into();
        assert_eq!(status_for(state, None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn configured_token_is_required() {
        let (mut state, _dir) = test_state().await;
        state.admin_token = Some("adm1n".into());
        assert_eq!(status_for(state.clone(), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(state.clone(), Some("wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(state, Some("adm1n")).await, StatusCode::OK);
    }
}
