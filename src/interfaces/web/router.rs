use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{agents, events, jobs, memory, webhooks};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_api_router(state: AppState) -> Router {
    // Webhook callers authenticate with the per-agent token instead.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/agents/webhook/{agent_id}", post(webhooks::webhook_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route(
            "/api/agents",
            get(agents::get_agents).post(agents::create_agent_endpoint),
        )
        .route(
            "/api/agents/{agent_id}",
            get(agents::get_agent).delete(agents::delete_agent_endpoint),
        )
        .route("/api/agents/{agent_id}/run", post(agents::run_agent_endpoint))
        .route(
            "/api/agents/{agent_id}/sessions/{session_id}/messages",
            get(memory::get_session_messages),
        )
        .route(
            "/api/events/collection",
            post(events::collection_event_endpoint),
        )
        .route("/api/jobs/stats", get(jobs::get_job_stats))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state);

    public_routes.merge(admin_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::{AgentDefinition, TriggerSpec, test_agent};
    use crate::core::queue::JobQueue;
    use crate::interfaces::web::test_state;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::util::ServiceExt;

    async fn request(
        app: Router,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let body = body.map(Body::from).unwrap_or_else(Body::empty);
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(json!({}));
        (status, json)
    }

    fn hook_agent() -> AgentDefinition {
        let mut agent = test_agent("hook");
        agent.trigger = TriggerSpec::Webhook {
            token: "s3cret".into(),
        };
        agent
    }

    async fn pending(state: &AppState) -> u64 {
        state.engine.queue().stats().await.unwrap().pending
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let (state, _dir) = test_state().await;
        let resp = build_api_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn webhook_status_codes() {
        let (state, _dir) = test_state().await;
        state.engine.register_agent(hook_agent()).await.unwrap();
        let app = build_api_router(state.clone());
        let body = Some(r#"{"order": 7}"#.to_string());

        let (status, _) = request(
            app.clone(),
            Method::POST,
            "/agents/webhook/nobody",
            &[("Webhook-Token", "s3cret")],
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = request(
            app.clone(),
            Method::POST,
            "/agents/webhook/hook",
            &[("Webhook-Token", "nope")],
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = request(
            app.clone(),
            Method::POST,
            "/agents/webhook/hook",
            &[],
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(pending(&state).await, 0);

        let (status, _) = request(
            app.clone(),
            Method::POST,
            "/agents/webhook/hook",
            &[("Webhook-Token", "s3cret")],
            Some("{not json".into()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = request(
            app,
            Method::POST,
            "/agents/webhook/hook",
            &[("Webhook-Token", "s3cret")],
            body,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "Job accepted for processing");
        assert_eq!(pending(&state).await, 1);
    }

    #[tokio::test]
    async fn invalid_definition_reports_fields() {
        let (state, _dir) = test_state().await;
        let mut agent = test_agent("");
        agent.max_turns = -1;
        let (status, json) = request(
            build_api_router(state),
            Method::POST,
            "/api/agents",
            &[],
            Some(serde_json::to_string(&agent).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let fields: Vec<&str> = json["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["id", "max_turns"]);
    }

    #[tokio::test]
    async fn register_list_run_and_delete() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state.clone());

        let (status, json) = request(
            app.clone(),
            Method::POST,
            "/api/agents",
            &[],
            Some(serde_json::to_string(&test_agent("a1")).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["id"], "a1");

        let (_, json) = request(app.clone(), Method::GET, "/api/agents", &[], None).await;
        assert_eq!(json["agents"].as_array().unwrap().len(), 1);

        let (status, json) = request(
            app.clone(),
            Method::POST,
            "/api/agents/a1/run",
            &[],
            Some(r#"{"input":"go"}"#.into()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["job_id"].is_string());

        let (_, json) = request(app.clone(), Method::GET, "/api/jobs/stats", &[], None).await;
        assert_eq!(json["pending"], 1);

        let (status, _) = request(app.clone(), Method::DELETE, "/api/agents/a1", &[], None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = request(app, Method::DELETE, "/api/agents/a1", &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_messages_after_a_run() {
        let (state, _dir) = test_state().await;
        state.engine.register_agent(test_agent("m")).await.unwrap();
        state
            .engine
            .run_agent("m", "hello", &tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();

        let (status, json) = request(
            build_api_router(state),
            Method::GET,
            "/api/agents/m/sessions/m/messages?limit=1",
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "done");
    }

    #[tokio::test]
    async fn collection_events_reach_subscribers() {
        let (state, _dir) = test_state().await;
        let mut agent = test_agent("tagger");
        agent.trigger = TriggerSpec::CollectionEvent {
            collection: "posts".into(),
            events: vec!["item:created".into()],
        };
        state.engine.register_agent(agent).await.unwrap();
        let app = build_api_router(state.clone());

        let event = json!({
            "collection": "posts",
            "event": "item:created",
            "item_id": "12",
            "item_data": {"title": "hello"}
        });
        let (status, json) = request(
            app.clone(),
            Method::POST,
            "/api/events/collection",
            &[],
            Some(event.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["job_ids"].as_array().unwrap().len(), 1);

        let (status, _) = request(
            app,
            Method::POST,
            "/api/events/collection",
            &[],
            Some(json!({"collection": "posts", "event": "item:exploded"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
