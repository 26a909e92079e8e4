use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use evoforge::config::EvoForgeConfig;
use evoforge::oracle::{OracleClient, OracleError};
use evoforge::server::{router, AppState};
use std::sync::Arc;
use tower::util::ServiceExt;

/// Oracle that immediately drives any run to a breakthrough.
struct InstantOracle;

#[async_trait]
impl OracleClient for InstantOracle {
    async fn ask(&self, _model: &str, prompt: &str) -> Result<String, OracleError> {
        if prompt.contains("Propose exactly") {
            return Ok(String::from(
                "[{\"title\": \"A\", \"description\": \"d\", \"approach\": \"x\", \"novelty\": 0.5}]",
            ));
        }
        if prompt.contains("Mentally simulate") {
            return Ok(String::from(
                "{\"viability\": 0.9, \"metrics\": {}, \"risks\": [\"r\"], \"recommendations\": [\"g\"]}",
            ));
        }
        if prompt.contains("Review the subject adversarially") {
            return Ok(String::from(
                "{\"flaws\": [], \"strengths\": [], \"biases_detected\": [], \
                 \"assessment\": \"approve\", \"confidence\": 0.9}",
            ));
        }
        Ok(String::from(
            "{\"consensus\": 0.95, \"combined_approach\": \"done\", \"ready_to_spawn\": false}",
        ))
    }
}

fn test_state() -> AppState {
    AppState::new(EvoForgeConfig::default(), Arc::new(InstantOracle))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let app = router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn create_then_query_run() {
    let state = test_state();
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/runs",
            serde_json::json!({"title": "Test mandate", "max_iterations": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let run_id = created["runId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{}", run_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["runId"], run_id.as_str());
    assert_eq!(status["title"], "Test mandate");
    assert!(status["population"]["agents"].as_array().unwrap().len() >= 4);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/runs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["runs"].as_array().unwrap().len(), 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{}/lineage", run_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let lineage = body_json(response).await;
    assert_eq!(lineage["stats"]["total_agents"], 4);
    assert_eq!(lineage["familyTree"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn create_run_rejects_bad_mandates() {
    let app = router(test_state());

    let response = app
        .clone()
        .oneshot(post_json("/runs", serde_json::json!({"title": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            "/runs",
            serde_json::json!({"title": "x", "max_agents": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // missing title entirely is a deserialization failure
    let response = app
        .oneshot(post_json("/runs", serde_json::json!({"description": "no title"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let app = router(test_state());
    for uri in ["/runs/nope", "/runs/nope/lineage", "/runs/nope/events"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {}", uri);
    }
}

#[tokio::test]
async fn event_stream_has_sse_content_type() {
    let state = test_state();
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json("/runs", serde_json::json!({"title": "SSE run"})))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{}/events", run_id))
                .header("last-event-id", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn breed_endpoint_dispatches_to_the_run() {
    let state = test_state();
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/runs",
            serde_json::json!({"title": "Breeding run", "max_iterations": 1}),
        ))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/runs/{}/breed", run_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    // either accepted while running, or 409 if the run already finished
    assert!(
        response.status() == StatusCode::OK || response.status() == StatusCode::CONFLICT,
        "unexpected status {}",
        response.status()
    );

    let response = app
        .oneshot(post_json("/runs/nope/breed", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
