//! CMS webhook endpoint driving cache invalidation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{EntityKind, InvalidationEvent, Invalidator};

/// Payload shape sent by the CMS. Only `entity` drives invalidation; the
/// rest is logged for operators.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event: String,
    pub entity: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
}

pub async fn handle(
    State(invalidator): State<Arc<Invalidator>>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(
                target = "statio::http::webhook",
                error = %rejection,
                "invalid webhook payload"
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid payload"})),
            )
                .into_response();
        }
    };

    info!(
        target = "statio::http::webhook",
        event = %payload.event,
        entity = %payload.entity,
        action = %payload.action,
        slug = payload.slug.as_deref().unwrap_or(""),
        "webhook received"
    );

    let invalidated = match payload.entity.parse::<EntityKind>() {
        Ok(kind) => invalidator.apply(InvalidationEvent::Entity(kind)),
        Err(()) => {
            warn!(
                target = "statio::http::webhook",
                entity = %payload.entity,
                "unknown webhook entity"
            );
            0
        }
    };

    Json(json!({"success": true, "invalidated": invalidated})).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, http::Request, routing::post};
    use tower::ServiceExt;

    use crate::cache::{EntryMeta, Index, Store, Strategy};

    use super::*;

    fn app(entries: Vec<EntryMeta>) -> (Router, Index, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), 1024).unwrap());
        let index = Index::with_entries(entries);
        let invalidator = Arc::new(Invalidator::new(index.clone(), store));

        let router = Router::new()
            .route("/hooks/cms", post(handle))
            .with_state(invalidator);
        (router, index, dir)
    }

    fn entry(key: &str, strategy: Strategy) -> EntryMeta {
        EntryMeta::new(key, "/about", "en", strategy, None, "etag")
    }

    fn webhook_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/hooks/cms")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn post_event_marks_content_entries_stale() {
        let (app, index, _dir) = app(vec![
            entry("k1", Strategy::Static),
            entry("k2", Strategy::Immutable),
        ]);

        let response = app
            .oneshot(webhook_request(
                r#"{"event":"updated","entity":"post","action":"update","slug":"hello","id":7}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["invalidated"], 1);
        assert!(index.lookup("k1").unwrap().stale);
        assert!(!index.lookup("k2").unwrap().stale);
    }

    #[tokio::test]
    async fn keyvalue_event_reaches_immutable_entries() {
        let (app, index, _dir) = app(vec![entry("k1", Strategy::Immutable)]);

        let response = app
            .oneshot(webhook_request(r#"{"entity":"keyvalue"}"#))
            .await
            .unwrap();

        assert_eq!(body_json(response).await["invalidated"], 1);
        assert!(index.lookup("k1").unwrap().stale);
    }

    #[tokio::test]
    async fn unknown_entity_is_ignored() {
        let (app, index, _dir) = app(vec![entry("k1", Strategy::Static)]);

        let response = app
            .oneshot(webhook_request(r#"{"entity":"widget"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["invalidated"], 0);
        assert!(!index.lookup("k1").unwrap().stale);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let (app, _index, _dir) = app(Vec::new());

        let response = app.oneshot(webhook_request("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid payload");
    }
}
