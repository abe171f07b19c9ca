use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod contacts;
pub mod devices;
pub mod health;
pub mod telemetry;
pub mod tokens;

/// Slow store calls surface as 408 once `timeout` elapses.
pub fn router(state: AppState, timeout: Duration) -> Router {
    Router::new()
        .merge(health::router())
        .merge(tokens::router())
        .merge(contacts::router())
        .merge(devices::router())
        .merge(telemetry::router())
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceRepository;
    use crate::test_support::{contact, device, test_state, TestApp};
    use crate::types::{NotificationToken, Thresholds, TokenAction};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn app() -> (TestApp, Router) {
        let test = test_state(t0());
        test.store.add_device(device("D1"));
        test.store.set_thresholds(
            "D1",
            Thresholds {
                amber: 20.0,
                red: 30.0,
            },
        );
        test.store.add_contact(contact(1, "D1", "ops@example.com"));
        let router = router(test.state.clone(), std::time::Duration::from_secs(5));
        (test, router)
    }

    fn live_token(test: &TestApp, action: TokenAction) -> NotificationToken {
        let token = NotificationToken {
            id: Uuid::new_v4(),
            device_id: "D1".into(),
            contact_id: 1,
            action,
            created_at: t0(),
            expires_at: t0() + ChronoDuration::hours(1),
            used: false,
        };
        test.store.put_token(token.clone());
        token
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_counters() {
        let (_test, router) = app();
        let (status, body) = send(&router, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["stats"]["packets_received"], 0);
    }

    #[tokio::test]
    async fn token_lookup_maps_terminal_states() {
        let (test, router) = app();
        let (status, body) = send(&router, get(&format!("/token/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = send(&router, get("/token/not-a-uuid")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let token = live_token(&test, TokenAction::Acknowledge);
        let (status, body) = send(&router, get(&format!("/token/{}", token.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "D1");
        assert_eq!(body["device_name"], "Mast D1");

        test.clock.advance(ChronoDuration::hours(2));
        let (status, body) = send(&router, get(&format!("/token/{}", token.id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "expired");
    }

    #[tokio::test]
    async fn acknowledge_is_single_use() {
        let (test, router) = app();
        let token = live_token(&test, TokenAction::Acknowledge);
        let uri = format!("/acknowledge/{}", token.id);

        let (status, body) = send(&router, post_json(&uri, r#"{"action":"snooze_3h"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "snooze_3h");
        assert_eq!(test.store.snoozes().len(), 1);

        let (status, body) = send(&router, post_json(&uri, r#"{"action":"snooze_3h"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "already_used");
        assert_eq!(test.store.snoozes().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_accepts_action_from_query_and_rejects_unknown() {
        let (test, router) = app();
        let token = live_token(&test, TokenAction::SnoozeToday);

        let request = Request::builder()
            .method("POST")
            .uri(format!("/acknowledge/{}?action=reboot", token.id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_action");

        let request = Request::builder()
            .method("POST")
            .uri(format!("/acknowledge/{}?action=snooze_today", token.id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "snooze_today");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_over_get_and_post() {
        let (test, router) = app();
        let (status, body) = send(&router, get("/unsubscribe/1/D1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contact_removed"], true);

        let request = Request::builder()
            .method("POST")
            .uri("/unsubscribe/1/D1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contact_removed"], false);
        assert!(test.store.tokens().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_rejects_non_numeric_contact_with_json_error() {
        let (test, router) = app();
        let (status, body) = send(&router, get("/unsubscribe/abc/D1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_contact_id");
        let contacts = test.store.list_contacts("D1").await.unwrap();
        assert_eq!(contacts.len(), 1);
    }

    #[tokio::test]
    async fn simulate_stores_reading_without_dispatch() {
        let (mut test, router) = app();
        let (status, body) = send(
            &router,
            post_json(
                "/telemetry/simulate",
                r#"{"deviceId":"D1","timestamp":"2024-05-01T12:00:00Z","windSpeed":35}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alert_level"], "red");
        assert_eq!(body["dispatched"], false);
        assert_eq!(test.store.readings().len(), 1);
        assert!(test.dispatch_rx.try_recv().is_err());

        let (status, body) = send(
            &router,
            post_json("/telemetry/simulate", r#"{"deviceId":"D1","windSpeed":35}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_packet");

        let (status, _) = send(
            &router,
            post_json(
                "/telemetry/simulate",
                r#"{"deviceId":"GHOST","timestamp":"2024-05-01T12:00:00Z","windSpeed":35}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gauge_returns_both_readouts() {
        let (test, router) = app();
        test.store.put_reading(crate::test_support::reading(
            1,
            "D1",
            t0() - ChronoDuration::seconds(10),
            24.0,
            true,
            false,
            0.0,
        ));
        let (status, body) = send(&router, get("/devices/D1/gauge")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instantaneous_wind_speed"], 24.0);
        assert_eq!(body["trailing_average"], 24.0);
        assert_eq!(body["trailing_window_seconds"], 30);
    }
}
