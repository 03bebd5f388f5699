//! Outbound HTTP against a local engine stand-in

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use flowgate_api::{
    alerting::{Alert, AlertError, AlertSink, Severity, SlackSink},
    config::WebhookConfig,
    delivery::{DeliveryError, HttpDelivery, WebhookDelivery, ENGINE_API_KEY_HEADER},
};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Received {
    path: String,
    headers: HeaderMap,
    body: Value,
}

type Log = Arc<Mutex<Vec<Received>>>;

async fn record(
    State(log): State<Log>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    log.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        headers,
        body,
    });
    StatusCode::OK
}

async fn spawn_engine() -> (SocketAddr, Log) {
    let log: Log = Arc::default();
    let app = Router::new()
        .route("/", post(record))
        .route("/webhook/lead-created", post(record))
        .route("/hooks/chat", post(record))
        .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/moved", post(|| async { StatusCode::MOVED_PERMANENTLY }))
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                StatusCode::OK
            }),
        )
        .with_state(log.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

fn webhook_config(addr: SocketAddr, routes: &[(&str, &str)]) -> WebhookConfig {
    WebhookConfig {
        base_url: format!("http://{}/", addr),
        routes: routes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        api_key: Some("engine-secret".to_string()),
        timeout: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn test_posts_envelope_with_headers_to_mapped_route() {
    let (addr, log) = spawn_engine().await;
    let delivery = HttpDelivery::new(&webhook_config(
        addr,
        &[("LEAD_CREATED", "/webhook/lead-created")],
    ))
    .unwrap();

    let payload = json!({"event": "LEAD_CREATED", "data": {"leadId": 9}});
    delivery.deliver("LEAD_CREATED", &payload).await.unwrap();
    delivery.deliver("OTHER", &payload).await.unwrap();

    let received = log.lock().unwrap().clone();
    assert_eq!(received.len(), 2);

    let first = &received[0];
    assert_eq!(first.path, "/webhook/lead-created");
    assert_eq!(first.body["eventName"], "LEAD_CREATED");
    assert_eq!(first.body["payload"]["data"]["leadId"], 9);
    assert_eq!(first.headers["content-type"], "application/json");
    assert_eq!(first.headers["x-flowgate-source"], "flowgate");
    assert_eq!(first.headers[ENGINE_API_KEY_HEADER], "engine-secret");
    let sent_at = first.headers["x-timestamp"].to_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(sent_at).is_ok());

    assert_eq!(received[1].path, "/");
}

#[tokio::test]
async fn test_non_success_status_is_a_failure() {
    let (addr, _) = spawn_engine().await;
    let delivery = HttpDelivery::new(&webhook_config(
        addr,
        &[("BROKEN", "broken"), ("MOVED", "moved")],
    ))
    .unwrap();

    let err = delivery.deliver("BROKEN", &json!({})).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Status(500)));

    let err = delivery.deliver("MOVED", &json!({})).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Status(301)));
}

#[tokio::test]
async fn test_hung_engine_times_out() {
    let (addr, _) = spawn_engine().await;
    let delivery = HttpDelivery::new(&webhook_config(addr, &[("SLOW", "/slow")])).unwrap();

    let err = delivery.deliver("SLOW", &json!({})).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Timeout(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unreachable_engine_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let delivery = HttpDelivery::new(&webhook_config(addr, &[])).unwrap();
    let err = delivery.deliver("X", &json!({})).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Transport(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_slack_sink_posts_formatted_alert() {
    let (addr, log) = spawn_engine().await;
    let sink = SlackSink::new(&format!("http://{}/hooks/chat", addr), Duration::from_secs(1)).unwrap();

    let alert = Alert::new(Severity::Error, "Trigger failed", "job exhausted attempts")
        .with_field("event", "LEAD_CREATED");
    sink.deliver(&alert).await.unwrap();

    let received = log.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].body["text"],
        "*ERROR: Trigger failed*\njob exhausted attempts"
    );
    assert_eq!(received[0].body["attachments"][0]["color"], "#ffa500");
    assert_eq!(
        received[0].body["attachments"][0]["fields"][0]["value"],
        "LEAD_CREATED"
    );
}

#[tokio::test]
async fn test_slack_sink_reports_http_errors() {
    let (addr, _) = spawn_engine().await;
    let sink = SlackSink::new(&format!("http://{}/broken", addr), Duration::from_secs(1)).unwrap();

    let err = sink
        .deliver(&Alert::new(Severity::Critical, "t", "m"))
        .await
        .unwrap_err();
    assert!(matches!(err, AlertError::Status(500)));
}
