//! HttpGateway against a mock OpenAI-compatible server

use agentrelay_relay::reconnect::RECOVERED_NOTE;
use agentrelay_relay::{
    complete_with_retry, Gateway, GatewayRequest, HttpGateway, OutputDelta, Relay, RelayConfig,
    RelayFailure, UpstreamDelta, UpstreamFailure, ACTIVITY_CLOSE, ACTIVITY_OPEN,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> RelayConfig {
    RelayConfig {
        retry_delay_ms: 0,
        liveness_timeout_secs: 1,
        liveness_poll_ms: 10,
        connect_timeout_secs: 2,
        read_timeout_secs: 5,
        upstream_wait_ms: 5,
        ..RelayConfig::default()
    }
}

fn chunk(content: &str, finish: Option<&str>) -> String {
    let frame = json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": finish}]
    });
    format!("data: {}\n\n", frame)
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

async fn collect(gateway: &HttpGateway, request: &GatewayRequest) -> Vec<UpstreamDelta> {
    gateway
        .open_stream(request)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_stream_decodes_deltas_and_forwards_headers() {
    let server = MockServer::start().await;
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        chunk("Hel", None),
        chunk("lo", None),
        chunk("", Some("stop"))
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer gw-token"))
        .and(header("x-openclaw-session-key", "session-1"))
        .respond_with(sse(body))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    let request = GatewayRequest::new(json!({"model": "openclaw", "stream": true}))
        .with_header("Authorization", "Bearer gw-token")
        .with_header("x-openclaw-session-key", "session-1");

    assert_eq!(
        collect(&gateway, &request).await,
        vec![
            UpstreamDelta::Text("Hel".into()),
            UpstreamDelta::Text("lo".into()),
            UpstreamDelta::Finish,
        ]
    );
}

#[tokio::test]
async fn test_stream_skips_garbage_and_reports_in_band_errors() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: not json\n\n: keep-alive comment\n\ndata: {}\n\n{}",
        chunk("a", None),
        json!({"error": {"code": "overloaded", "message": "try later"}}),
        chunk("never", None)
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse(body))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    assert_eq!(
        collect(&gateway, &GatewayRequest::default()).await,
        vec![
            UpstreamDelta::Text("a".into()),
            UpstreamDelta::Error {
                code: Some("overloaded".into()),
                body: "try later".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_error_status_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("restarting"))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    let err = gateway
        .open_stream(&GatewayRequest::default())
        .await
        .err()
        .unwrap();
    assert_eq!(
        err,
        UpstreamFailure::ServerError {
            status: 503,
            body: "restarting".into()
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_long_error_body_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(2_000)))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    match gateway.open_stream(&GatewayRequest::default()).await {
        Err(UpstreamFailure::ServerError { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body.len(), 500);
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_refused_connection_is_connect_failure() {
    let gateway = HttpGateway::new("http://127.0.0.1:1", &config()).unwrap();
    let err = gateway
        .open_stream(&GatewayRequest::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, UpstreamFailure::Connect(_)), "{:?}", err);
    assert!(!gateway.probe().await);
}

#[tokio::test]
async fn test_probe_requires_ok_models_listing() {
    let server = MockServer::start().await;
    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    assert!(!gateway.probe().await, "404 is not alive");

    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;
    assert!(gateway.probe().await);
}

#[tokio::test]
async fn test_complete_passes_status_and_body_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(422).set_body_string("plain text failure"))
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(&server.uri(), &config()).unwrap();
    let response = gateway.complete(&GatewayRequest::default()).await.unwrap();
    assert_eq!(response.status, 422);
    assert_eq!(
        response.body,
        json!({"error": {"message": "plain text failure"}})
    );
}

#[tokio::test]
async fn test_buffered_completion_gives_up_when_gateway_stays_down() {
    let gateway = HttpGateway::new("http://127.0.0.1:1", &config()).unwrap();
    let config = RelayConfig {
        liveness_timeout_secs: 0,
        ..config()
    };
    let err = complete_with_retry(&gateway, &GatewayRequest::default(), &config)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayFailure::Exhausted {
            retries: 3,
            last: UpstreamFailure::Connect(_)
        }
    ));
}

#[tokio::test]
async fn test_relay_recovers_from_gateway_restart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream restarting"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse(format!(
            "{}{}data: [DONE]\n\n",
            chunk("back", None),
            chunk("", Some("stop"))
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let gateway = Arc::new(HttpGateway::new(&server.uri(), &config()).unwrap());
    let out: Vec<OutputDelta> = Relay::new(gateway, config())
        .start(GatewayRequest::new(json!({"stream": true})), "openclaw")
        .await
        .into_deltas()
        .collect()
        .await;

    let contents: Vec<&str> = out.iter().filter_map(OutputDelta::as_content).collect();
    assert_eq!(
        contents,
        vec![
            ACTIVITY_OPEN,
            "⚡ gateway returned 502, retrying (1/3)...\n",
            RECOVERED_NOTE,
            ACTIVITY_CLOSE,
            "back",
        ]
    );
    assert_eq!(out.first(), Some(&OutputDelta::Role));
    assert_eq!(out.last(), Some(&OutputDelta::Stop));
}
