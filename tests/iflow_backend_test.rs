use futures::StreamExt;
use iflow_proxy::translate::openai_types::{ChatMessage, Role};
use iflow_proxy::upstream::iflow::{IflowConnector, IflowSettings};
use iflow_proxy::upstream::{BackendConnection, BackendEvent, Connector};
use iflow_proxy::{ProxyError, UpstreamAdapter};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer) -> IflowSettings {
    IflowSettings {
        base_url: format!("{}/v1", server.uri()),
        api_key: "sk-test".to_string(),
        model: "glm-4.7".to_string(),
        user_agent: "iFlow-Cli".to_string(),
        timeout: Duration::from_secs(5),
    }
}

fn sse_body(events: &[&str]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

fn delta(content: &str) -> String {
    serde_json::json!({
        "id": "up-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

async fn mount_sse(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_sends_flattened_context_with_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("user-agent", "iFlow-Cli"))
        .and(body_partial_json(serde_json::json!({
            "model": "glm-4.7",
            "stream": true,
            "messages": [{"role": "user", "content": "be brief\n\nhi\n\n"}]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&[&delta("Hel"), &delta("lo"), "[DONE]"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings(&server))));
    let fragments: Vec<String> = adapter
        .exchange(vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
        ])
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(fragments, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn test_finish_reason_ends_reply_after_its_content() {
    let server = MockServer::start().await;
    let last = serde_json::json!({
        "choices": [{"index": 0, "delta": {"content": "!"}, "finish_reason": "stop"}]
    })
    .to_string();
    mount_sse(
        &server,
        sse_body(&[&delta("Hi"), &last, &delta("ignored"), "[DONE]"]),
    )
    .await;

    let connector = IflowConnector::new(settings(&server));
    let mut conn = connector.connect().await.unwrap();
    conn.send("hi\n\n").await.unwrap();

    assert_eq!(conn.recv().await.unwrap(), Some(BackendEvent::Content("Hi".to_string())));
    assert_eq!(conn.recv().await.unwrap(), Some(BackendEvent::Content("!".to_string())));
    assert_eq!(conn.recv().await.unwrap(), Some(BackendEvent::Finish));
}

#[tokio::test]
async fn test_skips_empty_and_unparseable_events() {
    let server = MockServer::start().await;
    let role_only = serde_json::json!({
        "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
    })
    .to_string();
    mount_sse(
        &server,
        sse_body(&[&role_only, "not json", &delta(""), &delta("ok"), "[DONE]"]),
    )
    .await;

    let connector = IflowConnector::new(settings(&server));
    let mut conn = connector.connect().await.unwrap();
    conn.send("hi\n\n").await.unwrap();

    assert_eq!(conn.recv().await.unwrap(), Some(BackendEvent::Content("ok".to_string())));
    assert_eq!(conn.recv().await.unwrap(), Some(BackendEvent::Finish));
}

#[tokio::test]
async fn test_reply_without_done_ends_normally() {
    let server = MockServer::start().await;
    mount_sse(&server, sse_body(&[&delta("tail")])).await;

    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings(&server))));
    let items: Vec<_> = adapter
        .exchange(vec![ChatMessage::new(Role::User, "hi")])
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), "tail");
}

#[tokio::test]
async fn test_error_status_becomes_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"msg":"invalid api key"}"#))
        .mount(&server)
        .await;

    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings(&server))));
    let items: Vec<_> = adapter
        .exchange(vec![ChatMessage::new(Role::User, "hi")])
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(ProxyError::Upstream { message }) => {
            assert!(message.contains("401"));
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_in_stream_error_object_is_failure() {
    let server = MockServer::start().await;
    let err = serde_json::json!({"error": {"message": "rate limited"}}).to_string();
    mount_sse(&server, sse_body(&[&delta("a"), &err])).await;

    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings(&server))));
    let items: Vec<_> = adapter
        .exchange(vec![ChatMessage::new(Role::User, "hi")])
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "a");
    assert!(matches!(&items[1], Err(ProxyError::Upstream { message }) if message.contains("rate limited")));
}

#[tokio::test]
async fn test_unreachable_backend_is_upstream_error() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let settings = IflowSettings {
        base_url: format!("http://{addr}/v1"),
        api_key: "sk-test".to_string(),
        model: "glm-4.7".to_string(),
        user_agent: "iFlow-Cli".to_string(),
        timeout: Duration::from_secs(5),
    };
    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings)));
    let items: Vec<_> = adapter
        .exchange(vec![ChatMessage::new(Role::User, "hi")])
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(ProxyError::Upstream { .. })));
}

#[tokio::test]
async fn test_abandoned_reply_does_not_leak_into_next_send() {
    let server = MockServer::start().await;
    let first: Vec<String> = (0..50).map(|i| delta(&format!("old {i}"))).collect();
    let mut first: Vec<&str> = first.iter().map(String::as_str).collect();
    first.push("[DONE]");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&first), "text/event-stream"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_sse(&server, sse_body(&[&delta("new"), "[DONE]"])).await;

    let adapter = UpstreamAdapter::new(Arc::new(IflowConnector::new(settings(&server))));

    let mut abandoned = Box::pin(adapter.exchange(vec![ChatMessage::new(Role::User, "a")]));
    assert_eq!(abandoned.next().await.unwrap().unwrap(), "old 0");
    drop(abandoned);

    let fragments: Vec<String> = tokio::time::timeout(
        Duration::from_secs(5),
        adapter
            .exchange(vec![ChatMessage::new(Role::User, "b")])
            .map(|r| r.unwrap())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("second exchange blocked behind an abandoned one");

    assert_eq!(fragments, vec!["new"]);
}
