//! # Server Integration Tests
//!
//! The HTTP front end over real pipelines:
//! - proxying to a wiremock upstream through a bound listener
//! - key-auth rejection and the JSON error envelope
//! - templated headers reaching the upstream

use axum::http::StatusCode;
use axum_test::TestServer;
use http::{HeaderName, HeaderValue};
use policy_gateway::{DispatchGraphBuilder, Dispatcher, GatewayConfig, GatewayServer};
use policy_gateway::gateway::ServerConfig;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(yaml: &str) -> GatewayServer {
    let config = GatewayConfig::from_yaml_str(yaml).unwrap();
    let graph = DispatchGraphBuilder::with_builtin().build(&config, 1).unwrap();
    GatewayServer::new(Arc::new(Dispatcher::new(graph)), ServerConfig::default())
}

fn test_server(yaml: &str) -> TestServer {
    TestServer::new(gateway(yaml).router()).unwrap()
}

/// Serve on an ephemeral port; dropping the sender shuts the server down
async fn spawn_gateway(yaml: &str) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let server = gateway(yaml);
    tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (addr, tx)
}

fn proxy_config(upstream: &str) -> String {
    format!(
        r#"
serviceEndpoints:
  backend:
    url: "{}"
apiEndpoints:
  sub:
    host: "*.acme.com"
    paths: /x
pipelines:
  proxied:
    apiEndpoints: [sub]
    policies:
      - proxy:
          - action:
              serviceEndpoint: backend
              changeOrigin: true
"#,
        upstream
    )
}

#[tokio::test]
async fn test_proxy_through_bound_listener() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from upstream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (addr, _shutdown) = spawn_gateway(&proxy_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/x?page=2", addr))
        .header("host", "sub.acme.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "from upstream");

    let response = client
        .get(format!("http://{}/x?page=2", addr))
        .header("host", "acme.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    // bind then drop to get a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = test_server(&proxy_config(&format!("http://127.0.0.1:{}", port)));

    let response = server
        .get("/x")
        .add_header(HeaderName::from_static("host"), HeaderValue::from_static("api.acme.com"))
        .await;

    let status = response.status_code();
    assert!(
        status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE,
        "unexpected status {}",
        status
    );
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], status.as_u16());
}

#[tokio::test]
async fn test_key_auth_headers_and_proxy() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/7"))
        .and(header("x-gw-user", "alice"))
        .and(header("x-gw-endpoint", "orders"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&upstream)
        .await;

    let yaml = format!(
        r#"
serviceEndpoints:
  backend:
    url: "{}"
apiEndpoints:
  orders:
    paths: "/orders/*"
    methods: POST
pipelines:
  orders:
    apiEndpoints: [orders]
    policies:
      - key-auth:
          - action:
              keys: {{k-123: alice}}
      - headers:
          - action:
              headersPrefix: "x-gw-"
              forwardHeaders:
                user: "${{user.id}}"
                endpoint: "${{apiEndpoint.name}}"
      - proxy:
          - action:
              serviceEndpoint: backend
"#,
        upstream.uri()
    );
    let server = test_server(&yaml);

    let rejected = server.post("/orders/7").text("{}").await;
    rejected.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = rejected.json();
    assert_eq!(body["error"]["code"], 401);
    assert!(body["error"]["message"].as_str().unwrap().contains("missing API key"));

    let accepted = server
        .post("/orders/7")
        .add_header(HeaderName::from_static("apikey"), HeaderValue::from_static("apikey k-123"))
        .text("{}")
        .await;
    accepted.assert_status(StatusCode::CREATED);
    accepted.assert_text("created");
}

#[tokio::test]
async fn test_pipeline_without_response_is_server_error() {
    let server = test_server(
        r#"
apiEndpoints:
  api: {}
pipelines:
  quiet:
    apiEndpoints: [api]
    policies:
      - log:
          - action:
              message: "seen ${req.method} ${req.path}"
"#,
    );

    let response = server.get("/anything").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert!(body["error"]["message"].as_str().unwrap().contains("quiet"));
}
