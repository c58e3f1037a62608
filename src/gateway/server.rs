//! # Gateway HTTP Server
//!
//! Thin axum front end for the [`Dispatcher`]. Every request, whatever its path, lands
//! in one fallback handler that buffers the body, builds an [`IncomingRequest`] and
//! turns the dispatch result back into an HTTP response. Errors use the JSON error
//! envelope of [`GatewayError`].
//!
//! The same application is served over plain TCP ([`GatewayServer::serve`]) or over
//! rustls with SNI certificate selection ([`GatewayServer::serve_tls`]).

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router as AxumRouter;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use http_body_util::LengthLimitError;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::tls::{ClientCertAcceptor, TlsClientInfo};
use crate::core::config::{HttpConfig, HttpsConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl ServerConfig {
    pub fn from_http(http: &HttpConfig) -> GatewayResult<Self> {
        Ok(Self {
            bind_addr: parse_bind_addr(&http.hostname, http.port)?,
            max_body_size: http.max_body_size,
        })
    }

    /// HTTPS listener; the body limit is shared with the HTTP listener
    pub fn from_https(https: &HttpsConfig, max_body_size: usize) -> GatewayResult<Self> {
        Ok(Self {
            bind_addr: parse_bind_addr(&https.hostname, https.port)?,
            max_body_size,
        })
    }
}

fn parse_bind_addr(hostname: &str, port: u16) -> GatewayResult<SocketAddr> {
    format!("{}:{}", hostname, port)
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid bind address {}:{}: {}", hostname, port, e)))
}

impl Default for ServerConfig {
    fn default() -> Self {
        let http = HttpConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], http.port)),
            max_body_size: http.max_body_size,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
    max_body_size: usize,
}

pub struct GatewayServer {
    config: ServerConfig,
    app: AxumRouter,
}

impl GatewayServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Self {
        let state = ServerState {
            dispatcher,
            max_body_size: config.max_body_size,
        };

        let app = AxumRouter::new()
            .fallback(handle_request)
            .with_state(state)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        Self { config, app }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// The axum application, for embedding or in-process testing
    pub fn router(&self) -> AxumRouter {
        self.app.clone()
    }

    pub async fn start_with_shutdown<F>(self, signal: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", bind_addr, e))
        })?;
        self.serve(listener, signal).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway HTTP server listening");

        axum::serve(listener, self.app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

        info!("Gateway HTTP server stopped");
        Ok(())
    }

    /// Serve TLS on the configured address until `handle` is shut down
    pub async fn serve_tls(self, tls: RustlsConfig, handle: Handle) -> GatewayResult<()> {
        let bind_addr = self.config.bind_addr;
        info!(addr = %bind_addr, "Gateway HTTPS server listening");

        axum_server::bind(bind_addr)
            .acceptor(ClientCertAcceptor::new(RustlsAcceptor::new(tls)))
            .handle(handle)
            .serve(self.app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to serve HTTPS on {}: {}", bind_addr, e)))?;

        info!("Gateway HTTPS server stopped");
        Ok(())
    }
}

async fn handle_request(State(state): State<ServerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

    let client_cert_verified = parts
        .extensions
        .get::<TlsClientInfo>()
        .map(|info| info.client_cert_verified)
        .unwrap_or(false);

    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) if exceeds_length_limit(&e) => {
            warn!(limit = state.max_body_size, "Request body too large");
            return GatewayResponse::text(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return GatewayResponse::text(StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    let request = IncomingRequest::new(parts.method, parts.uri, parts.version, parts.headers, body, remote_addr)
        .with_client_cert_verified(client_cert_verified);

    match state.dispatcher.dispatch(request).await {
        Ok(response) => response.into_response(),
        Err(error) => {
            debug!(error = %error, status = error.status_code().as_u16(), "Request ended with error");
            error.into_response()
        }
    }
}

fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GatewayConfig;
    use crate::gateway::dispatcher::DispatchGraphBuilder;
    use crate::gateway::tls::test_support::null_key;
    use crate::gateway::tls::SniCertStore;
    use axum::body::Body;
    use axum_test::TestServer;
    use bytes::Bytes;
    use std::io;
    use tower::ServiceExt;

    fn gateway(yaml: &str, config: ServerConfig) -> GatewayServer {
        let gateway_config = GatewayConfig::from_yaml_str(yaml).unwrap();
        let graph = DispatchGraphBuilder::with_builtin().build(&gateway_config, 1).unwrap();
        GatewayServer::new(Arc::new(Dispatcher::new(graph)), config)
    }

    fn server(yaml: &str, max_body_size: usize) -> TestServer {
        let gateway = gateway(
            yaml,
            ServerConfig {
                max_body_size,
                ..Default::default()
            },
        );
        TestServer::new(gateway.router()).unwrap()
    }

    const CONFIG: &str = r#"
apiEndpoints:
  api:
    paths: "/api/*"
pipelines:
  main:
    apiEndpoints: [api]
    policies:
      - terminate:
          - action: {statusCode: 202, message: accepted}
"#;

    #[tokio::test]
    async fn test_routes_through_dispatcher() {
        let server = server(CONFIG, 1024);
        let response = server.post("/api/orders").text("{}").await;
        response.assert_status(StatusCode::ACCEPTED);
        response.assert_text("accepted");
    }

    #[tokio::test]
    async fn test_not_found_envelope() {
        let server = server(CONFIG, 1024);
        let response = server.get("/elsewhere").await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(body["error"]["code"], 404);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let server = server(CONFIG, 4);
        let response = server.post("/api/orders").text("too long").await;
        response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_broken_body_is_bad_request() {
        let app = gateway(CONFIG, ServerConfig::default()).router();
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"partial\"")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/orders")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_client_cert_flag_reaches_conditions() {
        let yaml = r#"
apiEndpoints:
  api: {}
pipelines:
  main:
    apiEndpoints: [api]
    policies:
      - terminate:
          - condition: {name: tlsClientAuthenticated}
            action: {statusCode: 200, message: mutual}
          - action: {statusCode: 403, message: anonymous}
"#;
        let app = gateway(yaml, ServerConfig::default()).router();

        let plain = TestServer::new(app.clone()).unwrap();
        plain.get("/").await.assert_status(StatusCode::FORBIDDEN);

        let verified = TestServer::new(app.layer(axum::Extension(TlsClientInfo {
            client_cert_verified: true,
        })))
        .unwrap();
        let response = verified.get("/").await;
        response.assert_status(StatusCode::OK);
        response.assert_text("mutual");
    }

    #[tokio::test]
    async fn test_tls_refuses_unknown_server_name() {
        let mut store = SniCertStore::new();
        store.insert("known.test", null_key()).unwrap();
        let tls = RustlsConfig::from_config(Arc::new(store.into_server_config(None).unwrap()));

        let gateway = gateway(
            CONFIG,
            ServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
        );
        let handle = Handle::new();
        let task = tokio::spawn(gateway.serve_tls(tls, handle.clone()));
        let addr = handle.listening().await.unwrap();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .resolve("unknown.test", addr)
            .build()
            .unwrap();
        let result = client
            .get(format!("https://unknown.test:{}/api/orders", addr.port()))
            .send()
            .await;
        assert!(result.is_err(), "handshake without a matching certificate must fail");

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_server_config_from_http() {
        let config = ServerConfig::from_http(&HttpConfig {
            port: 9090,
            hostname: "127.0.0.1".to_string(),
            max_body_size: 10,
        })
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090".parse().unwrap());

        let err = ServerConfig::from_http(&HttpConfig {
            hostname: "not an address".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }
}
