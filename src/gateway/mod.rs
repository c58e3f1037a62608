//! Request dispatch, hot reload and the HTTP/TLS front end

pub mod dispatcher;
pub mod reload;
pub mod server;
pub mod tls;

pub use dispatcher::{DispatchGraph, DispatchGraphBuilder, Dispatcher};
pub use reload::{ConfigSource, FileConfigSource, HotReloadManager, ReloadOutcome, ReloadStatus};
pub use server::{GatewayServer, ServerConfig};
pub use tls::{ClientCertAcceptor, SniCertStore, TlsClientInfo};
