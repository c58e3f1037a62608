//! # Hot Reload
//!
//! Rebuilds the dispatch graph when the configuration changes and publishes it only
//! if the whole graph compiled. A rejected configuration leaves the previous graph
//! serving.
//!
//! Change notifications arrive on an injected channel. [`FileConfigSource::watch`]
//! feeds that channel from a `notify` watcher on the config file's parent directory,
//! since editors that save by rename replace the file rather than modify it.

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchGraphBuilder, Dispatcher};
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics::CONFIG_RELOADS_TOTAL;

/// Where configuration comes from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load, override and validate the full configuration
    async fn load(&self) -> GatewayResult<GatewayConfig>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Configuration file on disk
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start watching the file; keep the returned watcher alive for as long as
    /// notifications are wanted
    pub fn watch(&self) -> GatewayResult<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| GatewayError::config(format!("Invalid config file path {}", self.path.display())))?
            .to_owned();
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    return;
                }
                if event.paths.iter().any(|path| path.file_name() == Some(file_name.as_os_str())) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Config watcher error"),
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;

        info!(path = %self.path.display(), "Watching configuration file");
        Ok((watcher, rx))
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> GatewayResult<GatewayConfig> {
        GatewayConfig::load_from_file(&self.path).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Result of the most recent reload attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    Applied { generation: u64 },
    Rejected { message: String },
}

/// Reload bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ReloadStatus {
    pub applied: u64,
    pub rejected: u64,
    pub last_outcome: Option<ReloadOutcome>,
    pub last_attempt: Option<Instant>,
}

/// Rebuilds and republishes the dispatch graph on configuration changes
pub struct HotReloadManager {
    source: Arc<dyn ConfigSource>,
    builder: DispatchGraphBuilder,
    dispatcher: Arc<Dispatcher>,
    debounce: Duration,
    status: RwLock<ReloadStatus>,
    // one rebuild at a time, so generations stay in order
    reloading: Mutex<()>,
}

impl HotReloadManager {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        builder: DispatchGraphBuilder,
        dispatcher: Arc<Dispatcher>,
        debounce: Duration,
    ) -> Self {
        Self {
            source,
            builder,
            dispatcher,
            debounce,
            status: RwLock::new(ReloadStatus::default()),
            reloading: Mutex::new(()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> ReloadStatus {
        self.status.read().clone()
    }

    /// Load, compile and publish; returns the new generation
    ///
    /// On error nothing is published.
    pub async fn reload(&self) -> GatewayResult<u64> {
        let _guard = self.reloading.lock().await;
        let generation = self.dispatcher.generation() + 1;

        let built = match self.source.load().await {
            Ok(config) => self.builder.build(&config, generation),
            Err(e) => Err(e),
        };

        let mut status = self.status.write();
        status.last_attempt = Some(Instant::now());

        match built {
            Ok(graph) => {
                self.dispatcher.publish(graph);
                status.applied += 1;
                status.last_outcome = Some(ReloadOutcome::Applied { generation });
                metrics::counter!(CONFIG_RELOADS_TOTAL, "outcome" => "applied").increment(1);
                info!(source = %self.source.describe(), generation, "Configuration reloaded");
                Ok(generation)
            }
            Err(e) => {
                status.rejected += 1;
                status.last_outcome = Some(ReloadOutcome::Rejected { message: e.to_string() });
                metrics::counter!(CONFIG_RELOADS_TOTAL, "outcome" => "rejected").increment(1);
                error!(
                    source = %self.source.describe(),
                    error = %e,
                    serving_generation = generation - 1,
                    "Configuration reload rejected, keeping previous configuration"
                );
                Err(e)
            }
        }
    }

    /// Reload after each burst of change notifications, once `debounce` has passed
    /// without another one. Returns when the channel closes.
    pub async fn watch(&self, mut changes: mpsc::UnboundedReceiver<()>) {
        while changes.recv().await.is_some() {
            let mut closed = false;
            loop {
                match tokio::time::timeout(self.debounce, changes.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            debug!(source = %self.source.describe(), "Configuration change detected");
            // failures are logged and counted by reload
            let _ = self.reload().await;

            if closed {
                break;
            }
        }
        debug!("Configuration change stream closed");
    }

    pub fn spawn_watch(self: Arc<Self>, changes: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.watch(changes).await })
    }
}

impl std::fmt::Debug for HotReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadManager")
            .field("source", &self.source.describe())
            .field("debounce", &self.debounce)
            .field("status", &*self.status.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::dispatcher::DispatchGraph;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves whichever YAML document is current and counts loads
    struct StaticSource {
        yaml: parking_lot::Mutex<String>,
        loads: AtomicUsize,
    }

    impl StaticSource {
        fn new(yaml: &str) -> Arc<Self> {
            Arc::new(Self {
                yaml: parking_lot::Mutex::new(yaml.to_string()),
                loads: AtomicUsize::new(0),
            })
        }

        fn set(&self, yaml: &str) {
            *self.yaml.lock() = yaml.to_string();
        }
    }

    #[async_trait]
    impl ConfigSource for StaticSource {
        async fn load(&self) -> GatewayResult<GatewayConfig> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let yaml = self.yaml.lock().clone();
            GatewayConfig::from_yaml_str(&yaml)
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    const GOOD: &str = r#"
apiEndpoints:
  api: {}
pipelines:
  main:
    apiEndpoints: [api]
    policies:
      - terminate:
          - action: {statusCode: 200}
"#;

    const BAD: &str = r#"
apiEndpoints:
  api: {}
pipelines:
  main:
    apiEndpoints: [api]
    policies:
      - terminate:
          - action: {name: missing}
"#;

    fn manager(source: Arc<StaticSource>, debounce: Duration) -> HotReloadManager {
        HotReloadManager::new(
            source,
            DispatchGraphBuilder::with_builtin(),
            Arc::new(Dispatcher::new(DispatchGraph::empty())),
            debounce,
        )
    }

    #[tokio::test]
    async fn test_reload_publishes_next_generation() {
        let manager = manager(StaticSource::new(GOOD), Duration::from_millis(10));
        assert_eq!(manager.reload().await.unwrap(), 1);
        assert_eq!(manager.reload().await.unwrap(), 2);
        assert_eq!(manager.dispatcher().generation(), 2);

        let status = manager.status();
        assert_eq!(status.applied, 2);
        assert_eq!(status.last_outcome, Some(ReloadOutcome::Applied { generation: 2 }));
    }

    #[tokio::test]
    async fn test_rejected_reload_keeps_graph() {
        let source = StaticSource::new(GOOD);
        let manager = manager(Arc::clone(&source), Duration::from_millis(10));
        manager.reload().await.unwrap();
        let before = manager.dispatcher().current();

        source.set(BAD);
        let err = manager.reload().await.unwrap_err();
        assert!(err.is_configuration());

        assert!(Arc::ptr_eq(&before, &manager.dispatcher().current()));
        let status = manager.status();
        assert_eq!(status.rejected, 1);
        assert!(matches!(status.last_outcome, Some(ReloadOutcome::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_watch_debounces_bursts() {
        let source = StaticSource::new(GOOD);
        let manager = manager(Arc::clone(&source), Duration::from_millis(50));
        let (tx, rx) = mpsc::unbounded_channel();

        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        drop(tx);
        manager.watch(rx).await;

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.dispatcher().generation(), 1);
    }
}
