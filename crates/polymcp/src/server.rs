//! The assembled server: configuration, registry, middleware, broker and
//! stream manager behind one cloneable value the transport serves.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::ErrorData;
use crate::middleware::Middleware;
use crate::registry::Registry;
use crate::service::engine::ServerCore;
use crate::session::{InMemorySessionStore, SessionId, SessionStore};
use crate::stream::StreamManager;
use crate::stream::memory::InMemoryStreamManager;

/// A protocol server core, cheap to clone and share.
#[derive(Clone)]
pub struct McpServer {
    core: Arc<ServerCore>,
}

impl McpServer {
    pub fn builder(config: ServerConfig) -> McpServerBuilder {
        McpServerBuilder {
            config,
            registry: None,
            middleware: Vec::new(),
            store: None,
            streams: None,
        }
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// The axum router serving this server's MCP mount path, for embedding
    /// into a larger application.
    pub fn router(&self) -> axum::Router {
        crate::transport::router(self.clone())
    }

    /// Bind and serve until cancelled.
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<RunningServer> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let ct = self.core.ct.clone();
        let router = self.router();
        let shutdown = ct.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("server cancelled");
            });
            if let Err(e) = server.await {
                error!(error = %e, "server shut down with error");
            }
        });
        info!(%local_addr, "serving MCP");
        Ok(RunningServer {
            local_addr,
            ct,
            handle,
        })
    }

    /// Push an out-of-band notification onto a session's stream. Delivery
    /// reaches the client regardless of which node holds its connection when
    /// the stream manager is shared.
    pub async fn send_notification(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Option<Value>,
    ) -> Result<u64, ErrorData> {
        self.core.send_notification(session_id, method, params).await
    }

    /// Swap the published registry and emit `*/list_changed` to sessions
    /// that negotiated list-change notifications.
    pub async fn replace_registry(&self, registry: Registry) {
        self.core.replace_registry(registry).await;
    }

    /// Stop background work and any serving loop started by [`serve`].
    ///
    /// [`serve`]: McpServer::serve
    pub fn cancel(&self) {
        self.core.shutdown();
    }
}

/// A bound, serving server.
pub struct RunningServer {
    local_addr: SocketAddr,
    ct: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cancel(&self) {
        self.ct.cancel();
    }

    /// Wait for the serving loop to finish.
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }
}

pub struct McpServerBuilder {
    config: ServerConfig,
    registry: Option<Registry>,
    middleware: Vec<Arc<dyn Middleware>>,
    store: Option<Arc<dyn SessionStore>>,
    streams: Option<Arc<dyn StreamManager>>,
}

impl McpServerBuilder {
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Append a middleware; the chain runs in registration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Use a shared session store (e.g. Redis) instead of the in-memory one.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a shared stream manager (e.g. Redis) instead of the in-memory one.
    pub fn stream_manager(mut self, streams: Arc<dyn StreamManager>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Assemble the server and start its background eviction sweep. Must be
    /// called within a tokio runtime.
    pub fn build(self) -> McpServer {
        let streams: Arc<dyn StreamManager> = self.streams.unwrap_or_else(|| {
            Arc::new(InMemoryStreamManager::new(
                self.config.stream_retention,
                self.config.stream_high_water,
            ))
        });
        let store: Arc<dyn SessionStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));
        let registry = self.registry.unwrap_or_default();
        let core = ServerCore::new(self.config, registry, self.middleware, store, streams);
        McpServer { core }
    }
}
