pub mod codec;
pub mod config;
mod connection;
pub mod correlation;
mod downstream;
pub mod error;
pub mod filter;
pub mod filters;
pub mod frame;
mod haproxy;
pub mod metrics;
pub mod net_filter;
mod pipeline;
mod state;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

pub use error::{BoxError, ProxyError, Result};
pub use filter::{
    ConnectionInfo, Filter, FilterContext, FilterFactory, InternalResponseFuture,
    RequestFilterResult, ResponseFilterResult,
};
pub use frame::{
    DecodedRequestFrame, DecodedResponseFrame, HaProxyPreamble, HaProxyVersion, RequestFrame,
    ResponseFrame,
};
pub use net_filter::{HostPort, NetFilter, NetFilterContext, StaticNetFilter, VirtualCluster};

/// Engine options for every proxied connection.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on bytes buffered before the upstream connection is ready.
    pub max_buffered_bytes: usize,
    /// Bound on a single KRPC frame; larger frames close the connection.
    pub max_frame_bytes: usize,
    /// Answer `ApiVersions` locally and take the authentication-offload
    /// branch of the handshake.
    pub sasl_offload: bool,
    /// Log per-direction byte counts at debug level.
    pub log_network: bool,
    /// Insert a frame-logging filter at the head of every chain.
    pub log_frames: bool,
    pub tcp_nodelay: bool,
    /// Name reported to filters via the virtual-cluster metadata.
    pub cluster_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 1024 * 1024,
            max_frame_bytes: 100 * 1024 * 1024,
            sasl_offload: false,
            log_network: false,
            log_frames: false,
            tcp_nodelay: true,
            cluster_name: "kafka".into(),
        }
    }
}

/// Builder for configuring a [`Proxy`].
pub struct ProxyBuilder {
    target: Option<HostPort>,
    net_filter: Option<Arc<dyn NetFilter>>,
    factories: Vec<Arc<dyn FilterFactory>>,
    engine: EngineConfig,
}

impl ProxyBuilder {
    /// Forward every connection to this broker (the static net-filter).
    /// Ignored when an explicit [`net_filter`](Self::net_filter) is set.
    pub fn target(mut self, target: HostPort) -> Self {
        self.target = Some(target);
        self
    }

    /// Use a custom upstream-selection policy instead of a fixed target.
    pub fn net_filter(mut self, net_filter: Arc<dyn NetFilter>) -> Self {
        self.net_filter = Some(net_filter);
        self
    }

    /// Append a filter to the chain. Factories run once per connection; the
    /// first appended filter is the first to see each request and the last
    /// to see each response.
    pub fn filter(mut self, factory: impl FilterFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    /// Append an already-shared filter factory.
    pub fn filter_arc(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn sasl_offload(mut self, enabled: bool) -> Self {
        self.engine.sasl_offload = enabled;
        self
    }

    pub fn max_buffered_bytes(mut self, bytes: usize) -> Self {
        self.engine.max_buffered_bytes = bytes;
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.engine.max_frame_bytes = bytes;
        self
    }

    pub fn log_network(mut self, enabled: bool) -> Self {
        self.engine.log_network = enabled;
        self
    }

    pub fn log_frames(mut self, enabled: bool) -> Self {
        self.engine.log_frames = enabled;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.engine.tcp_nodelay = enabled;
        self
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.engine.cluster_name = name.into();
        self
    }

    /// Build the proxy. Fails unless a target broker or a net-filter has
    /// been configured.
    pub fn build(self) -> anyhow::Result<Proxy> {
        let net_filter = match (self.net_filter, self.target) {
            (Some(net_filter), _) => net_filter,
            (None, Some(target)) => Arc::new(StaticNetFilter::new(
                self.engine.cluster_name.clone(),
                target,
                self.factories,
            )) as Arc<dyn NetFilter>,
            (None, None) => {
                anyhow::bail!("either a target broker or a net filter must be configured")
            }
        };
        Ok(Proxy {
            net_filter,
            engine: Arc::new(self.engine),
        })
    }
}

/// A configured Kafka protocol proxy.
///
/// Cheaply cloneable via internal `Arc`s.
///
/// # Examples
///
/// ```rust,no_run
/// use knoxy::{HostPort, Proxy};
///
/// # async fn run() -> anyhow::Result<()> {
/// let proxy = Proxy::builder()
///     .target(HostPort::new("broker.example.com", 9092))
///     .build()?;
/// proxy.listen("127.0.0.1:9192").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Proxy {
    net_filter: Arc<dyn NetFilter>,
    engine: Arc<EngineConfig>,
}

impl Proxy {
    /// Create a new builder.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder {
            target: None,
            net_filter: None,
            factories: Vec::new(),
            engine: EngineConfig::default(),
        }
    }

    /// Bind to `addr` and run the accept loop.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.listen_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn listen_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream, peer).await {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Run the accept loop until the shutdown future resolves.
    pub async fn listen_with_shutdown(
        &self,
        addr: impl ToSocketAddrs,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tokio::select! {
            result = self.listen_on(listener) => result,
            () = shutdown => {
                info!("shutting down");
                Ok(())
            }
        }
    }

    /// Serve a single already-accepted connection.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let result = connection::run(
            stream,
            peer,
            Arc::clone(&self.engine),
            Arc::clone(&self.net_filter),
        )
        .await;
        if let Err(e) = &result {
            warn!(peer = %peer, error = %e, "proxying failed");
        }
        result
    }
}
