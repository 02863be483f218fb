//! Upstream selection: given early client metadata, an external policy
//! object picks the broker address and the filter chain for the connection.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::filter::{ConnectionInfo, Filter, FilterFactory};
use crate::frame::HaProxyPreamble;

/// A broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        if host.is_empty() {
            return Err(format!("empty host in {s:?}"));
        }
        Ok(HostPort::new(host, port))
    }
}

/// Metadata about the (virtual) cluster a connection is proxied for.
#[derive(Debug, Clone)]
pub struct VirtualCluster {
    pub name: String,
    pub target: HostPort,
}

/// What the net-filter decided for this connection.
pub(crate) enum ServerChoice {
    None,
    One(HostPort, Vec<Box<dyn Filter>>),
    /// `initiate_connect` was called more than once.
    Repeated,
}

/// Context handed to [`NetFilter::select_server`]. Offers read-only access to
/// the early client metadata and exactly one terminal operation:
/// [`initiate_connect`](NetFilterContext::initiate_connect).
pub struct NetFilterContext {
    peer: SocketAddr,
    client_software_name: Option<String>,
    client_software_version: Option<String>,
    ha_proxy: Option<HaProxyPreamble>,
    choice: ServerChoice,
}

impl NetFilterContext {
    pub(crate) fn new(
        peer: SocketAddr,
        client_software_name: Option<String>,
        client_software_version: Option<String>,
        ha_proxy: Option<HaProxyPreamble>,
    ) -> Self {
        Self {
            peer,
            client_software_name,
            client_software_version,
            ha_proxy,
            choice: ServerChoice::None,
        }
    }

    /// Address of the TCP peer (the load balancer, if one is in front).
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Client software name from the `ApiVersions` request, if one was seen.
    pub fn client_software_name(&self) -> Option<&str> {
        self.client_software_name.as_deref()
    }

    pub fn client_software_version(&self) -> Option<&str> {
        self.client_software_version.as_deref()
    }

    /// The PROXY preamble, if the load balancer sent one.
    pub fn ha_proxy_source(&self) -> Option<&HaProxyPreamble> {
        self.ha_proxy.as_ref()
    }

    /// Choose the upstream broker and the filters for this connection.
    /// Calling this more than once is a protocol violation that closes the
    /// connection.
    pub fn initiate_connect(&mut self, remote: HostPort, filters: Vec<Box<dyn Filter>>) {
        self.choice = match self.choice {
            ServerChoice::None => ServerChoice::One(remote, filters),
            _ => ServerChoice::Repeated,
        };
    }

    pub(crate) fn into_choice(self) -> ServerChoice {
        self.choice
    }
}

/// Picks the upstream broker for each new connection.
#[async_trait::async_trait]
pub trait NetFilter: Send + Sync {
    async fn select_server(&self, ctx: &mut NetFilterContext);
}

/// The minimal deployment: every connection goes to one configured broker
/// with the globally configured filter chain.
pub struct StaticNetFilter {
    cluster: String,
    target: HostPort,
    factories: Vec<Arc<dyn FilterFactory>>,
}

impl StaticNetFilter {
    pub fn new(
        cluster: impl Into<String>,
        target: HostPort,
        factories: Vec<Arc<dyn FilterFactory>>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            target,
            factories,
        }
    }
}

#[async_trait::async_trait]
impl NetFilter for StaticNetFilter {
    async fn select_server(&self, ctx: &mut NetFilterContext) {
        let info = ConnectionInfo {
            peer: ctx.peer(),
            cluster: self.cluster.clone(),
        };
        let filters = self.factories.iter().map(|f| f.create(&info)).collect();
        ctx.initiate_connect(self.target.clone(), filters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NetFilterContext {
        NetFilterContext::new("127.0.0.1:1234".parse().unwrap(), None, None, None)
    }

    #[test]
    fn host_port_parses() {
        let hp: HostPort = "broker-0.example.com:9092".parse().unwrap();
        assert_eq!(hp.host, "broker-0.example.com");
        assert_eq!(hp.port, 9092);
        assert!("no-port".parse::<HostPort>().is_err());
        assert!(":9092".parse::<HostPort>().is_err());
    }

    #[tokio::test]
    async fn static_filter_picks_configured_target() {
        let nf = StaticNetFilter::new("main", HostPort::new("broker", 9092), vec![]);
        let mut ctx = ctx();
        nf.select_server(&mut ctx).await;
        match ctx.into_choice() {
            ServerChoice::One(remote, filters) => {
                assert_eq!(remote, HostPort::new("broker", 9092));
                assert!(filters.is_empty());
            }
            _ => panic!("expected a single choice"),
        }
    }

    #[test]
    fn second_initiate_connect_is_flagged() {
        let mut ctx = ctx();
        ctx.initiate_connect(HostPort::new("a", 1), vec![]);
        ctx.initiate_connect(HostPort::new("b", 2), vec![]);
        assert!(matches!(ctx.into_choice(), ServerChoice::Repeated));
    }
}
