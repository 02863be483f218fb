//! The state machine for a single client's connection to a broker.
//!
//! The session state lives in [`StateMachine::state`] as an immutable variant
//! of [`ProxyChannelState`]; events are the `on_*` methods, each admissible
//! only in specific states. An inadmissible event is an error: the connection
//! driver closes both channels with no client response.
//!
//! ```text
//!   «start»
//!      │ on_client_active
//!      ▼
//!   ClientActive ──preamble──▶ HaProxy
//!      │                         │
//!      ├──ApiVersions+offload──▶ ApiVersions ──any KRPC──▶ SelectingServer
//!      │                         │                            ▲
//!      └──────any KRPC───────────┴────────────────────────────┘
//!                                                             │ initiate_connect
//!                                                             ▼
//!                                  Forwarding ◀──server up── Connecting
//!                                      │
//!                                      ▼
//!                                   Closing ──both halves done──▶ Closed
//! ```
//!
//! A second, independent machine handles TCP backpressure: the two
//! `*_reads_blocked` booleans couple writability of one half-channel to read
//! suspension of the other. It is deliberately not folded into the session
//! state; backpressure can change in several session states.

use tracing::{error, trace};

use crate::error::{ProxyError, Result};
use crate::frame::HaProxyPreamble;
use crate::metrics;
use crate::net_filter::{HostPort, VirtualCluster};

#[derive(Debug)]
pub(crate) enum ProxyChannelState {
    Startup,
    ClientActive,
    HaProxy {
        preamble: HaProxyPreamble,
    },
    ApiVersions {
        client_software_name: Option<String>,
        client_software_version: Option<String>,
        preamble: Option<HaProxyPreamble>,
    },
    SelectingServer {
        client_software_name: Option<String>,
        client_software_version: Option<String>,
        preamble: Option<HaProxyPreamble>,
    },
    Connecting {
        remote: HostPort,
        virtual_cluster: VirtualCluster,
    },
    Forwarding {
        remote: HostPort,
        virtual_cluster: VirtualCluster,
    },
    Closing {
        client_done: bool,
        server_done: bool,
    },
    Closed,
}

impl ProxyChannelState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ProxyChannelState::Startup => "Startup",
            ProxyChannelState::ClientActive => "ClientActive",
            ProxyChannelState::HaProxy { .. } => "HaProxy",
            ProxyChannelState::ApiVersions { .. } => "ApiVersions",
            ProxyChannelState::SelectingServer { .. } => "SelectingServer",
            ProxyChannelState::Connecting { .. } => "Connecting",
            ProxyChannelState::Forwarding { .. } => "Forwarding",
            ProxyChannelState::Closing { .. } => "Closing",
            ProxyChannelState::Closed => "Closed",
        }
    }
}

/// What the connection driver must do with a client request frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClientRequestAction {
    /// Pre-forwarding: append the frame to the downstream buffer.
    Buffer,
    /// Buffer, then answer `ApiVersions` locally (SASL offload path).
    BufferAndRespondApiVersions,
    /// Buffer, then ask the net-filter to select an upstream.
    BufferAndSelectServer,
    /// `Forwarding`: run the request filter chain and send upstream.
    Forward,
    /// Shutting down; the frame is discarded.
    Ignore,
}

pub(crate) struct StateMachine {
    state: ProxyChannelState,
    // The read toggles are touched only on writability edges; these mirrors
    // let the driver consult them on every loop turn without churn.
    client_reads_blocked: bool,
    server_reads_blocked: bool,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: ProxyChannelState::Startup,
            client_reads_blocked: false,
            server_reads_blocked: false,
        }
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub(crate) fn is_forwarding(&self) -> bool {
        matches!(self.state, ProxyChannelState::Forwarding { .. })
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, ProxyChannelState::Closed)
    }

    pub(crate) fn is_closing_or_closed(&self) -> bool {
        matches!(
            self.state,
            ProxyChannelState::Closing { .. } | ProxyChannelState::Closed
        )
    }

    pub(crate) fn virtual_cluster(&self) -> Option<&VirtualCluster> {
        match &self.state {
            ProxyChannelState::Connecting {
                virtual_cluster, ..
            }
            | ProxyChannelState::Forwarding {
                virtual_cluster, ..
            } => Some(virtual_cluster),
            _ => None,
        }
    }

    /// Client metadata collected before server selection, used to build the
    /// net-filter context. Only meaningful in `SelectingServer`.
    pub(crate) fn selecting_metadata(
        &self,
    ) -> (Option<String>, Option<String>, Option<HaProxyPreamble>) {
        match &self.state {
            ProxyChannelState::SelectingServer {
                client_software_name,
                client_software_version,
                preamble,
            } => (
                client_software_name.clone(),
                client_software_version.clone(),
                preamble.clone(),
            ),
            _ => (None, None, None),
        }
    }

    fn set_state(&mut self, next: ProxyChannelState) {
        trace!(from = self.state.name(), to = next.name(), "state transition");
        metrics::state_transition(next.name());
        self.state = next;
    }

    fn illegal(&self, msg: &str) -> ProxyError {
        error!(
            state = self.state.name(),
            "unexpected event: {msg}; closing channels with no client response"
        );
        metrics::protocol_error();
        ProxyError::ProtocolViolation(format!("{msg} in state {}", self.state.name()))
    }

    /// Downstream TCP handshake completed.
    pub(crate) fn on_client_active(&mut self) -> Result<()> {
        match self.state {
            ProxyChannelState::Startup => {
                self.set_state(ProxyChannelState::ClientActive);
                Ok(())
            }
            _ => Err(self.illegal("client activation while not in the start state")),
        }
    }

    /// The codec produced a PROXY preamble.
    pub(crate) fn on_client_preamble(&mut self, preamble: HaProxyPreamble) -> Result<()> {
        match self.state {
            ProxyChannelState::ClientActive => {
                self.set_state(ProxyChannelState::HaProxy { preamble });
                Ok(())
            }
            _ => Err(self.illegal("PROXY preamble received")),
        }
    }

    /// The codec produced a Kafka request frame. `client_software` carries
    /// the software name/version out of a decoded `ApiVersions` body.
    pub(crate) fn on_client_request(
        &mut self,
        is_api_versions: bool,
        client_software: Option<(String, String)>,
        sasl_offload: bool,
    ) -> Result<ClientRequestAction> {
        let (name, version) = match client_software {
            Some((n, v)) => (Some(n), Some(v)),
            None => (None, None),
        };
        match &mut self.state {
            ProxyChannelState::ClientActive => {
                if is_api_versions && sasl_offload {
                    self.set_state(ProxyChannelState::ApiVersions {
                        client_software_name: name,
                        client_software_version: version,
                        preamble: None,
                    });
                    Ok(ClientRequestAction::BufferAndRespondApiVersions)
                } else {
                    self.set_state(ProxyChannelState::SelectingServer {
                        client_software_name: name,
                        client_software_version: version,
                        preamble: None,
                    });
                    Ok(ClientRequestAction::BufferAndSelectServer)
                }
            }
            ProxyChannelState::HaProxy { preamble } => {
                let preamble = Some(preamble.clone());
                if is_api_versions && sasl_offload {
                    self.set_state(ProxyChannelState::ApiVersions {
                        client_software_name: name,
                        client_software_version: version,
                        preamble,
                    });
                    Ok(ClientRequestAction::BufferAndRespondApiVersions)
                } else {
                    self.set_state(ProxyChannelState::SelectingServer {
                        client_software_name: name,
                        client_software_version: version,
                        preamble,
                    });
                    Ok(ClientRequestAction::BufferAndSelectServer)
                }
            }
            ProxyChannelState::ApiVersions {
                client_software_name,
                client_software_version,
                preamble,
            } => {
                let (csn, csv, pre) = (
                    client_software_name.take(),
                    client_software_version.take(),
                    preamble.take(),
                );
                self.set_state(ProxyChannelState::SelectingServer {
                    client_software_name: csn,
                    client_software_version: csv,
                    preamble: pre,
                });
                Ok(ClientRequestAction::BufferAndSelectServer)
            }
            ProxyChannelState::SelectingServer { .. } | ProxyChannelState::Connecting { .. } => {
                Ok(ClientRequestAction::Buffer)
            }
            ProxyChannelState::Forwarding { .. } => Ok(ClientRequestAction::Forward),
            ProxyChannelState::Closing { .. } | ProxyChannelState::Closed => {
                Ok(ClientRequestAction::Ignore)
            }
            ProxyChannelState::Startup => {
                Err(self.illegal("client request before channel activation"))
            }
        }
    }

    /// The net-filter called `initiate_connect`.
    pub(crate) fn on_net_filter_initiate_connect(
        &mut self,
        remote: HostPort,
        virtual_cluster: VirtualCluster,
    ) -> Result<()> {
        match self.state {
            ProxyChannelState::SelectingServer { .. } => {
                self.set_state(ProxyChannelState::Connecting {
                    remote,
                    virtual_cluster,
                });
                Ok(())
            }
            _ => Err(self.illegal("initiate_connect called outside server selection")),
        }
    }

    /// Upstream TCP connect completed.
    pub(crate) fn on_server_active(&mut self) -> Result<()> {
        match &self.state {
            ProxyChannelState::Connecting {
                remote,
                virtual_cluster,
            } => {
                let (remote, virtual_cluster) = (remote.clone(), virtual_cluster.clone());
                self.set_state(ProxyChannelState::Forwarding {
                    remote,
                    virtual_cluster,
                });
                Ok(())
            }
            _ => Err(self.illegal("server became active while not in the connecting state")),
        }
    }

    /// Begin shutdown. Returns `true` if `Closing` was newly entered (the
    /// caller tears down channels exactly once). `server_exists` seeds the
    /// server-done flag when no upstream channel was ever created.
    pub(crate) fn start_closing(&mut self, server_exists: bool) -> bool {
        if self.is_closing_or_closed() {
            return false;
        }
        self.set_state(ProxyChannelState::Closing {
            client_done: false,
            server_done: !server_exists,
        });
        true
    }

    /// The downstream channel finished closing.
    pub(crate) fn on_client_closed(&mut self) -> Result<()> {
        self.half_closed(true)
    }

    /// The upstream channel finished closing.
    pub(crate) fn on_server_closed(&mut self) -> Result<()> {
        self.half_closed(false)
    }

    fn half_closed(&mut self, client: bool) -> Result<()> {
        enum Outcome {
            AlreadyDone,
            BothDone,
            OneRemaining,
            Closed,
            NotClosing,
        }
        let outcome = match &mut self.state {
            ProxyChannelState::Closing {
                client_done,
                server_done,
            } => {
                let flag = if client {
                    &mut *client_done
                } else {
                    &mut *server_done
                };
                if *flag {
                    Outcome::AlreadyDone
                } else {
                    *flag = true;
                    if *client_done && *server_done {
                        Outcome::BothDone
                    } else {
                        Outcome::OneRemaining
                    }
                }
            }
            ProxyChannelState::Closed => Outcome::Closed,
            _ => Outcome::NotClosing,
        };
        match outcome {
            Outcome::AlreadyDone => Err(self.illegal("channel close acknowledged twice")),
            Outcome::BothDone => {
                self.set_state(ProxyChannelState::Closed);
                Ok(())
            }
            Outcome::OneRemaining | Outcome::Closed => Ok(()),
            Outcome::NotClosing => Err(self.illegal("channel closed outside shutdown")),
        }
    }

    // Backpressure edges. Each returns true when the driver must actually
    // toggle the corresponding read side, so the underlying flag is touched
    // only on writable/unwritable transitions.

    pub(crate) fn on_client_unwritable(&mut self) -> bool {
        if !self.server_reads_blocked {
            self.server_reads_blocked = true;
            return true;
        }
        false
    }

    pub(crate) fn on_client_writable(&mut self) -> bool {
        if self.server_reads_blocked {
            self.server_reads_blocked = false;
            return true;
        }
        false
    }

    pub(crate) fn on_server_unwritable(&mut self) -> bool {
        if !self.client_reads_blocked {
            self.client_reads_blocked = true;
            return true;
        }
        false
    }

    pub(crate) fn on_server_writable(&mut self) -> bool {
        if self.client_reads_blocked {
            self.client_reads_blocked = false;
            return true;
        }
        false
    }

    pub(crate) fn client_reads_blocked(&self) -> bool {
        self.client_reads_blocked
    }

    pub(crate) fn server_reads_blocked(&self) -> bool {
        self.server_reads_blocked
    }
}
