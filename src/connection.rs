//! Per-connection engine: one task owning the session state machine, the
//! two channel handlers and the filter pipeline.
//!
//! All events for a connection (client frames, broker frames, connect
//! completion, write-queue capacity) are serviced by this single task, so
//! the state machine needs no locks. Socket writes are offloaded to one
//! writer task per side, fed by a bounded queue; a full queue is the
//! "unwritable" signal that drives the backpressure coupling: while side A
//! is unwritable, side B's reads are not polled.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::codec::{ClientMessage, DownstreamCodec, RawResponse, UpstreamCodec};
use crate::downstream::{EnqueueOutcome, Frontend};
use crate::error::{ProxyError, Result};
use crate::filter::Filter;
use crate::filters::FrameLogger;
use crate::frame::{DecodedRequestFrame, RequestFrame};
use crate::metrics;
use crate::net_filter::{NetFilter, NetFilterContext, ServerChoice, VirtualCluster};
use crate::pipeline::FilterPipeline;
use crate::state::{ClientRequestAction, StateMachine};
use crate::upstream::{Backend, RouteOutcome};
use crate::EngineConfig;

/// Capacity of each side's write queue, in frames. Queue-full is the
/// unwritable edge; the exact depth only bounds how much is in flight
/// between the coordinator and a writer task.
const WRITE_QUEUE_FRAMES: usize = 32;

type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

enum Flow {
    Continue,
    Close(Option<ProxyError>),
}

/// Drive one client connection to completion.
pub(crate) async fn run(
    socket: TcpStream,
    peer: SocketAddr,
    cfg: Arc<EngineConfig>,
    net_filter: Arc<dyn NetFilter>,
) -> Result<()> {
    if let Err(e) = socket.set_nodelay(cfg.tcp_nodelay) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY on client socket");
    }
    let (client_read, client_write) = socket.into_split();
    let mut client_rd = FramedRead::new(client_read, DownstreamCodec::new(cfg.max_frame_bytes));
    let (client_tx, client_rx) = mpsc::channel(WRITE_QUEUE_FRAMES);
    let client_writer = tokio::spawn(write_half(
        FramedWrite::new(client_write, DownstreamCodec::new(cfg.max_frame_bytes)),
        client_rx,
    ));

    let mut sm = StateMachine::new();
    let mut fe = Frontend::new(client_tx, cfg.max_buffered_bytes);
    let mut be: Option<Backend> = None;
    let mut server_rd: Option<FramedRead<OwnedReadHalf, UpstreamCodec>> = None;
    let mut server_writer: Option<JoinHandle<Result<()>>> = None;
    let mut connect_fut: Option<ConnectFuture> = None;
    let mut pipeline = FilterPipeline::empty();
    let mut virtual_cluster: Option<VirtualCluster> = None;

    sm.on_client_active()?;
    metrics::connection_opened();
    debug!(peer = %peer, "client connection active");

    let cause: Option<ProxyError> = 'conn: loop {
        tokio::select! {
            biased;

            drained = fe.unblock(), if fe.is_blocked() => match drained {
                Ok(true) => {
                    if sm.on_client_writable() {
                        trace!("client writable again; resuming server reads");
                    }
                }
                Ok(false) => {}
                Err(e) => break 'conn Some(e),
            },

            drained = unblock_backend(&mut be), if be.as_ref().is_some_and(|b| b.is_blocked()) => match drained {
                Ok(true) => {
                    if sm.on_server_writable() {
                        trace!("server writable again; resuming client reads");
                    }
                }
                Ok(false) => {}
                Err(e) => break 'conn Some(e),
            },

            connected = await_connect(&mut connect_fut), if connect_fut.is_some() => {
                connect_fut = None;
                let stream = match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "upstream connect failed");
                        break 'conn Some(ProxyError::Server(Box::new(e)));
                    }
                };
                if let Err(e) = stream.set_nodelay(cfg.tcp_nodelay) {
                    debug!(error = %e, "failed to set TCP_NODELAY on server socket");
                }
                let (server_read, server_write) = stream.into_split();
                let (server_tx, server_rx) = mpsc::channel(WRITE_QUEUE_FRAMES);
                server_writer = Some(tokio::spawn(write_half(
                    FramedWrite::new(server_write, UpstreamCodec::new(cfg.max_frame_bytes)),
                    server_rx,
                )));
                server_rd = Some(FramedRead::new(
                    server_read,
                    UpstreamCodec::new(cfg.max_frame_bytes),
                ));
                be = Some(Backend::new(server_tx));
                if let Err(e) = sm.on_server_active() {
                    break 'conn Some(e);
                }
                virtual_cluster = sm.virtual_cluster().cloned();
                trace!(peer = %peer, "upstream active; draining buffered frames");

                // Invariant: the pre-forwarding buffer is drained exactly
                // once, in arrival order, each frame traversing the request
                // filters exactly once.
                let (Some(backend), Some(vc)) = (be.as_mut(), virtual_cluster.as_ref()) else {
                    break 'conn Some(ProxyError::ProtocolViolation(
                        "forwarding without an upstream".into(),
                    ));
                };
                for frame in fe.drain_buffer() {
                    match forward_request(frame, &mut sm, &mut fe, backend, &mut pipeline, vc).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close(c)) => break 'conn c,
                        Err(e) => break 'conn Some(e),
                    }
                }
            },

            response = read_server(&mut server_rd), if server_rd.is_some() && !sm.server_reads_blocked() => {
                match response {
                    None => {
                        debug!(peer = %peer, "server closed the connection");
                        break 'conn None;
                    }
                    Some(Err(e)) => {
                        warn!(peer = %peer, error = %e, "exception from the server channel");
                        break 'conn Some(e);
                    }
                    Some(Ok(raw)) => {
                        metrics::bytes_sent(raw.raw.len() + 4);
                        if cfg.log_network {
                            debug!(peer = %peer, bytes = raw.raw.len() + 4, "server -> client");
                        }
                        let (Some(backend), Some(vc)) = (be.as_mut(), virtual_cluster.as_ref()) else {
                            break 'conn Some(ProxyError::ProtocolViolation(
                                "response without an upstream".into(),
                            ));
                        };
                        match handle_server_response(raw, &mut sm, &mut fe, backend, &mut pipeline, vc).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(c)) => break 'conn c,
                            Err(e) => break 'conn Some(e),
                        }
                    }
                }
            },

            message = client_rd.next(), if !sm.client_reads_blocked() => {
                match message {
                    None => {
                        debug!(peer = %peer, "client closed the connection");
                        break 'conn None;
                    }
                    Some(Err(e)) => {
                        log_client_exception(&e, peer);
                        break 'conn Some(e);
                    }
                    Some(Ok(ClientMessage::Preamble(preamble))) => {
                        if let Err(e) = sm.on_client_preamble(preamble) {
                            break 'conn Some(e);
                        }
                    }
                    Some(Ok(ClientMessage::Request(frame))) => {
                        metrics::bytes_received(frame.buffered_size());
                        if cfg.log_network {
                            debug!(peer = %peer, bytes = frame.buffered_size(), "client -> server");
                        }
                        fe.note_request(&frame);

                        // ApiVersions bodies carry the client software
                        // name/version the net-filter wants; decode them
                        // eagerly while still pre-forwarding.
                        let mut decoded_api_versions: Option<DecodedRequestFrame> = None;
                        if frame.is_api_versions() && !sm.is_forwarding() && !sm.is_closing_or_closed() {
                            match frame.clone().into_decoded() {
                                Ok(decoded) => decoded_api_versions = Some(decoded),
                                Err(e) => break 'conn Some(e),
                            }
                        }
                        let software = decoded_api_versions.as_ref().and_then(client_software);

                        let action = match sm.on_client_request(
                            frame.is_api_versions(),
                            software,
                            cfg.sasl_offload,
                        ) {
                            Ok(action) => action,
                            Err(e) => break 'conn Some(e),
                        };
                        match action {
                            ClientRequestAction::Buffer => {
                                if let Err(e) = fe.buffer_msg(frame) {
                                    break 'conn Some(e);
                                }
                            }
                            ClientRequestAction::BufferAndRespondApiVersions => {
                                if let Err(e) = fe.buffer_msg(frame) {
                                    break 'conn Some(e);
                                }
                                let Some(decoded) = decoded_api_versions.as_ref() else {
                                    break 'conn Some(ProxyError::ProtocolViolation(
                                        "ApiVersions state without a decoded request".into(),
                                    ));
                                };
                                match fe.respond_api_versions(decoded) {
                                    EnqueueOutcome::Written | EnqueueOutcome::StillBlocked => {}
                                    EnqueueOutcome::NowBlocked => {
                                        if sm.on_client_unwritable() {
                                            trace!("client unwritable; blocking server reads");
                                        }
                                    }
                                    EnqueueOutcome::Closed => {
                                        break 'conn Some(ProxyError::Client(
                                            "client writer gone".into(),
                                        ));
                                    }
                                }
                            }
                            ClientRequestAction::BufferAndSelectServer => {
                                if let Err(e) = fe.buffer_msg(frame) {
                                    break 'conn Some(e);
                                }
                                match select_server(peer, &cfg, &net_filter, &mut sm).await {
                                    Ok((filters, fut)) => {
                                        let mut filters = filters;
                                        if cfg.log_frames {
                                            filters.insert(
                                                0,
                                                Box::new(FrameLogger::new(peer.to_string())),
                                            );
                                        }
                                        pipeline = FilterPipeline::new(filters);
                                        connect_fut = Some(fut);
                                    }
                                    Err(e) => break 'conn Some(e),
                                }
                            }
                            ClientRequestAction::Forward => {
                                let (Some(backend), Some(vc)) = (be.as_mut(), virtual_cluster.as_ref()) else {
                                    break 'conn Some(ProxyError::ProtocolViolation(
                                        "forwarding without an upstream".into(),
                                    ));
                                };
                                match forward_request(frame, &mut sm, &mut fe, backend, &mut pipeline, vc).await {
                                    Ok(Flow::Continue) => {}
                                    Ok(Flow::Close(c)) => break 'conn c,
                                    Err(e) => break 'conn Some(e),
                                }
                            }
                            ClientRequestAction::Ignore => {}
                        }
                    }
                }
            },
        }
    };

    // Shutdown: tear both halves down exactly once, deliver anything still
    // queued (a short-circuit response beats the close), then synthesize a
    // client-visible error where the taxonomy permits one.
    sm.start_closing(server_writer.is_some());
    pipeline.notify_closed();
    drop(client_rd);
    drop(server_rd);
    if let Some(backend) = be.take() {
        backend.close().await;
    }
    fe.close(cause.as_ref()).await;

    match client_writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "client writer finished with error"),
        Err(e) => warn!(peer = %peer, error = %e, "client writer task failed"),
    }
    if let Err(e) = sm.on_client_closed() {
        warn!(error = %e, "unexpected state during client close");
    }
    if let Some(writer) = server_writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "server writer finished with error"),
            Err(e) => warn!(peer = %peer, error = %e, "server writer task failed"),
        }
        if let Err(e) = sm.on_server_closed() {
            warn!(error = %e, "unexpected state during server close");
        }
    }
    if !sm.is_closed() {
        warn!(state = sm.state_name(), "connection torn down in an unexpected state");
    }
    metrics::connection_closed();
    debug!(peer = %peer, state = sm.state_name(), "connection closed");

    match cause {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Ask the net-filter for an upstream and start the connect.
async fn select_server(
    peer: SocketAddr,
    cfg: &EngineConfig,
    net_filter: &Arc<dyn NetFilter>,
    sm: &mut StateMachine,
) -> Result<(Vec<Box<dyn Filter>>, ConnectFuture)> {
    let (software_name, software_version, preamble) = sm.selecting_metadata();
    let mut ctx = NetFilterContext::new(peer, software_name, software_version, preamble);
    net_filter.select_server(&mut ctx).await;
    match ctx.into_choice() {
        ServerChoice::One(remote, filters) => {
            let vc = VirtualCluster {
                name: cfg.cluster_name.clone(),
                target: remote.clone(),
            };
            sm.on_net_filter_initiate_connect(remote.clone(), vc)?;
            debug!(peer = %peer, remote = %remote, "connecting upstream");
            let addr = remote.to_string();
            let fut: ConnectFuture = Box::pin(TcpStream::connect(addr));
            Ok((filters, fut))
        }
        ServerChoice::None => Err(ProxyError::ProtocolViolation(
            "net-filter completed without calling initiate_connect".into(),
        )),
        ServerChoice::Repeated => Err(ProxyError::ProtocolViolation(
            "net-filter called initiate_connect more than once".into(),
        )),
    }
}

/// Push a client request through the filter chain and onward to the broker.
async fn forward_request(
    frame: RequestFrame,
    sm: &mut StateMachine,
    fe: &mut Frontend,
    be: &mut Backend,
    pipeline: &mut FilterPipeline,
    vc: &VirtualCluster,
) -> Result<Flow> {
    let dispatch = pipeline
        .dispatch_request(frame, vc, &mut be.correlation)
        .await?;
    if dispatch.disconnect {
        return Ok(Flow::Close(None));
    }
    for frame in dispatch.to_server {
        match be.enqueue(frame) {
            EnqueueOutcome::Written | EnqueueOutcome::StillBlocked => {}
            EnqueueOutcome::NowBlocked => {
                if sm.on_server_unwritable() {
                    trace!("server unwritable; blocking client reads");
                }
            }
            EnqueueOutcome::Closed => {
                return Err(ProxyError::Server("server writer gone".into()));
            }
        }
    }
    if let Some(response) = dispatch.to_client {
        match fe.enqueue(response) {
            EnqueueOutcome::Written | EnqueueOutcome::StillBlocked => {}
            EnqueueOutcome::NowBlocked => {
                if sm.on_client_unwritable() {
                    trace!("client unwritable; blocking server reads");
                }
            }
            EnqueueOutcome::Closed => {
                return Err(ProxyError::Client("client writer gone".into()));
            }
        }
    }
    if dispatch.close_after {
        return Ok(Flow::Close(None));
    }
    Ok(Flow::Continue)
}

/// Route a broker response: internal responses complete their promise,
/// external ones run the response filters and head for the client.
async fn handle_server_response(
    raw: RawResponse,
    sm: &mut StateMachine,
    fe: &mut Frontend,
    be: &mut Backend,
    pipeline: &mut FilterPipeline,
    vc: &VirtualCluster,
) -> Result<Flow> {
    let frame = match be.route_response(raw)? {
        RouteOutcome::Internal { recipient } => {
            trace!(recipient, "internal response delivered to filter");
            return Ok(Flow::Continue);
        }
        RouteOutcome::ToClient(frame) => frame,
    };
    let dispatch = pipeline
        .dispatch_response(frame, vc, &mut be.correlation)
        .await?;
    if dispatch.disconnect {
        return Ok(Flow::Close(None));
    }
    for frame in dispatch.to_server {
        match be.enqueue(frame) {
            EnqueueOutcome::Written | EnqueueOutcome::StillBlocked => {}
            EnqueueOutcome::NowBlocked => {
                if sm.on_server_unwritable() {
                    trace!("server unwritable; blocking client reads");
                }
            }
            EnqueueOutcome::Closed => {
                return Err(ProxyError::Server("server writer gone".into()));
            }
        }
    }
    if let Some(response) = dispatch.to_client {
        match fe.enqueue(response) {
            EnqueueOutcome::Written | EnqueueOutcome::StillBlocked => {}
            EnqueueOutcome::NowBlocked => {
                if sm.on_client_unwritable() {
                    trace!("client unwritable; blocking server reads");
                }
            }
            EnqueueOutcome::Closed => {
                return Err(ProxyError::Client("client writer gone".into()));
            }
        }
    }
    if dispatch.close_after {
        return Ok(Flow::Close(None));
    }
    Ok(Flow::Continue)
}

fn client_software(frame: &DecodedRequestFrame) -> Option<(String, String)> {
    match &frame.body {
        kafka_protocol::messages::RequestKind::ApiVersions(body) => Some((
            body.client_software_name.to_string(),
            body.client_software_version.to_string(),
        )),
        _ => None,
    }
}

fn log_client_exception(error: &ProxyError, peer: SocketAddr) {
    match error {
        ProxyError::OversizedFrame { received, max } => {
            // The usual culprit is something that is not Kafka at all
            // arriving on the listener port.
            warn!(
                peer = %peer,
                received_frame_size_bytes = received,
                max_frame_size_bytes = max,
                "received over-sized frame from the client (hint: are we decoding a Kafka \
                 frame, or something unexpected like an HTTP request or a TLS handshake?)"
            );
        }
        other => {
            warn!(peer = %peer, error = %other, "exception from the client channel");
        }
    }
}

/// Writer task: drains the queue, flushing once each burst is exhausted, and
/// ends with a final flush and FIN when the queue is released.
async fn write_half<S, C, F>(mut framed: FramedWrite<S, C>, mut rx: mpsc::Receiver<F>) -> Result<()>
where
    S: AsyncWrite + Unpin,
    C: Encoder<F, Error = ProxyError>,
{
    while let Some(frame) = rx.recv().await {
        framed.feed(frame).await?;
        while let Ok(frame) = rx.try_recv() {
            framed.feed(frame).await?;
        }
        framed.flush().await?;
    }
    framed.close().await?;
    Ok(())
}

async fn read_server(
    rd: &mut Option<FramedRead<OwnedReadHalf, UpstreamCodec>>,
) -> Option<Result<RawResponse>> {
    match rd.as_mut() {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

async fn await_connect(fut: &mut Option<ConnectFuture>) -> std::io::Result<TcpStream> {
    match fut.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn unblock_backend(be: &mut Option<Backend>) -> Result<bool> {
    match be.as_mut() {
        Some(backend) => backend.unblock().await,
        None => std::future::pending().await,
    }
}
