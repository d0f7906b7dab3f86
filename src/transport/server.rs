//! TCP server accepting node connections.
//!
//! Every connection gets a [`NodeChannel`], a writer task draining the
//! channel's outbound queue and a reader loop routing incoming messages.
//! The writer resolves the in-flight unit before each dispatch write and
//! arms expiration (or offline hand-over) right after it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::channel::{node_properties, ExecutionStatus, NodeChannel, NodeIdentity, Outbound};
use crate::driver::DriverContext;
use crate::error::{GridError, Result};
use crate::handler::expiration::schedule_expiration;
use crate::handler::failure::handle_channel_failure;
use crate::handler::offline;
use crate::handler::results::handle_result;
use crate::policy::system_info::{NODE_MAX_JOBS, PEER_DRIVER, PROVISIONING_MASTER, PROVISIONING_SLAVE};
use crate::scheduler::job::DispatchUnit;
use crate::transport::codec::MessageCodec;
use crate::transport::message::{HandshakeInfo, Header, Message};

type FrameSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type FrameStream = SplitStream<Framed<TcpStream, MessageCodec>>;

/// Accept node connections until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn serve(listener: TcpListener, ctx: Arc<DriverContext>, shutdown: CancellationToken) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Node server listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Node server shutting down");
                break;
            }
            res = listener.accept() => {
                match res {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(stream, addr, Arc::clone(&ctx)));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept node connection");
                    }
                }
            }
        }
    }
    Ok(())
}

/// One node connection, from accept to close.
struct Connection {
    ctx: Arc<DriverContext>,
    channel: Arc<NodeChannel>,
    remote: SocketAddr,
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<DriverContext>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(remote = %remote, error = %e, "Could not set TCP_NODELAY");
    }
    let (channel, outbound) = ctx.open_channel().await;
    tracing::info!(channel = %channel.id(), remote = %remote, "Node connection accepted");

    let (sink, frames) = Framed::new(stream, MessageCodec::new()).split();
    let conn = Arc::new(Connection { ctx, channel, remote });
    let writer = tokio::spawn(Arc::clone(&conn).write_loop(sink, outbound));

    let reason = match conn.start_handshake().await {
        Ok(()) => conn.read_loop(frames).await,
        Err(e) => e.to_string(),
    };
    handle_channel_failure(&conn.ctx, &conn.channel, &reason).await;
    if let Err(e) = writer.await {
        tracing::error!(channel = %conn.channel.id(), error = %e, "Writer task failed");
    }
}

impl Connection {
    async fn start_handshake(&self) -> Result<()> {
        {
            let mut state = self.channel.lock().await;
            self.channel.set_status(&mut state, ExecutionStatus::Handshaking)?;
        }
        self.channel.send(Message::new(Header::HandshakeRequest {
            driver_uuid: self.ctx.config.uuid.clone(),
        }))
    }

    /// Route messages until the connection ends. Returns why it ended.
    async fn read_loop(&self, mut frames: FrameStream) -> String {
        loop {
            let next = tokio::select! {
                _ = self.channel.closed_token().cancelled() => return "channel closed".to_string(),
                next = frames.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    if let Err(e) = self.route(message).await {
                        tracing::warn!(channel = %self.channel.id(), error = %e, "Dropping node connection");
                        return e.to_string();
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(channel = %self.channel.id(), node = %self.channel.uuid(), error = %e, "Read from node failed");
                    return format!("read failed: {}", e);
                }
                None => return "connection closed by node".to_string(),
            }
        }
    }

    async fn route(&self, message: Message) -> Result<()> {
        let Message { header, segments } = message;
        match header {
            Header::Handshake(info) => self.process_handshake(info, segments).await,
            Header::Result(result) => {
                if self.channel.identity().is_none() {
                    return Err(GridError::Protocol("result before handshake".to_string()));
                }
                handle_result(&self.ctx, &self.channel, result, segments).await;
                Ok(())
            }
            Header::Notification { accepting_new_jobs } => {
                let mut state = self.channel.lock().await;
                if state.accepting_new_jobs != accepting_new_jobs {
                    state.accepting_new_jobs = accepting_new_jobs;
                    tracing::debug!(node = %self.channel.uuid(), accepting_new_jobs, "Node throttling changed");
                    self.channel.refresh();
                }
                Ok(())
            }
            other => Err(GridError::Protocol(format!(
                "unexpected {} message from node",
                other.kind()
            ))),
        }
    }

    async fn process_handshake(&self, info: HandshakeInfo, segments: Vec<Bytes>) -> Result<()> {
        let channel = &self.channel;
        if channel.status().await != ExecutionStatus::Handshaking {
            return Err(GridError::Protocol("unexpected handshake".to_string()));
        }
        let identity = NodeIdentity {
            node_uuid: info.node_uuid.clone(),
            peer: info.peer,
            local: info.local,
            offline: info.offline,
            provisioning_master: info.provisioning_master,
            provisioning_slave: info.provisioning_slave,
            management_host: info.management_host.clone(),
            management_port: info.management_port,
            remote_addr: Some(self.remote),
        };
        channel.set_identity(identity.clone())?;

        let max_jobs = if info.offline {
            1
        } else {
            info.max_jobs.unwrap_or(self.ctx.config.default_node_max_jobs).max(1)
        };
        {
            let mut state = channel.lock().await;
            let mut props = node_properties(&identity, &info.system_info);
            props.set(NODE_MAX_JOBS, max_jobs);
            if info.peer {
                props.set(PEER_DRIVER, true);
            }
            if info.provisioning_master {
                props.set(PROVISIONING_MASTER, true);
            }
            if info.provisioning_slave {
                props.set(PROVISIONING_SLAVE, true);
            }
            state.system_info = props;
            state.max_jobs = max_jobs;
            state.accepting_new_jobs = info.accepting_new_jobs;
        }
        self.ctx.stats.node_connected(info.peer);
        tracing::info!(
            channel = %channel.id(),
            node = %identity.node_uuid,
            remote = %self.remote,
            peer = info.peer,
            offline = info.offline,
            max_jobs,
            "Node connected"
        );

        if let Some(reopen) = info.reopen {
            let close_after = reopen.close_after;
            offline::reopen(&self.ctx, channel, reopen, segments).await;
            if close_after {
                handle_channel_failure(&self.ctx, channel, "offline node delivered its results").await;
                return Ok(());
            }
        }

        let mut state = channel.lock().await;
        channel.set_status(&mut state, ExecutionStatus::Active)
    }

    async fn write_loop(self: Arc<Self>, mut sink: FrameSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let channel = &self.channel;
        loop {
            let out = tokio::select! {
                _ = channel.closed_token().cancelled() => break,
                out = outbound.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
            };

            let unit = match out.unit {
                Some(key) => {
                    let state = channel.lock().await;
                    match state.entry(&key) {
                        Some(unit) => Some(Arc::clone(unit)),
                        None => {
                            tracing::debug!(channel = %channel.id(), bundle = %key, "Unit no longer in flight, not sent");
                            continue;
                        }
                    }
                }
                None => None,
            };

            let kind = out.message.header.kind();
            if let Err(e) = sink.send(out.message).await {
                tracing::error!(channel = %channel.id(), node = %channel.uuid(), kind, error = %e, "Write to node failed");
                handle_channel_failure(&self.ctx, channel, "write failed").await;
                break;
            }
            if let Some(unit) = unit {
                self.unit_sent(unit).await;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::trace!(channel = %channel.id(), error = %e, "Closing node connection");
        }
    }

    async fn unit_sent(&self, unit: Arc<DispatchUnit>) {
        schedule_expiration(&self.ctx, &self.channel, &unit).await;
        if self.channel.is_offline() {
            offline::hand_over(&self.ctx, &self.channel, unit).await;
        }
    }
}
