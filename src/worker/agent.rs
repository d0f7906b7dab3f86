use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{GridError, Result};
use crate::policy::SystemInfo;
use crate::transport::codec::MessageCodec;
use crate::transport::message::{DispatchHeader, HandshakeInfo, Header, Message, ReopenInfo, ResultHeader};
use crate::worker::executor::TaskExecutor;

type UnitKey = (Uuid, u64);

/// Results of one unit, ready to go back to the driver.
#[derive(Debug)]
struct Completed {
    header: ResultHeader,
    results: Vec<Bytes>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    /// Reconnect at once with the reconfigured properties
    Restart,
    Disconnected,
}

/// Node agent: connects to a driver, executes the units it receives and
/// sends the results back. Reconnects after every disconnect until shut down.
///
/// An offline agent keeps the results of a unit until the next connection
/// and delivers them in its handshake.
pub struct NodeAgent {
    config: AgentConfig,
    executor: TaskExecutor,
    properties: SystemInfo,
    pending: Vec<Completed>,
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Self {
        let mut properties = SystemInfo::local_host();
        for (key, value) in &config.properties {
            properties.set(key.clone(), value);
        }
        Self {
            executor: TaskExecutor::new(config.sandbox.clone()),
            config,
            properties,
            pending: Vec::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    /// Properties announced in the handshake, including applied reconfigurations.
    pub fn system_info(&self) -> &SystemInfo {
        &self.properties
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            node = %self.config.uuid,
            driver = %self.config.driver_addr,
            max_jobs = self.config.max_jobs,
            offline = self.config.offline,
            sandboxed = self.executor.sandboxed(),
            "Node agent starting"
        );
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let connect = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                res = TcpStream::connect(&self.config.driver_addr) => res,
            };
            match connect {
                Ok(stream) => match self.session(stream, &shutdown).await {
                    Ok(SessionEnd::Shutdown) => {
                        tracing::info!(node = %self.config.uuid, "Node agent stopped");
                        return Ok(());
                    }
                    Ok(SessionEnd::Restart) => {
                        tracing::info!(node = %self.config.uuid, "Restarting with new configuration");
                        continue;
                    }
                    Ok(SessionEnd::Disconnected) => {
                        tracing::info!(node = %self.config.uuid, pending = self.pending.len(), "Disconnected from driver");
                    }
                    Err(e) => {
                        tracing::warn!(node = %self.config.uuid, error = %e, "Driver session failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(node = %self.config.uuid, driver = %self.config.driver_addr, error = %e, "Failed to connect to driver");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn handshake(&mut self) -> Message {
        let mut segments = Vec::new();
        let reopen = if self.pending.is_empty() {
            None
        } else {
            let completed = self.pending.remove(0);
            segments = completed.results;
            Some(ReopenInfo {
                result: completed.header,
                close_after: !self.pending.is_empty(),
            })
        };
        let info = HandshakeInfo {
            node_uuid: self.config.uuid.clone(),
            system_info: self.properties.clone(),
            management_host: None,
            management_port: self.config.management_port,
            peer: self.config.peer,
            local: self.config.local,
            offline: self.config.offline,
            accepting_new_jobs: true,
            provisioning_master: self.config.provisioning_master,
            provisioning_slave: self.config.provisioning_slave,
            max_jobs: Some(self.config.max_jobs),
            reopen,
        };
        Message::with_segments(Header::Handshake(info), segments)
    }

    async fn session(&mut self, stream: TcpStream, shutdown: &CancellationToken) -> Result<SessionEnd> {
        let (mut sink, mut frames) = Framed::new(stream, MessageCodec::new()).split();

        let driver_uuid = match frames.next().await {
            Some(Ok(Message {
                header: Header::HandshakeRequest { driver_uuid },
                ..
            })) => driver_uuid,
            Some(Ok(other)) => {
                return Err(GridError::Protocol(format!(
                    "expected handshake request, got {}",
                    other.header.kind()
                )))
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(SessionEnd::Disconnected),
        };
        sink.send(self.handshake()).await?;
        tracing::info!(node = %self.config.uuid, driver = %driver_uuid, "Connected to driver");

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
        let mut running: HashMap<UnitKey, CancellationToken> = HashMap::new();
        let mut connected = true;
        let mut accepting = true;
        let mut properties_changed = false;
        let max_jobs = self.config.max_jobs.max(1);

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                Some(mut done) = done_rx.recv() => {
                    running.remove(&(done.header.job_uuid, done.header.bundle_id));
                    if connected && !self.config.offline {
                        if properties_changed {
                            done.header.system_info = Some(self.properties.clone());
                            properties_changed = false;
                        }
                        let header = Header::Result(done.header);
                        sink.send(Message::with_segments(header, done.results)).await?;
                    } else {
                        self.pending.push(done);
                    }
                    if !connected && running.is_empty() {
                        break SessionEnd::Disconnected;
                    }
                }
                next = frames.next(), if connected => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) if !self.config.offline || running.is_empty() => return Err(e),
                        Some(Err(_)) | None => {
                            if self.config.offline && !running.is_empty() {
                                tracing::debug!(node = %self.config.uuid, running = running.len(), "Offline, finishing units");
                                connected = false;
                                continue;
                            }
                            break SessionEnd::Disconnected;
                        }
                    };
                    match message.header {
                        Header::Dispatch(header) => {
                            let key = (header.job_uuid, header.bundle_id);
                            let token = CancellationToken::new();
                            running.insert(key, token.clone());
                            tracing::debug!(node = %self.config.uuid, job = %header.job_uuid, bundle = header.bundle_id, tasks = header.positions.len(), "Unit received");
                            tokio::spawn(run_unit(
                                self.executor.clone(),
                                header,
                                message.segments,
                                token,
                                done_tx.clone(),
                            ));
                        }
                        Header::Cancel { job_uuid, bundle_id } => {
                            if let Some(token) = running.get(&(job_uuid, bundle_id)) {
                                tracing::info!(node = %self.config.uuid, job = %job_uuid, bundle = bundle_id, "Cancelling unit");
                                token.cancel();
                            }
                        }
                        Header::Reconfigure(reconfigure) => {
                            self.properties.merge(&reconfigure.properties);
                            if reconfigure.restart {
                                break SessionEnd::Restart;
                            }
                            properties_changed = true;
                            tracing::info!(node = %self.config.uuid, "Configuration applied in place");
                        }
                        other => {
                            tracing::warn!(node = %self.config.uuid, kind = other.kind(), "Unexpected message from driver");
                        }
                    }
                }
            }

            // an offline node's connection only lives until its unit arrives
            let busy = running.len() >= max_jobs;
            if connected && !self.config.offline && busy == accepting {
                accepting = !busy;
                let notification = Header::Notification { accepting_new_jobs: accepting };
                sink.send(Message::new(notification)).await?;
            }
        };

        for token in running.values() {
            token.cancel();
        }
        Ok(end)
    }
}

/// Execute every task of a unit concurrently and report the outcomes.
async fn run_unit(
    executor: TaskExecutor,
    header: DispatchHeader,
    segments: Vec<Bytes>,
    cancel: CancellationToken,
    done: mpsc::UnboundedSender<Completed>,
) {
    let started = Instant::now();
    // segment 0 is the job's shared data
    let commands: Vec<String> = segments
        .iter()
        .skip(1)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    let outcomes = join_all(commands.iter().map(|c| executor.execute(c, &cancel))).await;

    let mut result = ResultHeader::new(header.job_uuid, header.bundle_id);
    result.node_elapsed_ms = Some(started.elapsed().as_millis() as u64);
    let resubmit: Vec<usize> = header
        .positions
        .iter()
        .zip(&outcomes)
        .filter(|(_, o)| o.wants_resubmit())
        .map(|(&pos, _)| pos)
        .collect();
    if !resubmit.is_empty() {
        result.resubmit_positions = Some(resubmit);
    }
    if commands.len() != header.positions.len() {
        result.exception = Some(format!(
            "unit announced {} tasks but carried {}",
            header.positions.len(),
            commands.len()
        ));
    }

    let results = match outcomes
        .iter()
        .map(|o| serde_json::to_vec(o).map(Bytes::from))
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(results) => results,
        Err(e) => {
            result.exception = Some(e.to_string());
            Vec::new()
        }
    };

    if done.send(Completed { header: result, results }).is_err() {
        tracing::debug!(job = %header.job_uuid, bundle = header.bundle_id, "Session ended before unit finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(bundle_id: u64) -> Completed {
        Completed {
            header: ResultHeader::new(Uuid::new_v4(), bundle_id),
            results: vec![Bytes::from_static(b"{}")],
        }
    }

    #[test]
    fn handshake_announces_configuration() {
        let config = AgentConfig::new("127.0.0.1:1")
            .with_max_jobs(3)
            .with_property("gpu", "true");
        let mut agent = NodeAgent::new(config);
        let message = agent.handshake();
        let Header::Handshake(info) = message.header else {
            panic!("expected a handshake");
        };
        assert_eq!(info.node_uuid, agent.uuid());
        assert_eq!(info.max_jobs, Some(3));
        assert_eq!(info.system_info.get("gpu"), Some("true"));
        assert!(info.reopen.is_none());
        assert!(message.segments.is_empty());
    }

    #[test]
    fn offline_results_go_out_one_per_handshake() {
        let mut agent = NodeAgent::new(AgentConfig::new("127.0.0.1:1").with_offline(true));
        agent.pending.push(completed(1));
        agent.pending.push(completed(2));

        let first = agent.handshake();
        let Header::Handshake(info) = first.header else {
            panic!("expected a handshake");
        };
        let reopen = info.reopen.unwrap();
        assert_eq!(reopen.result.bundle_id, 1);
        assert!(reopen.close_after);
        assert_eq!(first.segments.len(), 1);

        let Header::Handshake(info) = agent.handshake().header else {
            panic!("expected a handshake");
        };
        let reopen = info.reopen.unwrap();
        assert_eq!(reopen.result.bundle_id, 2);
        assert!(!reopen.close_after);
        assert!(agent.pending.is_empty());
    }

    #[tokio::test]
    async fn unit_results_follow_dispatch_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let header = DispatchHeader {
            job_uuid: Uuid::new_v4(),
            bundle_id: 7,
            job_name: "j".into(),
            positions: vec![4, 5],
            metadata: Default::default(),
            uuid_path: Vec::new(),
        };
        let segments = vec![
            Bytes::new(),
            Bytes::from_static(b"echo first"),
            Bytes::from_static(b"exit 75"),
        ];
        run_unit(
            TaskExecutor::new(Default::default()),
            header,
            segments,
            CancellationToken::new(),
            tx,
        )
        .await;

        let done = rx.recv().await.unwrap();
        assert_eq!(done.header.bundle_id, 7);
        assert_eq!(done.header.resubmit_positions, Some(vec![5]));
        assert!(done.header.exception.is_none());
        assert!(done.header.node_elapsed_ms.is_some());
        let first: crate::worker::executor::TaskOutcome = serde_json::from_slice(&done.results[0]).unwrap();
        assert_eq!(first.output.as_deref(), Some("first\n"));
        assert_eq!(done.results.len(), 2);
    }
}
