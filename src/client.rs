//! Client mode implementation
//!
//! Discovers a server, then runs rounds of concurrent stream and datagram
//! transfers and aggregates each round into a [`Summary`].

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discover::{self, DiscoveryError, Endpoint};
use crate::protocol::{DISCOVERY_PORT, Transport};
use crate::shutdown::{self, cancelled};
use crate::stats::{Aggregator, StatisticsRecord, Summary};
use crate::tcp::{self, TcpConfig};
use crate::udp::{self, UdpConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bytes requested by every session
    pub size: u64,
    pub stream_sessions: u32,
    pub datagram_sessions: u32,
    pub discovery_port: u16,
    pub discovery_timeout: Duration,
    /// None runs until cancelled
    pub rounds: Option<u32>,
    /// Collect every round's summary into the value returned by
    /// [`Client::run`]. Off, rounds are only reported as events, so an
    /// endless run holds no history.
    pub keep_summaries: bool,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            stream_sessions: 1,
            datagram_sessions: 1,
            discovery_port: DISCOVERY_PORT,
            discovery_timeout: Duration::from_secs(10),
            rounds: Some(1),
            keep_summaries: true,
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Discovering,
    Testing,
    Aggregating,
    Failed,
}

impl ClientState {
    pub fn can_move_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Idle, Discovering)
                | (Discovering, Testing)
                | (Discovering, Failed)
                | (Testing, Aggregating)
                | (Aggregating, Idle)
                | (Failed, Idle)
        )
    }
}

/// Progress reported while [`Client::run`] is working
#[derive(Debug, Clone)]
pub enum ClientEvent {
    State(ClientState),
    Discovered(Endpoint),
    DiscoveryFailed(String),
    Round(Summary),
}

pub struct Client {
    config: ClientConfig,
    /// Signals transfer workers and the round loop to stop
    cancel_tx: watch::Sender<bool>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            cancel_tx,
            state: Mutex::new(ClientState::Idle),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Stop the current round; workers keep what they have received so far.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    fn transition(&self, next: ClientState, events: Option<&mpsc::Sender<ClientEvent>>) {
        {
            let mut state = self.state.lock();
            if !state.can_move_to(next) {
                warn!("Unexpected client state change {:?} -> {:?}", *state, next);
            }
            debug!("Client state {:?} -> {:?}", *state, next);
            *state = next;
        }
        emit(events, ClientEvent::State(next));
    }

    /// Listen for one Offer, moving through Discovering.
    pub async fn discover(&self) -> Result<Endpoint, DiscoveryError> {
        self.discover_with_events(None).await
    }

    async fn discover_with_events(
        &self,
        events: Option<&mpsc::Sender<ClientEvent>>,
    ) -> Result<Endpoint, DiscoveryError> {
        self.transition(ClientState::Discovering, events);
        info!("Waiting for server offers on port {}...", self.config.discovery_port);

        match discover::discover_on(self.config.discovery_port, self.config.discovery_timeout).await {
            Ok(endpoint) => {
                emit(events, ClientEvent::Discovered(endpoint));
                Ok(endpoint)
            }
            Err(e) => {
                self.transition(ClientState::Failed, events);
                emit(events, ClientEvent::DiscoveryFailed(e.to_string()));
                self.transition(ClientState::Idle, events);
                Err(e)
            }
        }
    }

    /// Run one round against `endpoint`: every session in parallel, joined
    /// before aggregation. Each session contributes exactly one record.
    pub async fn run_round(&self, endpoint: Endpoint) -> anyhow::Result<Summary> {
        self.run_round_with_events(endpoint, None).await
    }

    async fn run_round_with_events(
        &self,
        endpoint: Endpoint,
        events: Option<&mpsc::Sender<ClientEvent>>,
    ) -> anyhow::Result<Summary> {
        if self.state() == ClientState::Idle {
            self.transition(ClientState::Discovering, events);
        }
        self.transition(ClientState::Testing, events);

        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let size = self.config.size;
        info!(
            "Round {}: {} stream + {} datagram sessions of {} bytes against {}",
            id, self.config.stream_sessions, self.config.datagram_sessions, size, endpoint
        );

        let aggregator = Arc::new(Aggregator::new());
        let mut workers = JoinSet::new();

        for session in 0..self.config.stream_sessions {
            let aggregator = aggregator.clone();
            let config = self.config.tcp.clone();
            let cancel = self.cancel_tx.subscribe();
            workers.spawn(async move {
                let record = match tcp::request_stream_transfer(&endpoint, size, &config, cancel).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Stream session {} failed: {}", session, e);
                        StatisticsRecord::failed(Transport::Stream, size, e)
                    }
                };
                aggregator.append(record.with_session(session));
            });
        }

        for session in 0..self.config.datagram_sessions {
            let aggregator = aggregator.clone();
            let config = self.config.udp.clone();
            let cancel = self.cancel_tx.subscribe();
            workers.spawn(async move {
                let record = match udp::request_datagram_transfer(&endpoint, size, &config, cancel).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Datagram session {} failed: {}", session, e);
                        StatisticsRecord::failed(Transport::Datagram, size, e)
                    }
                };
                aggregator.append(record.with_session(session));
            });
        }

        // Join barrier: nothing is summarized until every worker has returned
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Transfer task failed: {}", e);
            }
        }

        self.transition(ClientState::Aggregating, events);
        let aggregator = Arc::try_unwrap(aggregator)
            .map_err(|_| anyhow::anyhow!("aggregator still shared after join"))?;
        let summary = aggregator.into_summary(id, started_at);
        self.transition(ClientState::Idle, events);

        Ok(summary)
    }

    /// Discover and test for the configured number of rounds. Discovery
    /// timeouts are retried; cancellation ends the loop after the current
    /// round. The returned list is empty unless `keep_summaries` is set.
    pub async fn run(
        &self,
        events: Option<mpsc::Sender<ClientEvent>>,
    ) -> anyhow::Result<Vec<Summary>> {
        let events = events.as_ref();
        let mut cancel = self.cancel_tx.subscribe();
        let mut summaries = Vec::new();
        let mut completed = 0u32;

        while self.config.rounds.is_none_or(|rounds| completed < rounds) {
            if shutdown::is_cancelled(&cancel) {
                break;
            }

            let endpoint = tokio::select! {
                result = self.discover_with_events(events) => result,
                _ = cancelled(&mut cancel) => break,
            };
            let endpoint = match endpoint {
                Ok(endpoint) => endpoint,
                Err(DiscoveryError::Timeout(timeout)) => {
                    info!("No offer within {:?}, retrying", timeout);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let summary = self.run_round_with_events(endpoint, events).await?;
            if self.config.keep_summaries {
                summaries.push(summary.clone());
            }
            emit(events, ClientEvent::Round(summary));
            completed += 1;
        }

        // Leave the state machine at rest if cancellation cut discovery short
        let state = self.state();
        if state != ClientState::Idle {
            debug!("Client stopped in state {:?}", state);
            *self.state.lock() = ClientState::Idle;
        }

        Ok(summaries)
    }
}

fn emit(events: Option<&mpsc::Sender<ClientEvent>>, event: ClientEvent) {
    if let Some(tx) = events
        && tx.try_send(event).is_err()
    {
        debug!("Client event dropped");
    }
}
