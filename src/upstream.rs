//! Connections to the origin server.
//!
//! Two policies exist and exactly one is active per process:
//!
//! - [`UpstreamMode::Shared`]: one worker task owns the only origin connection
//!   and serves exchanges from a FIFO queue, so at most one exchange is in
//!   flight. A slow origin delays every queued exchange.
//! - [`UpstreamMode::PerSession`]: every client session dials its own origin
//!   connection and never waits on another session.
//!
//! In both cases a connection is opened lazily and dropped after a failed
//! exchange; the next exchange reconnects.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::http::{MessageReader, ReceivedMessage};

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpstreamMode {
    /// One origin connection shared by all sessions, one exchange at a time.
    Shared,
    /// One origin connection per client session.
    PerSession,
}

/// A completed origin round trip.
#[derive(Debug)]
pub struct Exchange {
    pub response: ReceivedMessage,
    /// From the request being written until the last body byte arrived.
    pub elapsed: Duration,
}

// ============================================================================
// ORIGIN CONNECTION
// ============================================================================

pub struct OriginConnection {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
    exchange_timeout: Option<Duration>,
    stream: Option<MessageReader<TcpStream>>,
}

impl OriginConnection {
    pub fn new(
        addr: SocketAddr,
        connect_timeout: Option<Duration>,
        exchange_timeout: Option<Duration>,
    ) -> Self {
        Self {
            addr,
            connect_timeout,
            exchange_timeout,
            stream: None,
        }
    }

    /// A fresh, unconnected handle to the same origin.
    pub fn detached(&self) -> Self {
        Self::new(self.addr, self.connect_timeout, self.exchange_timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends `request` and reads the full response.
    pub async fn exchange(&mut self, request: &[u8]) -> Result<Exchange> {
        if self.stream.is_none() {
            self.stream = Some(self.connect().await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(ProxyError::UpstreamClosed);
        };

        let result = match self.exchange_timeout {
            Some(limit) => match timeout(limit, round_trip(stream, request)).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::Timeout("Origin exchange", limit)),
            },
            None => round_trip(stream, request).await,
        };

        if let Err(ref e) = result {
            debug!("Dropping origin connection to {}: {}", self.addr, e);
            self.stream = None;
        }

        result
    }

    async fn connect(&self) -> Result<MessageReader<TcpStream>> {
        let connect_future = TcpStream::connect(self.addr);

        let stream = match self.connect_timeout {
            Some(limit) => match timeout(limit, connect_future).await {
                Ok(result) => result,
                Err(_) => return Err(ProxyError::Timeout("Origin connect", limit)),
            },
            None => connect_future.await,
        }
        .map_err(|e| ProxyError::OriginConnect {
            addr: self.addr.to_string(),
            reason: e.to_string(),
        })?;

        let _ = stream.set_nodelay(true);
        debug!("Connected to origin {}", self.addr);
        Ok(MessageReader::new(stream))
    }
}

async fn round_trip(stream: &mut MessageReader<TcpStream>, request: &[u8]) -> Result<Exchange> {
    stream.get_mut().write_all(request).await?;
    stream.get_mut().flush().await?;

    let started = Instant::now();
    let response = stream.read_response().await?;

    Ok(Exchange {
        response,
        elapsed: started.elapsed(),
    })
}

// ============================================================================
// SHARED WORKER
// ============================================================================

struct Job {
    request: Vec<u8>,
    reply: oneshot::Sender<Result<Exchange>>,
}

/// Handle to the worker that owns the shared origin connection.
#[derive(Clone)]
pub struct SharedUpstream {
    jobs: mpsc::Sender<Job>,
}

impl SharedUpstream {
    /// Spawns the worker. It runs until every handle is dropped.
    ///
    /// Each exchange runs in its own task. If that task dies, only its job
    /// fails and the worker carries on with a fresh connection.
    pub fn spawn(mut origin: OriginConnection) -> Self {
        let (jobs, mut queue) = mpsc::channel::<Job>(QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(Job { request, reply }) = queue.recv().await {
                if !origin.is_connected() {
                    debug!("Opening shared origin connection");
                }
                let replacement = origin.detached();

                let attempt = tokio::spawn(async move {
                    let result = origin.exchange(&request).await;
                    (origin, result)
                });

                let result = match attempt.await {
                    Ok((conn, result)) => {
                        origin = conn;
                        result
                    }
                    Err(e) => {
                        warn!("Shared origin exchange aborted: {}", e);
                        origin = replacement;
                        Err(ProxyError::UpstreamClosed)
                    }
                };
                if let Err(ref e) = result {
                    warn!("Shared origin exchange failed: {}", e);
                }
                // The session may have gone away while queued.
                let _ = reply.send(result);
            }
            debug!("Shared upstream worker stopped");
        });

        Self { jobs }
    }

    pub async fn exchange(&self, request: Vec<u8>) -> Result<Exchange> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .await
            .map_err(|_| ProxyError::UpstreamClosed)?;
        response.await.map_err(|_| ProxyError::UpstreamClosed)?
    }
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

/// What a client session uses to talk to the origin.
pub enum Upstream {
    Shared(SharedUpstream),
    Dedicated(OriginConnection),
}

impl Upstream {
    pub async fn exchange(&mut self, request: Vec<u8>) -> Result<Exchange> {
        match self {
            Upstream::Shared(shared) => shared.exchange(request).await,
            Upstream::Dedicated(origin) => origin.exchange(&request).await,
        }
    }
}

/// Hands out an [`Upstream`] per session according to the configured mode.
#[derive(Clone)]
pub struct UpstreamPool {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
    exchange_timeout: Option<Duration>,
    shared: Option<SharedUpstream>,
}

impl UpstreamPool {
    /// Must be called inside a tokio runtime when `mode` is `Shared`.
    pub fn new(
        mode: UpstreamMode,
        addr: SocketAddr,
        connect_timeout: Option<Duration>,
        exchange_timeout: Option<Duration>,
    ) -> Self {
        let shared = match mode {
            UpstreamMode::Shared => Some(SharedUpstream::spawn(OriginConnection::new(
                addr,
                connect_timeout,
                exchange_timeout,
            ))),
            UpstreamMode::PerSession => None,
        };

        Self {
            addr,
            connect_timeout,
            exchange_timeout,
            shared,
        }
    }

    pub fn origin_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn for_session(&self) -> Upstream {
        match &self.shared {
            Some(shared) => Upstream::Shared(shared.clone()),
            None => Upstream::Dedicated(OriginConnection::new(
                self.addr,
                self.connect_timeout,
                self.exchange_timeout,
            )),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
