//! Request classification and the per-class origin exchanges.
//!
//! - Manifest (`.mpd`): fetch the manifest, record its bitrate ladder and bind
//!   it to the session, then fetch the companion `-no-list` manifest and relay
//!   that to the client instead.
//! - Segment (`.m4s`): rewrite the bitrate in the segment name to the selected
//!   rate, fetch it, fold the measured throughput into the session estimate and
//!   log the transfer.
//! - Anything else: point `Host` at the origin and relay.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::http::{HttpMessage, ReceivedMessage};
use crate::ladder::{BitrateLadder, LadderStore};
use crate::manifest::parse_bitrates;
use crate::session::{throughput_kbps, ConnectionId, SessionRegistry, NO_SELECTION};
use crate::stats::Stats;
use crate::transfer_log::{TransferLog, TransferRecord};
use crate::upstream::{Upstream, UpstreamPool};

// ============================================================================
// CONSTANTS
// ============================================================================

const MANIFEST_SUFFIX: &str = ".mpd";
const SEGMENT_SUFFIX: &str = ".m4s";
const COMPANION_MARKER: &str = "-no-list";
const SEGMENT_MARKER: &str = "-seg-";

// ============================================================================
// CLASSIFICATION & REWRITES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Manifest,
    Segment,
    Other,
}

pub fn classify(target: &str) -> RequestClass {
    let path = split_query(target).0;
    if path.ends_with(MANIFEST_SUFFIX) {
        RequestClass::Manifest
    } else if path.ends_with(SEGMENT_SUFFIX) {
        RequestClass::Segment
    } else {
        RequestClass::Other
    }
}

/// Splits `/a/b.mpd?x=1` into `("/a/b.mpd", "?x=1")`.
fn split_query(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => target.split_at(idx),
        None => (target, ""),
    }
}

/// `/v/big.mpd` -> `/v/big-no-list.mpd`. Without an extension the target is
/// returned unchanged.
pub fn companion_manifest_path(target: &str) -> String {
    let (path, query) = split_query(target);
    match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => {
            format!("{}{}{}{}", &path[..dot], COMPANION_MARKER, &path[dot..], query)
        }
        _ => target.to_string(),
    }
}

/// Replaces the number between the last `-` before `-seg-` and `-seg-`.
/// Targets without that shape are returned unchanged.
pub fn rewrite_segment_bitrate(target: &str, bitrate: u64) -> String {
    let Some(marker) = target.find(SEGMENT_MARKER) else {
        return target.to_string();
    };
    let Some(dash) = target[..marker].rfind('-') else {
        return target.to_string();
    };
    format!("{}{}{}", &target[..=dash], bitrate, &target[marker..])
}

/// File name part of a target, used in the transfer log.
pub fn chunk_name(target: &str) -> &str {
    let path = split_query(target).0;
    match path.rfind('/') {
        Some(slash) => &path[slash + 1..],
        None => path,
    }
}

fn host_header(origin: SocketAddr) -> String {
    if origin.port() == 80 {
        origin.ip().to_string()
    } else {
        origin.to_string()
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// State shared by every client session.
pub struct ProxyContext {
    pub alpha: f64,
    pub origin: SocketAddr,
    pub ladders: Arc<LadderStore>,
    pub sessions: Arc<SessionRegistry>,
    pub transfer_log: Arc<TransferLog>,
    pub stats: Arc<Stats>,
    pub upstream: UpstreamPool,
    pub idle_timeout: Option<Duration>,
}

impl ProxyContext {
    pub fn new(
        alpha: f64,
        upstream: UpstreamPool,
        transfer_log: TransferLog,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            alpha,
            origin: upstream.origin_addr(),
            ladders: Arc::new(LadderStore::new()),
            sessions: Arc::new(SessionRegistry::new()),
            transfer_log: Arc::new(transfer_log),
            stats: Arc::new(Stats::new()),
            upstream,
            idle_timeout,
        }
    }
}

// ============================================================================
// REQUEST HANDLING
// ============================================================================

/// Serves one client request to completion.
pub async fn handle_request<W>(
    ctx: &ProxyContext,
    id: ConnectionId,
    upstream: &mut Upstream,
    request: ReceivedMessage,
    client: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !request.message.is_request() {
        return Err(ProxyError::MalformedStartLine(request.message.start.to_string()));
    }

    let target = request.message.target().unwrap_or_default().to_string();

    let class = classify(&target);
    debug!("Client {} {:?} {}", id, class, target);
    ctx.stats.count_request(class);

    match class {
        RequestClass::Manifest => handle_manifest(ctx, id, upstream, &request, &target, client).await,
        RequestClass::Segment => handle_segment(ctx, id, upstream, &request, &target, client).await,
        RequestClass::Other => handle_other(ctx, upstream, request.message, client).await,
    }
}

/// The manifest request goes to the origin byte for byte; the companion
/// request differs only in its target.
async fn handle_manifest<W>(
    ctx: &ProxyContext,
    id: ConnectionId,
    upstream: &mut Upstream,
    request: &ReceivedMessage,
    target: &str,
    client: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let manifest = fetch(ctx, upstream, request.raw_head.clone()).await?;

    let path = split_query(target).0;
    let bitrates = parse_bitrates(&String::from_utf8_lossy(manifest.body()));
    debug!("Manifest {} advertises {:?}", path, bitrates);
    ctx.ladders.put(path, BitrateLadder::new(bitrates));
    ctx.sessions.update(id, |session| session.bind_manifest(path));

    let companion = companion_manifest_path(target);
    let response = fetch(ctx, upstream, request.retargeted(&companion)).await?;

    relay(ctx, client, &response).await
}

async fn handle_segment<W>(
    ctx: &ProxyContext,
    id: ConnectionId,
    upstream: &mut Upstream,
    request: &ReceivedMessage,
    target: &str,
    client: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(session) = ctx.sessions.get(id) else {
        return Err(ProxyError::UnknownSession(id));
    };

    let bitrate = session.select_bitrate(&ctx.ladders);
    if bitrate == NO_SELECTION {
        warn!(
            "Client {} requested {} without a known ladder, using bitrate {}",
            id, target, NO_SELECTION
        );
    }

    let rewritten = rewrite_segment_bitrate(target, bitrate);
    let exchange = upstream.exchange(request.retargeted(&rewritten)).await?;
    ctx.stats
        .bytes_in
        .fetch_add(exchange.response.wire_len() as u64, Ordering::Relaxed);

    let throughput = throughput_kbps(exchange.response.body().len(), exchange.elapsed);
    let avg_throughput = ctx
        .sessions
        .update(id, |session| {
            session.update_throughput(throughput, ctx.alpha);
            session.throughput()
        })
        .unwrap_or(throughput);

    let record = TransferRecord {
        client_ip: session.peer.ip(),
        chunk_name: chunk_name(&rewritten).to_string(),
        origin_ip: ctx.origin.ip(),
        duration: exchange.elapsed,
        throughput,
        avg_throughput,
        bitrate,
    };
    if let Err(e) = ctx.transfer_log.record(&record) {
        warn!("Failed to write transfer log {:?}: {}", ctx.transfer_log.path(), e);
    }

    relay(ctx, client, &exchange.response).await
}

async fn handle_other<W>(
    ctx: &ProxyContext,
    upstream: &mut Upstream,
    mut request: HttpMessage,
    client: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    request.set_header("Host", host_header(ctx.origin));
    let response = fetch(ctx, upstream, request.to_bytes()).await?;
    relay(ctx, client, &response).await
}

async fn fetch(
    ctx: &ProxyContext,
    upstream: &mut Upstream,
    request: Vec<u8>,
) -> Result<ReceivedMessage> {
    let exchange = upstream.exchange(request).await?;
    ctx.stats
        .bytes_in
        .fetch_add(exchange.response.wire_len() as u64, Ordering::Relaxed);
    Ok(exchange.response)
}

async fn relay<W>(ctx: &ProxyContext, client: &mut W, response: &ReceivedMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write_all(&response.raw_head).await?;
    client.write_all(response.body()).await?;
    client.flush().await?;
    ctx.stats
        .bytes_out
        .fetch_add(response.wire_len() as u64, Ordering::Relaxed);
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
