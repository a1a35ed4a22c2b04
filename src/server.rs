//! Client connection handling.
//!
//! Every accepted client gets its own task. A task reads one request at a
//! time and serves it to completion before reading the next, so requests on
//! one connection are answered in order. Tasks share nothing but the
//! [`ProxyContext`]; whether they contend for the origin depends on the
//! upstream mode.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::Result;
use crate::http::MessageReader;
use crate::proxy::{handle_request, ProxyContext};
use crate::session::ConnectionId;

/// Accept loop. Only returns on an accept error.
pub async fn serve(listener: TcpListener, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    loop {
        let (client, client_addr) = listener.accept().await?;

        let id = ctx.sessions.open(client_addr);
        ctx.stats.total.fetch_add(1, Ordering::Relaxed);
        ctx.stats.active.fetch_add(1, Ordering::Relaxed);
        info!("New client {} from {}", id, client_addr);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(client, client_addr, id, &ctx).await {
                debug!("Connection error from {}: {}", client_addr, e);
                ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
            }

            ctx.sessions.remove(id);
            ctx.stats.active.fetch_sub(1, Ordering::Relaxed);
            info!("Client {} disconnected", id);
        });
    }
}

async fn handle_connection(
    client: TcpStream,
    client_addr: SocketAddr,
    id: ConnectionId,
    ctx: &ProxyContext,
) -> Result<()> {
    let _ = client.set_nodelay(true);

    let (read_half, mut write_half) = client.into_split();
    let mut reader = MessageReader::new(read_half);
    let mut upstream = ctx.upstream.for_session();

    loop {
        let next = match ctx.idle_timeout {
            Some(limit) => match timeout(limit, reader.read_request()).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Read timeout from {}", client_addr);
                    return Ok(());
                }
            },
            None => reader.read_request().await?,
        };

        let Some(request) = next else {
            return Ok(());
        };

        handle_request(ctx, id, &mut upstream, request, &mut write_half).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::{mock_origin, test_context, COMPANION_BODY, SEGMENT_BYTES};
    use crate::upstream::UpstreamMode;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_tcp_listener_binding() {
        let listener = TcpListener::bind("127.0.0.1:0").await;
        assert!(listener.is_ok());
    }

    async fn start_proxy(mode: UpstreamMode) -> (SocketAddr, Arc<ProxyContext>, tempfile::TempDir) {
        let (origin, _seen) = mock_origin().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(test_context(origin, mode, &dir));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ctx.clone()));

        (addr, ctx, dir)
    }

    async fn wait_for_sessions(ctx: &ProxyContext, count: usize) {
        for _ in 0..100 {
            if ctx.sessions.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} sessions, have {}", count, ctx.sessions.len());
    }

    #[tokio::test]
    async fn test_session_follows_connection() {
        let (addr, ctx, _dir) = start_proxy(UpstreamMode::Shared).await;

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_sessions(&ctx, 1).await;

        drop(client);
        wait_for_sessions(&ctx, 0).await;
        assert_eq!(ctx.stats.total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_keeps_serving_one_connection() {
        let (addr, ctx, _dir) = start_proxy(UpstreamMode::PerSession).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let mut reader = MessageReader::new(client);

        reader
            .get_mut()
            .write_all(b"GET /v/big.mpd HTTP/1.1\r\nHost: proxy\r\n\r\n")
            .await
            .unwrap();
        let manifest = reader.read_response().await.unwrap();
        assert_eq!(manifest.body(), COMPANION_BODY.as_bytes());

        reader
            .get_mut()
            .write_all(b"GET /v/vid-500-seg-1.m4s HTTP/1.1\r\nHost: proxy\r\n\r\n")
            .await
            .unwrap();
        let segment = reader.read_response().await.unwrap();
        assert_eq!(segment.body().len(), SEGMENT_BYTES);

        let ids = ctx.sessions.ids();
        assert_eq!(ids.len(), 1);
        let session = ctx.sessions.get(ids[0]).unwrap();
        assert_eq!(session.manifest_path(), Some("/v/big.mpd"));
        assert!(session.throughput() > 0.0);
    }

    #[tokio::test]
    async fn test_garbage_request_closes_only_that_session() {
        let (addr, ctx, _dir) = start_proxy(UpstreamMode::Shared).await;

        let healthy = TcpStream::connect(addr).await.unwrap();
        let mut bad = TcpStream::connect(addr).await.unwrap();
        wait_for_sessions(&ctx, 2).await;

        bad.write_all(b"\r\n\r\n").await.unwrap();
        wait_for_sessions(&ctx, 1).await;
        assert_eq!(ctx.stats.failed.load(Ordering::Relaxed), 1);

        let mut reader = MessageReader::new(healthy);
        reader
            .get_mut()
            .write_all(b"GET /index.html HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let page = reader.read_response().await.unwrap();
        assert_eq!(page.body(), b"hello");
    }
}
