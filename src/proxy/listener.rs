//! The SNI-aware transparent TCP proxy.
//!
//! Per connection: read the ClientHello, look the server name up in the
//! current routing table, dial the chosen target, replay the intercepted
//! bytes, then splice both directions until one side finishes. The TLS
//! payload is never decoded or modified beyond the initial ClientHello
//! record, so the handshake continues end-to-end.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ProxyConfig;
use crate::metrics::Sink;
use crate::route::{ProxyProto, TableStore, TargetCounters};

use super::proxy_protocol::{encode_v1, encode_v2};
use super::sni::{read_client_hello, SniError};

/// Intermediate buffer size for each copy direction.
const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound bytes never yielded a routable ClientHello.
    #[error("TLS handshake read failed: {0}")]
    Handshake(#[from] SniError),

    /// The selected target has no dialable host:port.
    #[error("target has no dialable address")]
    BadTarget,

    /// The upstream could not be reached.
    #[error("upstream dial failed: {0}")]
    Dial(#[source] io::Error),

    /// A mid-stream transport error in either direction.
    #[error("transfer failed: {0}")]
    Copy(#[source] io::Error),
}

/// Per-listener counters. Increments are mirrored into the sink.
#[derive(Debug, Default)]
pub struct ListenerStats {
    conn: AtomicU64,
    conn_fail: AtomicU64,
    noroute: AtomicU64,
}

impl ListenerStats {
    fn inc_conn(&self, sink: &dyn Sink) {
        self.conn.fetch_add(1, Ordering::Relaxed);
        sink.counter_add("conn", 1);
    }

    fn inc_conn_fail(&self, sink: &dyn Sink) {
        self.conn_fail.fetch_add(1, Ordering::Relaxed);
        sink.counter_add("conn_fail", 1);
    }

    fn inc_noroute(&self, sink: &dyn Sink) {
        self.noroute.fetch_add(1, Ordering::Relaxed);
        sink.counter_add("noroute", 1);
    }

    pub fn conn(&self) -> u64 {
        self.conn.load(Ordering::Relaxed)
    }

    pub fn conn_fail(&self) -> u64 {
        self.conn_fail.load(Ordering::Relaxed)
    }

    pub fn noroute(&self) -> u64 {
        self.noroute.load(Ordering::Relaxed)
    }
}

/// The SNI proxy listener.
pub struct SniListener {
    cfg: ProxyConfig,
    listener: TcpListener,
    store: Arc<TableStore>,
    sink: Arc<dyn Sink>,
    stats: Arc<ListenerStats>,
}

impl SniListener {
    pub async fn bind(
        cfg: ProxyConfig,
        store: Arc<TableStore>,
        sink: Arc<dyn Sink>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(cfg.listen).await?;
        info!(listen = %listener.local_addr()?, "SNI listener bound");
        Ok(Self {
            cfg,
            listener,
            store,
            sink,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` fires, then wait up to the grace
    /// period for in-flight connections to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let active = Arc::new(AtomicU64::new(0));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            error!(%err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    active.fetch_add(1, Ordering::Relaxed);
                    let listener = Arc::clone(&self);
                    let active = Arc::clone(&active);
                    tokio::spawn(
                        async move {
                            if let Err(err) = listener.handle(inbound, peer).await {
                                debug!(%peer, %err, "connection closed with error");
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::debug_span!("conn", peer = %peer)),
                    );
                }
            }
        }

        let deadline = Instant::now() + self.cfg.grace_period;
        while active.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let abandoned = active.load(Ordering::Relaxed);
        if abandoned > 0 {
            warn!(abandoned, "grace period elapsed with connections in flight");
        }
        Ok(())
    }

    async fn handle(&self, mut inbound: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        self.stats.inc_conn(&*self.sink);
        let local = inbound.local_addr().map_err(ProxyError::Dial)?;

        let hello = match timeout(self.cfg.handshake_timeout, read_client_hello(&mut inbound)).await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(err)) => {
                debug!(%err, "TLS handshake failed");
                self.stats.inc_conn_fail(&*self.sink);
                return Err(err.into());
            }
            Err(_) => {
                debug!("TLS handshake deadline exceeded");
                self.stats.inc_conn_fail(&*self.sink);
                return Err(SniError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake deadline exceeded",
                ))
                .into());
            }
        };
        let (host, hello_buf) = hello;

        // Pin one snapshot; the target keeps its counters alive even if the
        // table is swapped while this connection is in flight.
        let target = match self.store.snapshot().lookup_host(&host) {
            Some(target) => target,
            None => {
                self.stats.inc_noroute(&*self.sink);
                debug!(host, "no route");
                return Ok(());
            }
        };

        if target.access_denied_tcp(peer.ip()) {
            debug!(host, "access denied");
            return Ok(());
        }

        let Some(addr) = target.dial_addr() else {
            self.stats.inc_conn_fail(&*self.sink);
            warn!(url = %target.url, "target url has no host or port");
            return Err(ProxyError::BadTarget);
        };

        let mut upstream = match timeout(self.cfg.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.stats.inc_conn_fail(&*self.sink);
                target.counters.inc_conn_fail();
                warn!(upstream = %addr, %err, "cannot connect to upstream");
                return Err(ProxyError::Dial(err));
            }
            Err(_) => {
                self.stats.inc_conn_fail(&*self.sink);
                target.counters.inc_conn_fail();
                warn!(upstream = %addr, "upstream dial timed out");
                return Err(ProxyError::Dial(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "dial timed out",
                )));
            }
        };
        target.counters.inc_conn();

        match target.opts.proxy_proto {
            ProxyProto::Off => {}
            ProxyProto::V1 => {
                let header = encode_v1(peer, local);
                upstream
                    .write_all(header.as_bytes())
                    .await
                    .map_err(ProxyError::Copy)?;
            }
            ProxyProto::V2 => {
                let header = encode_v2(peer, local);
                upstream
                    .write_all(&header)
                    .await
                    .map_err(ProxyError::Copy)?;
            }
        }

        // Replay the intercepted ClientHello verbatim so the handshake
        // continues against the real backend.
        upstream
            .write_all(&hello_buf)
            .await
            .map_err(ProxyError::Copy)?;
        target.counters.add_rx(hello_buf.len() as u64);
        self.sink.counter_add("rx_bytes", hello_buf.len() as u64);

        self.splice(inbound, upstream, Arc::clone(&target.counters))
            .await
    }

    /// Copy both directions until the first one finishes. End-of-stream is
    /// success; anything else is a transfer failure.
    async fn splice(
        &self,
        inbound: TcpStream,
        upstream: TcpStream,
        counters: Arc<TargetCounters>,
    ) -> Result<(), ProxyError> {
        let (in_read, in_write) = inbound.into_split();
        let (up_read, up_write) = upstream.into_split();

        let mut to_upstream = tokio::spawn(copy_counted(
            in_read,
            up_write,
            Arc::clone(&counters),
            Arc::clone(&self.sink),
            CopyDirection::InboundToUpstream,
        ));
        let mut to_inbound = tokio::spawn(copy_counted(
            up_read,
            in_write,
            counters,
            Arc::clone(&self.sink),
            CopyDirection::UpstreamToInbound,
        ));

        let (direction, result) = tokio::select! {
            r = &mut to_upstream => ("inbound->upstream", r),
            r = &mut to_inbound => ("upstream->inbound", r),
        };
        // Dropping the other direction closes both halves it owns.
        to_upstream.abort();
        to_inbound.abort();

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                warn!(direction, %err, "transfer failed");
                Err(ProxyError::Copy(err))
            }
            Err(join_err) => {
                warn!(direction, %join_err, "transfer task failed");
                Err(ProxyError::Copy(io::Error::other(join_err)))
            }
        }
    }
}

#[derive(Clone, Copy)]
enum CopyDirection {
    InboundToUpstream,
    UpstreamToInbound,
}

/// One copy direction with byte accounting. Returns the bytes copied once
/// the reader reaches end-of-stream.
async fn copy_counted<R, W>(
    mut reader: R,
    mut writer: W,
    counters: Arc<TargetCounters>,
    sink: Arc<dyn Sink>,
    direction: CopyDirection,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        let n = n as u64;
        total += n;
        match direction {
            CopyDirection::InboundToUpstream => {
                counters.add_rx(n);
                sink.counter_add("rx_bytes", n);
            }
            CopyDirection::UpstreamToInbound => {
                counters.add_tx(n);
                sink.counter_add("tx_bytes", n);
            }
        }
    }
}
