//! Client-facing server.
//!
//! Binds the UDP listening socket, calibrates the proxies, then starts one
//! session per received query. Everything runs on a single-threaded
//! `LocalSet`; sessions share the socket, the subnet table and the
//! calibrated proxies read-only.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::calibration::Calibrator;
use crate::config::Config;
use crate::dns::HEADER_LEN;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::session::Session;
use crate::stats::Stats;
use crate::subnet::SubnetTable;
use crate::transport::MAX_DNS_PACKET_SIZE;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Server {
    socket: Rc<UdpSocket>,
    proxies: Rc<[Rc<Proxy>]>,
    subnets: Rc<SubnetTable>,
    query_timeout: Duration,
    stats: Rc<Stats>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Only enabled proxies take part in sessions.
    pub async fn bind(
        addr: SocketAddr,
        proxies: Vec<Proxy>,
        subnets: SubnetTable,
        query_timeout: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::with_socket(socket, proxies, subnets, query_timeout))
    }

    fn with_socket(
        socket: UdpSocket,
        proxies: Vec<Proxy>,
        subnets: SubnetTable,
        query_timeout: Duration,
    ) -> Self {
        let proxies: Rc<[Rc<Proxy>]> = proxies
            .into_iter()
            .filter(Proxy::is_enabled)
            .map(Rc::new)
            .collect();

        Self {
            socket: Rc::new(socket),
            proxies,
            subnets: Rc::new(subnets),
            query_timeout,
            stats: Rc::new(Stats::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive queries forever, one session per datagram.
    pub async fn serve(self) {
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            };

            if len < HEADER_LEN {
                debug!(client = %src, len, "ignoring short datagram");
                continue;
            }
            if len == buf.len() {
                warn!(client = %src, "dropping query of {} bytes or more, possibly truncated", len);
                continue;
            }

            let session = Session::new(src, &buf[..len], self.subnets.clone());
            let socket = self.socket.clone();
            let proxies = self.proxies.clone();
            let stats = self.stats.clone();
            let timeout = self.query_timeout;

            tokio::task::spawn_local(async move {
                let start = Instant::now();
                let outcome = session.run(&socket, &proxies, timeout).await;
                stats.record(outcome, start.elapsed());
            });
        }
    }

    /// Log and reset statistics every minute.
    pub fn spawn_stats_reporter(&self) {
        let stats = self.stats.clone();
        let started = Instant::now();

        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await; // Skip first immediate tick
            loop {
                interval.tick().await;
                let snapshot = stats.snapshot_and_reset();
                info!(
                    "[stats] uptime={}s requests={} forwarded={} fallback={} dropped={} avg_response={:.2}ms",
                    started.elapsed().as_secs(),
                    snapshot.requests,
                    snapshot.forwarded,
                    snapshot.fallback,
                    snapshot.dropped,
                    snapshot.avg_response_ms
                );
            }
        });
    }
}

/// Run the forwarder described by `config`.
///
/// The socket is bound first so a bad address fails fast, then the proxies
/// are calibrated, and only then are client queries read.
pub async fn run(config: Config, subnets: SubnetTable) -> Result<()> {
    let socket = UdpSocket::bind(config.bind_addr()).await?;
    run_with_socket(socket, &config, subnets).await
}

/// Calibrate, then serve queries arriving on an already bound `socket`.
///
/// Queries that arrive during calibration wait in the socket's receive
/// buffer.
pub async fn run_with_socket(
    socket: UdpSocket,
    config: &Config,
    subnets: SubnetTable,
) -> Result<()> {
    info!(
        "DNS forwarder bound to {} ({} internal subnets)",
        socket.local_addr()?,
        subnets.len()
    );

    let calibrator = Calibrator {
        blocked: &config.domains.blocked,
        non_blocked: &config.domains.non_blocked,
        window: config.init_timeout(),
    };
    let proxies = calibrator.run(&config.proxies()).await;

    let server = Server::with_socket(socket, proxies, subnets, config.query_timeout());
    info!(
        "calibration complete, serving with {} proxies",
        server.proxies.len()
    );

    server.spawn_stats_reporter();
    server.serve().await;

    Ok(())
}
