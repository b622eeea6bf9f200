//! The per-channel relay loop.
//!
//! One task receives a datagram and handles it completely before the next
//! receive: full-rate send, decimation, decimated send, log append. Receive
//! order is therefore fan-out order and log order.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use speeddata_core::WorkerSettings;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::decimator::Decimator;
use crate::error::RelayError;
use crate::log_writer::RotatingLog;

/// Largest UDP payload.
pub const MAX_DATAGRAM: usize = 65_535;

/// Counters reported when the relay stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub decimated: u64,
    pub files: u64,
}

struct Fanout {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl Fanout {
    async fn open(dest: SocketAddrV4, ttl: u32) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(RelayError::Socket)?;
        socket
            .set_multicast_ttl_v4(ttl)
            .map_err(RelayError::Socket)?;
        info!(%dest, ttl, "Multicast sender ready");
        Ok(Self {
            socket,
            dest: SocketAddr::V4(dest),
        })
    }

    async fn send(&self, payload: &[u8], stream: &str) {
        if let Err(e) = self.socket.send_to(payload, self.dest).await {
            warn!(dest = %self.dest, stream, error = %e, "Send failed");
        }
    }
}

/// A bound relay for one channel.
pub struct Relay {
    channel: String,
    rx: UdpSocket,
    full: Fanout,
    decimated: Option<(Fanout, Decimator)>,
    log: RotatingLog,
    stats: RelayStats,
}

impl Relay {
    /// Bind the ingest socket and open the fan-out senders.
    ///
    /// The log file is not created until the first datagram arrives.
    pub async fn bind(settings: WorkerSettings) -> Result<Self, RelayError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(settings.bind_addr, settings.rx_port));
        let rx = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        info!(channel = %settings.name, %addr, "Listening");

        let ttl = settings.multicast.ttl;
        let full_rate = settings.multicast.full_rate;
        let full = Fanout::open(SocketAddrV4::new(full_rate.address, full_rate.port), ttl).await?;

        let decimated = if settings.decimation.enabled {
            let target = settings.multicast.decimated;
            let fanout = Fanout::open(SocketAddrV4::new(target.address, target.port), ttl).await?;
            let decimator =
                Decimator::new(settings.decimation.factor, settings.decimation.algorithm);
            info!(factor = decimator.factor(), algorithm = %decimator.algorithm(), "Decimation enabled");
            Some((fanout, decimator))
        } else {
            None
        };

        Ok(Self {
            channel: settings.name,
            rx,
            full,
            decimated,
            log: RotatingLog::new(settings.output_dir, settings.rotation),
            stats: RelayStats::default(),
        })
    }

    /// Address the ingest socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.rx.local_addr()
    }

    /// Relay datagrams until `shutdown` completes, then close the log.
    ///
    /// Receive and send errors are logged and skipped. A log write error
    /// ends the loop and is returned.
    pub async fn run<F>(mut self, shutdown: F) -> Result<RelayStats, RelayError>
    where
        F: Future<Output = ()>,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);

        info!(channel = %self.channel, "Relay started");
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!(channel = %self.channel, "Shutdown requested");
                    break;
                }
                received = self.rx.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        debug!(len, %src, "Datagram received");
                        self.handle(&buf[..len]).await?;
                    }
                    Err(e) => warn!(channel = %self.channel, error = %e, "Receive failed"),
                },
            }
        }

        self.log.close()?;
        self.stats.files = self.log.files_opened();
        info!(
            channel = %self.channel,
            packets = self.stats.received,
            decimated = self.stats.decimated,
            files = self.stats.files,
            "Relay stopped"
        );
        Ok(self.stats)
    }

    async fn handle(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        self.stats.received += 1;

        self.full.send(payload, "full").await;

        if let Some((fanout, decimator)) = self.decimated.as_mut() {
            if let Some(representative) = decimator.push(payload) {
                fanout.send(&representative, "decimated").await;
                self.stats.decimated += 1;
            }
        }

        self.log.append(payload)
    }
}
