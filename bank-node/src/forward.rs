//! Relaying commands to other bank nodes.
//!
//! Each relay is a fresh TCP connection carrying exactly one request line and
//! one response line. Peers are assumed to listen on the same port as this
//! node unless the address already carries an explicit `ip:port`.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::BufReader,
    net::{lookup_host, TcpStream},
    sync::Semaphore,
    time::timeout,
};
use tracing::{debug, warn};

use crate::wire::{read_line, write_line};

/// Relays allowed in flight at once. A relay chain that loops back through
/// aliases of this node runs into this limit and unwinds.
pub const DEFAULT_RELAY_LIMIT: usize = 64;

/// Why a relay produced no answer from the peer.
///
/// The `Display` text is the reason rendered after `ER ` on the wire; the
/// `proxy:` prefix keeps transport failures apart from the peer's own errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("proxy: timeout")]
    Timeout,
    #[error("proxy: connection failed")]
    ConnectionFailed,
    #[error("proxy: no response")]
    NoResponse,
    #[error("proxy: address refers to this bank")]
    SelfTarget,
    #[error("proxy: too many relays in flight")]
    Busy,
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    port: u16,
    timeout: Duration,
    /// The socket this node listens on, once known.
    local: Option<SocketAddr>,
    /// This node's own address when it is a literal IP.
    advertised: Option<IpAddr>,
    relays: Arc<Semaphore>,
}

impl Forwarder {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            local: None,
            advertised: None,
            relays: Arc::new(Semaphore::new(DEFAULT_RELAY_LIMIT)),
        }
    }

    /// Tells the forwarder where this node listens and what it calls itself,
    /// so relays that would land back on this node are refused.
    pub fn serving(mut self, local: SocketAddr, address: &str) -> Self {
        self.local = Some(local);
        self.advertised = address.parse().ok();
        self
    }

    pub fn with_relay_limit(mut self, limit: usize) -> Self {
        self.relays = Arc::new(Semaphore::new(limit));
        self
    }

    /// Sends `line` to the bank at `address` and returns its single reply.
    ///
    /// The whole exchange, name resolution and connect included, is bounded by
    /// the configured timeout.
    pub async fn forward(&self, address: &str, line: &str) -> Result<String, ForwardError> {
        let Ok(_permit) = self.relays.try_acquire() else {
            warn!(%address, "relay refused, too many in flight");
            return Err(ForwardError::Busy);
        };

        match timeout(self.timeout, self.round_trip(address, line)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%address, "relay timed out");
                Err(ForwardError::Timeout)
            }
        }
    }

    async fn round_trip(&self, address: &str, line: &str) -> Result<String, ForwardError> {
        let targets = self.resolve(address).await.map_err(|err| {
            debug!(%address, error = ?err, "failed to resolve peer bank");
            ForwardError::ConnectionFailed
        })?;
        if targets.iter().any(|target| self.is_self(*target)) {
            warn!(%address, "refusing to relay a command to this bank");
            return Err(ForwardError::SelfTarget);
        }

        let stream = TcpStream::connect(&targets[..]).await.map_err(|err| {
            debug!(%address, error = ?err, "failed to connect to peer bank");
            ForwardError::ConnectionFailed
        })?;

        let (reader, mut writer) = stream.into_split();
        write_line(&mut writer, line).await.map_err(|err| {
            debug!(%address, error = ?err, "failed to send relayed command");
            ForwardError::ConnectionFailed
        })?;

        let mut reader = BufReader::new(reader);
        match read_line(&mut reader).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ForwardError::NoResponse),
            Err(err) => {
                debug!(%address, error = ?err, "failed to read relayed reply");
                Err(ForwardError::ConnectionFailed)
            }
        }
    }

    /// Peers listen on this node's port unless `address` is an explicit `ip:port`.
    async fn resolve(&self, address: &str) -> std::io::Result<Vec<SocketAddr>> {
        let targets: Vec<SocketAddr> = match address.parse::<SocketAddr>() {
            Ok(socket) => vec![socket],
            Err(_) => lookup_host((address, self.port)).await?.collect(),
        };
        if targets.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to nothing",
            ));
        }
        Ok(targets)
    }

    fn is_self(&self, target: SocketAddr) -> bool {
        let Some(local) = self.local else {
            return false;
        };
        if target.port() != local.port() {
            return false;
        }

        let ip = target.ip();
        let reaches_loopback = local.ip().is_loopback() || local.ip().is_unspecified();
        ip == local.ip()
            || Some(ip) == self.advertised
            || ((ip.is_loopback() || ip.is_unspecified()) && reaches_loopback)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    #[tokio::test]
    async fn relays_one_line_each_way() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let request = read_line(&mut reader).await.expect("read").expect("line");
            write_line(&mut writer, &format!("echo {request}"))
                .await
                .expect("write");
        });

        let forwarder = Forwarder::new(addr.port(), Duration::from_secs(2));
        let reply = forwarder.forward("127.0.0.1", "AB 10000/127.0.0.1").await;

        assert_eq!(reply.as_deref(), Ok("echo AB 10000/127.0.0.1"));
        peer.await.expect("peer task");
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let forwarder = Forwarder::new(1, Duration::from_secs(2));
        let reply = forwarder.forward(&addr.to_string(), "BC").await;

        assert_eq!(reply, Err(ForwardError::ConnectionFailed));
    }

    #[tokio::test]
    async fn peer_closing_without_reply_is_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let _ = read_line(&mut reader).await;
            writer.shutdown().await.expect("shutdown");
        });

        let forwarder = Forwarder::new(addr.port(), Duration::from_secs(2));
        let reply = forwarder.forward("127.0.0.1", "BN").await;

        assert_eq!(reply, Err(ForwardError::NoResponse));
        peer.await.expect("peer task");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let forwarder = Forwarder::new(addr.port(), Duration::from_millis(100));
        let reply = forwarder.forward("127.0.0.1", "BA").await;

        assert_eq!(reply, Err(ForwardError::Timeout));
        peer.abort();
    }

    #[tokio::test]
    async fn own_listener_is_never_dialled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let local = listener.local_addr().expect("addr");
        let forwarder =
            Forwarder::new(local.port(), Duration::from_secs(2)).serving(local, "127.0.0.1");

        for address in [
            local.to_string(),
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            format!("0.0.0.0:{}", local.port()),
        ] {
            assert_eq!(
                forwarder.forward(&address, "AB 10000/x").await,
                Err(ForwardError::SelfTarget),
                "{address}"
            );
        }

        let accepted = timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no connection should have been made");
    }

    #[test]
    fn advertised_address_counts_as_self_on_any_interface() {
        let local: SocketAddr = "0.0.0.0:7000".parse().expect("addr");
        let forwarder = Forwarder::new(7000, Duration::from_secs(1)).serving(local, "10.0.0.5");

        assert!(forwarder.is_self("10.0.0.5:7000".parse().expect("addr")));
        assert!(forwarder.is_self("127.0.0.1:7000".parse().expect("addr")));
        assert!(!forwarder.is_self("10.0.0.6:7000".parse().expect("addr")));
        assert!(!forwarder.is_self("10.0.0.5:7001".parse().expect("addr")));
    }

    #[tokio::test]
    async fn relays_beyond_the_limit_are_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let forwarder = Forwarder::new(addr.port(), Duration::from_secs(1)).with_relay_limit(1);
        let first = tokio::spawn({
            let forwarder = forwarder.clone();
            async move { forwarder.forward(&addr.to_string(), "BN").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            forwarder.forward(&addr.to_string(), "BN").await,
            Err(ForwardError::Busy)
        );
        assert_eq!(first.await.expect("first relay"), Err(ForwardError::Timeout));
        peer.abort();
    }

    #[test]
    fn sentinels_are_distinct_protocol_reasons() {
        assert_eq!(ForwardError::Timeout.to_string(), "proxy: timeout");
        assert_eq!(
            ForwardError::ConnectionFailed.to_string(),
            "proxy: connection failed"
        );
        assert_eq!(ForwardError::NoResponse.to_string(), "proxy: no response");
        assert_eq!(
            ForwardError::SelfTarget.to_string(),
            "proxy: address refers to this bank"
        );
    }
}
