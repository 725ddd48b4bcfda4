/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Endpoints: local listeners with printable names.
//!
//! A launcher opens at most one endpoint per transport kind; multiple
//! logical uses (tree children, application processes) are multiplexed
//! by sequenced accept.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::net::UnixListener;

use crate::Channel;
use crate::ChannelAddr;
use crate::ChannelError;
use crate::ChannelTransport;

/// A local listener. Its name (the display form of its address) is
/// handed to peers, which `connect` to it to form a [`Channel`].
pub struct Endpoint {
    listener: Listener,
    addr: ChannelAddr,
    closed: bool,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Endpoint {
    /// Open a listener of the given transport kind. TCP endpoints bind
    /// an unspecified port on all interfaces and advertise the local
    /// IP; Unix endpoints bind a fresh socket path under the system
    /// temp directory.
    pub async fn open(transport: ChannelTransport) -> Result<Self, ChannelError> {
        match transport {
            ChannelTransport::Tcp => {
                let listener = TcpListener::bind(("0.0.0.0", 0))
                    .await
                    .map_err(ChannelError::Transport)?;
                let port = listener
                    .local_addr()
                    .map_err(ChannelError::Transport)?
                    .port();
                let ip = local_ip_address::local_ip()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                Ok(Self {
                    listener: Listener::Tcp(listener),
                    addr: ChannelAddr::Tcp(SocketAddr::new(ip, port)),
                    closed: false,
                })
            }
            ChannelTransport::Unix => {
                let path = fresh_socket_path();
                let listener = UnixListener::bind(&path).map_err(ChannelError::Transport)?;
                Ok(Self {
                    listener: Listener::Unix(listener),
                    addr: ChannelAddr::Unix(path),
                    closed: false,
                })
            }
        }
    }

    /// The address peers connect to.
    pub fn addr(&self) -> &ChannelAddr {
        &self.addr
    }

    /// The endpoint's printable name; parses back to its address.
    pub fn name(&self) -> String {
        self.addr.to_string()
    }

    /// Close the endpoint: tear down the listener and remove a Unix
    /// socket path from the file system, surfacing the removal
    /// failure. Dropping an endpoint performs the same cleanup as a
    /// safety net, discarding any error.
    pub fn close(mut self) -> Result<(), ChannelError> {
        self.closed = true;
        if let ChannelAddr::Unix(path) = &self.addr {
            std::fs::remove_file(path).map_err(ChannelError::Transport)?;
        }
        Ok(())
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<Channel, ChannelError> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(ChannelError::Transport)?;
                stream.set_nodelay(true).map_err(ChannelError::Transport)?;
                tracing::debug!("accepted connection from {peer} on {}", self.addr);
                Ok(Channel::from_stream(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(ChannelError::Transport)?;
                tracing::debug!("accepted connection on {}", self.addr);
                Ok(Channel::from_stream(stream))
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let ChannelAddr::Unix(path) = &self.addr {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn fresh_socket_path() -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!("spawnnet-{}", suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Strmap;

    async fn exercise(transport: ChannelTransport) {
        let ep = Endpoint::open(transport).await.unwrap();
        // The advertised name parses back to the listen address.
        let addr: ChannelAddr = ep.name().parse().unwrap();
        assert_eq!(&addr, ep.addr());

        let addr = ep.addr().clone();
        let client = tokio::spawn(async move {
            let mut ch = Channel::connect(&addr).await.unwrap();
            ch.write_strmap(&[("ID", "1"), ("PID", "42")].into_iter().collect())
                .await
                .unwrap();
            ch.read_str().await.unwrap()
        });

        let mut ch = ep.accept().await.unwrap();
        let idmap = ch.read_strmap().await.unwrap();
        assert_eq!(idmap.get("ID"), Some("1"));
        ch.write_str("params").await.unwrap();
        assert_eq!(client.await.unwrap(), "params");
    }

    #[tokio::test]
    async fn test_tcp_accept_connect() {
        // Connect over loopback regardless of the advertised interface.
        let ep = Endpoint::open(ChannelTransport::Tcp).await.unwrap();
        let ChannelAddr::Tcp(sock) = ep.addr() else {
            panic!("expected tcp address");
        };
        let addr = ChannelAddr::Tcp(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            sock.port(),
        ));
        let client = tokio::spawn(async move {
            let mut ch = Channel::connect(&addr).await.unwrap();
            ch.write(b"x").await.unwrap();
        });
        let mut ch = ep.accept().await.unwrap();
        assert_eq!(ch.read(1).await.unwrap(), b"x");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_accept_connect() {
        exercise(ChannelTransport::Unix).await;
    }

    fn unix_socket_path(ep: &Endpoint) -> PathBuf {
        let ChannelAddr::Unix(path) = ep.addr().clone() else {
            panic!("expected unix address");
        };
        path
    }

    #[tokio::test]
    async fn test_unix_socket_removed_on_close() {
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        let path = unix_socket_path(&ep);
        assert!(path.exists());
        ep.close().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unix_socket_removed_on_drop() {
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        let path = unix_socket_path(&ep);
        assert!(path.exists());
        drop(ep);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_close_surfaces_removal_failure() {
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        // Yank the socket out from under the endpoint; close must
        // report the failed removal rather than swallow it.
        std::fs::remove_file(unix_socket_path(&ep)).unwrap();
        assert!(matches!(
            ep.close().unwrap_err(),
            ChannelError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_tcp_close() {
        let ep = Endpoint::open(ChannelTransport::Tcp).await.unwrap();
        ep.close().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let missing = ChannelAddr::Unix(PathBuf::from("/tmp/spawnnet-does-not-exist"));
        assert!(matches!(
            Channel::connect(&missing).await.unwrap_err(),
            ChannelError::ConnectRefused(_)
        ));
    }

    #[tokio::test]
    async fn test_sequenced_accept() {
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        let addr = ep.addr().clone();
        let clients = tokio::spawn(async move {
            for i in 0..3u64 {
                let mut ch = Channel::connect(&addr).await.unwrap();
                ch.write_strmap(&Strmap::from_iter([("ID", i.to_string())]))
                    .await
                    .unwrap();
                // Hold the channel open until the server has read it.
                ch.read(1).await.unwrap();
            }
        });
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut ch = ep.accept().await.unwrap();
            let idmap = ch.read_strmap().await.unwrap();
            seen.push(idmap.get("ID").unwrap().to_string());
            ch.write(b"k").await.unwrap();
        }
        clients.await.unwrap();
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2"]);
    }
}
