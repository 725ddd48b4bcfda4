/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Channels: exclusively owned, reliable, ordered byte streams between
//! two endpoints. Reads and writes are blocking and atomic with respect
//! to size.

use std::fmt;
use std::io;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::UnixStream;

use crate::ChannelAddr;
use crate::ChannelError;
use crate::Strmap;

/// Maximum length accepted for a single length-prefixed frame (a string
/// or a packed strmap). Larger frames are a transport error: a peer
/// advertising one is either corrupt or hostile.
pub const MAX_FRAME_LENGTH: u64 = 1 << 30;

pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Stream for S {}

/// One end of an established channel. Dropping it (or calling
/// [`Channel::disconnect`]) invalidates the peer's end, which observes
/// subsequent operations failing with [`ChannelError::PeerClosed`].
pub struct Channel {
    stream: Box<dyn Stream>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn from_stream(stream: impl Stream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Connect to the named endpoint, dispatching on the transport kind
    /// encoded in the address.
    pub async fn connect(addr: &ChannelAddr) -> Result<Self, ChannelError> {
        match addr {
            ChannelAddr::Tcp(sock_addr) => {
                let stream = TcpStream::connect(sock_addr)
                    .await
                    .map_err(|err| connect_error(addr, err))?;
                // Handshake traffic is tiny and latency-bound.
                stream.set_nodelay(true).map_err(ChannelError::Transport)?;
                Ok(Self::from_stream(stream))
            }
            ChannelAddr::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|err| connect_error(addr, err))?;
                Ok(Self::from_stream(stream))
            }
        }
    }

    /// An in-memory channel pair whose ends are connected to each
    /// other. Used to stitch launcher flows together in tests.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (Self::from_stream(a), Self::from_stream(b))
    }

    /// Read exactly `buf.len()` bytes into `buf`.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        self.stream.read_exact(buf).await.map_err(map_io)?;
        Ok(())
    }

    /// Read exactly `n` bytes.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf).await?;
        Ok(buf)
    }

    /// Write all of `buf`.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(buf).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Write a length-prefixed string: a u64 big-endian byte length
    /// followed by the raw bytes, with no terminator.
    pub async fn write_str(&mut self, s: &str) -> Result<(), ChannelError> {
        let mut buf = Vec::with_capacity(8 + s.len());
        buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
        buf.extend_from_slice(s.as_bytes());
        self.write(&buf).await
    }

    /// Read a length-prefixed string written by [`Self::write_str`].
    pub async fn read_str(&mut self) -> Result<String, ChannelError> {
        let len = self.read_frame_len().await?;
        let bytes = self.read(len).await?;
        String::from_utf8(bytes)
            .map_err(|err| map_io(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    /// Pack `map` and write it as one length-prefixed frame.
    pub async fn write_strmap(&mut self, map: &Strmap) -> Result<(), ChannelError> {
        let packed = map.pack();
        let mut buf = Vec::with_capacity(8 + packed.len());
        buf.extend_from_slice(&(packed.len() as u64).to_be_bytes());
        buf.extend_from_slice(&packed);
        self.write(&buf).await
    }

    /// Read one packed strmap frame written by [`Self::write_strmap`].
    pub async fn read_strmap(&mut self) -> Result<Strmap, ChannelError> {
        let len = self.read_frame_len().await?;
        let bytes = self.read(len).await?;
        Strmap::unpack(&bytes)
            .map_err(|err| map_io(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    /// Shut down the write side and release the channel.
    pub async fn disconnect(mut self) -> Result<(), ChannelError> {
        self.stream.shutdown().await.map_err(map_io)
    }

    async fn read_frame_len(&mut self) -> Result<usize, ChannelError> {
        let mut len_buf = [0u8; 8];
        self.read_into(&mut len_buf).await?;
        let len = u64::from_be_bytes(len_buf);
        if len > MAX_FRAME_LENGTH {
            return Err(map_io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds maximum"),
            )));
        }
        Ok(len as usize)
    }
}

fn connect_error(addr: &ChannelAddr, err: io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
            ChannelError::ConnectRefused(addr.clone())
        }
        _ => ChannelError::Transport(err),
    }
}

fn map_io(err: io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ChannelError::PeerClosed,
        _ => ChannelError::Transport(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_size_reads() {
        let (mut a, mut b) = Channel::pair();
        // One write, several reads.
        a.write(b"hello world").await.unwrap();
        assert_eq!(b.read(5).await.unwrap(), b"hello");
        assert_eq!(b.read(6).await.unwrap(), b" world");
        // Several writes, one read.
        a.write(b"spawn").await.unwrap();
        a.write(b"net").await.unwrap();
        assert_eq!(b.read(8).await.unwrap(), b"spawnnet");
    }

    #[tokio::test]
    async fn test_str_roundtrip() {
        let (mut a, mut b) = Channel::pair();
        a.write_str("BARRIER").await.unwrap();
        a.write_str("").await.unwrap();
        assert_eq!(b.read_str().await.unwrap(), "BARRIER");
        assert_eq!(b.read_str().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_strmap_roundtrip() {
        let (mut a, mut b) = Channel::pair();
        let map: Strmap = [("RANK", "3"), ("RANKS", "8")].into_iter().collect();
        a.write_strmap(&map).await.unwrap();
        assert_eq!(b.read_strmap().await.unwrap(), map);
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (a, mut b) = Channel::pair();
        drop(a);
        assert!(matches!(
            b.read(1).await.unwrap_err(),
            ChannelError::PeerClosed
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = Channel::pair();
        a.write(&u64::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            b.read_str().await.unwrap_err(),
            ChannelError::Transport(_)
        ));
    }
}
