//! Minimal subscriber side of the discovery protocol

use crate::codec::{write_frame, FrameReader, DEFAULT_MAX_FRAME_BYTES};
use crate::{Result, ServerError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time;
use xds_api::{DiscoveryRequest, ServerMessage};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A single discovery stream from the subscriber's point of view
pub struct DiscoveryClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DiscoveryClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES * 16),
            writer,
        })
    }

    pub async fn send(&mut self, request: &DiscoveryRequest) -> Result<()> {
        write_frame(&mut self.writer, request, WRITE_TIMEOUT).await
    }

    /// Send raw bytes, used to exercise malformed input
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next server message. `Ok(None)` means the server closed the stream;
    /// nothing arriving within `timeout` is an error.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<ServerMessage>> {
        match time::timeout(timeout, self.reader.next_frame()).await {
            Ok(frame) => frame,
            Err(_) => Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no message within {:?}", timeout),
            ))),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
