//! Transport halves the connection agent reads from and writes to.
//!
//! An agent only needs "give me the next bytes" and "write this frame", so it
//! works over any stream split into a read half and a write half. TCP halves,
//! generic `tokio::io` split halves and WebSocket streams (binary messages
//! carry the packet bytes) are provided.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Read side of a connection.
#[async_trait]
pub trait TransportRead: Send {
    /// Reads the next chunk of bytes into `buf`. `Ok(0)` means the peer closed.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a connection.
#[async_trait]
pub trait TransportWrite: Send {
    /// Writes one encoded packet.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Flushes and closes the write side.
    async fn shutdown(&mut self) -> io::Result<()>;
}

#[async_trait]
impl TransportRead for OwnedReadHalf {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl TransportWrite for OwnedWriteHalf {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

#[async_trait]
impl<T> TransportRead for ReadHalf<T>
where
    T: AsyncRead + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl<T> TransportWrite for WriteHalf<T>
where
    T: AsyncWrite + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame).await?;
        self.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Bytes,
}

/// Write half of a WebSocket connection.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

/// Splits an established WebSocket into transport halves.
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = ws.split();
    (
        WsReader {
            stream,
            pending: Bytes::new(),
        },
        WsWriter { sink },
    )
}

#[async_trait]
impl<S> TransportRead for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(n);
            }

            match self.stream.next().await {
                None => return Ok(0),
                Some(Err(e)) => return Err(io::Error::other(e)),
                Some(Ok(WsMessage::Binary(data))) => self.pending = data,
                Some(Ok(WsMessage::Text(text))) => {
                    self.pending = Bytes::copy_from_slice(text.as_str().as_bytes())
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(0),
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[async_trait]
impl<S> TransportWrite for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sink
            .send(WsMessage::Binary(Bytes::copy_from_slice(frame)))
            .await
            .map_err(io::Error::other)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.sink.close().await.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_halves() {
        let (client, server) = tokio::io::duplex(64);
        let (mut server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write.write_frame(b"abc").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server_read.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        TransportWrite::shutdown(&mut client_write).await.unwrap();
        assert_eq!(server_read.read_chunk(&mut buf).await.unwrap(), 0);
    }
}
