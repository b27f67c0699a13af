//! One TCP stream wrapped with cancellable async read/write and a
//! head-of-queue writer.
//!
//! The original callback-pair convention (`send(pkt, on_done)`,
//! `set_receive_callback(cb)` returning a continuation verdict) is
//! normalized per the design notes into plain futures: `send` returns a
//! future that resolves once, `recv` is called again by the caller's own
//! loop to read the next packet.

use crate::packet::{Packet, PacketCodec, PacketError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Broken(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] PacketError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

struct SendRequest {
    packet: Packet,
    done: oneshot::Sender<Result<(), ConnectionError>>,
}

/// A cancellable, ordered connection over a TCP stream.
pub struct Connection {
    reader: FramedRead<tokio::net::tcp::OwnedReadHalf, PacketCodec>,
    send_tx: mpsc::UnboundedSender<SendRequest>,
    writer_task: tokio::task::JoinHandle<()>,
    read_cancel: CancellationToken,
    write_cancel: CancellationToken,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, PacketCodec);
        let mut writer = FramedWrite::new(write_half, PacketCodec);

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SendRequest>();
        let write_cancel = CancellationToken::new();
        let writer_cancel = write_cancel.clone();

        let writer_task = tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(req) = send_rx.recv().await {
                let result = tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => Err(ConnectionError::Cancelled),
                    res = writer.send(req.packet) => res.map_err(ConnectionError::from),
                };
                // A cancelled send does not invoke the caller's completion —
                // drop the sender instead of completing it.
                if !matches!(result, Err(ConnectionError::Cancelled)) {
                    let _ = req.done.send(result);
                }
            }
        });

        Self {
            reader,
            send_tx,
            writer_task,
            read_cancel: CancellationToken::new(),
            write_cancel,
        }
    }

    /// Enqueue a packet for transmission. The returned future resolves once
    /// the packet is on the wire (or fails); ordering across calls is
    /// preserved by the single writer task.
    pub async fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_tx
            .send(SendRequest {
                packet,
                done: done_tx,
            })
            .map_err(|_| ConnectionError::Closed)?;
        done_rx.await.unwrap_or(Err(ConnectionError::Cancelled))
    }

    /// Read exactly one packet, honoring `cancel_io(Direction::Read)`.
    /// A read that loses the race to cancellation is not reported
    /// to the caller as end-of-stream — it simply resolves as `Cancelled`.
    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.read_cancel.cancelled() => Err(ConnectionError::Cancelled),
            next = self.reader.next() => match next {
                Some(Ok(packet)) => Ok(packet),
                Some(Err(e)) => Err(ConnectionError::from(e)),
                None => Err(ConnectionError::Closed),
            },
        }
    }

    /// Cancel outstanding I/O in one direction. For `Write`, the queue is
    /// effectively drained: in-flight and subsequently-enqueued sends race a
    /// freshly-armed cancellation token. Idempotent.
    pub fn cancel_io(&mut self, direction: Direction) {
        match direction {
            Direction::Read => {
                self.read_cancel.cancel();
                self.read_cancel = CancellationToken::new();
            }
            Direction::Write => {
                self.write_cancel.cancel();
                self.write_cancel = CancellationToken::new();
            }
            Direction::Both => {
                self.cancel_io(Direction::Read);
                self.cancel_io(Direction::Write);
            }
        }
    }

    pub fn close(&mut self) {
        self.cancel_io(Direction::Both);
        self.writer_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let client_stream = connect.await.unwrap();
        (Connection::new(server_stream), Connection::new(client_stream))
    }

    #[tokio::test]
    async fn send_then_recv_roundtrips_a_packet() {
        let (server, mut client) = connected_pair().await;
        server.send(Packet::new_user(vec![1, 2, 3])).await.unwrap();
        let packet = client.recv().await.unwrap();
        assert_eq!(packet.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sends_are_delivered_in_enqueue_order() {
        let (server, mut client) = connected_pair().await;
        server.send(Packet::new_user(vec![1])).await.unwrap();
        server.send(Packet::new_user(vec![2])).await.unwrap();
        let first = client.recv().await.unwrap();
        let second = client.recv().await.unwrap();
        assert_eq!(first.payload, vec![1]);
        assert_eq!(second.payload, vec![2]);
    }

    #[tokio::test]
    async fn cancel_read_resolves_with_cancelled() {
        let (_server, mut client) = connected_pair().await;
        client.cancel_io(Direction::Read);
        let result = client.recv().await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }

    #[tokio::test]
    async fn close_stops_further_use() {
        let (mut server, _client) = connected_pair().await;
        server.close();
        let result = server.send(Packet::new_user(vec![1])).await;
        assert!(result.is_err());
    }
}
