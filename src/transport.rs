// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Byte-oriented duplex channel between the client core and a socket.
//!
//! The core never touches a socket directly. A [`Connector`] produces a
//! fresh [`Transport`] per connection attempt; the TCP implementation runs
//! one read-loop task and one write-loop task per connection and talks to
//! the core purely through owned byte buffers, so a test harness can stand
//! in with plain channels.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Why the transport stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The peer closed the connection.
    ClosedByPeer,

    /// Reading from the socket failed.
    ReadFailed,

    /// Writing to the socket failed.
    WriteFailed,

    /// Local graceful close finished flushing.
    Closed,
}

/// Read buffer size of the TCP read loop.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Depth of the byte channels in each direction. Bounded so a slow socket
/// back-pressures the core instead of buffering without limit.
const CHANNEL_DEPTH: usize = 32;

/// One live connection, seen from the client core.
///
/// Reads and writes are channels of owned buffers: the producer allocates,
/// the consumer frees after use. Dropping the transport aborts the
/// connection.
pub struct Transport {
    writer: mpsc::Sender<Bytes>,
    pub(crate) reader: mpsc::Receiver<Bytes>,
    pub(crate) terminated: mpsc::Receiver<TerminationReason>,
    abort: Option<oneshot::Sender<()>>,
    max_frame_size: usize,
}

impl Transport {
    /// Assemble a transport from its channel halves. The socket layer (or
    /// a test harness) owns the other ends.
    #[must_use]
    pub fn new(
        writer: mpsc::Sender<Bytes>,
        reader: mpsc::Receiver<Bytes>,
        terminated: mpsc::Receiver<TerminationReason>,
        abort: Option<oneshot::Sender<()>>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            writer,
            reader,
            terminated,
            abort,
            max_frame_size,
        }
    }

    /// Largest frame the socket layer accepts in one write.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Hand `frame` to the write loop, waiting when the channel is full.
    ///
    /// # Errors
    ///
    /// Returns error if the write loop is gone.
    pub async fn write(&mut self, frame: Bytes) -> Result<(), Error> {
        self.writer
            .send(frame)
            .await
            .map_err(|_err| Error::transport_lost("transport write loop is gone"))
    }

    /// Graceful close: queued writes flush, then the socket shuts down.
    /// Completes when the write loop confirms. Idempotent by construction,
    /// the transport is consumed.
    pub async fn close(mut self) {
        // Disarm the abort trigger, then closing the write channel lets the
        // write loop drain before shutdown.
        drop(self.abort.take());
        drop(self.writer);
        while let Some(reason) = self.terminated.recv().await {
            if reason == TerminationReason::Closed {
                break;
            }
        }
    }

    /// Unclean teardown, nothing flushes.
    pub fn abort(mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
    }
}

/// Produces a fresh transport per connection attempt. Boxed future so the
/// supervisor can hold any connector behind one object.
pub trait Connector: Send {
    fn connect(&mut self) -> BoxFuture<'_, Result<Transport, Error>>;
}

/// Plain TCP connector, one read task and one write task per connection.
#[allow(clippy::module_name_repetitions)]
pub struct TcpConnector {
    address: String,
    max_frame_size: usize,
}

impl TcpConnector {
    #[must_use]
    pub fn new(address: &str, max_frame_size: usize) -> Self {
        Self {
            address: address.to_string(),
            max_frame_size,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> BoxFuture<'_, Result<Transport, Error>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|err| Error::from_string(
                    crate::error::ErrorKind::TransportLoss,
                    format!("tcp connect to {} failed: {err}", self.address),
                ))?;
            if let Err(err) = stream.set_nodelay(true) {
                log::warn!("transport: set_nodelay failed: {err}");
            }

            let (read_half, write_half) = stream.into_split();
            let (read_tx, read_rx) = mpsc::channel(CHANNEL_DEPTH);
            let (write_tx, write_rx) = mpsc::channel(CHANNEL_DEPTH);
            // Depth two, both loops may report their reason.
            let (term_tx, term_rx) = mpsc::channel(2);
            let (abort_tx, abort_rx) = oneshot::channel();

            tokio::spawn(read_loop(read_half, read_tx, term_tx.clone()));
            tokio::spawn(write_loop(write_half, write_rx, abort_rx, term_tx));

            Ok(Transport::new(
                write_tx,
                read_rx,
                term_rx,
                Some(abort_tx),
                self.max_frame_size,
            ))
        })
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    chunks: mpsc::Sender<Bytes>,
    terminated: mpsc::Sender<TerminationReason>,
) {
    loop {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = terminated.try_send(TerminationReason::ClosedByPeer);
                return;
            }
            Ok(_) => {
                // Ownership of the buffer moves to the decoder.
                if chunks.send(buf.freeze()).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                log::warn!("transport: socket read failed: {err}");
                let _ = terminated.try_send(TerminationReason::ReadFailed);
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
    abort: oneshot::Receiver<()>,
    terminated: mpsc::Sender<TerminationReason>,
) {
    // A dropped abort handle means graceful close; only an explicit signal
    // aborts.
    let abort = async move {
        if abort.await.is_err() {
            futures::future::pending::<()>().await;
        }
    };
    tokio::pin!(abort);

    loop {
        tokio::select! {
            maybe_frame = frames.recv() => match maybe_frame {
                Some(frame) => {
                    if let Err(err) = write_half.write_all(&frame).await {
                        log::warn!("transport: socket write failed: {err}");
                        let _ = terminated.try_send(TerminationReason::WriteFailed);
                        return;
                    }
                }
                // Channel closed: flush and shut down cleanly.
                None => break,
            },
            () = &mut abort => return,
        }
    }

    let _ = write_half.flush().await;
    let _ = write_half.shutdown().await;
    let _ = terminated.try_send(TerminationReason::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_round_trip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            buf
        });

        let mut connector = TcpConnector::new(&address, 64 * 1024);
        let mut transport = connector.connect().await.unwrap();
        assert_eq!(transport.max_frame_size(), 64 * 1024);

        transport
            .write(Bytes::from_static(&[0xc0, 0x00, 0xe0, 0x00]))
            .await
            .unwrap();

        let echoed = transport.reader.recv().await.unwrap();
        assert_eq!(&echoed[..], &[0xc0, 0x00, 0xe0, 0x00]);
        assert_eq!(server.await.unwrap(), [0xc0, 0x00, 0xe0, 0x00]);

        transport.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_signals_termination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut connector = TcpConnector::new(&address, 1024);
        let mut transport = connector.connect().await.unwrap();
        let reason = transport.terminated.recv().await.unwrap();
        assert_eq!(reason, TerminationReason::ClosedByPeer);
    }
}
