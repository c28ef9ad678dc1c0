//! Connection channel - framed read/write workers for one stream
//!
//! The write worker drains the outbound queue in order; the read worker
//! decodes frames into envelopes and pushes them onto the owner's inbound
//! queue. A failure on either side reports `Closed` and ends that worker.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::protocol::Envelope;

/// Something the workers report to the channel's owner
#[derive(Debug)]
pub enum ChannelEvent {
    Message { generation: u64, envelope: Envelope },
    Closed { generation: u64, error: Error },
}

impl ChannelEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ChannelEvent::Message { generation, .. } | ChannelEvent::Closed { generation, .. } => {
                *generation
            }
        }
    }
}

/// Handle to a live connection's workers
pub struct ConnectionChannel {
    generation: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionChannel {
    /// Split `stream` and spawn its workers. Events are tagged with
    /// `generation` so a stale connection's events can be told apart.
    pub fn spawn<S, T>(stream: S, generation: u64, capacity: usize, inbound: mpsc::Sender<T>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        T: From<ChannelEvent> + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));

        let reader = tokio::spawn(read_worker(reader, generation, inbound.clone()));
        let writer = tokio::spawn(write_worker(writer, generation, outbound_rx, inbound));

        Self {
            generation,
            outbound,
            reader,
            writer,
        }
    }

    /// Encoded envelopes written to this connection in order
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound.clone()
    }

    pub fn close(self) {
        debug!(generation = self.generation, "Closing connection");
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_worker<S, T>(mut reader: ReadHalf<S>, generation: u64, inbound: mpsc::Sender<T>)
where
    S: AsyncRead + AsyncWrite,
    T: From<ChannelEvent>,
{
    let error = loop {
        match read_frame(&mut reader).await {
            Ok(bytes) => match Envelope::from_bytes(&bytes) {
                Ok(envelope) => {
                    let event = ChannelEvent::Message {
                        generation,
                        envelope,
                    };
                    if inbound.send(T::from(event)).await.is_err() {
                        debug!(generation, "Inbound queue closed");
                        return;
                    }
                }
                Err(e) => {
                    warn!(generation, error = %e, "Dropping undecodable frame");
                }
            },
            Err(Error::ConnectionLost) => {
                debug!(generation, "Peer closed connection");
                break Error::ConnectionLost;
            }
            Err(e) => {
                warn!(generation, error = %e, "Read error");
                break e;
            }
        }
    };
    let _ = inbound
        .send(T::from(ChannelEvent::Closed { generation, error }))
        .await;
}

async fn write_worker<S, T>(
    mut writer: WriteHalf<S>,
    generation: u64,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<T>,
) where
    S: AsyncRead + AsyncWrite,
    T: From<ChannelEvent>,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            warn!(generation, error = %e, "Write error");
            let _ = inbound
                .send(T::from(ChannelEvent::Closed {
                    generation,
                    error: e,
                }))
                .await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}
