//! A transport that communicates with the peer over two async streams, one for reading and one
//! for writing, one envelope per line.
//!
//! This is used to implement the stdio transport, and also is useful for creating tests that
//! simulate a client and server talking to each other without a real network.
use super::{encode_line, Transport, TransportError};
use crate::Envelope;
use std::fmt::{Debug, Formatter};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    closed: CancellationToken,
}

impl<R, W> Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let line = encode_line(&envelope)?;

        // Holding the writer lock for the whole line keeps concurrent senders from interleaving
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            tokio::select! {
                _ = self.closed.cancelled() => {
                    debug!("Transport closed; no more messages");
                    return Ok(None);
                },
                result = reader.read_line(&mut line) => {
                    if result? == 0 {
                        debug!("EOF on reader; stopping stream");
                        return Ok(None);
                    }
                }
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return line
                .parse::<Envelope>()
                .map(Some)
                .map_err(TransportError::Malformed);
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Error shutting down writer; ignoring");
        }
        Ok(())
    }
}

pub type DuplexTransport = StreamTransport<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

/// Make two stream transports connected to each other in memory.
pub fn duplex(max_buf_size: usize) -> (DuplexTransport, DuplexTransport) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    (
        StreamTransport::new(BufReader::new(a_read), a_write),
        StreamTransport::new(BufReader::new(b_read), b_write),
    )
}
