//! Message and chunk transport over an async byte pipe with bounded reads.

use std::time::Duration;

use tidepool_io::chunk::{varint_decode, ChunkDecoder, ChunkEncoder, VARINT_MAX_LEN};
use tidepool_io::{StorageError, StorageResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::trace;

use crate::message::{ProtocolMessage, MAX_FRAME_SIZE};

/// Boxed read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default time to wait for any single read from the peer.
pub const PROTOCOL_TIMEOUT_DEFAULT: Duration = Duration::from_secs(1800);

/// Framed message stream shared by the protocol client and server.
pub struct ProtocolStream {
    reader: BufReader<BoxedReader>,
    writer: BufWriter<BoxedWriter>,
    timeout: Duration,
    encoder: ChunkEncoder,
    decoder: ChunkDecoder,
}

impl ProtocolStream {
    /// Wrap a read/write pair. Every read waits at most `timeout`.
    pub fn new(reader: BoxedReader, writer: BoxedWriter, timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            timeout,
            encoder: ChunkEncoder::new(),
            decoder: ChunkDecoder::new(),
        }
    }

    /// Read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> StorageResult<()> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.reader.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(StorageError::from_io(&e, "unable to read from protocol stream", StorageError::ReadFailed)),
            Err(_) => Err(StorageError::ReadTimeout(format!(
                "timeout after {}ms waiting for read from protocol stream",
                timeout.as_millis()
            ))),
        }
    }

    /// Write one message and flush it.
    pub async fn write_message(&mut self, message: &ProtocolMessage) -> StorageResult<()> {
        let frame = message.encode()?;
        trace!(kind = message.kind(), bytes = frame.len(), "write protocol message");
        self.write_all(&frame).await?;
        self.flush().await
    }

    /// Read one message.
    pub async fn read_message(&mut self) -> StorageResult<ProtocolMessage> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(StorageError::Format(format!(
                "protocol frame of {} bytes exceeds maximum frame size {}",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        let message = ProtocolMessage::decode(&payload)?;
        trace!(kind = message.kind(), bytes = len, "read protocol message");
        Ok(message)
    }

    /// Write one chunk of streamed content. Empty chunks are skipped.
    pub async fn write_chunk(&mut self, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut header = Vec::with_capacity(VARINT_MAX_LEN);
        self.encoder.header(data.len(), &mut header);
        self.write_all(&header).await?;
        self.write_all(data).await
    }

    /// Terminate streamed content and flush.
    pub async fn write_chunk_end(&mut self) -> StorageResult<()> {
        let mut tail = Vec::with_capacity(1);
        self.encoder.end(&mut tail);
        self.write_all(&tail).await?;
        self.flush().await
    }

    /// Read the next chunk of streamed content; `None` once the terminator arrives.
    pub async fn read_chunk(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let mut header = Vec::with_capacity(VARINT_MAX_LEN);
        let value = loop {
            let mut byte = [0u8; 1];
            self.read_exact(&mut byte).await?;
            header.push(byte[0]);
            if let Some((value, _)) = varint_decode(&header)? {
                break value;
            }
        };
        let Some(size) = self.decoder.size(value)? else {
            return Ok(None);
        };
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= MAX_FRAME_SIZE)
            .ok_or_else(|| StorageError::Format(format!("chunk size {} is too large", size)))?;
        let mut data = vec![0u8; size];
        self.read_exact(&mut data).await?;
        Ok(Some(data))
    }

    async fn write_all(&mut self, data: &[u8]) -> StorageResult<()> {
        self.writer.write_all(data).await.map_err(|e| {
            StorageError::from_io(&e, "unable to write to protocol stream", StorageError::WriteFailed)
        })
    }

    async fn flush(&mut self) -> StorageResult<()> {
        self.writer.flush().await.map_err(|e| {
            StorageError::from_io(&e, "unable to flush protocol stream", StorageError::WriteFailed)
        })
    }
}

impl std::fmt::Debug for ProtocolStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolStream")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Connected pair of streams over in-memory pipes, for tests and in-process peers.
pub fn stream_pair(timeout: Duration) -> (ProtocolStream, ProtocolStream) {
    let (a_read, b_write) = tokio::io::duplex(256 * 1024);
    let (b_read, a_write) = tokio::io::duplex(256 * 1024);
    (
        ProtocolStream::new(Box::new(a_read), Box::new(a_write), timeout),
        ProtocolStream::new(Box::new(b_read), Box::new(b_write), timeout),
    )
}
