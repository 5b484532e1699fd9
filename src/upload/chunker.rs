//! Stream chunker
//!
//! Splits a byte stream into ordered chunks of at most `chunk_size` bytes on
//! a background task. Chunks travel through a bounded queue together with
//! the terminal error or end marker, so the consumer sees one ordered
//! sequence of [`ChunkMessage`]s.
//!
//! A queue slot is reserved before the next chunk is read. While the
//! consumer is busy, at most `queue_depth` chunks exist outside of it and
//! the source is not read any further.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of chunks buffered ahead of the consumer
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

/// Contiguous slice of the source stream
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position in the chunk sequence, starting at 0
    pub index: u64,
    /// Byte offset of the first byte in the source stream
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Item delivered by a [`ChunkStream`]
#[derive(Debug)]
pub enum ChunkMessage {
    Chunk(Chunk),
    /// Reading failed. Nothing follows.
    Error(io::Error),
    /// Source exhausted. Nothing follows.
    End,
}

/// Chunking parameters
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    queue_depth: usize,
}

impl Chunker {
    /// Create a chunker. Zero sizes are raised to 1.
    pub fn new(chunk_size: usize, queue_depth: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Start chunking `reader` on a background task.
    ///
    /// The task stops at end of stream, on the first read error, when
    /// `cancel` fires, or when the returned stream is dropped.
    pub fn spawn<R>(self, reader: R, cancel: CancellationToken) -> ChunkStream
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let task = tokio::spawn(produce(reader, self.chunk_size, tx, cancel));
        ChunkStream { rx, task }
    }
}

/// Receiving end of a running chunker
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<ChunkMessage>,
    task: JoinHandle<()>,
}

impl ChunkStream {
    /// Next message, or `None` if the chunker stopped without a terminal
    /// message (cancelled or panicked)
    pub async fn recv(&mut self) -> Option<ChunkMessage> {
        self.rx.recv().await
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn produce<R>(
    mut reader: R,
    chunk_size: usize,
    tx: mpsc::Sender<ChunkMessage>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut index = 0u64;
    let mut offset = 0u64;

    loop {
        let permit = tokio::select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("Chunk consumer went away");
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        };

        let filled = tokio::select! {
            filled = fill_chunk(&mut reader, chunk_size) => filled,
            _ = cancel.cancelled() => return,
        };

        let (data, eof) = match filled {
            Ok(filled) => filled,
            Err(e) => {
                tracing::debug!(error = %e, offset, "Read failed while chunking");
                permit.send(ChunkMessage::Error(e));
                return;
            }
        };

        if data.is_empty() {
            permit.send(ChunkMessage::End);
            return;
        }

        let len = data.len() as u64;
        tracing::trace!(index, offset, len, "Chunk ready");
        permit.send(ChunkMessage::Chunk(Chunk {
            index,
            offset,
            data,
        }));
        index += 1;
        offset += len;

        if eof {
            tokio::select! {
                _ = tx.send(ChunkMessage::End) => {}
                _ = cancel.cancelled() => {}
            }
            return;
        }
    }
}

/// Read until `chunk_size` bytes are buffered or the stream ends.
///
/// Returns the bytes and whether the stream ended.
async fn fill_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<(Bytes, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(chunk_size);
    while buf.len() < chunk_size {
        let remaining = (chunk_size - buf.len()) as u64;
        let n = (&mut *reader).take(remaining).read_buf(&mut buf).await?;
        if n == 0 {
            return Ok((buf.freeze(), true));
        }
    }
    Ok((buf.freeze(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;

    async fn collect(mut stream: ChunkStream) -> (Vec<Chunk>, Option<io::Error>) {
        let mut chunks = Vec::new();
        loop {
            match stream.recv().await {
                Some(ChunkMessage::Chunk(chunk)) => chunks.push(chunk),
                Some(ChunkMessage::Error(e)) => return (chunks, Some(e)),
                Some(ChunkMessage::End) => return (chunks, None),
                None => panic!("chunker stopped without a terminal message"),
            }
        }
    }

    /// Endless reader that counts the bytes handed out
    struct CountingReader {
        served: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = buf.remaining();
            buf.put_slice(&vec![0x5a; n]);
            self.served.fetch_add(n, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_chunk_sizes() {
        let data: Vec<u8> = (0..25u8).collect();
        let stream = Chunker::new(10, 2).spawn(io::Cursor::new(data.clone()), CancellationToken::new());

        let (chunks, err) = collect(stream).await;

        assert!(err.is_none());
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let offsets: Vec<u64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_chunk() {
        let stream = Chunker::new(4, 2).spawn(io::Cursor::new(vec![1u8; 12]), CancellationToken::new());

        let (chunks, err) = collect(stream).await;

        assert!(err.is_none());
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 4));
    }

    #[tokio::test]
    async fn test_empty_stream_yields_no_chunks() {
        let stream = Chunker::new(4, 2).spawn(io::Cursor::new(Vec::new()), CancellationToken::new());

        let (chunks, err) = collect(stream).await;

        assert!(err.is_none());
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_small_reads_are_coalesced() {
        let reader = tokio_test::io::Builder::new()
            .read(b"ab")
            .read(b"c")
            .read(b"defg")
            .read(b"h")
            .build();
        let stream = Chunker::new(3, 2).spawn(reader, CancellationToken::new());

        let (chunks, err) = collect(stream).await;

        assert!(err.is_none());
        let parts: Vec<&[u8]> = chunks.iter().map(|c| c.data.as_ref()).collect();
        assert_eq!(parts, vec![&b"abc"[..], &b"def"[..], &b"gh"[..]]);
    }

    #[tokio::test]
    async fn test_read_error_ends_sequence() {
        let reader = tokio_test::io::Builder::new()
            .read(b"abcd")
            .read(b"ef")
            .read_error(io::Error::new(io::ErrorKind::Other, "boom"))
            .build();
        let stream = Chunker::new(4, 2).spawn(reader, CancellationToken::new());

        let (chunks, err) = collect(stream).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.as_ref(), b"abcd");
        assert_eq!(err.unwrap().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_backpressure_bounds_reads() {
        let served = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            served: Arc::clone(&served),
        };
        let mut stream = Chunker::new(1024, 2).spawn(reader, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(served.load(Ordering::SeqCst), 2 * 1024);

        assert!(matches!(stream.recv().await, Some(ChunkMessage::Chunk(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(served.load(Ordering::SeqCst), 3 * 1024);
    }

    #[tokio::test]
    async fn test_cancel_stops_chunker() {
        let served = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            served: Arc::clone(&served),
        };
        let cancel = CancellationToken::new();
        let mut stream = Chunker::new(16, 1).spawn(reader, cancel.clone());

        cancel.cancel();
        let mut received = 0;
        while let Some(message) = stream.recv().await {
            assert!(matches!(message, ChunkMessage::Chunk(_)));
            received += 1;
        }
        assert!(received <= 1);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let chunker = Chunker::new(0, 0);
        assert_eq!(chunker.chunk_size(), 1);
        assert_eq!(chunker.queue_depth(), 1);
    }
}
