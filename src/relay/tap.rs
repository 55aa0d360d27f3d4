//! Client response sinks and the duplicating tap.
//!
//! Adaptors write the client-visible response through a [`ResponseWriter`].
//! The relay wraps the real writer in a [`ResponseTap`], which keeps a copy of
//! every body byte for audit logging without changing what the client sees.
//!
//! ```text
//!   adaptor ──write──> ResponseTap ──forward──> real writer ──> client
//!                          │
//!                          └──copy──> captured buffer ──> content extraction
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::error::{RelayError, Result};

/// Destination of the client-visible response.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    /// Send status and headers. Later calls are ignored.
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()>;

    /// Send a body chunk, writing a `200` head first if none was written.
    async fn write(&self, chunk: Bytes) -> Result<usize>;

    /// Whether any part of the response has reached the writer.
    fn head_written(&self) -> bool;
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for &W {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        (**self).write_head(status, headers)
    }

    async fn write(&self, chunk: Bytes) -> Result<usize> {
        (**self).write(chunk).await
    }

    fn head_written(&self) -> bool {
        (**self).head_written()
    }
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for Arc<W> {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        (**self).write_head(status, headers)
    }

    async fn write(&self, chunk: Bytes) -> Result<usize> {
        (**self).write(chunk).await
    }

    fn head_written(&self) -> bool {
        (**self).head_written()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Body bytes kept by a [`ResponseTap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedResponse {
    /// Every body byte forwarded, in order.
    pub body: Bytes,
    /// Whether the response was a stream.
    pub is_stream: bool,
}

impl CapturedResponse {
    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Duplicating writer: forwards every byte to `inner` and keeps a copy.
///
/// In streaming mode each write takes a lock around the accumulate-and-forward
/// pair so writes issued from several tasks cannot interleave in the copy or
/// reorder on the wire. Non-streaming responses are written once and skip it.
pub struct ResponseTap<W> {
    inner: W,
    captured: Mutex<BytesMut>,
    stream_guard: Option<tokio::sync::Mutex<()>>,
    is_stream: bool,
}

impl<W: ResponseWriter> ResponseTap<W> {
    /// Wrap `inner`.
    pub fn new(inner: W, is_stream: bool) -> Self {
        Self {
            inner,
            captured: Mutex::new(BytesMut::new()),
            stream_guard: is_stream.then(|| tokio::sync::Mutex::new(())),
            is_stream,
        }
    }

    /// Copy of what has been captured so far.
    pub fn captured(&self) -> CapturedResponse {
        CapturedResponse {
            body: lock(&self.captured).clone().freeze(),
            is_stream: self.is_stream,
        }
    }

    /// Split into the real writer and the capture.
    pub fn into_parts(self) -> (W, CapturedResponse) {
        let body = self
            .captured
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .freeze();
        let captured = CapturedResponse {
            body,
            is_stream: self.is_stream,
        };
        (self.inner, captured)
    }

    /// The wrapped writer.
    pub fn inner(&self) -> &W {
        &self.inner
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for ResponseTap<W> {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        self.inner.write_head(status, headers)
    }

    async fn write(&self, chunk: Bytes) -> Result<usize> {
        let _guard = match &self.stream_guard {
            Some(guard) => Some(guard.lock().await),
            None => None,
        };

        lock(&self.captured).extend_from_slice(&chunk);
        self.inner.write(chunk).await
    }

    fn head_written(&self) -> bool {
        self.inner.head_written()
    }
}

/// Status and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code.
    pub status: StatusCode,
    /// Headers.
    pub headers: HeaderMap,
}

/// Body item delivered to the HTTP layer.
pub type BodyChunk = std::result::Result<Bytes, std::io::Error>;

/// [`ResponseWriter`] feeding an HTTP response through channels.
///
/// The head is delivered once over a oneshot; body chunks flow through a
/// bounded channel. Dropping the writer ends the body.
pub struct ChannelWriter {
    head: Mutex<Option<oneshot::Sender<ResponseHead>>>,
    head_written: AtomicBool,
    body: mpsc::Sender<BodyChunk>,
}

/// Receiving half of [`response_channel`].
pub struct ChannelReceiver {
    /// Resolves once the head is written; errors if the writer is dropped first.
    pub head: oneshot::Receiver<ResponseHead>,
    /// Body chunks.
    pub body: mpsc::Receiver<BodyChunk>,
}

impl ChannelReceiver {
    /// Body as a stream, ending when the writer is dropped.
    pub fn into_body_stream(
        body: mpsc::Receiver<BodyChunk>,
    ) -> impl Stream<Item = BodyChunk> + Send + 'static {
        stream::unfold(body, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }
}

/// Create a channel-backed writer with room for `buffer` pending chunks.
pub fn response_channel(buffer: usize) -> (ChannelWriter, ChannelReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));

    (
        ChannelWriter {
            head: Mutex::new(Some(head_tx)),
            head_written: AtomicBool::new(false),
            body: body_tx,
        },
        ChannelReceiver {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl ResponseWriter for ChannelWriter {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        let Some(sender) = lock(&self.head).take() else {
            return Ok(());
        };
        self.head_written.store(true, Ordering::Release);

        sender
            .send(ResponseHead { status, headers })
            .map_err(|_| RelayError::ClientClosed("response head receiver dropped".to_string()))
    }

    async fn write(&self, chunk: Bytes) -> Result<usize> {
        if !self.head_written() {
            self.write_head(StatusCode::OK, HeaderMap::new())?;
        }

        let len = chunk.len();
        self.body
            .send(Ok(chunk))
            .await
            .map_err(|_| RelayError::ClientClosed("response body receiver dropped".to_string()))?;
        Ok(len)
    }

    fn head_written(&self) -> bool {
        self.head_written.load(Ordering::Acquire)
    }
}

/// [`ResponseWriter`] that buffers everything in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    head: Mutex<Option<ResponseHead>>,
    chunks: Mutex<Vec<Bytes>>,
    fail_after: Option<usize>,
    writes: AtomicUsize,
}

impl MemoryWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer that reports the client gone after `writes` successful writes.
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    /// Status written, if any.
    pub fn status(&self) -> Option<StatusCode> {
        lock(&self.head).as_ref().map(|head| head.status)
    }

    /// Headers written, if any.
    pub fn headers(&self) -> Option<HeaderMap> {
        lock(&self.head).as_ref().map(|head| head.headers.clone())
    }

    /// Chunks in write order.
    pub fn chunks(&self) -> Vec<Bytes> {
        lock(&self.chunks).clone()
    }

    /// Concatenated body.
    pub fn body(&self) -> Bytes {
        let chunks = lock(&self.chunks);
        let mut body = BytesMut::new();
        for chunk in chunks.iter() {
            body.extend_from_slice(chunk);
        }
        body.freeze()
    }
}

#[async_trait]
impl ResponseWriter for MemoryWriter {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        let mut head = lock(&self.head);
        if head.is_none() {
            *head = Some(ResponseHead { status, headers });
        }
        Ok(())
    }

    async fn write(&self, chunk: Bytes) -> Result<usize> {
        if let Some(limit) = self.fail_after {
            if self.writes.load(Ordering::SeqCst) >= limit {
                return Err(RelayError::ClientClosed("memory writer closed".to_string()));
            }
        }

        self.write_head(StatusCode::OK, HeaderMap::new())?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let len = chunk.len();
        lock(&self.chunks).push(chunk);
        Ok(len)
    }

    fn head_written(&self) -> bool {
        lock(&self.head).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tap_forwards_and_captures() {
        let sink = MemoryWriter::new();
        let tap = ResponseTap::new(&sink, false);

        tap.write_head(StatusCode::CREATED, HeaderMap::new()).unwrap();
        tap.write(Bytes::from_static(b"{\"ok\":true}")).await.unwrap();

        assert_eq!(sink.status(), Some(StatusCode::CREATED));
        assert_eq!(sink.body(), Bytes::from_static(b"{\"ok\":true}"));

        let (_, captured) = tap.into_parts();
        assert_eq!(captured.body, Bytes::from_static(b"{\"ok\":true}"));
        assert!(!captured.is_stream);
    }

    #[tokio::test]
    async fn test_forwarding_error_comes_from_real_sink() {
        let sink = MemoryWriter::failing_after(1);
        let tap = ResponseTap::new(&sink, true);

        assert_eq!(tap.write(Bytes::from_static(b"data: a\n\n")).await.unwrap(), 9);
        let err = tap.write(Bytes::from_static(b"data: b\n\n")).await.unwrap_err();

        assert!(matches!(err, RelayError::ClientClosed(_)));
        assert_eq!(sink.body(), Bytes::from_static(b"data: a\n\n"));
    }

    #[tokio::test]
    async fn test_concurrent_stream_writes_keep_chunks_whole() {
        let sink = Arc::new(MemoryWriter::new());
        let tap = Arc::new(ResponseTap::new(sink.clone(), true));

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let tap = tap.clone();
            handles.push(tokio::spawn(async move {
                let chunk = Bytes::from(vec![b'a' + i; 64]);
                tap.write(chunk).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Whatever the order, the copy and the wire agree chunk for chunk.
        let forwarded = sink.body();
        let captured = tap.captured().body;
        assert_eq!(forwarded, captured);
        assert_eq!(captured.len(), 16 * 64);
        for block in captured.chunks(64) {
            assert!(block.iter().all(|b| *b == block[0]));
        }
    }

    #[tokio::test]
    async fn test_channel_writer_delivers_head_then_body() {
        let (writer, receiver) = response_channel(4);

        writer.write(Bytes::from_static(b"hello ")).await.unwrap();
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        assert!(writer.head_written());
        drop(writer);

        let head = receiver.head.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);

        let body: Vec<Bytes> = ChannelReceiver::into_body_stream(receiver.body)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(body.concat(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_channel_writer_reports_client_gone() {
        let (writer, receiver) = response_channel(1);
        drop(receiver);

        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, RelayError::ClientClosed(_)));
    }

    proptest! {
        #[test]
        fn prop_tap_is_transparent(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..32),
            is_stream in any::<bool>(),
        ) {
            let rt = runtime();
            let sink = MemoryWriter::new();
            let tap = ResponseTap::new(&sink, is_stream);

            rt.block_on(async {
                for chunk in &chunks {
                    tap.write(Bytes::from(chunk.clone())).await.unwrap();
                }
            });

            let expected: Vec<u8> = chunks.concat();
            let forwarded: Vec<Bytes> = sink.chunks();

            prop_assert_eq!(forwarded.len(), chunks.len());
            for (sent, seen) in chunks.iter().zip(forwarded.iter()) {
                prop_assert_eq!(sent.as_slice(), seen.as_ref());
            }
            let sink_body = sink.body();
            let captured = tap.captured();
            prop_assert_eq!(sink_body.as_ref(), expected.as_slice());
            prop_assert_eq!(captured.body.as_ref(), expected.as_slice());
        }
    }
}
