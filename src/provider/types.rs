use crate::error::GenerateError;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Chunks buffered between a backend's reader task and the consumer.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub text: String,
}

/// Lifecycle of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Sending,
    Streaming,
    Done,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Done | StreamState::Failed)
    }
}

pub type GenerateFuture =
    Pin<Box<dyn Future<Output = Result<GenerationStream, GenerateError>> + Send>>;

/// Backend interface.
///
/// One composed prompt in, one lazy sequence of text chunks out. A failure
/// either comes back from the future (nothing streamed yet) or as the last
/// item of the stream.
pub trait Provider {
    fn name(&self) -> &'static str;

    /// Start streaming a response. Cancelling `cancel` stops the reader task
    /// and closes the connection.
    fn generate(&self, prompt: String, cancel: CancellationToken) -> GenerateFuture;
}

/// Consumer side of a generation.
///
/// Single pass: it is not `Clone`, and running the prompt again means calling
/// `Provider::generate` again. Dropping it cancels the producer.
pub struct GenerationStream {
    rx: ReceiverStream<Result<ChatChunk, GenerateError>>,
    state: watch::Receiver<StreamState>,
    _cancel: DropGuard,
}

impl GenerationStream {
    /// Create a connected producer/consumer pair in the `Pending` state.
    ///
    /// The producer gets a child of `cancel`, so dropping the stream never
    /// cancels the caller's token.
    pub fn channel(cancel: &CancellationToken) -> (Producer, GenerationStream) {
        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StreamState::Pending);

        let producer = Producer {
            tx,
            state: state_tx,
            cancel: token.clone(),
        };
        let stream = GenerationStream {
            rx: ReceiverStream::new(rx),
            state: state_rx,
            _cancel: token.drop_guard(),
        };
        (producer, stream)
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }
}

impl Stream for GenerationStream {
    type Item = Result<ChatChunk, GenerateError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Producer side, owned by a backend's reader task.
#[derive(Debug)]
pub struct Producer {
    tx: mpsc::Sender<Result<ChatChunk, GenerateError>>,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
}

impl Producer {
    pub fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// Resolves once the consumer is gone or the caller cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Await `fut` unless the exchange is cancelled first. On cancellation the
    /// producer is marked abandoned and `None` comes back.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.abandon();
                None
            }
            out = fut => Some(out),
        }
    }

    /// Deliver one chunk. Returns false when nobody is listening any more.
    pub async fn send(&self, text: String) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(ChatChunk { text })) => sent.is_ok(),
        }
    }

    /// End the stream with a terminal error item.
    pub async fn fail(&self, err: GenerateError) {
        tracing::debug!(error = %err, "generation failed");
        self.set_state(StreamState::Failed);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(Err(err)) => {}
        }
    }

    /// End the stream normally.
    pub fn finish(&self) {
        self.set_state(StreamState::Done);
    }

    /// The consumer walked away; stop without reporting anything.
    pub fn abandon(&self) {
        tracing::debug!("generation abandoned by consumer; closing connection");
        self.set_state(StreamState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn delivers_chunks_in_order_then_ends() {
        let cancel = CancellationToken::new();
        let (producer, mut stream) = GenerationStream::channel(&cancel);
        assert_eq!(stream.state(), StreamState::Pending);

        tokio::spawn(async move {
            producer.set_state(StreamState::Streaming);
            for t in ["a", "b", "c"] {
                assert!(producer.send(t.to_string()).await);
            }
            producer.finish();
        });

        let mut got = Vec::new();
        while let Some(item) = stream.next().await {
            got.push(item.unwrap().text);
        }
        assert_eq!(got, ["a", "b", "c"]);
        assert_eq!(stream.state(), StreamState::Done);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_producer_only() {
        let cancel = CancellationToken::new();
        let (producer, stream) = GenerationStream::channel(&cancel);
        drop(stream);

        tokio::time::timeout(std::time::Duration::from_secs(1), producer.cancelled())
            .await
            .expect("producer should observe cancellation");
        assert!(!producer.send("late".into()).await);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn failure_is_the_last_item() {
        let cancel = CancellationToken::new();
        let (producer, mut stream) = GenerationStream::channel(&cancel);
        tokio::spawn(async move {
            producer.send("partial".into()).await;
            producer.fail(GenerateError::Backend("boom".into())).await;
        });

        assert_eq!(stream.next().await.unwrap().unwrap().text, "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(stream.state().is_terminal());
    }
}
