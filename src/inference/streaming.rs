//! Streaming inference support
//!
//! Chunks produced on the worker reach the caller through a channel of
//! capacity one, so the worker waits for the consumer between chunks.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::Receiver;

use crate::inference::engine::{EngineError, InferenceEngine, Job};

/// Represents a message emitted during streaming inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// A generated chunk of text
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed
    Error(EngineError),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if this token ends the stream
    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }
}

/// Lazy, finite, non-restartable sequence of generated text.
///
/// The generation is submitted to the worker on the first poll. Dropping the
/// stream cancels it.
pub struct TokenStream<'a> {
    pending: Option<(&'a InferenceEngine, Job)>,
    token_rx: Receiver<StreamToken>,
    finished: bool,
}

impl<'a> TokenStream<'a> {
    pub(crate) fn new(engine: &'a InferenceEngine, job: Job, token_rx: Receiver<StreamToken>) -> Self {
        Self {
            pending: Some((engine, job)),
            token_rx,
            finished: false,
        }
    }

    /// Drains the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, EngineError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for TokenStream<'_> {
    type Item = Result<String, EngineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some((engine, job)) = this.pending.take() {
            if let Err(e) = engine.dispatch(job) {
                this.finished = true;
                return Poll::Ready(Some(Err(e)));
            }
        }

        let token = match this.token_rx.poll_recv(cx) {
            Poll::Ready(token) => token,
            Poll::Pending => return Poll::Pending,
        };

        let item = match token {
            Some(StreamToken::Token(text)) => return Poll::Ready(Some(Ok(text))),
            Some(StreamToken::Done) => None,
            Some(StreamToken::Error(e)) => Some(Err(e)),
            None => Some(Err(EngineError::WorkerUnavailable(
                "worker stopped mid-generation".to_string(),
            ))),
        };
        this.finished = true;
        Poll::Ready(item)
    }
}
