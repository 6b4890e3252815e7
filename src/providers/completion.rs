//! Completion provider contract with synchronous and streaming variants.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::RagError;

/// A finite sequence of text deltas produced by one completion call.
///
/// The channel closing marks end of stream; a receiver that is dropped early
/// cancels the turn from the producer's perspective (sends start failing).
pub type DeltaStream = flume::Receiver<Result<String, RagError>>;

/// Prompt-to-text generation.
///
/// Only transport or auth failures should surface as errors; an "I don't
/// know" style answer is still a successful completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Produce the full response text for a prompt.
    async fn complete(&self, prompt: &str) -> Result<String, RagError>;

    /// Produce the response as a stream of text deltas.
    ///
    /// The default implementation falls back to [`complete`](Self::complete)
    /// and yields the whole response as a single delta, for providers without
    /// a native streaming API.
    async fn complete_stream(&self, prompt: &str) -> Result<DeltaStream, RagError> {
        let text = self.complete(prompt).await?;
        let (tx, rx) = flume::unbounded();
        let _ = tx.send(Ok(text));
        Ok(rx)
    }
}

/// Scripted completion provider for tests and offline demos.
///
/// Records every prompt it receives so tests can assert on the context that
/// was assembled, and streams its canned response word by word.
#[derive(Debug, Default)]
pub struct MockCompletionProvider {
    response: String,
    prompts: Mutex<Vec<String>>,
}

impl MockCompletionProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// The most recent prompt, if any call was made.
    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn complete(&self, prompt: &str) -> Result<String, RagError> {
        self.prompts.lock().push(prompt.to_string());
        Ok(self.response.clone())
    }

    async fn complete_stream(&self, prompt: &str) -> Result<DeltaStream, RagError> {
        self.prompts.lock().push(prompt.to_string());
        let (tx, rx) = flume::bounded(8);
        let words: Vec<String> = self
            .response
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        tokio::spawn(async move {
            for word in words {
                if tx.send_async(Ok(word)).await.is_err() {
                    // Receiver dropped: the turn was cancelled.
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_prompts_and_streams_words() {
        let provider = MockCompletionProvider::new("one two three");
        let stream = provider.complete_stream("a prompt").await.unwrap();

        let mut assembled = String::new();
        while let Ok(delta) = stream.recv_async().await {
            assembled.push_str(&delta.unwrap());
        }
        assert_eq!(assembled, "one two three");
        assert_eq!(provider.prompts(), vec!["a prompt".to_string()]);
    }

    #[tokio::test]
    async fn default_stream_yields_single_delta() {
        struct OneShot;

        #[async_trait]
        impl CompletionProvider for OneShot {
            async fn complete(&self, _prompt: &str) -> Result<String, RagError> {
                Ok("whole answer".to_string())
            }
        }

        let stream = OneShot.complete_stream("q").await.unwrap();
        let deltas: Vec<_> = stream.into_iter().collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].as_ref().unwrap(), "whole answer");
    }
}
