//! Event sources feeding the engine.

use async_trait::async_trait;
use studyphase_core::TemplateCompletionEvent;
use tokio::sync::mpsc;

/// Delivers completion events from wherever they are transported.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<TemplateCompletionEvent>;
}

/// Source backed by a bounded channel.
pub struct ChannelEventSource {
    rx: mpsc::Receiver<TemplateCompletionEvent>,
}

impl ChannelEventSource {
    /// Create a source and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<TemplateCompletionEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Option<TemplateCompletionEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelEventSource::channel(4);
        tx.send(TemplateCompletionEvent::new("p1", "scr", "consent", true))
            .await
            .unwrap();
        drop(tx);

        let event = source.next_event().await.unwrap();
        assert_eq!(event.template_id.as_str(), "consent");
        assert!(source.next_event().await.is_none());
    }
}
