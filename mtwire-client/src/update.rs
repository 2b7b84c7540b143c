//! Server-initiated objects that do not answer any pending call.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;

/// An object pushed by the server outside of any `rpc_result`.
///
/// The client does not interpret application-level schemas, so the object
/// is handed over as raw TL bytes together with its constructor id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    /// Server msg_id of the message that carried the object.
    pub msg_id: i64,
    /// Leading constructor id of [`Update::body`].
    pub constructor_id: u32,
    /// The serialized object, after container and gzip unwrapping.
    pub body: Vec<u8>,
}

/// Receives [`Update`]s from the driver task.
///
/// `deliver` runs on the driver task and must not block.
pub trait UpdateSink: Send + Sync {
    /// Handle one update.
    fn deliver(&self, update: Update);

    /// True once the sink can take no more updates. Closed sinks are
    /// unregistered.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F: Fn(Update) + Send + Sync> UpdateSink for F {
    fn deliver(&self, update: Update) {
        self(update)
    }
}

/// Sink half of [`UpdateStream`].
pub(crate) struct ChannelSink(pub(crate) mpsc::UnboundedSender<Update>);

impl UpdateSink for ChannelSink {
    fn deliver(&self, update: Update) {
        if self.0.send(update).is_err() {
            tracing::trace!("[dispatch] update stream dropped, discarding update");
        }
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Async stream of updates returned by [`crate::Client::stream_updates`].
///
/// Ends after [`crate::Client::stop`].
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Update>,
}

impl UpdateStream {
    pub(crate) fn channel() -> (ChannelSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink(tx), Self { rx })
    }

    /// Wait for the next update.
    pub async fn next(&mut self) -> Option<Update> {
        self.rx.recv().await
    }
}

impl futures::Stream for UpdateStream {
    type Item = Update;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Update>> {
        self.rx.poll_recv(cx)
    }
}
