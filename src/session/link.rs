use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::EncodedFrame;
use crate::transport::{EventStream, FrameSink, LinkEvent};

/// The two tasks driving a connected session: one forwards inbound events,
/// the other drains the outbound frame queue into the sink.
pub struct LinkHandle {
    cancel: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// `notify` sees every inbound event, plus a `Failed` event when sending
    /// breaks. After a `Closed` or `Failed` event nothing more is reported.
    pub fn spawn<S, E, F>(
        mut sink: S,
        mut events: E,
        mut frames: mpsc::Receiver<EncodedFrame>,
        notify: F,
    ) -> Self
    where
        S: FrameSink,
        E: EventStream,
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        let notify = Arc::new(notify);
        let (cancel, mut cancelled) = watch::channel(false);

        let reader_notify = Arc::clone(&notify);
        let reader = tokio::spawn(async move {
            while let Some(event) = events.next_event().await {
                let finished = matches!(event, LinkEvent::Closed(_) | LinkEvent::Failed(_));
                reader_notify(event);
                if finished {
                    return;
                }
            }
            reader_notify(LinkEvent::Closed(None));
        });

        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        if let Err(e) = sink.send(frame).await {
                            notify(LinkEvent::Failed(e.to_string()));
                            break;
                        }
                    }
                    _ = cancelled.changed() => {
                        tracing::debug!("link sender cancelled");
                        break;
                    }
                }
            }

            if let Err(e) = sink.close().await {
                tracing::debug!("closing link: {e}");
            }
        });

        Self {
            cancel,
            reader: Some(reader),
            sender: Some(sender),
        }
    }

    /// Stop both tasks. The sender closes the sink on its way out.
    pub fn close(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.sender.take().is_some() {
            let _ = self.cancel.send(true);
            tracing::debug!("link closed");
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.halt();
    }
}
