use crossbeam_channel::{Receiver, Sender};

use super::outbound::ServerEvent;

/// Outbound path to one connected client.
///
/// `emit` must not block on the network: workers call it while holding the
/// session lock.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServerEvent);

    /// Asks the transport to drop the connection. Default: no-op.
    fn close(&self) {}
}

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Sink that forwards events into an unbounded channel drained by a writer
/// thread (or by a test).
pub struct ChannelSink {
    sender: Sender<ServerEvent>,
    on_close: Option<CloseHook>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<ServerEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                sender,
                on_close: None,
            },
            receiver,
        )
    }

    pub fn with_close_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ServerEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Dropping event for closed connection");
        }
    }

    fn close(&self) {
        if let Some(hook) = &self.on_close {
            hook();
        }
    }
}
