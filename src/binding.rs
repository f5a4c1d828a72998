//! Delivery sinks handed out by `bind` calls.

use tokio::sync::mpsc;

pub(crate) const BINDING_BUFFER: usize = 16;

/// Identifies one binding within the registry that allocated it. Pass back to
/// `unbind` to remove that specific sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub(crate) u64);

/// Receiving half of a binding.
///
/// The dispatcher delivers into each binding from its own task, so a consumer
/// that stops receiving only stalls its own deliveries.
pub struct Binding<T> {
    id: BindingId,
    rx: mpsc::Receiver<T>,
}

impl<T> Binding<T> {
    pub(crate) fn new(id: u64, rx: mpsc::Receiver<T>) -> Self {
        Self {
            id: BindingId(id),
            rx,
        }
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Receive the next delivery. Returns `None` once the binding has been
    /// removed and all pending deliveries drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Connection-wide binding carrying whole [`crate::Event`]s.
pub type EventBinding = Binding<crate::Event>;
/// Per-channel binding carrying event `data` payloads.
pub type DataBinding = Binding<serde_json::Value>;
/// Presence binding carrying [`crate::Member`]s.
pub type MemberBinding = Binding<crate::Member>;

/// Hand one item to a sink without blocking the caller.
pub(crate) fn deliver<T: Send + 'static>(tx: mpsc::Sender<T>, item: T) {
    tokio::spawn(async move {
        let _ = tx.send(item).await;
    });
}
