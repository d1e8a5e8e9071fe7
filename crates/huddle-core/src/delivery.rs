//! Delivery bus for Huddle.
//!
//! The command handler never writes to sockets. It pushes [`Delivery`]
//! values onto a [`DeliveryBus`]; a single [`DeliveryWorker`] drains the
//! queue, resolves targets, and performs every write and close. Because it
//! is the only writer, frames for one connection are never interleaved.

use crate::connection::ConnectionRegistry;
use crate::store::EntityStore;
use bytes::Bytes;
use huddle_transport::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Who a delivery is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One connection.
    Connection(ConnectionId),
    /// Every current member of a room.
    Room(String),
    /// Every registered connection.
    All,
}

impl Target {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Connection(_) => "connection",
            Target::Room(_) => "room",
            Target::All => "all",
        }
    }
}

/// An already-encoded server event and where to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: Target,
    pub payload: Bytes,
}

impl Delivery {
    /// Address a payload to one connection.
    #[must_use]
    pub fn to_connection(id: ConnectionId, payload: impl Into<Bytes>) -> Self {
        Self {
            target: Target::Connection(id),
            payload: payload.into(),
        }
    }

    /// Address a payload to every member of a room.
    #[must_use]
    pub fn to_room(room: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            target: Target::Room(room.into()),
            payload: payload.into(),
        }
    }

    /// Address a payload to every connection.
    #[must_use]
    pub fn to_all(payload: impl Into<Bytes>) -> Self {
        Self {
            target: Target::All,
            payload: payload.into(),
        }
    }
}

#[derive(Debug)]
enum BusMessage {
    Deliver(Delivery),
    Disconnect(ConnectionId),
}

/// Producer handle for the delivery queue.
#[derive(Debug, Clone)]
pub struct DeliveryBus {
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Consumer end of the delivery queue, handed to the [`DeliveryWorker`].
#[derive(Debug)]
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl DeliveryBus {
    /// Create a bus and its queue.
    #[must_use]
    pub fn new() -> (Self, DeliveryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DeliveryQueue { rx })
    }

    /// Queue a delivery.
    ///
    /// Returns `false` if the worker has shut down.
    pub fn publish(&self, delivery: Delivery) -> bool {
        trace!(target_kind = delivery.target.kind(), "Queueing delivery");
        self.tx.send(BusMessage::Deliver(delivery)).is_ok()
    }

    /// Queue the teardown of a connection.
    ///
    /// The worker processes it after everything already queued, so a final
    /// error reported to the connection is still written before it closes.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.tx.send(BusMessage::Disconnect(id)).is_ok()
    }
}

#[cfg(test)]
impl DeliveryQueue {
    /// Drain queued deliveries without a worker.
    pub(crate) fn take_all(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            if let BusMessage::Deliver(delivery) = message {
                out.push(delivery);
            }
        }
        out
    }
}

/// Outcome of dispatching one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    /// Target kind, see [`Target::kind`].
    pub kind: &'static str,
    /// Connections the target resolved to.
    pub recipients: usize,
    /// Successful writes.
    pub delivered: usize,
    /// Failed writes; those connections were closed.
    pub failed: usize,
    /// Recipients with no registered connection.
    pub skipped: usize,
}

enum WriteOutcome {
    Delivered,
    Failed,
    Skipped,
}

/// The single consumer of the delivery queue.
pub struct DeliveryWorker {
    queue: DeliveryQueue,
    store: Arc<EntityStore>,
    registry: Arc<ConnectionRegistry>,
}

impl DeliveryWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        queue: DeliveryQueue,
        store: Arc<EntityStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
        }
    }

    /// Drain the queue until every [`DeliveryBus`] handle is dropped.
    pub async fn run(self) {
        self.run_with(|_| {}).await;
    }

    /// Like [`run`](Self::run), reporting each dispatched delivery.
    pub async fn run_with(mut self, mut observe: impl FnMut(&DeliveryReport) + Send) {
        debug!("Delivery worker started");

        while let Some(message) = self.queue.rx.recv().await {
            match message {
                BusMessage::Deliver(delivery) => {
                    let report = self.dispatch(delivery).await;
                    observe(&report);
                }
                BusMessage::Disconnect(id) => self.disconnect(id).await,
            }
        }

        debug!("Delivery worker stopped");
    }

    /// Resolve a delivery's target and write to each recipient.
    pub async fn dispatch(&self, delivery: Delivery) -> DeliveryReport {
        let Delivery { target, payload } = delivery;
        let mut report = DeliveryReport {
            kind: target.kind(),
            ..DeliveryReport::default()
        };

        let recipients = match &target {
            Target::Connection(id) => vec![*id],
            Target::Room(name) => {
                // Resolve under the lock, write after releasing it
                let connections = self.store.lock().room(name).map(|room| room.connections());
                match connections {
                    Ok(connections) => connections,
                    Err(_) => {
                        warn!(room = %name, "Dropping delivery to missing room");
                        return report;
                    }
                }
            }
            Target::All => self.registry.ids(),
        };

        report.recipients = recipients.len();
        for id in recipients {
            match self.write(id, payload.clone()).await {
                WriteOutcome::Delivered => report.delivered += 1,
                WriteOutcome::Failed => report.failed += 1,
                WriteOutcome::Skipped => report.skipped += 1,
            }
        }

        trace!(
            target_kind = report.kind,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Delivery dispatched"
        );
        report
    }

    async fn write(&self, id: ConnectionId, payload: Bytes) -> WriteOutcome {
        let Some(sink) = self.registry.get(id) else {
            trace!(connection = %id, "No live connection, skipping");
            return WriteOutcome::Skipped;
        };

        match sink.send(payload).await {
            Ok(()) => WriteOutcome::Delivered,
            Err(e) => {
                warn!(connection = %id, error = %e, "Write failed, closing connection");
                self.registry.deregister(id);
                if let Err(e) = sink.close().await {
                    debug!(connection = %id, error = %e, "Close after failed write");
                }
                WriteOutcome::Failed
            }
        }
    }

    async fn disconnect(&self, id: ConnectionId) {
        if let Some(sink) = self.registry.deregister(id) {
            if let Err(e) = sink.close().await {
                debug!(connection = %id, error = %e, "Close on disconnect");
            }
        }
    }
}
