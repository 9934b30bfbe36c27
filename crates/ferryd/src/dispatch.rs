//! Routes envelopes between the servers running in this process.

use std::sync::Arc;

use dashmap::DashMap;
use ferry_core::{Envelope, ServerId};
use tokio::sync::{broadcast, mpsc};

/// Maps server ids to their inboxes.
#[derive(Clone, Default)]
pub struct FleetRouter {
    routes: Arc<DashMap<ServerId, mpsc::UnboundedSender<Envelope>>>,
}

impl FleetRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `server` an inbox. Replaces any earlier registration.
    pub fn register(&self, server: ServerId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(server, tx);
        rx
    }

    /// Deliver one envelope. Returns false if it was dropped.
    pub fn route(&self, envelope: Envelope) -> bool {
        let to = envelope.to;
        let Some(inbox) = self.routes.get(&to) else {
            tracing::debug!(to = %to, from = %envelope.from, kind = envelope.message.kind(), "no route, dropped");
            return false;
        };
        if inbox.send(envelope).is_err() {
            tracing::debug!(to = %to, "inbox closed, dropped");
            return false;
        }
        true
    }

    /// Forward everything from the shared outbound channel until shutdown.
    pub async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut routed: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => {
                        if self.route(envelope) {
                            routed += 1;
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::info!(routed, "router stopped");
    }
}
