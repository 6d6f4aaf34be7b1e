//! Presence registry
//!
//! Maps logical [`Identity`] addresses to the set of live connections that
//! joined them. A user may be connected from several devices and a
//! connection may join several identities (its personal one plus a
//! role-wide broadcast address), so both directions are kept: identity to
//! connections for dispatch, connection to identities for O(1) disconnect.
//!
//! Both maps are `DashMap`s, so dispatches to unrelated identities never
//! contend on a shared lock.

use crate::ConnId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use telecare_rtc_core::signaling::ServerEvent;
use telecare_rtc_core::Identity;
use thiserror::Error;
use tracing::{debug, trace};

/// Delivery failure on one connection
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// The connection is gone
    #[error("connection closed")]
    Closed,

    /// The transport reported an error
    #[error("delivery failed: {0}")]
    Send(String),
}

/// Outbound half of one client connection
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Deliver one event to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection can no longer carry events; the
    /// registry treats that as a skipped delivery, not a relay failure.
    async fn deliver(&self, event: ServerEvent) -> Result<(), DeliveryError>;
}

/// Identity-to-connections registry
pub struct PresenceRegistry<C: ConnectionSink> {
    rooms: DashMap<Identity, HashMap<ConnId, Arc<C>>>,
    joined: DashMap<ConnId, HashSet<Identity>>,
}

impl<C: ConnectionSink> PresenceRegistry<C> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    /// Register `conn_id` under `identity`. Idempotent; joining again with
    /// the same connection replaces the sink.
    pub fn join(&self, conn_id: ConnId, identity: Identity, sink: Arc<C>) {
        self.rooms
            .entry(identity.clone())
            .or_default()
            .insert(conn_id, sink);
        self.joined
            .entry(conn_id)
            .or_default()
            .insert(identity.clone());
        debug!(%conn_id, %identity, "connection joined");
    }

    /// Fan `event` out to every connection joined under `identity`,
    /// returning how many deliveries succeeded.
    ///
    /// An identity with no connections is a silent no-op returning 0.
    pub async fn dispatch(&self, identity: &Identity, event: ServerEvent) -> usize {
        let sinks: Vec<Arc<C>> = match self.rooms.get(identity) {
            Some(conns) => conns.values().cloned().collect(),
            None => Vec::new(),
        };
        if sinks.is_empty() {
            trace!(%identity, "dispatch to empty identity");
            return 0;
        }

        let deliveries = sinks.iter().map(|sink| sink.deliver(event.clone()));
        let results = futures::future::join_all(deliveries).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            debug!(%identity, error = %err, "delivery skipped");
        }
        trace!(%identity, delivered, of = sinks.len(), "dispatched");
        delivered
    }

    /// Remove `conn_id` from every identity it joined.
    ///
    /// After this returns no dispatch can reach the connection; identities
    /// left with no connections are dropped from the registry.
    pub fn disconnect(&self, conn_id: ConnId) {
        let Some((_, identities)) = self.joined.remove(&conn_id) else {
            return;
        };
        for identity in identities {
            if let Some(mut conns) = self.rooms.get_mut(&identity) {
                conns.remove(&conn_id);
                let empty = conns.is_empty();
                drop(conns);
                if empty {
                    self.rooms.remove_if(&identity, |_, conns| conns.is_empty());
                }
            }
        }
        debug!(%conn_id, "connection removed");
    }

    /// Number of connections currently joined under `identity`
    #[must_use]
    pub fn connections(&self, identity: &Identity) -> usize {
        self.rooms.get(identity).map_or(0, |conns| conns.len())
    }

    /// Number of identities with at least one connection
    #[must_use]
    pub fn identities(&self) -> usize {
        self.rooms.len()
    }
}

impl<C: ConnectionSink> Default for PresenceRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ConnectionSink> std::fmt::Debug for PresenceRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("identities", &self.rooms.len())
            .field("connections", &self.joined.len())
            .finish()
    }
}
