//! Process-wide latest values for the display layer.
//!
//! One `watch` channel per source plus one for the recommendation, so writes
//! to different keys never contend. Only the aggregator holds the writing
//! [`PresentationState`]; the display layer gets a [`PresentationReader`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::types::{EntityValues, Recommendation, SOURCE_COUNT, Snapshot, SourceId};

struct Channels {
    snapshots: [watch::Sender<Option<Snapshot>>; SOURCE_COUNT],
    recommendation: watch::Sender<Option<Recommendation>>,
}

/// Writing half. Cheap to clone.
#[derive(Clone)]
pub struct PresentationState {
    channels: Arc<Channels>,
}

/// Read-only half handed to the display layer.
#[derive(Clone)]
pub struct PresentationReader {
    channels: Arc<Channels>,
}

/// JSON view served on `/api/state`.
#[derive(Debug, Clone, Serialize)]
pub struct PresentationView {
    pub overtake: Option<EntityValues>,
    pub tire_cliff: Option<EntityValues>,
    pub undercut: Option<EntityValues>,
    pub strategy: Option<Recommendation>,
}

impl Default for PresentationState {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Channels {
                snapshots: std::array::from_fn(|_| watch::Sender::new(None)),
                recommendation: watch::Sender::new(None),
            }),
        }
    }

    #[must_use]
    pub fn reader(&self) -> PresentationReader {
        PresentationReader {
            channels: Arc::clone(&self.channels),
        }
    }

    /// Latest-wins: always replaces the source's snapshot.
    pub(crate) fn publish(&self, snapshot: Snapshot) {
        self.channels.snapshots[snapshot.source().index()].send_replace(Some(snapshot));
    }

    /// Seed a source from the cache. Never overwrites a live value. Restored
    /// snapshots carry revision 0.
    pub(crate) fn restore(&self, entities: EntityValues) -> bool {
        let slot = &self.channels.snapshots[entities.source().index()];
        slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Snapshot {
                entities,
                revision: 0,
            });
            true
        })
    }

    /// Replace the recommendation unless a newer generation already landed.
    pub(crate) fn apply_recommendation(&self, recommendation: Recommendation) -> bool {
        self.channels.recommendation.send_if_modified(|current| {
            if current
                .as_ref()
                .is_some_and(|c| c.generation >= recommendation.generation)
            {
                return false;
            }
            *current = Some(recommendation);
            true
        })
    }
}

impl PresentationReader {
    #[must_use]
    pub fn latest(&self, source: SourceId) -> Option<Snapshot> {
        self.channels.snapshots[source.index()].borrow().clone()
    }

    #[must_use]
    pub fn recommendation(&self) -> Option<Recommendation> {
        self.channels.recommendation.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self, source: SourceId) -> watch::Receiver<Option<Snapshot>> {
        self.channels.snapshots[source.index()].subscribe()
    }

    #[must_use]
    pub fn subscribe_recommendation(&self) -> watch::Receiver<Option<Recommendation>> {
        self.channels.recommendation.subscribe()
    }

    #[must_use]
    pub fn view(&self) -> PresentationView {
        let entities = |source| self.latest(source).map(|s| s.entities);
        PresentationView {
            overtake: entities(SourceId::Overtake),
            tire_cliff: entities(SourceId::TireCliff),
            undercut: entities(SourceId::Undercut),
            strategy: self.recommendation(),
        }
    }
}
