//! Cross-stream synchronization core.
//!
//! A single task owns all per-source state and consumes snapshots from one
//! `mpsc` channel fed by the three source connections, so every
//! read-evaluate-fire sequence is serialized without a lock.
//!
//! The trigger is a periodic barrier: it holds when every source's last
//! revision is a nonzero multiple of the period. Sources free-run at their own
//! rate; the barrier only asks that they line up on multiples of the period at
//! the same instant. Each aligned window dispatches at most one strategy
//! computation, as a detached task, so a slow endpoint never backpressures the
//! streams.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::LatestValueCache;
use crate::config::WindowPolicy;
use crate::metrics::Metrics;
use crate::presentation::{PresentationReader, PresentationState};
use crate::strategy::Strategy;
use crate::types::{CombinedPayload, Recommendation, SOURCE_COUNT, Snapshot, SourceId};

/// Period used when none is configured.
pub const DEFAULT_PERIOD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    /// Every revision must be a nonzero multiple of this. Never zero.
    pub period: u64,
    pub window: WindowPolicy,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            window: WindowPolicy::Simultaneous,
        }
    }
}

impl TriggerPolicy {
    #[must_use]
    pub fn new(period: u64, window: WindowPolicy) -> Self {
        Self {
            period: period.max(1),
            window,
        }
    }
}

/// Identity of a trigger window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKey {
    /// The shared window value: lowest `revision / period` across sources.
    Round(u64),
    /// `revision / period` per source, in [`SourceId::index`] order.
    Aligned([u64; SOURCE_COUNT]),
}

/// Per-source tracked state.
#[derive(Debug, Clone, Default)]
pub struct SourceState {
    pub last_snapshot: Option<Snapshot>,
    pub last_revision: u64,
    /// Eligible to satisfy the barrier. False before the first message and
    /// right after a revision regression.
    armed: bool,
    /// `revision / period` at the last dispatch. Cleared when the source resets.
    fired_round: Option<u64>,
}

impl SourceState {
    fn aligned(&self, period: u64) -> bool {
        self.armed && self.last_revision != 0 && self.last_revision % period == 0
    }

    fn advanced_since_fire(&self, round: u64) -> bool {
        self.fired_round.is_none_or(|fired| round > fired)
    }
}

/// Result of recording one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Advanced,
    /// Ordering anomaly: the source went backwards, most likely a restart.
    Regressed { previous: u64, revision: u64 },
}

/// One strategy computation to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub generation: u64,
    pub window: WindowKey,
    pub payload: CombinedPayload,
}

/// Outcome of evaluating the trigger predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    NotAligned,
    AlreadyFired(WindowKey),
    Fire(Dispatch),
}

/// Revision bookkeeping and window deduplication, free of I/O.
#[derive(Debug, Clone)]
pub struct Barrier {
    policy: TriggerPolicy,
    states: [SourceState; SOURCE_COUNT],
    last_fired: Option<WindowKey>,
    generation: u64,
}

impl Barrier {
    #[must_use]
    pub fn new(policy: TriggerPolicy) -> Self {
        Self {
            policy,
            states: Default::default(),
            last_fired: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    #[must_use]
    pub fn state(&self, source: SourceId) -> &SourceState {
        &self.states[source.index()]
    }

    #[must_use]
    pub fn revisions(&self) -> [u64; SOURCE_COUNT] {
        self.states.each_ref().map(|s| s.last_revision)
    }

    /// Number of dispatches so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record `snapshot` as its source's latest. Latest-wins even on
    /// regression, but a regressed source cannot satisfy the barrier until its
    /// next non-regressing update.
    pub fn observe(&mut self, snapshot: Snapshot) -> Observation {
        let state = &mut self.states[snapshot.source().index()];
        let previous = state.last_revision;
        let revision = snapshot.revision;

        let observation = if state.last_snapshot.is_some() && revision < previous {
            state.armed = false;
            state.fired_round = None;
            Observation::Regressed { previous, revision }
        } else {
            state.armed = true;
            Observation::Advanced
        };

        state.last_revision = revision;
        state.last_snapshot = Some(snapshot);
        observation
    }

    fn rounds(&self) -> Option<[u64; SOURCE_COUNT]> {
        let period = self.policy.period;
        self.states
            .iter()
            .all(|s| s.aligned(period))
            .then(|| self.states.each_ref().map(|s| s.last_revision / period))
    }

    fn window_key(&self, rounds: [u64; SOURCE_COUNT]) -> WindowKey {
        match self.policy.window {
            WindowPolicy::Simultaneous => WindowKey::Round(rounds.into_iter().min().unwrap_or(0)),
            WindowPolicy::AllAdvanced => WindowKey::Aligned(rounds),
        }
    }

    fn already_fired(&self, window: WindowKey, rounds: [u64; SOURCE_COUNT]) -> bool {
        match self.policy.window {
            WindowPolicy::Simultaneous => self.last_fired == Some(window),
            WindowPolicy::AllAdvanced => !self
                .states
                .iter()
                .zip(rounds)
                .all(|(s, round)| s.advanced_since_fire(round)),
        }
    }

    /// Evaluate the predicate. On [`Trigger::Fire`] the window is recorded as
    /// fired and the generation advanced, so calling again returns
    /// [`Trigger::AlreadyFired`] until the window moves on.
    pub fn poll(&mut self) -> Trigger {
        let Some(rounds) = self.rounds() else {
            return Trigger::NotAligned;
        };
        let window = self.window_key(rounds);
        if self.already_fired(window, rounds) {
            return Trigger::AlreadyFired(window);
        }

        let latest = self.states.each_ref().map(|s| s.last_snapshot.clone());
        let Some(payload) = CombinedPayload::assemble(&latest) else {
            return Trigger::NotAligned;
        };

        self.last_fired = Some(window);
        for (state, round) in self.states.iter_mut().zip(rounds) {
            state.fired_round = Some(round);
        }
        self.generation += 1;
        Trigger::Fire(Dispatch {
            generation: self.generation,
            window,
            payload,
        })
    }
}

/// Owns the barrier and fans updates out to the cache, the presentation state
/// and the strategy computation.
pub struct Aggregator<S> {
    barrier: Barrier,
    cache: Arc<LatestValueCache>,
    presentation: PresentationState,
    strategy: Arc<S>,
    metrics: Arc<Metrics>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<S: Strategy> Aggregator<S> {
    pub fn new(
        policy: TriggerPolicy,
        cache: Arc<LatestValueCache>,
        strategy: S,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            barrier: Barrier::new(policy),
            cache,
            presentation: PresentationState::new(),
            strategy: Arc::new(strategy),
            metrics,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Read access for the display layer.
    #[must_use]
    pub fn presentation(&self) -> PresentationReader {
        self.presentation.reader()
    }

    /// Tracker of in-flight strategy computations, for bounded shutdown.
    #[must_use]
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    #[must_use]
    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Seed the presentation state with the cached values from a previous
    /// run. Revisions are not cached, so this never arms the barrier.
    pub fn restore_from_cache(&self) -> usize {
        let mut restored = 0;
        for entities in self.cache.load_all() {
            let source = entities.source();
            if self.presentation.restore(entities) {
                debug!(source = source.as_str(), "restored from cache");
                restored += 1;
            }
        }
        info!(restored, "presentation state restored from cache");
        restored
    }

    /// Process one snapshot. Returns the generation of the strategy
    /// computation it dispatched, if any.
    pub fn ingest(&mut self, snapshot: Snapshot) -> Option<u64> {
        let source = snapshot.source().as_str();
        let revision = snapshot.revision;
        self.metrics.ingests.fetch_add(1, Relaxed);

        // Display and cache always reflect the newest value, whatever the
        // trigger state.
        if let Err(e) = self.cache.store(&snapshot.entities) {
            self.metrics.cache_errors.fetch_add(1, Relaxed);
            warn!(source, error = %e, "cache write failed");
        }
        self.presentation.publish(snapshot.clone());

        if let Observation::Regressed { previous, revision } = self.barrier.observe(snapshot) {
            self.metrics.ordering_anomalies.fetch_add(1, Relaxed);
            warn!(source, previous, revision, "revision regressed, treating as source reset");
        }

        match self.barrier.poll() {
            Trigger::NotAligned => {
                debug!(source, revision, revisions = ?self.barrier.revisions(), "barrier not aligned");
                None
            }
            Trigger::AlreadyFired(window) => {
                debug!(source, revision, ?window, "window already fired");
                None
            }
            Trigger::Fire(dispatch) => {
                let generation = dispatch.generation;
                self.metrics.triggers.fetch_add(1, Relaxed);
                info!(
                    generation,
                    window = ?dispatch.window,
                    revisions = ?self.barrier.revisions(),
                    "barrier aligned, dispatching strategy"
                );
                self.dispatch(dispatch);
                Some(generation)
            }
        }
    }

    /// Run the computation as a detached task. Its result is applied only if
    /// no newer generation has landed and shutdown has not begun.
    fn dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            generation,
            payload,
            ..
        } = dispatch;
        let strategy = Arc::clone(&self.strategy);
        let presentation = self.presentation.clone();
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let t0 = Instant::now();
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    metrics.strategy_discarded.fetch_add(1, Relaxed);
                    info!(generation, "shutting down, strategy computation abandoned");
                    return;
                }
                r = strategy.compute(payload) => r,
            };
            metrics.strategy_latency.record(t0.elapsed());

            match result {
                Ok(text) => {
                    metrics.strategy_ok.fetch_add(1, Relaxed);
                    if cancel.is_cancelled() {
                        metrics.strategy_discarded.fetch_add(1, Relaxed);
                        info!(generation, "strategy arrived after shutdown, discarded");
                    } else if presentation.apply_recommendation(Recommendation { text, generation }) {
                        info!(generation, "strategy updated");
                    } else {
                        metrics.strategy_discarded.fetch_add(1, Relaxed);
                        debug!(generation, "newer strategy already applied, discarded");
                    }
                }
                Err(e) => {
                    metrics.strategy_failures.fetch_add(1, Relaxed);
                    error!(
                        generation,
                        error = %e,
                        transport = e.is_transport(),
                        "strategy computation failed, keeping previous recommendation"
                    );
                }
            }
        });
    }

    /// Consume snapshots until every source has closed or shutdown begins.
    /// Closes the tracker on exit so callers can wait for in-flight work.
    pub async fn run(mut self, mut updates: mpsc::Receiver<Snapshot>) {
        let policy = self.barrier.policy();
        info!(period = policy.period, window = ?policy.window, "aggregator started");

        loop {
            let snapshot = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("aggregator cancelled");
                    break;
                }
                next = updates.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => {
                        info!("all sources closed, aggregator exiting");
                        break;
                    }
                },
            };
            self.ingest(snapshot);
        }

        self.tracker.close();
    }
}
