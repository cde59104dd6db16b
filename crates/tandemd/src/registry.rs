use crate::metrics::{counters, gauges};
use crate::ratelimit::RateLimiter;
use crate::store::{Snapshot, SnapshotStore};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tandem_common::{ParticipantId, Status};
use tracing::{debug, warn};

/// Outcome of [`MatchRegistry::rotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Partner the caller just left, now Idle and due a notice.
    pub previous: Option<ParticipantId>,
    /// New partner, or `None` if the caller is now waiting.
    pub next: Option<ParticipantId>,
}

/// Where a message from a participant may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget {
    /// Sender has no partner.
    NotPaired,
    /// Sender is paired but inside the cooldown window.
    Throttled,
    /// Relay to this partner.
    Partner(ParticipantId),
}

/// Point-in-time counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Participants in the waiting queue.
    pub waiting: usize,
    /// Active pairs.
    pub sessions: usize,
}

struct Inner {
    queue: VecDeque<ParticipantId>,
    sessions: HashMap<ParticipantId, ParticipantId>,
    limiter: RateLimiter,
}

impl Inner {
    /// Caller must already have checked that `id` is not paired.
    fn enqueue_or_pair(&mut self, id: ParticipantId) -> Option<ParticipantId> {
        self.dequeue(id);
        match self.queue.pop_front() {
            Some(other) => {
                self.sessions.insert(id, other);
                self.sessions.insert(other, id);
                Some(other)
            }
            None => {
                self.queue.push_back(id);
                None
            }
        }
    }

    fn unpair(&mut self, id: ParticipantId) -> Option<ParticipantId> {
        let partner = self.sessions.remove(&id)?;
        self.sessions.remove(&partner);
        self.limiter.forget(id);
        self.limiter.forget(partner);
        Some(partner)
    }

    fn dequeue(&mut self, id: ParticipantId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|waiting| *waiting != id);
        self.queue.len() != before
    }

    fn status_of(&self, id: ParticipantId) -> Status {
        if self.sessions.contains_key(&id) {
            Status::Paired
        } else if self.queue.contains(&id) {
            Status::Waiting
        } else {
            Status::Idle
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            queue: self.queue.iter().copied().collect(),
            sessions: self.sessions.iter().map(|(a, b)| (*a, *b)).collect(),
        }
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            waiting: self.queue.len(),
            sessions: self.sessions.len() / 2,
        }
    }
}

/// Waiting queue, session directory and rate-limit clock behind one lock.
///
/// Every operation takes the lock once, so no caller can observe a half-made
/// pair or a participant that is both waiting and paired. Mutations write a
/// full snapshot while still holding the lock, which keeps on-disk snapshots
/// in mutation order. A failed write is logged and counted; the in-memory
/// state stays authoritative.
pub struct MatchRegistry {
    inner: Mutex<Inner>,
    store: Option<SnapshotStore>,
}

impl MatchRegistry {
    /// Registry with no persistence.
    #[must_use]
    pub fn in_memory(cooldown: Duration) -> Self {
        Self::from_snapshot(Snapshot::default(), cooldown, None)
    }

    /// Registry restored from `store`, persisting back to it.
    #[must_use]
    pub fn open(store: SnapshotStore, cooldown: Duration) -> Self {
        let snapshot = store.load();
        debug!(
            waiting = snapshot.queue.len(),
            sessions = snapshot.sessions.len() / 2,
            "restored registry state"
        );
        Self::from_snapshot(snapshot, cooldown, Some(store))
    }

    /// Registry seeded from `snapshot`, which is sanitized first.
    #[must_use]
    pub fn from_snapshot(
        mut snapshot: Snapshot,
        cooldown: Duration,
        store: Option<SnapshotStore>,
    ) -> Self {
        snapshot.sanitize();
        let inner = Inner {
            queue: snapshot.queue.into_iter().collect(),
            sessions: snapshot.sessions.into_iter().collect(),
            limiter: RateLimiter::new(cooldown),
        };
        publish_gauges(&inner);
        Self {
            inner: Mutex::new(inner),
            store,
        }
    }

    /// Pair `id` with the longest-waiting participant, or queue it.
    ///
    /// Returns the partner if `id` is (now or already) paired. An already
    /// paired caller is left untouched.
    pub fn request_match(&self, id: ParticipantId) -> Option<ParticipantId> {
        let mut inner = self.lock();
        if let Some(partner) = inner.sessions.get(&id) {
            return Some(*partner);
        }
        let partner = inner.enqueue_or_pair(id);
        if partner.is_some() {
            counters::matches_total();
        }
        self.persist(&inner);
        partner
    }

    /// Leave the current session or the queue.
    ///
    /// Returns the former partner, who is now Idle. Idempotent.
    pub fn end_session(&self, id: ParticipantId) -> Option<ParticipantId> {
        let mut inner = self.lock();
        if let Some(partner) = inner.unpair(id) {
            counters::sessions_ended_total("stop");
            self.persist(&inner);
            return Some(partner);
        }
        if inner.dequeue(id) {
            self.persist(&inner);
        }
        None
    }

    /// Leave the current partner (if any) and immediately look for another.
    ///
    /// Both steps happen under one lock hold with one snapshot write. The
    /// previous partner is never re-matched with the caller here because it
    /// is left Idle rather than queued.
    pub fn rotate(&self, id: ParticipantId) -> Rotation {
        let mut inner = self.lock();
        let previous = inner.unpair(id);
        if previous.is_some() {
            counters::sessions_ended_total("next");
        }
        let next = inner.enqueue_or_pair(id);
        if next.is_some() {
            counters::matches_total();
        }
        self.persist(&inner);
        Rotation { previous, next }
    }

    /// Current state of `id`.
    #[must_use]
    pub fn status_of(&self, id: ParticipantId) -> Status {
        self.lock().status_of(id)
    }

    /// Current partner of `id`, if paired.
    #[must_use]
    pub fn partner_of(&self, id: ParticipantId) -> Option<ParticipantId> {
        self.lock().sessions.get(&id).copied()
    }

    /// Resolve where a message from `id` goes, consuming a rate-limit slot.
    pub fn relay_target(&self, id: ParticipantId) -> RelayTarget {
        self.relay_target_at(id, Instant::now())
    }

    /// [`relay_target`](Self::relay_target) with an explicit clock reading.
    ///
    /// The clock is only consulted for paired senders.
    pub fn relay_target_at(&self, id: ParticipantId, now: Instant) -> RelayTarget {
        let mut inner = self.lock();
        let Some(partner) = inner.sessions.get(&id).copied() else {
            return RelayTarget::NotPaired;
        };
        if inner.limiter.allow(id, now) {
            RelayTarget::Partner(partner)
        } else {
            RelayTarget::Throttled
        }
    }

    /// Drop every session, waiter and rate-limit entry, and delete the
    /// snapshot file. Returns the state that was discarded.
    pub fn clear(&self) -> RegistryStats {
        let mut inner = self.lock();
        let discarded = inner.stats();
        inner.queue.clear();
        inner.sessions.clear();
        inner.limiter.clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.remove() {
                warn!(path = %store.path().display(), error = %e, "failed to remove snapshot");
                counters::snapshot_failures_total();
            }
        }
        publish_gauges(&inner);
        discarded
    }

    /// Copy of the persisted portion of the state.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    /// Queue length and pair count.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.lock().stats()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("registry lock poisoned, using recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn persist(&self, inner: &Inner) {
        publish_gauges(inner);
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&inner.snapshot()) {
            warn!(path = %store.path().display(), error = %e, "failed to save snapshot");
            counters::snapshot_failures_total();
        }
    }
}

fn publish_gauges(inner: &Inner) {
    let stats = inner.stats();
    gauges::set_queue_len(stats.waiting);
    gauges::set_sessions_active(stats.sessions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::DEFAULT_COOLDOWN;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn id(n: i64) -> ParticipantId {
        ParticipantId(n)
    }

    fn registry() -> MatchRegistry {
        MatchRegistry::in_memory(DEFAULT_COOLDOWN)
    }

    #[test]
    fn first_request_waits_second_pairs() {
        let reg = registry();

        assert_eq!(reg.request_match(id(1)), None);
        assert_eq!(reg.status_of(id(1)), Status::Waiting);

        assert_eq!(reg.request_match(id(2)), Some(id(1)));
        assert_eq!(reg.status_of(id(1)), Status::Paired);
        assert_eq!(reg.status_of(id(2)), Status::Paired);
        assert_eq!(reg.partner_of(id(1)), Some(id(2)));
        assert_eq!(reg.partner_of(id(2)), Some(id(1)));
        assert!(reg.snapshot().queue.is_empty());
    }

    #[test]
    fn request_while_paired_returns_existing_partner() {
        let reg = registry();
        reg.request_match(id(1));
        reg.request_match(id(2));

        assert_eq!(reg.request_match(id(1)), Some(id(2)));
        assert_eq!(reg.stats(), RegistryStats { waiting: 0, sessions: 1 });
    }

    #[test]
    fn repeated_request_while_waiting_does_not_duplicate_or_self_pair() {
        let reg = registry();
        assert_eq!(reg.request_match(id(1)), None);
        assert_eq!(reg.request_match(id(1)), None);

        assert_eq!(reg.snapshot().queue, vec![id(1)]);
        assert_eq!(reg.partner_of(id(1)), None);
    }

    #[test]
    fn earliest_waiter_is_matched_first() {
        let snapshot = Snapshot {
            queue: vec![id(10), id(20)],
            sessions: BTreeMap::new(),
        };
        let reg = MatchRegistry::from_snapshot(snapshot, DEFAULT_COOLDOWN, None);

        assert_eq!(reg.request_match(id(30)), Some(id(10)));
        assert_eq!(reg.snapshot().queue, vec![id(20)]);
        assert_eq!(reg.request_match(id(40)), Some(id(20)));
    }

    #[test]
    fn end_session_returns_partner_once() {
        let reg = registry();
        reg.request_match(id(1));
        reg.request_match(id(2));

        assert_eq!(reg.end_session(id(1)), Some(id(2)));
        assert_eq!(reg.status_of(id(1)), Status::Idle);
        assert_eq!(reg.status_of(id(2)), Status::Idle);
        assert_eq!(reg.end_session(id(1)), None);
        assert_eq!(reg.end_session(id(2)), None);
    }

    #[test]
    fn end_session_while_waiting_leaves_queue() {
        let reg = registry();
        reg.request_match(id(1));

        assert_eq!(reg.end_session(id(1)), None);
        assert_eq!(reg.status_of(id(1)), Status::Idle);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn rotate_scenario() {
        let reg = registry();
        assert_eq!(reg.request_match(id(1)), None);
        assert_eq!(reg.request_match(id(2)), Some(id(1)));

        let rotation = reg.rotate(id(1));
        assert_eq!(
            rotation,
            Rotation {
                previous: Some(id(2)),
                next: None
            }
        );
        assert_eq!(reg.snapshot().queue, vec![id(1)]);
        assert_eq!(reg.status_of(id(2)), Status::Idle);

        assert_eq!(reg.request_match(id(3)), Some(id(1)));
    }

    #[test]
    fn rotate_pairs_immediately_when_someone_waits() {
        let reg = registry();
        reg.request_match(id(1));
        reg.request_match(id(2));
        reg.end_session(id(2));
        reg.request_match(id(3)); // 1 and 3 paired
        reg.request_match(id(4)); // 4 waits

        let rotation = reg.rotate(id(1));
        assert_eq!(rotation.previous, Some(id(3)));
        assert_eq!(rotation.next, Some(id(4)));
        assert_eq!(reg.status_of(id(3)), Status::Idle);
    }

    #[test]
    fn rotate_when_idle_just_queues() {
        let reg = registry();
        assert_eq!(
            reg.rotate(id(5)),
            Rotation {
                previous: None,
                next: None
            }
        );
        assert_eq!(reg.status_of(id(5)), Status::Waiting);
    }

    #[test]
    fn relay_target_throttles_paired_sender() {
        let reg = registry();
        reg.request_match(id(1));
        reg.request_match(id(2));
        let t0 = Instant::now();

        assert_eq!(reg.relay_target_at(id(1), t0), RelayTarget::Partner(id(2)));
        assert_eq!(
            reg.relay_target_at(id(1), t0 + Duration::from_millis(100)),
            RelayTarget::Throttled
        );
        assert_eq!(
            reg.relay_target_at(id(1), t0 + DEFAULT_COOLDOWN),
            RelayTarget::Partner(id(2))
        );
        assert_eq!(reg.relay_target_at(id(2), t0), RelayTarget::Partner(id(1)));
    }

    #[test]
    fn relay_target_for_unpaired_sender_does_not_touch_clock() {
        let reg = registry();
        reg.request_match(id(1));
        let t0 = Instant::now();

        assert_eq!(reg.relay_target_at(id(1), t0), RelayTarget::NotPaired);
        reg.request_match(id(2));
        assert_eq!(reg.relay_target_at(id(1), t0), RelayTarget::Partner(id(2)));
    }

    #[test]
    fn clear_discards_everything() {
        let reg = registry();
        reg.request_match(id(1));
        reg.request_match(id(2));
        reg.request_match(id(3));

        assert_eq!(reg.clear(), RegistryStats { waiting: 1, sessions: 1 });
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.status_of(id(1)), Status::Idle);
    }

    #[test]
    fn mutations_are_persisted_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let reg = MatchRegistry::open(SnapshotStore::new(&path), DEFAULT_COOLDOWN);
        reg.request_match(id(1));
        reg.request_match(id(2));
        reg.request_match(id(3));
        drop(reg);

        let restored = MatchRegistry::open(SnapshotStore::new(&path), DEFAULT_COOLDOWN);
        assert_eq!(restored.partner_of(id(1)), Some(id(2)));
        assert_eq!(restored.status_of(id(3)), Status::Waiting);
    }

    #[test]
    fn clear_removes_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let reg = MatchRegistry::open(SnapshotStore::new(&path), DEFAULT_COOLDOWN);
        reg.request_match(id(1));
        assert!(path.exists());

        reg.clear();
        assert!(!path.exists());
    }

    #[test]
    fn save_failure_keeps_in_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be makes every rename fail
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), b"x").unwrap();

        let reg = MatchRegistry::open(SnapshotStore::new(&path), DEFAULT_COOLDOWN);
        reg.request_match(id(1));
        assert_eq!(reg.request_match(id(2)), Some(id(1)));
        assert_eq!(reg.partner_of(id(2)), Some(id(1)));
    }

    #[test]
    fn concurrent_requests_never_double_pair() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        reg.request_match(id(t * 1000 + n));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = reg.snapshot();
        assert!(snapshot.queue.is_empty());
        assert_eq!(snapshot.sessions.len(), 400);
        for (a, b) in &snapshot.sessions {
            assert_ne!(a, b);
            assert_eq!(snapshot.sessions.get(b), Some(a));
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::ratelimit::DEFAULT_COOLDOWN;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone)]
    enum Op {
        Request(i64),
        End(i64),
        Rotate(i64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..12i64).prop_map(Op::Request),
            (0..12i64).prop_map(Op::End),
            (0..12i64).prop_map(Op::Rotate),
        ]
    }

    fn assert_invariants(reg: &MatchRegistry) -> Result<(), TestCaseError> {
        let snapshot = reg.snapshot();
        let mut seen = HashSet::new();
        for waiting in &snapshot.queue {
            prop_assert!(seen.insert(*waiting), "duplicate waiter {waiting}");
            prop_assert!(!snapshot.sessions.contains_key(waiting));
        }
        for (a, b) in &snapshot.sessions {
            prop_assert_ne!(a, b);
            prop_assert_eq!(snapshot.sessions.get(b), Some(a));
        }
        prop_assert!(snapshot.queue.len() <= 1);
        Ok(())
    }

    proptest! {
        #[test]
        fn invariants_hold_for_any_operation_sequence(ops in prop::collection::vec(arb_op(), 0..200)) {
            let reg = MatchRegistry::in_memory(DEFAULT_COOLDOWN);
            for op in ops {
                match op {
                    Op::Request(n) => {
                        let partner = reg.request_match(ParticipantId(n));
                        if let Some(p) = partner {
                            prop_assert_eq!(reg.partner_of(p), Some(ParticipantId(n)));
                        } else {
                            prop_assert_eq!(reg.status_of(ParticipantId(n)), Status::Waiting);
                        }
                    }
                    Op::End(n) => {
                        reg.end_session(ParticipantId(n));
                        prop_assert_eq!(reg.status_of(ParticipantId(n)), Status::Idle);
                    }
                    Op::Rotate(n) => {
                        let rotation = reg.rotate(ParticipantId(n));
                        if let Some(prev) = rotation.previous {
                            prop_assert_ne!(Some(prev), rotation.next);
                            prop_assert_eq!(reg.status_of(prev), Status::Idle);
                        }
                    }
                }
                assert_invariants(&reg)?;
            }
        }
    }
}
