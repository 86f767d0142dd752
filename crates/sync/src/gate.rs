use std::sync::Arc;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use libp2p_identity::PeerId;
use tendril_primitives::Cid;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Sentinel carried inside a transfer failure message when the gate refused
/// a block. The transfer layer classifies such failures as retryable.
pub(crate) const RATE_LIMIT_SENTINEL: &str = "hit rate limit";

/// Direct (per-peer, unkeyed) token bucket.
pub type PeerLimiter = governor::DefaultDirectRateLimiter;

/// Caller-supplied lookup from publisher to its token bucket.
pub type LimiterFor = Arc<dyn Fn(PeerId) -> Arc<PeerLimiter> + Send + Sync>;

/// Gate decision for one incoming block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum GateDecision {
    /// Let the block through. `invoke_hook` is false while replaying blocks
    /// a previous pass already announced to the caller.
    Pass { invoke_hook: bool },

    /// Out of tokens: the transfer must terminate with the sentinel.
    RateLimited,
}

/// Per-peer token bucket gating incoming blocks during transfer.
///
/// Besides the buckets themselves the gate owns the `last_failed` slot: the
/// link at which a previous pass was refused. Because the transport cannot
/// resume mid-DAG, the retry pass replays the traversal from the root; the
/// slot keeps the caller's block-hook at-most-once per link across passes.
pub struct RateGate {
    limiter_for: Option<LimiterFor>,
    overrides: DashMap<PeerId, Arc<PeerLimiter>>,
    last_failed: DashMap<PeerId, Cid>,
}

impl RateGate {
    pub fn new(limiter_for: Option<LimiterFor>) -> Self {
        Self {
            limiter_for,
            overrides: DashMap::new(),
            last_failed: DashMap::new(),
        }
    }

    /// A `limiter_for` handing every peer its own bucket built from `config`.
    pub fn keyed(config: RateLimitConfig) -> LimiterFor {
        let limiters: DashMap<PeerId, Arc<PeerLimiter>> = DashMap::new();

        Arc::new(move |peer| {
            limiters
                .entry(peer)
                .or_insert_with(|| {
                    let quota =
                        Quota::per_second(config.blocks_per_second).allow_burst(config.burst);
                    Arc::new(RateLimiter::direct(quota))
                })
                .clone()
        })
    }

    /// Installs a limiter for `peer` that shadows the default lookup for
    /// the duration of one sync request.
    pub fn set_override(&self, peer: PeerId, limiter: Arc<PeerLimiter>) {
        let _ignored = self.overrides.insert(peer, limiter);
    }

    pub fn clear_override(&self, peer: &PeerId) {
        let _ignored = self.overrides.remove(peer);
    }

    fn limiter(&self, peer: PeerId) -> Option<Arc<PeerLimiter>> {
        if let Some(limiter) = self.overrides.get(&peer) {
            return Some(limiter.clone());
        }

        self.limiter_for.as_ref().map(|f| f(peer))
    }

    /// Applies the gate policy to one incoming block.
    ///
    /// Blocks the transport already had locally (`size_on_wire == 0`)
    /// bypass the bucket and never reach the hook (they are duplicates the
    /// transport sent anyway), but still participate in retry-slot
    /// bookkeeping. The hook stays suppressed for every block up to and
    /// including the recorded link; seeing that link clears the slot.
    pub(crate) fn admit(&self, peer: PeerId, cid: Cid, size_on_wire: usize) -> GateDecision {
        if size_on_wire > 0 {
            if let Some(limiter) = self.limiter(peer) {
                if limiter.check().is_err() {
                    debug!(%peer, %cid, "rate limit hit, recording link for retry");
                    let _ignored = self.last_failed.insert(peer, cid);
                    return GateDecision::RateLimited;
                }
            }
        }

        if self
            .last_failed
            .remove_if(&peer, |_, last| *last == cid)
            .is_some()
        {
            return GateDecision::Pass { invoke_hook: false };
        }

        if self.last_failed.contains_key(&peer) {
            // Still replaying blocks from before the recorded link.
            return GateDecision::Pass { invoke_hook: false };
        }

        GateDecision::Pass {
            invoke_hook: size_on_wire > 0,
        }
    }

    /// Clears the retry slot once a sync terminates with a non-rate-limit
    /// outcome, so a reordered traversal cannot poison the next sync.
    /// Transports call this when a sync attempt ends.
    pub fn finish_sync(&self, peer: &PeerId) {
        let _ignored = self.last_failed.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn strict_limiter(burst: u32) -> Arc<PeerLimiter> {
        // One token per hour: effectively no refill within a test.
        let quota = Quota::per_hour(NonZeroU32::new(1).unwrap())
            .allow_burst(NonZeroU32::new(burst).unwrap());
        Arc::new(RateLimiter::direct(quota))
    }

    fn gated(burst: u32) -> RateGate {
        let limiter = strict_limiter(burst);
        RateGate::new(Some(Arc::new(move |_: PeerId| limiter.clone())))
    }

    #[test]
    fn ungated_blocks_pass_with_hook() {
        let gate = RateGate::new(None);
        let peer = PeerId::random();

        let decision = gate.admit(peer, Cid::hash(b"a"), 100);

        assert_eq!(decision, GateDecision::Pass { invoke_hook: true });
    }

    #[test]
    fn local_blocks_bypass_the_bucket_and_the_hook() {
        let gate = gated(1);
        let peer = PeerId::random();

        assert_eq!(
            gate.admit(peer, Cid::hash(b"a"), 10),
            GateDecision::Pass { invoke_hook: true }
        );
        // Bucket is now empty, but a zero-size duplicate still passes; the
        // hook is skipped for it.
        assert_eq!(
            gate.admit(peer, Cid::hash(b"b"), 0),
            GateDecision::Pass { invoke_hook: false }
        );
    }

    #[test]
    fn refusal_records_the_link() {
        let gate = gated(1);
        let peer = PeerId::random();
        let tripped = Cid::hash(b"tripped");

        assert!(matches!(
            gate.admit(peer, Cid::hash(b"first"), 10),
            GateDecision::Pass { .. }
        ));
        assert_eq!(gate.admit(peer, tripped, 10), GateDecision::RateLimited);
        assert_eq!(gate.last_failed.get(&peer).map(|c| *c), Some(tripped));
    }

    #[test]
    fn retry_pass_suppresses_hooks_through_recorded_link() {
        // Refills one token every 10ms so the retry pass can make progress.
        let quota = Quota::per_second(NonZeroU32::new(100).unwrap())
            .allow_burst(NonZeroU32::new(1).unwrap());
        let limiter = Arc::new(RateLimiter::direct(quota));
        let gate = RateGate::new(Some(Arc::new(move |_: PeerId| limiter.clone())));

        let peer = PeerId::random();
        let (a, b, c) = (Cid::hash(b"a"), Cid::hash(b"b"), Cid::hash(b"c"));

        // First pass: a passes, b trips.
        assert_eq!(gate.admit(peer, a, 10), GateDecision::Pass { invoke_hook: true });
        assert_eq!(gate.admit(peer, b, 10), GateDecision::RateLimited);

        std::thread::sleep(std::time::Duration::from_millis(50));

        // Retry pass replays from the root: a (now local) suppressed, b
        // suppressed and clears the slot.
        assert_eq!(gate.admit(peer, a, 0), GateDecision::Pass { invoke_hook: false });
        assert_eq!(gate.admit(peer, b, 10), GateDecision::Pass { invoke_hook: false });

        std::thread::sleep(std::time::Duration::from_millis(50));

        // Past the recorded link, fresh blocks get the hook again.
        assert_eq!(gate.admit(peer, c, 10), GateDecision::Pass { invoke_hook: true });
    }

    #[test]
    fn finish_sync_clears_a_stale_slot() {
        // One token every 10ms so the pass after finish_sync has a token.
        let quota = Quota::per_second(NonZeroU32::new(100).unwrap())
            .allow_burst(NonZeroU32::new(1).unwrap());
        let limiter = Arc::new(RateLimiter::direct(quota));
        let gate = RateGate::new(Some(Arc::new(move |_: PeerId| limiter.clone())));
        let peer = PeerId::random();

        assert!(matches!(gate.admit(peer, Cid::hash(b"x"), 10), GateDecision::Pass { .. }));
        assert_eq!(gate.admit(peer, Cid::hash(b"y"), 10), GateDecision::RateLimited);

        gate.finish_sync(&peer);
        std::thread::sleep(std::time::Duration::from_millis(50));

        // Next sync starts with hooks enabled again.
        assert_eq!(
            gate.admit(peer, Cid::hash(b"z"), 10),
            GateDecision::Pass { invoke_hook: true }
        );
    }

    #[test]
    fn slots_are_per_peer() {
        // Every peer gets its own one-token bucket.
        let gate = RateGate::new(Some(RateGate::keyed(crate::config::RateLimitConfig {
            blocks_per_second: NonZeroU32::new(1).unwrap(),
            burst: NonZeroU32::new(1).unwrap(),
        })));
        let (p1, p2) = (PeerId::random(), PeerId::random());

        assert!(matches!(gate.admit(p1, Cid::hash(b"a"), 10), GateDecision::Pass { .. }));
        assert_eq!(gate.admit(p1, Cid::hash(b"b"), 10), GateDecision::RateLimited);

        // A different peer has its own bucket and no slot.
        assert_eq!(
            gate.admit(p2, Cid::hash(b"c"), 10),
            GateDecision::Pass { invoke_hook: true }
        );
    }

    #[test]
    fn override_shadows_the_default_lookup() {
        let gate = RateGate::new(None);
        let peer = PeerId::random();

        gate.set_override(peer, strict_limiter(1));

        assert!(matches!(gate.admit(peer, Cid::hash(b"a"), 10), GateDecision::Pass { .. }));
        assert_eq!(gate.admit(peer, Cid::hash(b"b"), 10), GateDecision::RateLimited);

        gate.clear_override(&peer);
        gate.finish_sync(&peer);

        // Back to ungated.
        assert_eq!(
            gate.admit(peer, Cid::hash(b"c"), 10),
            GateDecision::Pass { invoke_hook: true }
        );
    }
}
