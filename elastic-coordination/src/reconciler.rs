//! Merging a discovered peer set into the committed roster.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::JobStore;
use crate::types::{PeerAddress, PeerSet, Roster, SelfIdentity, SizePolicy};
use crate::util::{self, Backoff};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The previous roster stands as is.
    Unchanged,
    /// A new roster was produced.
    Updated,
    /// The change would violate the size policy; the previous roster stands.
    Rejected(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => f.write_str("unchanged"),
            Self::Updated => f.write_str("updated"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub roster: Roster,
    pub outcome: Outcome,
}

impl Reconciliation {
    fn unchanged(previous: &Roster) -> Self {
        Self {
            roster: previous.clone(),
            outcome: Outcome::Unchanged,
        }
    }

    fn rejected(previous: &Roster, reason: String) -> Self {
        Self {
            roster: previous.clone(),
            outcome: Outcome::Rejected(reason),
        }
    }

    fn updated(previous: &Roster, roster: Roster) -> Self {
        if roster == *previous {
            return Self::unchanged(previous);
        }
        Self {
            roster,
            outcome: Outcome::Updated,
        }
    }

    pub fn changed(&self) -> bool {
        self.outcome == Outcome::Updated
    }
}

/// Compute the roster that follows `previous` given the peers discovered now.
///
/// Pure and deterministic: every peer that sees the same discovered set (in
/// the same key order) and the same previous roster computes the same result,
/// and reconciling a result again with the same discovered set changes
/// nothing.
pub fn reconcile(
    discovered: &PeerSet,
    previous: &Roster,
    policy: SizePolicy,
    me: &SelfIdentity,
) -> Reconciliation {
    match policy {
        SizePolicy::Fixed(n) => reconcile_fixed(discovered, previous, n, me),
        SizePolicy::Range { min, max } => reconcile_elastic(discovered, previous, min, max),
    }
}

fn reconcile_fixed(
    discovered: &PeerSet,
    previous: &Roster,
    n: usize,
    me: &SelfIdentity,
) -> Reconciliation {
    if previous.is_empty() {
        // Bootstrap: wait for exactly n peers, then take them in key order.
        if discovered.len() != n {
            return Reconciliation::unchanged(previous);
        }
        return Reconciliation::updated(previous, Roster::from_endpoints(discovered.iter().cloned()));
    }

    let Some(rank) = me.rank else {
        return Reconciliation::unchanged(previous);
    };
    let Some(current) = previous.endpoints().get(rank) else {
        return Reconciliation::rejected(
            previous,
            format!("rank {rank} is outside the roster of {}", previous.len()),
        );
    };
    if *current == me.address {
        return Reconciliation::unchanged(previous);
    }
    if let Some(other) = previous.position(&me.address) {
        return Reconciliation::rejected(
            previous,
            format!("{} already holds slot {other}, not {rank}", me.address),
        );
    }

    let mut roster = previous.clone();
    roster.replace(rank, me.address.clone());
    Reconciliation::updated(previous, roster)
}

fn reconcile_elastic(
    discovered: &PeerSet,
    previous: &Roster,
    min: usize,
    max: usize,
) -> Reconciliation {
    let survivors: Vec<(usize, &PeerAddress)> = previous
        .endpoints()
        .iter()
        .enumerate()
        .filter(|(_, addr)| discovered.contains(addr))
        .collect();
    let capacity = max.saturating_sub(survivors.len());
    let newcomers: Vec<&PeerAddress> = discovered.iter().filter(|a| !previous.contains(a)).collect();
    let deferred = newcomers.len().saturating_sub(capacity);
    let admitted = &newcomers[..newcomers.len() - deferred];

    let len = survivors.len() + admitted.len();
    if len < min {
        return Reconciliation::rejected(
            previous,
            format!("{len} members would fall below the minimum of {min}"),
        );
    }
    if deferred > 0 {
        tracing::info!(deferred, max, "cluster is full, deferring new peers");
    }

    let mut roster = Roster::from_endpoints(compact(&survivors).into_iter().cloned());
    for addr in admitted {
        roster.push((*addr).clone());
    }
    Reconciliation::updated(previous, roster)
}

/// Close the gaps left by departed members with as little rank movement as
/// possible: survivors whose index still fits keep it, the rest fill the
/// freed slots in their previous order.
fn compact<'a>(survivors: &[(usize, &'a PeerAddress)]) -> Vec<&'a PeerAddress> {
    let len = survivors.len();
    let mut slots: Vec<Option<&PeerAddress>> = vec![None; len];
    let mut displaced = Vec::new();
    for &(index, addr) in survivors {
        match slots.get_mut(index) {
            Some(slot) => *slot = Some(addr),
            None => displaced.push(addr),
        }
    }
    let mut displaced = displaced.into_iter();
    slots
        .into_iter()
        .filter_map(|slot| slot.or_else(|| displaced.next()))
        .collect()
}

/// Applies [`reconcile`] under one size policy and persists what it commits.
pub struct RosterReconciler {
    store: JobStore,
    policy: SizePolicy,
    backoff: Backoff,
}

impl RosterReconciler {
    pub fn new(store: JobStore, policy: SizePolicy) -> Self {
        Self {
            store,
            policy,
            backoff: Backoff::default(),
        }
    }

    pub fn policy(&self) -> SizePolicy {
        self.policy
    }

    pub fn reconcile(
        &self,
        discovered: &PeerSet,
        previous: &Roster,
        me: &SelfIdentity,
    ) -> Reconciliation {
        let result = reconcile(discovered, previous, self.policy, me);
        match &result.outcome {
            Outcome::Updated => tracing::info!(
                previous = %previous.trainer_endpoints(),
                roster = %result.roster.trainer_endpoints(),
                policy = %self.policy,
                "roster updated"
            ),
            Outcome::Rejected(reason) => tracing::warn!(
                discovered = ?discovered.to_strings(),
                policy = %self.policy,
                reason,
                "roster change rejected, keeping previous roster"
            ),
            Outcome::Unchanged => {}
        }
        result
    }

    /// Whether a roster published by another peer may be adopted.
    pub fn admits(&self, roster: &Roster) -> bool {
        !roster.is_empty() && self.policy.admits(roster.len())
    }

    /// Write `roster` to the shared `endpoints` key.
    pub async fn persist(&self, roster: &Roster, cancel: &CancellationToken) -> Result<()> {
        util::retry_with_backoff("persist roster", self.backoff, cancel, || {
            self.store.put_roster(roster)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s).unwrap()
    }

    fn roster(endpoints: &[&str]) -> Roster {
        Roster::from_endpoints(endpoints.iter().map(|e| addr(e)))
    }

    fn peers(endpoints: &[&str]) -> PeerSet {
        PeerSet::from_values(endpoints)
    }

    fn me(address: &str, rank: Option<usize>) -> SelfIdentity {
        SelfIdentity::new(addr(address), rank)
    }

    const A: &str = "10.10.10.1:6001";
    const B: &str = "10.10.10.2:6001";
    const C: &str = "10.10.10.3:6001";
    const D: &str = "10.10.10.4:6001";
    const W: &str = "10.10.10.9:6001";

    #[test]
    fn fixed_replaces_own_slot() {
        let previous = roster(&[A, B]);
        let result = reconcile(&peers(&[A, C]), &previous, SizePolicy::Fixed(2), &me(C, Some(1)));
        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(result.roster, roster(&[A, C]));
        assert_eq!(result.roster.hosts(), &["10.10.10.1", "10.10.10.3"]);
    }

    #[test]
    fn fixed_without_rank_is_a_no_op() {
        let previous = roster(&[A, B]);
        let result = reconcile(&peers(&[A, C]), &previous, SizePolicy::Fixed(2), &me(C, None));
        assert_eq!(result.outcome, Outcome::Unchanged);
        assert_eq!(result.roster, previous);
    }

    #[test]
    fn fixed_keeps_own_slot_when_address_unchanged() {
        let previous = roster(&[A, B]);
        let result = reconcile(&peers(&[A, B]), &previous, SizePolicy::Fixed(2), &me(B, Some(1)));
        assert_eq!(result.outcome, Outcome::Unchanged);
    }

    #[test]
    fn fixed_rejects_rank_outside_roster() {
        let previous = roster(&[A, B]);
        let result = reconcile(&peers(&[A, C]), &previous, SizePolicy::Fixed(2), &me(C, Some(5)));
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert_eq!(result.roster, previous);
    }

    #[test]
    fn fixed_rejects_address_already_in_another_slot() {
        let previous = roster(&[A, B]);
        let result = reconcile(&peers(&[A, B]), &previous, SizePolicy::Fixed(2), &me(A, Some(1)));
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert_eq!(result.roster, previous);
    }

    #[test]
    fn fixed_bootstrap_waits_for_full_set() {
        let empty = Roster::empty();
        let result = reconcile(&peers(&[B]), &empty, SizePolicy::Fixed(2), &me(B, None));
        assert_eq!(result.outcome, Outcome::Unchanged);
        assert!(result.roster.is_empty());

        let result = reconcile(&peers(&[B, A]), &empty, SizePolicy::Fixed(2), &me(B, None));
        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(result.roster, roster(&[B, A]));
    }

    #[test]
    fn elastic_growth_appends() {
        let previous = roster(&[A, B]);
        let result = reconcile(
            &peers(&[A, B, C]),
            &previous,
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, Some(0)),
        );
        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(result.roster, roster(&[A, B, C]));
    }

    #[test]
    fn elastic_growth_preserves_discovery_order() {
        let previous = roster(&[A]);
        let result = reconcile(
            &peers(&[D, A, C, B]),
            &previous,
            SizePolicy::Range { min: 1, max: 4 },
            &me(A, None),
        );
        assert_eq!(result.roster, roster(&[A, D, C, B]));
    }

    #[test]
    fn elastic_growth_is_capped_at_max() {
        let previous = roster(&[A, B]);
        let policy = SizePolicy::Range { min: 2, max: 3 };
        let discovered = peers(&[A, B, C, D]);
        let result = reconcile(&discovered, &previous, policy, &me(A, None));
        assert_eq!(result.roster, roster(&[A, B, C]));

        // The deferred peer stays out on the next pass too.
        let again = reconcile(&discovered, &result.roster, policy, &me(A, None));
        assert_eq!(again.outcome, Outcome::Unchanged);
        assert_eq!(again.roster, result.roster);
    }

    #[test]
    fn elastic_shrink_compacts_and_stays_aligned() {
        let previous = roster(&[W, A, B, C]);
        let result = reconcile(
            &peers(&[A, B, C]),
            &previous,
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, None),
        );
        assert_eq!(result.outcome, Outcome::Updated);
        assert_eq!(result.roster.len(), 3);
        assert_eq!(result.roster.member_set(), peers(&[A, B, C]));
        assert!(result.roster.is_aligned());

        for (endpoint, host) in result
            .roster
            .trainer_endpoints()
            .split(',')
            .zip(result.roster.trainers().split(','))
        {
            assert!(endpoint.starts_with(&format!("{host}:")));
        }
    }

    #[test]
    fn elastic_shrink_moves_as_few_ranks_as_possible() {
        let previous = roster(&[W, A, B, C]);
        let result = reconcile(
            &peers(&[A, B, C]),
            &previous,
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, None),
        );
        assert_eq!(result.roster, roster(&[C, A, B]));

        let previous = roster(&[A, B, C, D]);
        let result = reconcile(
            &peers(&[A, C]),
            &previous,
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, None),
        );
        assert_eq!(result.roster, roster(&[A, C]));
    }

    #[test]
    fn elastic_shrink_and_growth_in_one_pass() {
        let previous = roster(&[A, B, C]);
        let result = reconcile(
            &peers(&[A, C, D]),
            &previous,
            SizePolicy::Range { min: 2, max: 3 },
            &me(A, None),
        );
        assert_eq!(result.roster, roster(&[A, C, D]));
    }

    #[test]
    fn elastic_rejects_below_min() {
        let previous = roster(&[A, B, C]);
        let result = reconcile(
            &peers(&[A]),
            &previous,
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, None),
        );
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert_eq!(result.roster, previous);
    }

    #[test]
    fn elastic_bootstrap_grows_from_empty() {
        let result = reconcile(
            &peers(&[B, A]),
            &Roster::empty(),
            SizePolicy::Range { min: 2, max: 4 },
            &me(A, None),
        );
        assert_eq!(result.roster, roster(&[B, A]));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let cases = [
            (peers(&[A, B, C]), roster(&[A, B]), SizePolicy::Range { min: 2, max: 4 }, me(A, None)),
            (peers(&[A, B, C]), roster(&[W, A, B, C]), SizePolicy::Range { min: 2, max: 4 }, me(A, None)),
            (peers(&[A, B, C, D]), roster(&[A]), SizePolicy::Range { min: 1, max: 2 }, me(A, None)),
            (peers(&[A]), roster(&[A, B, C]), SizePolicy::Range { min: 2, max: 4 }, me(A, None)),
            (peers(&[A, C]), roster(&[A, B]), SizePolicy::Fixed(2), me(C, Some(1))),
            (peers(&[A, C]), roster(&[A, B]), SizePolicy::Fixed(2), me(C, None)),
            (peers(&[A, B]), Roster::empty(), SizePolicy::Fixed(2), me(A, None)),
        ];
        for (discovered, previous, policy, me) in cases {
            let once = reconcile(&discovered, &previous, policy, &me);
            let twice = reconcile(&discovered, &once.roster, policy, &me);
            assert_eq!(twice.roster, once.roster, "not idempotent for {previous:?}");
            assert_ne!(twice.outcome, Outcome::Updated);
            assert!(once.roster.is_aligned());
        }
    }

    #[test]
    fn admits_follows_policy() {
        let client = crate::client::MockCoordinationClient::new();
        let store = JobStore::new(
            std::sync::Arc::new(client),
            crate::store::StoreConfig {
                prefix: "/elastic/".to_string(),
                job_id: "job".to_string(),
            },
        );
        let reconciler = RosterReconciler::new(store, SizePolicy::Range { min: 2, max: 3 });
        assert!(!reconciler.admits(&Roster::empty()));
        assert!(!reconciler.admits(&roster(&[A])));
        assert!(reconciler.admits(&roster(&[A, B])));
        assert!(!reconciler.admits(&roster(&[A, B, C, D])));
    }
}
