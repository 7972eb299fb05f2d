use crate::types::{PeerSet, Roster};

/// Whether the discovered peers have converged to the committed roster:
/// the same members, in any order.
///
/// Size bounds are not checked here; callers gate readiness on the size
/// policy separately.
pub fn matches(discovered: &PeerSet, committed: &Roster) -> bool {
    *discovered == committed.member_set()
}
