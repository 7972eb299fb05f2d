use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire value of `TRAINER_ID` for a process that has not been given a rank.
pub const UNASSIGNED_RANK: i64 = -1;

/// One worker's communication endpoint, `host:port`.
///
/// Normalized on construction (surrounding whitespace stripped, lower-cased),
/// so equality is plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let normalized = raw.as_ref().trim().to_ascii_lowercase();
        let (host, port) = normalized
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_config(format!("peer address {normalized:?} has no port")))?;
        if host.is_empty() {
            return Err(Error::invalid_config(format!(
                "peer address {normalized:?} has an empty host"
            )));
        }
        port.parse::<u16>().map_err(|e| {
            Error::invalid_config(format!("peer address {normalized:?} has an invalid port: {e}"))
        })?;
        Ok(Self(normalized))
    }

    /// Build an address from a bare host and a port.
    pub fn from_parts(host: &str, port: u16) -> Result<Self> {
        Self::new(format!("{host}:{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host portion, without the port.
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.0)
    }

    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.0
    }
}

/// The peers that answered a prefix query or watch event just now.
///
/// Membership is a set, but first-seen order is kept because elastic growth
/// admits newcomers in discovery order. Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    members: Vec<PeerAddress>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse raw registration values, skipping (and logging) anything that is
    /// not a valid `host:port`.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .filter_map(|raw| match PeerAddress::new(raw.as_ref()) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = raw.as_ref(), error = %e, "ignoring malformed peer registration");
                    None
                }
            })
            .collect()
    }

    pub fn insert(&mut self, addr: PeerAddress) -> bool {
        if self.members.contains(&addr) {
            return false;
        }
        self.members.push(addr);
        true
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.members.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.members.iter()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.members.iter().map(ToString::to_string).collect()
    }
}

impl PartialEq for PeerSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|addr| other.contains(addr))
    }
}

impl Eq for PeerSet {}

impl FromIterator<PeerAddress> for PeerSet {
    fn from_iter<T: IntoIterator<Item = PeerAddress>>(iter: T) -> Self {
        let mut set = PeerSet::new();
        for addr in iter {
            set.insert(addr);
        }
        set
    }
}

/// Serialized form of a roster, stored under `{job}/endpoints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RosterRecord {
    endpoints: Vec<PeerAddress>,
    hosts: Vec<String>,
}

/// The committed, ordered cluster configuration.
///
/// `hosts[i]` is always the host portion of `endpoints[i]`; both sequences are
/// only ever modified together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RosterRecord", into = "RosterRecord")]
pub struct Roster {
    endpoints: Vec<PeerAddress>,
    hosts: Vec<String>,
}

impl Roster {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a roster in the given order, keeping the first of any repeats.
    pub fn from_endpoints<I: IntoIterator<Item = PeerAddress>>(endpoints: I) -> Self {
        let mut roster = Self::empty();
        for addr in endpoints {
            if roster.contains(&addr) {
                tracing::warn!(endpoint = %addr, "dropping duplicate roster endpoint");
                continue;
            }
            roster.push(addr);
        }
        roster
    }

    /// Load a roster from its published, comma-joined form.
    ///
    /// The hosts list is re-derived from the endpoints; a published hosts list
    /// that disagrees is logged and discarded.
    pub fn from_published(endpoints: &str, hosts: &str) -> Result<Self> {
        let endpoints = split_list(endpoints)
            .map(PeerAddress::new)
            .collect::<Result<Vec<_>>>()?;
        let roster = Self::from_endpoints(endpoints);
        let published_hosts: Vec<&str> = split_list(hosts).collect();
        if !published_hosts.is_empty() && published_hosts != roster.hosts {
            tracing::warn!(
                published = %hosts,
                derived = %roster.trainers(),
                "published hosts do not match endpoints, using hosts derived from endpoints"
            );
        }
        Ok(roster)
    }

    pub fn endpoints(&self) -> &[PeerAddress] {
        &self.endpoints
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.endpoints.contains(addr)
    }

    pub fn position(&self, addr: &PeerAddress) -> Option<usize> {
        self.endpoints.iter().position(|e| e == addr)
    }

    /// The roster's members as an unordered set.
    pub fn member_set(&self) -> PeerSet {
        self.endpoints.iter().cloned().collect()
    }

    /// Comma-joined bare hosts, in roster order.
    pub fn trainers(&self) -> String {
        self.hosts.join(",")
    }

    /// Comma-joined `host:port` endpoints, in roster order.
    pub fn trainer_endpoints(&self) -> String {
        self.endpoints
            .iter()
            .map(PeerAddress::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn push(&mut self, addr: PeerAddress) {
        self.hosts.push(addr.host().to_string());
        self.endpoints.push(addr);
    }

    pub(crate) fn replace(&mut self, index: usize, addr: PeerAddress) {
        self.hosts[index] = addr.host().to_string();
        self.endpoints[index] = addr;
    }

    /// Check the alignment invariant.
    pub fn is_aligned(&self) -> bool {
        self.endpoints.len() == self.hosts.len()
            && self
                .endpoints
                .iter()
                .zip(&self.hosts)
                .all(|(endpoint, host)| endpoint.host() == host)
    }
}

impl TryFrom<RosterRecord> for Roster {
    type Error = Error;

    fn try_from(record: RosterRecord) -> Result<Self> {
        let roster = Roster {
            endpoints: record.endpoints,
            hosts: record.hosts,
        };
        if !roster.is_aligned() {
            return Err(Error::invalid_state(format!(
                "roster endpoints {:?} and hosts {:?} are not aligned",
                roster.trainer_endpoints(),
                roster.trainers()
            )));
        }
        if roster.member_set().len() != roster.len() {
            return Err(Error::invalid_state(format!(
                "roster endpoints {:?} contain duplicates",
                roster.trainer_endpoints()
            )));
        }
        Ok(roster)
    }
}

impl From<Roster> for RosterRecord {
    fn from(roster: Roster) -> Self {
        RosterRecord {
            endpoints: roster.endpoints,
            hosts: roster.hosts,
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Cluster size constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    /// Fault-tolerant mode: the cluster size stays exactly `n`.
    Fixed(usize),
    /// Elastic mode: the cluster size may vary within `[min, max]`.
    Range { min: usize, max: usize },
}

impl SizePolicy {
    /// Parse a size spec, `"N"` or `"min:max"`.
    ///
    /// Sizes below one are raised to one, and a `max` below `min` is raised to
    /// `min`.
    pub fn parse(spec: &str) -> Result<Self> {
        let parse_part = |part: &str| -> Result<usize> {
            part.trim()
                .parse::<i64>()
                .map(|n| n.max(1) as usize)
                .map_err(|e| Error::invalid_config(format!("invalid size {part:?} in {spec:?}: {e}")))
        };
        let parts: Vec<&str> = spec.trim().split(':').collect();
        match parts.as_slice() {
            [n] => Ok(Self::Fixed(parse_part(n)?)),
            [min, max] => {
                let min = parse_part(min)?;
                let max = parse_part(max)?.max(min);
                Ok(Self::Range { min, max })
            }
            _ => Err(Error::invalid_config(format!(
                "size spec {spec:?} must be \"N\" or \"min:max\""
            ))),
        }
    }

    /// Like `parse`, but a spec whose upper bound is zero or less turns
    /// elastic mode off instead of being raised to one.
    pub fn parse_enabled(spec: &str) -> Result<Option<Self>> {
        let policy = Self::parse(spec)?;
        let upper = spec.trim().rsplit(':').next().unwrap_or_default();
        match upper.trim().parse::<i64>() {
            Ok(n) if n <= 0 => Ok(None),
            _ => Ok(Some(policy)),
        }
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    pub fn min(&self) -> usize {
        match self {
            Self::Fixed(n) => *n,
            Self::Range { min, .. } => *min,
        }
    }

    pub fn max(&self) -> usize {
        match self {
            Self::Fixed(n) => *n,
            Self::Range { max, .. } => *max,
        }
    }

    /// Whether a roster of `len` members is within bounds.
    pub fn admits(&self, len: usize) -> bool {
        (self.min()..=self.max()).contains(&len)
    }
}

impl fmt::Display for SizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Range { min, max } => write!(f, "{min}:{max}"),
        }
    }
}

/// This process's address and its rank, when one has been assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    pub address: PeerAddress,
    pub rank: Option<usize>,
}

impl SelfIdentity {
    pub fn new(address: PeerAddress, rank: Option<usize>) -> Self {
        Self { address, rank }
    }

    /// Decode a `TRAINER_ID` wire value; any negative value means unassigned.
    pub fn rank_from_wire(value: i64) -> Option<usize> {
        usize::try_from(value).ok()
    }

    pub fn rank_to_wire(rank: Option<usize>) -> i64 {
        rank.and_then(|r| i64::try_from(r).ok())
            .unwrap_or(UNASSIGNED_RANK)
    }
}

/// Lifecycle states of the elastic manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initializing,
    Watching,
    Reconfiguring,
    Ready,
    Exiting,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Watching => "watching",
            Self::Reconfiguring => "reconfiguring",
            Self::Ready => "ready",
            Self::Exiting => "exiting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s).unwrap()
    }

    #[test]
    fn peer_address_normalizes() {
        let a = addr("  Worker-A.Example:6001 \n");
        assert_eq!(a.as_str(), "worker-a.example:6001");
        assert_eq!(a.host(), "worker-a.example");
        assert_eq!(a.port(), 6001);
        assert_eq!(a, addr("worker-a.example:6001"));
    }

    #[test]
    fn peer_address_rejects_malformed() {
        for raw in ["10.10.10.1", ":6001", "10.10.10.1:port", "10.10.10.1:70000", ""] {
            assert!(PeerAddress::new(raw).is_err(), "should reject: {raw:?}");
        }
    }

    #[test]
    fn peer_set_equality_ignores_order() {
        let a = PeerSet::from_values(["10.10.10.1:6001", "10.10.10.2:6001"]);
        let b = PeerSet::from_values(["10.10.10.2:6001", "10.10.10.1:6001"]);
        assert_eq!(a, b);

        let c = PeerSet::from_values(["10.10.10.1:6001"]);
        assert_ne!(a, c);
    }

    #[test]
    fn peer_set_dedups_and_keeps_first_seen_order() {
        let set = PeerSet::from_values([
            "10.10.10.2:6001",
            "10.10.10.1:6001",
            "10.10.10.2:6001",
            "garbage",
        ]);
        assert_eq!(set.to_strings(), vec!["10.10.10.2:6001", "10.10.10.1:6001"]);
    }

    #[test]
    fn roster_from_published_derives_hosts() {
        let roster = Roster::from_published("10.10.10.1:6001, 10.10.10.2:6001", "").unwrap();
        assert_eq!(roster.hosts(), &["10.10.10.1", "10.10.10.2"]);
        assert_eq!(roster.trainers(), "10.10.10.1,10.10.10.2");
        assert_eq!(roster.trainer_endpoints(), "10.10.10.1:6001,10.10.10.2:6001");
        assert!(roster.is_aligned());
    }

    #[test]
    fn roster_from_published_ignores_mismatched_hosts() {
        let roster = Roster::from_published("10.10.10.1:6001", "10.10.10.9").unwrap();
        assert_eq!(roster.hosts(), &["10.10.10.1"]);
    }

    #[test]
    fn roster_from_published_drops_duplicate_endpoints() {
        let roster =
            Roster::from_published("10.10.10.1:6001,10.10.10.2:6001,10.10.10.1:6001", "")
                .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.trainer_endpoints(), "10.10.10.1:6001,10.10.10.2:6001");
        assert!(roster.is_aligned());
    }

    #[test]
    fn roster_json_rejects_duplicate_endpoints() {
        let json = r#"{"endpoints":["10.10.10.1:6001","10.10.10.1:6001"],"hosts":["10.10.10.1","10.10.10.1"]}"#;
        assert!(serde_json::from_str::<Roster>(json).is_err());
    }

    #[test]
    fn roster_json_rejects_misaligned_record() {
        let json = r#"{"endpoints":["10.10.10.1:6001"],"hosts":["10.10.10.2"]}"#;
        assert!(serde_json::from_str::<Roster>(json).is_err());

        let json = r#"{"endpoints":["10.10.10.1:6001"],"hosts":["10.10.10.1"]}"#;
        let roster: Roster = serde_json::from_str(json).unwrap();
        assert_eq!(roster.trainer_endpoints(), "10.10.10.1:6001");
    }

    #[test]
    fn size_policy_parses_fixed_and_range() {
        assert_eq!(SizePolicy::parse("2").unwrap(), SizePolicy::Fixed(2));
        assert_eq!(SizePolicy::parse("0").unwrap(), SizePolicy::Fixed(1));
        assert_eq!(
            SizePolicy::parse("2:4").unwrap(),
            SizePolicy::Range { min: 2, max: 4 }
        );
        assert_eq!(
            SizePolicy::parse("0:4").unwrap(),
            SizePolicy::Range { min: 1, max: 4 }
        );
        assert_eq!(
            SizePolicy::parse("5:3").unwrap(),
            SizePolicy::Range { min: 5, max: 5 }
        );
    }

    #[test]
    fn size_policy_zero_upper_bound_disables() {
        for spec in ["0", "00", " 0 ", "0:0", "2:0", "-1"] {
            assert_eq!(SizePolicy::parse_enabled(spec).unwrap(), None, "spec: {spec:?}");
        }
        assert_eq!(
            SizePolicy::parse_enabled("0:4").unwrap(),
            Some(SizePolicy::Range { min: 1, max: 4 })
        );
        assert_eq!(SizePolicy::parse_enabled("3").unwrap(), Some(SizePolicy::Fixed(3)));
        assert!(SizePolicy::parse_enabled("0:x").is_err());
    }

    #[test]
    fn size_policy_rejects_bad_specs() {
        for spec in ["", "a", "1:2:3", "2:x"] {
            assert!(SizePolicy::parse(spec).is_err(), "should reject: {spec:?}");
        }
    }

    #[test]
    fn size_policy_bounds() {
        let policy = SizePolicy::Range { min: 2, max: 4 };
        assert!(!policy.admits(1));
        assert!(policy.admits(2));
        assert!(policy.admits(4));
        assert!(!policy.admits(5));
        assert!(SizePolicy::Fixed(2).admits(2));
        assert!(!SizePolicy::Fixed(2).admits(3));
    }

    #[test]
    fn rank_wire_conversion() {
        assert_eq!(SelfIdentity::rank_from_wire(-1), None);
        assert_eq!(SelfIdentity::rank_from_wire(3), Some(3));
        assert_eq!(SelfIdentity::rank_to_wire(None), UNASSIGNED_RANK);
        assert_eq!(SelfIdentity::rank_to_wire(Some(1)), 1);
    }
}
