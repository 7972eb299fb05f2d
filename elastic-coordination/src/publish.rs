//! The roster as handed to the training launcher: one `KEY=value` line per
//! setting.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Roster, SelfIdentity, SizePolicy};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishedRoster {
    /// `TRAINERS`: bare hosts, in roster order.
    pub trainers: String,
    /// `TRAINER_ENDPOINTS`: `host:port`, in roster order.
    pub trainer_endpoints: String,
    /// `DISTRIBUTED_TRAINER_ENDPOINTS`: every roster endpoint expanded to one
    /// port per local process.
    pub distributed_trainer_endpoints: String,
    /// `TRAINER_ID`
    pub trainer_id: Option<usize>,
    /// `ELASTIC_TIMEOUT`, in seconds.
    pub elastic_timeout: u64,
    /// `ELASTIC_NP`
    pub elastic_np: usize,
}

impl PublishedRoster {
    pub fn new(
        roster: &Roster,
        me: &SelfIdentity,
        policy: SizePolicy,
        nproc_per_node: usize,
        elastic_timeout: Duration,
        elastic_np: usize,
    ) -> Self {
        Self {
            trainers: roster.trainers(),
            trainer_endpoints: roster.trainer_endpoints(),
            distributed_trainer_endpoints: expand_endpoints(roster, nproc_per_node),
            trainer_id: trainer_id(roster, me, policy),
            elastic_timeout: elastic_timeout.as_secs(),
            elastic_np,
        }
    }

    pub fn to_env_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TRAINERS", self.trainers.clone()),
            ("TRAINER_ENDPOINTS", self.trainer_endpoints.clone()),
            (
                "DISTRIBUTED_TRAINER_ENDPOINTS",
                self.distributed_trainer_endpoints.clone(),
            ),
            (
                "TRAINER_ID",
                SelfIdentity::rank_to_wire(self.trainer_id).to_string(),
            ),
            ("ELASTIC_TIMEOUT", self.elastic_timeout.to_string()),
            ("ELASTIC_NP", self.elastic_np.to_string()),
        ]
    }

    pub fn render(&self) -> String {
        self.to_env_pairs()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }

    /// Write the rendered roster to `path`, replacing it atomically.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, self.render()).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::info!(path = %path.display(), "wrote published roster");
        Ok(())
    }
}

/// This process's rank in `roster`.
///
/// In elastic mode ranks follow roster order, so it is the current index.
/// In fixed mode an assigned rank is kept; an unassigned process that is in
/// the roster takes its index.
pub fn trainer_id(roster: &Roster, me: &SelfIdentity, policy: SizePolicy) -> Option<usize> {
    let index = roster.position(&me.address);
    match policy {
        SizePolicy::Range { .. } => index,
        SizePolicy::Fixed(_) => me.rank.or(index),
    }
}

/// Expand every endpoint into `nproc_per_node` consecutive ports.
pub fn expand_endpoints(roster: &Roster, nproc_per_node: usize) -> String {
    let nproc = nproc_per_node.max(1);
    roster
        .endpoints()
        .iter()
        .flat_map(|endpoint| {
            let host = endpoint.host();
            let base = endpoint.port();
            (0..nproc).filter_map(move |i| {
                let port = u16::try_from(i).ok().and_then(|i| base.checked_add(i));
                if port.is_none() {
                    tracing::warn!(%endpoint, process = i, "port out of range, skipping");
                }
                port.map(|port| format!("{host}:{port}"))
            })
        })
        .collect::<Vec<_>>()
        .join(",")
}
