use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{Error, Result};
use crate::types::{PeerAddress, Roster, SelfIdentity, SizePolicy};
use crate::util;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── Coordination service ────────────────────────────────────────
    /// Comma separated etcd endpoints.
    #[envconfig(default = "")]
    pub elastic_server: String,

    #[envconfig(default = "/elastic/")]
    pub etcd_prefix: String,

    #[envconfig(default = "")]
    pub job_id: String,

    // ── Cluster size ────────────────────────────────────────────────
    /// `"N"` for a fixed size, `"min:max"` for an elastic range.
    #[envconfig(default = "")]
    pub np: String,

    #[envconfig(default = "0")]
    pub scale: i64,

    #[envconfig(default = "false")]
    pub force: bool,

    // ── This node ───────────────────────────────────────────────────
    pub host: Option<String>,

    pub pod_ip: Option<String>,

    pub host_port: Option<String>,

    #[envconfig(default = "6170")]
    pub start_port: u16,

    #[envconfig(default = "1")]
    pub nproc_per_node: usize,

    #[envconfig(default = "gloo")]
    pub backend: String,

    // ── Timing ──────────────────────────────────────────────────────
    #[envconfig(default = "120")]
    pub elastic_timeout: u64,

    #[envconfig(default = "60")]
    pub elastic_ttl: i64,

    #[envconfig(default = "2")]
    pub supervise_interval_secs: u64,

    // ── Prior committed state ───────────────────────────────────────
    #[envconfig(default = "")]
    pub trainers: String,

    #[envconfig(default = "")]
    pub trainer_endpoints: String,

    #[envconfig(default = "-1")]
    pub trainer_id: i64,

    #[envconfig(default = "0")]
    pub elastic_np: usize,

    /// File the published roster is written to.
    pub roster_path: Option<String>,
}

impl Config {
    pub fn init_with_defaults() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.elastic_server
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The size spec in effect: `NP`, else the previously known `ELASTIC_NP`.
    fn size_spec(&self) -> Option<String> {
        let spec = self.np.trim();
        if !spec.is_empty() {
            return Some(spec.to_string());
        }
        (self.elastic_np > 0).then(|| self.elastic_np.to_string())
    }

    /// This node's host: `HOST`, then `POD_IP`, then the outbound interface.
    fn resolve_host(&self) -> Result<String> {
        let configured = [&self.host, &self.pod_ip]
            .into_iter()
            .flatten()
            .map(|h| h.trim())
            .find(|h| !h.is_empty());
        match configured {
            Some(host) => Ok(host.to_string()),
            None => util::resolve_local_host(),
        }
    }

    pub fn elastic_config(&self) -> Result<ElasticConfig> {
        let policy = match self.size_spec() {
            Some(spec) => SizePolicy::parse_enabled(&spec)?,
            None => None,
        };

        let host = match self.resolve_host() {
            Ok(host) => host,
            Err(e) if policy.is_none() => {
                tracing::warn!(error = %e, "cannot resolve local host, elastic mode is off anyway");
                "127.0.0.1".to_string()
            }
            Err(e) => return Err(e),
        };
        let host_port = match self.host_port.as_deref().map(str::trim) {
            Some(host_port) if !host_port.is_empty() => PeerAddress::new(host_port)?,
            _ => PeerAddress::from_parts(&host, self.start_port)?,
        };

        let prior_roster = Roster::from_published(&self.trainer_endpoints, &self.trainers)
            .map_err(|e| Error::invalid_config(format!("invalid TRAINER_ENDPOINTS: {e}")))?;

        Ok(ElasticConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
            job_id: self.job_id.trim().to_string(),
            policy,
            host_port,
            rank: SelfIdentity::rank_from_wire(self.trainer_id),
            nproc_per_node: self.nproc_per_node.max(1),
            scale: self.scale,
            force: self.force,
            backend: self.backend.clone(),
            elastic_timeout: Duration::from_secs(self.elastic_timeout),
            lease_ttl: self.elastic_ttl.max(1),
            prior_roster,
            elastic_np: self.elastic_np,
            supervise_interval: Duration::from_secs(self.supervise_interval_secs.max(1)),
            roster_path: self.roster_path.as_ref().map(PathBuf::from),
        })
    }
}

/// Typed construction input of the elastic manager.
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub job_id: String,
    /// `None` when no size was given; elastic mode is then off.
    pub policy: Option<SizePolicy>,
    pub host_port: PeerAddress,
    pub rank: Option<usize>,
    pub nproc_per_node: usize,
    pub scale: i64,
    pub force: bool,
    /// Collective-communication backend, passed through to the launcher.
    pub backend: String,
    pub elastic_timeout: Duration,
    pub lease_ttl: i64,
    pub prior_roster: Roster,
    pub elastic_np: usize,
    pub supervise_interval: Duration,
    pub roster_path: Option<PathBuf>,
}

impl ElasticConfig {
    pub fn new(job_id: &str, policy: SizePolicy, host_port: PeerAddress) -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            prefix: "/elastic/".to_string(),
            job_id: job_id.to_string(),
            policy: Some(policy),
            host_port,
            rank: None,
            nproc_per_node: 1,
            scale: 0,
            force: false,
            backend: "gloo".to_string(),
            elastic_timeout: Duration::from_secs(120),
            lease_ttl: 60,
            prior_roster: Roster::empty(),
            elastic_np: 0,
            supervise_interval: Duration::from_secs(2),
            roster_path: None,
        }
    }

    /// Elastic mode needs a reachable server (`host:port`), a job id and a
    /// size.
    pub fn enabled(&self) -> bool {
        !self.endpoints.is_empty()
            && self.endpoints.iter().all(|e| has_port(e))
            && !self.job_id.is_empty()
            && self.policy.is_some()
    }

    /// The size advertised under `np`: the policy's lower bound adjusted by
    /// `scale`, never below one.
    pub fn target_np(&self) -> usize {
        let base = self.policy.map(|p| p.min()).unwrap_or(self.elastic_np);
        let base = i64::try_from(base).unwrap_or(i64::MAX);
        usize::try_from(base.saturating_add(self.scale).max(1)).unwrap_or(1)
    }

    pub fn identity(&self) -> SelfIdentity {
        SelfIdentity::new(self.host_port.clone(), self.rank)
    }
}

fn has_port(endpoint: &str) -> bool {
    let authority = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    authority
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}
