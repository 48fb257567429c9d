//! Per-command policies.
//!
//! Unlike [`ClientPolicy`](crate::config::ClientPolicy), these are plain
//! structs with public fields: callers usually start from `Default` and
//! tweak one or two settings per call.

use std::time::{Duration, Instant};

use aerospike_core::Expression;

/// Which replica serves a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replica {
    /// Always the master.
    Master,
    /// Round-robin across master and proles.
    MasterProles,
    /// Master first, then the next replica on each retry.
    #[default]
    Sequence,
    /// A replica on the local rack, else `Sequence`.
    PreferRack,
}

/// Read consistency for AP namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadModeAP {
    /// Read one replica.
    #[default]
    One,
    /// Read all replicas and return the newest.
    All,
}

/// Read consistency for strong consistency namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadModeSC {
    /// Session consistency.
    #[default]
    Session,
    /// Linearizable reads.
    Linearize,
    /// Allow reads from replicas.
    AllowReplica,
    /// Allow reads from unavailable partitions.
    AllowUnavailable,
}

/// What a write does when the record does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordExistsAction {
    /// Create or merge bins.
    #[default]
    Update,
    /// Merge bins; fail if missing.
    UpdateOnly,
    /// Create or replace all bins.
    Replace,
    /// Replace all bins; fail if missing.
    ReplaceOnly,
    /// Create; fail if present.
    CreateOnly,
}

/// Generation check applied to writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationPolicy {
    /// No check.
    #[default]
    None,
    /// Stored generation must equal the given one.
    ExpectGenEqual,
    /// Given generation must exceed the stored one.
    ExpectGenGreater,
}

/// How many replicas a write waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitLevel {
    /// Every replica.
    #[default]
    CommitAll,
    /// Master only.
    CommitMaster,
}

/// Record time to live set by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Namespace default.
    #[default]
    NamespaceDefault,
    /// Seconds from now.
    Seconds(u32),
    /// Never expire.
    Never,
    /// Keep the current time to live.
    DontUpdate,
}

impl Expiration {
    /// Value sent in the message header.
    pub fn value(self) -> u32 {
        match self {
            Expiration::NamespaceDefault => 0,
            Expiration::Seconds(s) => s,
            Expiration::Never => u32::MAX,
            Expiration::DontUpdate => u32::MAX - 1,
        }
    }
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct BasePolicy {
    /// Per-attempt I/O timeout; zero is unbounded.
    pub socket_timeout: Duration,
    /// Whole-command timeout including retries; zero is unbounded.
    pub total_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial pause between attempts.
    pub sleep_between_retries: Duration,
    /// Factor applied to the pause after each retry.
    pub sleep_multiplier: f64,
    /// Send the user key along with the digest.
    pub send_key: bool,
    /// Compress requests and ask for compressed replies.
    pub use_compression: bool,
    /// Replica selection for reads.
    pub replica: Replica,
    /// AP read consistency.
    pub read_mode_ap: ReadModeAP,
    /// SC read consistency.
    pub read_mode_sc: ReadModeSC,
    /// Fail instead of retrying when a node pool is exhausted.
    pub exit_fast_on_exhausted_connection_pool: bool,
    /// Server-side predicate. Records it rejects are skipped by scans,
    /// queries and batches and fail other commands with `FilteredOut`.
    pub filter_expression: Option<Expression>,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(1),
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(1),
            sleep_multiplier: 1.0,
            send_key: false,
            use_compression: false,
            replica: Replica::default(),
            read_mode_ap: ReadModeAP::default(),
            read_mode_sc: ReadModeSC::default(),
            exit_fast_on_exhausted_connection_pool: false,
            filter_expression: None,
        }
    }
}

impl BasePolicy {
    /// Returns the command deadline, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        if self.total_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.total_timeout)
        }
    }

    /// Returns the effective per-attempt timeout: the smaller of the two
    /// timeouts when both are set.
    pub fn effective_socket_timeout(&self) -> Duration {
        match (self.socket_timeout.is_zero(), self.total_timeout.is_zero()) {
            (false, false) => self.socket_timeout.min(self.total_timeout),
            (true, false) => self.total_timeout,
            _ => self.socket_timeout,
        }
    }
}

/// Read policy.
pub type ReadPolicy = BasePolicy;

/// Settings for writes, deletes, touches and operate calls.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    /// Shared settings.
    pub base: BasePolicy,
    /// Behaviour when the record does or does not exist.
    pub record_exists_action: RecordExistsAction,
    /// Generation check.
    pub generation_policy: GenerationPolicy,
    /// Generation compared by `generation_policy`.
    pub generation: u32,
    /// Time to live.
    pub expiration: Expiration,
    /// Replicas to wait for.
    pub commit_level: CommitLevel,
    /// Leave a tombstone on delete.
    pub durable_delete: bool,
    /// Return a result per operation in operate calls.
    pub respond_per_each_op: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                max_retries: 0,
                ..BasePolicy::default()
            },
            record_exists_action: RecordExistsAction::default(),
            generation_policy: GenerationPolicy::default(),
            generation: 0,
            expiration: Expiration::default(),
            commit_level: CommitLevel::default(),
            durable_delete: false,
            respond_per_each_op: false,
        }
    }
}

/// Settings for batch reads.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Shared settings.
    pub base: BasePolicy,
    /// Nodes queried in parallel; zero queries all at once.
    pub concurrent_nodes: usize,
    /// Let the server process keys inline.
    pub allow_inline: bool,
    /// Send the set name with each key.
    pub send_set_name: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::default(),
            concurrent_nodes: 1,
            allow_inline: true,
            send_set_name: false,
        }
    }
}

/// Settings for scans.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    /// Shared settings.
    pub base: BasePolicy,
    /// Upper bound on records returned; zero is unbounded.
    pub max_records: u64,
    /// Server-side throttle; zero is unthrottled.
    pub records_per_second: u32,
    /// Return bin data, not only digests and metadata.
    pub include_bin_data: bool,
    /// Sample percentage. Treated as a hint; the scan always covers every
    /// requested partition.
    pub scan_percent: u8,
    /// Nodes scanned in parallel; zero scans all at once.
    pub max_concurrent_nodes: usize,
    /// Capacity of the record channel.
    pub record_queue_size: usize,
    /// Abort when the cluster key changes while the scan runs. Always on
    /// for strong consistency namespaces.
    pub fail_on_cluster_change: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                total_timeout: Duration::ZERO,
                max_retries: 5,
                ..BasePolicy::default()
            },
            max_records: 0,
            records_per_second: 0,
            include_bin_data: true,
            scan_percent: 100,
            max_concurrent_nodes: 0,
            record_queue_size: 50,
            fail_on_cluster_change: false,
        }
    }
}

/// Settings for secondary index queries.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    /// Shared settings.
    pub base: BasePolicy,
    /// Upper bound on records returned; zero is unbounded.
    pub max_records: u64,
    /// Server-side throttle; zero is unthrottled.
    pub records_per_second: u32,
    /// Return bin data, not only digests and metadata.
    pub include_bin_data: bool,
    /// Nodes queried in parallel; zero queries all at once.
    pub max_concurrent_nodes: usize,
    /// Capacity of the record channel.
    pub record_queue_size: usize,
    /// Abort when the cluster key changes while the query runs. Always on
    /// for strong consistency namespaces.
    pub fail_on_cluster_change: bool,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                total_timeout: Duration::ZERO,
                max_retries: 5,
                ..BasePolicy::default()
            },
            max_records: 0,
            records_per_second: 0,
            include_bin_data: true,
            max_concurrent_nodes: 0,
            record_queue_size: 50,
            fail_on_cluster_change: false,
        }
    }
}

/// Settings for info requests.
#[derive(Debug, Clone)]
pub struct InfoPolicy {
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for InfoPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

/// Settings for admin requests.
#[derive(Debug, Clone)]
pub struct AdminPolicy {
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for AdminPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}
