use std::time::Duration;

// ======= Chain client =======

/// Default deadline applied to every outbound chain RPC.
pub const CHAIN_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A subscription that stays silent this long is torn down and
/// re-established from the cursor.
pub const SUBSCRIPTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts allowed for a transient chain error before escalating.
pub const CHAIN_RETRY_ATTEMPTS: u32 = 5;

pub const CHAIN_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);

// ======= Orchestrator client =======

/// Deadline for a single orchestrator API call.
pub const KUBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts allowed against an unreachable orchestrator before a request is
/// recorded as failed with a synthetic 503.
pub const KUBE_RETRY_ATTEMPTS: u32 = 3;

pub const KUBE_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(250);

// ======= Observer =======

/// Per-partition buffer between the subscription pump and the dispatcher.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// In-memory capacity of the seen-digests set.
pub const SEEN_DIGESTS_CAPACITY: usize = 10_000;

/// Digests older than this are pruned from the persisted tail.
pub const SEEN_DIGESTS_RETENTION: Duration = Duration::from_secs(3600);

/// Cooldown before an aborted-but-unrecorded handler is retried.
pub const HANDLER_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

// ======= Heartbeats =======

/// A worker heartbeat is mirrored on-chain at most this often; the chain
/// only needs heartbeat freshness at scheduling granularity.
pub const HEARTBEAT_CHAIN_RECORD_INTERVAL: Duration = Duration::from_secs(300);

// ======= Settings environment variables =======

pub const CONFIG_ROOT: &str = "CK_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/chainkube";
