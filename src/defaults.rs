//! Default timeouts and identifiers shared across the tool.

use std::time::Duration;

/// Bound on opening the etcd-backed cluster environment. Plan commands must
/// stay responsive on hosts where the cluster is down.
pub const ETCD_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Window granted to registered stoppers during process shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on establishing an agent transport.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Health-check cadence and per-probe deadline for agent peers.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on wizard operator HTTP calls.
pub const OPERATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Account that owns locally-installed clusters.
pub const SYSTEM_ACCOUNT_ID: &str = "system";
