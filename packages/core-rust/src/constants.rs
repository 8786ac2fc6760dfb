//! Well-known URL parameter keys, component names, and defaults.

// ---------------------------------------------------------------------------
// Component names
// ---------------------------------------------------------------------------

/// In-process backend name used by every built-in memory adapter.
pub const MEMORY_KEY: &str = "memory";
pub const NACOS_KEY: &str = "nacos";
pub const ETCD_KEY: &str = "etcd";
pub const REDIS_KEY: &str = "redis";

/// Service factory registered by default.
pub const DEFAULT_PROTOCOL: &str = "rpc";
pub const RANDOM_SELECTOR: &str = "random";
pub const ROUND_ROBIN_SELECTOR: &str = "roundrobin";

// ---------------------------------------------------------------------------
// URL parameter keys
// ---------------------------------------------------------------------------

pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const TIMEOUT_KEY: &str = "timeout";
pub const ROLE_KEY: &str = "registry.role";
pub const REGISTRY_KEY: &str = "registry";
pub const REGISTRY_TIMEOUT_KEY: &str = "registry.timeout";
pub const REGISTRY_TTL_KEY: &str = "registry.ttl";
pub const REGISTRY_ZONE_KEY: &str = "registry.zone";
pub const REGISTRY_PREFERRED_KEY: &str = "registry.preferred";
pub const REGISTRY_LABEL_KEY: &str = "registry.label";
pub const SIMPLIFIED_KEY: &str = "simplified";

pub const CONFIG_NAMESPACE_KEY: &str = "config.namespace";
pub const CONFIG_GROUP_KEY: &str = "config.group";
pub const CONFIG_CLUSTER_KEY: &str = "config.cluster";
pub const CONFIG_APP_ID_KEY: &str = "config.appId";
pub const CONFIG_LOG_DIR_KEY: &str = "config.logDir";
pub const CONFIG_TIMEOUT_KEY: &str = "config.timeout";

/// Request metadata key carrying the bearer token.
pub const AUTHORIZATION_KEY: &str = "authorization";

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_GROUP: &str = "micro";
pub const DEFAULT_NAMESPACE: &str = "micro";
pub const DEFAULT_CONFIG_FILE: &str = "micro.properties";
pub const DEFAULT_REGISTRY_TIMEOUT: &str = "5s";
pub const DEFAULT_REGISTRY_TTL: &str = "10m";
pub const DEFAULT_CONFIG_TIMEOUT: &str = "10s";
pub const DEFAULT_CONNECT_TIMEOUT: &str = "100ms";
pub const DEFAULT_REQUEST_TIMEOUT: &str = "5s";

pub const DEFAULT_SERVER_NAME: &str = "xmicro.server";
pub const DEFAULT_SERVER_VERSION: &str = "latest";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:0";
pub const DEFAULT_REGISTER_TTL_SECS: u64 = 90;
pub const DEFAULT_REGISTER_INTERVAL_SECS: u64 = 30;

/// Upper bound for a client request timeout (15 minutes).
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 900;
