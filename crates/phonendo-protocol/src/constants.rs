/// Prefix shared by every role tag on the wire (`phonendo_storage`, ...).
pub const ROLE_TAG_PREFIX: &str = "phonendo_";

/// Version suffix appended to every operation name (`/capture/1.0.0`).
pub const PROTOCOL_SUFFIX: &str = "1.0.0";

/// Protocol version string advertised through Identify.
pub const PROTOCOL_VERSION: &str = "/phonendo/1.0.0";

/// Constant self-announcement sent on the discover protocol.
pub const DISCOVER_PAYLOAD: &str = "discover";

/// Constant request body for the verifier's public key.
pub const PK_PAYLOAD: &str = "pk";

/// Constant request body for the storage reconnect operation.
pub const RECONNECT_PAYLOAD: &str = "reconnect";

/// Separator between an opaque key and its JSON value.
pub const KEY_VALUE_DELIMITER: &str = "##";

/// Status string for a successful operation.
pub const STATUS_OK: &str = "true";

/// Status string for a refused operation.
pub const STATUS_FAILED: &str = "false";

/// Upper bound on a single request or response payload (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default delay before a deferred reconnection replay is retried.
pub const DEFAULT_REPLAY_BACKOFF_SECS: u64 = 10;

/// Default per-request timeout for outbound invocations.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Interval between mDNS queries (the original fleet announced every 20s).
pub const MDNS_QUERY_INTERVAL_SECS: u64 = 20;

/// Size of the random payload echoed by a liveness probe.
pub const PING_PAYLOAD_SIZE: usize = 32;
