use std::time::Duration;

/// Protocol magic sent once after the TCP connection is established.
pub const MAGIC_V2: &[u8] = b"  V2";

/// Response body acknowledging a command.
pub const OK: &[u8] = b"OK";

/// Response body the broker sends to check the client is alive.
///
/// Clients must answer with `NOP` or the broker drops the connection.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response body sent by the broker after a `CLS` has been processed.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Frame type: command response.
pub const FRAME_TYPE_RESPONSE: i32 = 0;
/// Frame type: command error.
pub const FRAME_TYPE_ERROR: i32 = 1;
/// Frame type: delivered message.
pub const FRAME_TYPE_MESSAGE: i32 = 2;

/// Upper bound on a single frame (matches the broker's default `--max-msg-size` plus headroom).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Bytes of message header preceding the body: timestamp + attempts + id.
pub const MESSAGE_HEADER_SIZE: usize = 8 + 2 + MESSAGE_ID_SIZE;

/// Length of a message id.
pub const MESSAGE_ID_SIZE: usize = 16;

/// `status_code` value the directory service uses for success.
pub const LOOKUP_STATUS_OK: i64 = 200;

/// How often the directory service is re-queried.
pub const DEFAULT_LOOKUPD_INTERVAL: Duration = Duration::from_secs(30);

/// Per-request HTTP timeout for directory queries.
pub const DEFAULT_LOOKUPD_TIMEOUT: Duration = Duration::from_secs(1);

/// Read deadline for a broker connection; heartbeats arrive every 30s by default.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// In-flight budget announced with `RDY` after subscribing.
pub const DEFAULT_RDY_COUNT: u32 = 1;
