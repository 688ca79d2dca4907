// -----------------------------------------------------------------------------
// Exit Codes
// -----------------------------------------------------------------------------

/// Execution success.
pub const E_CODE_SUCCESS: i32 = libc::EXIT_SUCCESS;

/// Execution failure.
///
/// Reported by a worker that stopped because of an uncaught error, an
/// out-of-memory condition, or a forced termination.
pub const E_CODE_FAILURE: i32 = libc::EXIT_FAILURE;

// -----------------------------------------------------------------------------
// System - Scheduler Behavior
// -----------------------------------------------------------------------------

/// Default number of background threads.
///
/// Note: This value is only used when a default value is not
///       retrievable from the host environment.
pub const DEFAULT_BACKGROUND_THREADS: usize = 4;

/// Stack size (in bytes) for background and worker threads.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Initial capacity of a task queue.
pub const CAP_TASK_QUEUE: usize = 32;

// -----------------------------------------------------------------------------
// System - Messaging
// -----------------------------------------------------------------------------

/// Initial capacity of a channel's incoming message queue.
pub const CAP_CHANNEL_QUEUE: usize = 8;

/// Version byte written at the start of every encoded payload.
pub const WIRE_FORMAT_VERSION: u8 = 0x01;

/// Maximum nesting depth accepted when decoding a payload.
pub const MAX_DECODE_DEPTH: usize = 256;

// -----------------------------------------------------------------------------
// System - Realm Behavior
// -----------------------------------------------------------------------------

/// Default heap limit of a realm (in bytes); `0` means unlimited.
pub const DEFAULT_HEAP_LIMIT: usize = 0;
