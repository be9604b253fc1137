//! Project-wide constants.

/// Name of the build state directory, created next to the build it traces.
pub const BUILD_DIR: &str = ".retrace";

/// Trace file name inside the build directory.
pub const TRACE_FILENAME: &str = "trace";

/// Temporary trace file; renamed over [`TRACE_FILENAME`] on a successful finish.
pub const TRACE_TEMP_FILENAME: &str = "trace.tmp";

/// Content cache directory inside the build directory.
pub const CACHE_DIR: &str = "cache";

/// Staging cache for the build in progress; rotated over [`CACHE_DIR`] on finish.
pub const NEW_CACHE_DIR: &str = "newcache";

/// Lock file guarding the build directory against concurrent retrace processes.
pub const LOCK_FILENAME: &str = "lock";

/// The build program a fresh trace launches.
pub const BUILD_FILE: &str = "Buildfile";

/// Shell used to run the build file.
pub const BUILD_SHELL: &str = "/bin/sh";

/// Magic number at the head of every trace file.
pub const TRACE_MAGIC: u64 = u64::from_le_bytes(*b"RETRACE\0");

/// Trace format version; bumped on incompatible changes.
pub const TRACE_VERSION: u64 = 1;

/// Maximum symlink depth during path resolution before reporting ELOOP.
pub const SYMLINK_FOLLOW_LIMIT: u32 = 40;

/// Default column budget when printing command short names.
pub const DEFAULT_COMMAND_LENGTH: usize = 80;

/// Buffer size for streaming file hashing.
pub const HASH_BUF_SIZE: usize = 65536;
