//! Storage tuning parameters.
//!
//! Defaults follow what common download engines ship with: a bounded pool of
//! open descriptors well below typical per-process limits, and allocation
//! units small enough that one chunk never blocks a driver for long.

// ============================================================================
// File handles
// ============================================================================

/// Default ceiling on simultaneously open file handles per adaptor.
/// A single multi-file download can reference thousands of files, far more
/// than a process descriptor limit allows.
pub const DEFAULT_MAX_OPEN_FILES: usize = 100;

// ============================================================================
// Allocation
// ============================================================================

/// Bytes of zeroes written per chunk in full allocation mode (256 KiB).
pub const FILE_ALLOCATION_CHUNK_SIZE: u64 = 256 * 1024;

/// Bytes reserved per chunk with the OS preallocation facility (64 MiB).
pub const PREALLOCATION_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
