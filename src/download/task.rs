//! Chunk math and the concurrent-participation decision.

use tracing::debug;

use super::adapter::AdapterLimits;
use crate::backend::Backend;
use crate::config::{GIB, MIB};

/// Requested byte range of a partial download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte requested.
    pub offset: u64,
    /// Requested length; `None` means "to the end".
    pub length: Option<u64>,
}

/// Caller options for a download.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Forces single-stream download regardless of size.
    pub disable_concurrent: bool,
    /// Partial-content request, when the caller wants a sub-range.
    pub range: Option<ByteRange>,
}

/// Picks the chunk size for a file: the adapter's configured default when
/// present, the caller's configured default next, else a staircase by file
/// size.
#[must_use]
pub fn chunk_size_for(file_size: u64, adapter_default: u64, config_default: u64) -> u64 {
    if adapter_default > 0 {
        return adapter_default;
    }
    if config_default > 0 {
        return config_default;
    }
    if file_size <= 100 * MIB {
        10 * MIB
    } else if file_size <= GIB {
        32 * MIB
    } else if file_size <= 10 * GIB {
        100 * MIB
    } else {
        200 * MIB
    }
}

/// Inclusive byte range of chunk `i`.
#[must_use]
pub fn chunk_range(i: u32, chunk_size: u64, file_size: u64) -> (u64, u64) {
    let start = u64::from(i) * chunk_size;
    let end = (start + chunk_size).min(file_size) - 1;
    (start, end)
}

/// Worker-pool width: bounded by the chunk count, the adapter ceiling, and
/// a backend default that opens up for multi-gigabyte files.
#[must_use]
pub fn max_concurrency(num_chunks: u32, adapter_max: usize, file_size: u64) -> usize {
    let backend_default = if file_size > GIB { 4 } else { 2 };
    (num_chunks as usize).min(adapter_max).min(backend_default).max(1)
}

/// Whether a download should go through the chunked concurrent path.
///
/// Partial-range requests are mostly declined: for Drive-A, the upstream
/// multi-threaded copier already splits into 32-128 MiB sub-ranges and
/// double-chunking them wastes workers, while ranges of 200 MiB and up are
/// the cross-cloud case where chunking both sides causes contention.
/// Drive-B tolerates chunked partials down to 10 MiB.
#[must_use]
pub fn should_download_concurrently(
    backend: Backend,
    size: u64,
    options: &DownloadOptions,
    limits: &AdapterLimits,
) -> bool {
    if options.disable_concurrent {
        debug!("concurrent download disabled by caller");
        return false;
    }
    if size < limits.min_size_for_concurrency {
        debug!(
            size,
            min = limits.min_size_for_concurrency,
            "file too small for concurrent download"
        );
        return false;
    }

    if let Some(range) = options.range {
        let len = range.length.unwrap_or(size.saturating_sub(range.offset));
        match backend {
            Backend::DriveA => {
                if (32 * MIB..=128 * MIB).contains(&len) {
                    debug!(len, "declining: upstream copier chunk size");
                } else if len >= 200 * MIB {
                    debug!(len, "declining: large cross-cloud range");
                } else {
                    debug!(len, "declining: partial range");
                }
                return false;
            }
            Backend::DriveB => {
                if len < 10 * MIB {
                    debug!(len, "declining: partial range too small");
                    return false;
                }
            }
        }
    }

    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(min: u64) -> AdapterLimits {
        AdapterLimits {
            min_size_for_concurrency: min,
            max_concurrency: 4,
            default_chunk_size: 0,
            per_chunk_timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn staircase_by_file_size() {
        assert_eq!(chunk_size_for(50 * MIB, 0, 0), 10 * MIB);
        assert_eq!(chunk_size_for(100 * MIB, 0, 0), 10 * MIB);
        assert_eq!(chunk_size_for(500 * MIB, 0, 0), 32 * MIB);
        assert_eq!(chunk_size_for(GIB, 0, 0), 32 * MIB);
        assert_eq!(chunk_size_for(5 * GIB, 0, 0), 100 * MIB);
        assert_eq!(chunk_size_for(20 * GIB, 0, 0), 200 * MIB);
    }

    #[test]
    fn explicit_chunk_sizes_win() {
        assert_eq!(chunk_size_for(5 * GIB, 64 * MIB, 16 * MIB), 64 * MIB);
        assert_eq!(chunk_size_for(5 * GIB, 0, 16 * MIB), 16 * MIB);
    }

    #[test]
    fn chunk_ranges_cover_the_file_exactly() {
        // 250 bytes in chunks of 100: [0,99], [100,199], [200,249].
        assert_eq!(chunk_range(0, 100, 250), (0, 99));
        assert_eq!(chunk_range(1, 100, 250), (100, 199));
        assert_eq!(chunk_range(2, 100, 250), (200, 249));
    }

    #[test]
    fn one_byte_final_chunk() {
        assert_eq!(chunk_range(1, 100, 101), (100, 100));
    }

    #[test]
    fn concurrency_bounds() {
        assert_eq!(max_concurrency(1, 8, 10 * GIB), 1);
        assert_eq!(max_concurrency(10, 8, 500 * MIB), 2);
        assert_eq!(max_concurrency(10, 8, 2 * GIB), 4);
        assert_eq!(max_concurrency(10, 3, 2 * GIB), 3);
    }

    #[test]
    fn small_files_stay_single_stream() {
        let opts = DownloadOptions::default();
        assert!(!should_download_concurrently(
            Backend::DriveA,
            10 * MIB,
            &opts,
            &limits(50 * MIB)
        ));
        assert!(should_download_concurrently(
            Backend::DriveA,
            100 * MIB,
            &opts,
            &limits(50 * MIB)
        ));
    }

    #[test]
    fn disable_flag_wins() {
        let opts = DownloadOptions {
            disable_concurrent: true,
            ..Default::default()
        };
        assert!(!should_download_concurrently(
            Backend::DriveA,
            GIB,
            &opts,
            &limits(50 * MIB)
        ));
    }

    #[test]
    fn drive_a_declines_all_partials() {
        let cases = [
            64 * MIB,  // upstream copier chunk
            200 * MIB, // cross-cloud range
            5 * MIB,   // anything else
        ];
        for len in cases {
            let opts = DownloadOptions {
                disable_concurrent: false,
                range: Some(ByteRange {
                    offset: 0,
                    length: Some(len),
                }),
            };
            assert!(
                !should_download_concurrently(Backend::DriveA, GIB, &opts, &limits(50 * MIB)),
                "len {len} should decline"
            );
        }
    }

    #[test]
    fn drive_b_partials_need_ten_mib() {
        let small = DownloadOptions {
            disable_concurrent: false,
            range: Some(ByteRange {
                offset: 0,
                length: Some(5 * MIB),
            }),
        };
        assert!(!should_download_concurrently(
            Backend::DriveB,
            GIB,
            &small,
            &limits(50 * MIB)
        ));

        let big = DownloadOptions {
            disable_concurrent: false,
            range: Some(ByteRange {
                offset: 0,
                length: Some(64 * MIB),
            }),
        };
        assert!(should_download_concurrently(
            Backend::DriveB,
            GIB,
            &big,
            &limits(50 * MIB)
        ));
    }
}
