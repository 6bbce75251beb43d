//! Downsample time-interval splitting
//!
//! A downsampled aggregate over a plan range must be cut along fragment
//! boundaries without tearing any precision-sized group across two
//! un-mergeable results. The first layer slices the clamped per-fragment
//! intervals into prefix / whole-groups / suffix shards; the second tags
//! every shard with a combine group so the execution layer can reunite
//! partial aggregates that belong to the same precision window.

use crate::metadata::TimeInterval;

/// A shard with its combine-group label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupedShard {
    pub time_interval: TimeInterval,
    pub combine_group: u64,
    /// True when the shard spans one full precision window on its own
    pub whole_group: bool,
}

/// Slice each interval (clamped to `[begin, end)`) into at most three
/// shards:
///
/// - a prefix shard completing the group straddling the interval boundary
///   (never emitted for an interval starting at or before `begin`),
/// - a whole-groups shard covering every complete precision window,
/// - a suffix shard for the remainder.
///
/// The union of the output equals the union of the clamped inputs, with no
/// overlaps.
pub fn split_downsample_intervals(
    intervals: &[TimeInterval],
    begin: i64,
    end: i64,
    precision: i64,
) -> Vec<TimeInterval> {
    let mut result = Vec::new();
    for interval in intervals {
        let clamped_start = interval.start.max(begin);
        let clamped_end = interval.end.min(end);
        if clamped_end <= clamped_start {
            continue;
        }
        let mut cursor = clamped_start;
        if interval.start > begin && (interval.start - begin) % precision != 0 {
            let prefix_end =
                (cursor + precision - (interval.start - begin) % precision).min(clamped_end);
            result.push(TimeInterval::new(cursor, prefix_end));
            cursor = prefix_end;
        }
        let consumed = if clamped_end - cursor >= precision {
            let whole_end = clamped_end - (clamped_end - cursor) % precision;
            result.push(TimeInterval::new(cursor, whole_end));
            whole_end
        } else {
            cursor
        };
        if consumed < clamped_end {
            result.push(TimeInterval::new(consumed, clamped_end));
        }
    }
    result
}

/// Tag shards with combine groups.
///
/// A shard spanning at least one full precision window is cut into
/// precision-sized windows, each in a fresh combine group. Sub-precision
/// shards share a combine group until their accumulated span reaches the
/// precision, which closes the group.
pub fn assign_combine_groups(slices: &[TimeInterval], precision: i64) -> Vec<GroupedShard> {
    let mut result = Vec::new();
    let mut group = 0u64;
    let mut accumulated = 0i64;
    for slice in slices {
        if slice.span() >= precision {
            if accumulated > 0 {
                // A whole window never joins a partially filled group.
                accumulated = 0;
                group += 1;
            }
            let mut start = slice.start;
            while start < slice.end {
                result.push(GroupedShard {
                    time_interval: TimeInterval::new(start, start + precision),
                    combine_group: group,
                    whole_group: true,
                });
                group += 1;
                start += precision;
            }
        } else {
            result.push(GroupedShard {
                time_interval: *slice,
                combine_group: group,
                whole_group: false,
            });
            accumulated += slice.span();
            if accumulated >= precision {
                accumulated = 0;
                group += 1;
            }
        }
    }
    result
}
