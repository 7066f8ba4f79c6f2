//! Range merging
//!
//! Many small payloads scattered through the remote package would cost
//! one HTTP round-trip each. The merger coalesces adjacent small ranges
//! into one request, bounded by a total-download cap and a wasted-bytes
//! ratio, so the saving never turns into bulk over-fetch.

use tracing::debug;

/// Files above this payload size are never merged
pub const MERGE_MAX_FILE_SIZE: u64 = 500 * 1024;

/// A merged request may not download more than this
pub const MERGE_MAX_DOWNLOAD: u64 = 10 * 1024 * 1024;

/// Upper bound on `(download - effective) / download`
pub const MERGE_MAX_WASTE: f64 = 0.20;

/// One mergeable remote fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeCandidate {
    /// Index of the owning task in the plan
    pub task_index: usize,
    /// Absolute payload offset in the remote package
    pub offset: u64,
    /// Payload size in bytes
    pub size: u64,
}

impl MergeCandidate {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A group of payloads fetched through one HTTP range request
#[derive(Debug, Clone)]
pub struct MergedGroup {
    /// Constituent fetches, sorted by offset
    pub files: Vec<MergeCandidate>,
    /// Absolute byte interval `[start, end)` of the single request
    pub range: (u64, u64),
    /// Bytes the request downloads
    pub total_download: u64,
    /// Bytes belonging to constituent payloads
    pub total_effective: u64,
    /// `(total_download - total_effective) / total_download`
    pub waste_ratio: f64,
    /// Discarded intervals between consecutive payloads
    pub gaps: Vec<(u64, u64)>,
}

/// Output of a merge pass: groups plus everything left individual
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Multi-file groups worth a single request
    pub groups: Vec<MergedGroup>,
    /// Fetches that stay as plain single-range requests
    pub singles: Vec<MergeCandidate>,
}

/// Coalesce small adjacent ranges under the download and waste caps
pub fn merge_ranges(mut candidates: Vec<MergeCandidate>) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    // Large files go straight through; only small ones merge.
    candidates.retain(|c| {
        if c.size > MERGE_MAX_FILE_SIZE {
            outcome.singles.push(*c);
            false
        } else {
            true
        }
    });
    candidates.sort_by_key(|c| c.offset);

    let mut current: Vec<MergeCandidate> = Vec::new();
    for candidate in candidates {
        if current.is_empty() {
            current.push(candidate);
            continue;
        }

        let start = current[0].offset;
        let end = candidate.end().max(current.last().map_or(0, MergeCandidate::end));
        let download = end - start;
        let effective: u64 = current.iter().map(|c| c.size).sum::<u64>() + candidate.size;
        let waste = waste_ratio(download, effective);

        if download <= MERGE_MAX_DOWNLOAD && waste <= MERGE_MAX_WASTE {
            current.push(candidate);
        } else {
            flush(&mut outcome, std::mem::take(&mut current));
            current.push(candidate);
        }
    }
    flush(&mut outcome, current);

    debug!(
        "merge pass: {} groups, {} singles",
        outcome.groups.len(),
        outcome.singles.len()
    );
    outcome
}

fn waste_ratio(download: u64, effective: u64) -> f64 {
    if download == 0 {
        return 0.0;
    }
    (download.saturating_sub(effective)) as f64 / download as f64
}

fn flush(outcome: &mut MergeOutcome, group: Vec<MergeCandidate>) {
    match group.len() {
        0 => {}
        1 => outcome.singles.push(group[0]),
        _ => {
            let start = group[0].offset;
            let end = group.iter().map(MergeCandidate::end).max().unwrap_or(start);
            let total_download = end - start;
            let total_effective = group.iter().map(|c| c.size).sum();

            let mut gaps = Vec::new();
            let mut covered_to = start;
            for candidate in &group {
                if candidate.offset > covered_to {
                    gaps.push((covered_to, candidate.offset));
                }
                covered_to = covered_to.max(candidate.end());
            }

            outcome.groups.push(MergedGroup {
                range: (start, end),
                total_download,
                total_effective,
                waste_ratio: waste_ratio(total_download, total_effective),
                gaps,
                files: group,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn candidate(task_index: usize, offset: u64, size: u64) -> MergeCandidate {
        MergeCandidate {
            task_index,
            offset,
            size,
        }
    }

    #[test]
    fn test_adjacent_small_files_merge() {
        let outcome = merge_ranges(vec![
            candidate(0, 0, 100 * 1024),
            candidate(1, 100 * 1024, 100 * 1024),
            candidate(2, 200 * 1024, 50 * 1024),
        ]);

        assert_eq!(outcome.groups.len(), 1);
        assert!(outcome.singles.is_empty());
        let group = &outcome.groups[0];
        assert_eq!(group.range, (0, 250 * 1024));
        assert_eq!(group.total_effective, 250 * 1024);
        assert!(group.waste_ratio.abs() < f64::EPSILON);
        assert!(group.gaps.is_empty());
    }

    #[test]
    fn test_waste_cap_splits_groups() {
        // Second candidate sits far enough away that merging would waste
        // more than 20% of the download.
        let outcome = merge_ranges(vec![
            candidate(0, 0, 100 * 1024),
            candidate(1, 200 * 1024, 100 * 1024),
        ]);
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.singles.len(), 2);
    }

    #[test]
    fn test_small_gap_tolerated_and_recorded() {
        let outcome = merge_ranges(vec![
            candidate(0, 0, 100 * 1024),
            candidate(1, 110 * 1024, 100 * 1024),
        ]);
        assert_eq!(outcome.groups.len(), 1);
        let group = &outcome.groups[0];
        assert_eq!(group.gaps, vec![(100 * 1024, 110 * 1024)]);
        assert!(group.waste_ratio <= MERGE_MAX_WASTE);
        assert_eq!(group.total_effective, 200 * 1024);
        assert_eq!(group.total_download, 210 * 1024);
    }

    #[test]
    fn test_download_cap_respected() {
        // 30 files of 400 KiB back to back: caps at 10 MiB per group.
        let candidates: Vec<_> = (0..30)
            .map(|i| candidate(i, i as u64 * 400 * 1024, 400 * 1024))
            .collect();
        let outcome = merge_ranges(candidates);

        assert!(outcome.groups.len() >= 2);
        for group in &outcome.groups {
            assert!(group.total_download <= MERGE_MAX_DOWNLOAD);
            assert!(group.waste_ratio <= MERGE_MAX_WASTE);
        }
        let grouped: usize = outcome.groups.iter().map(|g| g.files.len()).sum();
        assert_eq!(grouped + outcome.singles.len(), 30);
    }

    #[test]
    fn test_large_files_never_merge() {
        let outcome = merge_ranges(vec![
            candidate(0, 0, MERGE_MAX_FILE_SIZE + 1),
            candidate(1, 600 * 1024, 100),
        ]);
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.singles.len(), 2);
    }

    #[test]
    fn test_effective_equals_sum_of_sizes() {
        let sizes = [10 * 1024u64, 20 * 1024, 30 * 1024, 15 * 1024];
        let mut offset = 5000u64;
        let mut candidates = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            candidates.push(candidate(i, offset, *size));
            offset += size + 512; // slim gaps
        }
        let outcome = merge_ranges(candidates);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(
            outcome.groups[0].total_effective,
            sizes.iter().sum::<u64>()
        );
    }
}
