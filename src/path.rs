use crate::matrix::ScoreTable;

/// A called domain in genomic coordinates, half-open `[start, stop)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainInterval {
    pub start: u32,
    pub stop: u32,
}

/// Per-chromosome domain calls, kept sorted by start.
#[derive(Clone, Debug, Default)]
pub struct DomainSet {
    pub chrom: String,
    pub intervals: Vec<DomainInterval>,
}

/// A compartment run with its eigenvector sign and mean score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompartmentInterval {
    pub start: u32,
    pub stop: u32,
    /// 0 or 1, the decoded HMM state for the run
    pub state: u8,
    pub mean_score: f64,
}

#[derive(Clone, Debug, Default)]
pub struct CompartmentSet {
    pub chrom: String,
    pub intervals: Vec<CompartmentInterval>,
}

/// Best non-overlapping domain partition over a scored chromosome.
///
/// `scores.get(start, len)` is the quality of a candidate domain covering bins
/// `[start, start + len)`; negative infinity means no valid candidate. The
/// recurrence walks left to right, at each bin either carrying the previous
/// best forward (a gap of one bin) or ending a domain of each candidate
/// length. Returns a per-bin path vector: `path[i] == 1` marks a gap and
/// `path[i] == l > 1` marks a domain of `l` bins ending at `i`.
pub fn find_domain_path(scores: &ScoreTable, minbins: usize, maxbins: usize) -> Vec<usize> {
    let n = scores.nbins();
    let mut best = vec![0.0f64; n];
    let mut path = vec![1usize; n];
    for i in 0..n {
        if i > 0 {
            best[i] = best[i - 1];
        }
        for len in minbins..=maxbins.min(i + 1) {
            let start = i + 1 - len;
            let s = scores.get(start, len);
            if !s.is_finite() {
                continue;
            }
            let prev = if start > 0 { best[start - 1] } else { 0.0 };
            if prev + s > best[i] {
                best[i] = prev + s;
                path[i] = len;
            }
        }
    }
    path
}

/// Walk a domain path backwards and emit bin-index intervals, sorted by start.
pub fn domains_from_path(path: &[usize]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = path.len();
    while i > 0 {
        let step = path[i - 1];
        if step > 1 {
            out.push((i - step, i));
        }
        i -= step;
    }
    out.reverse();
    out
}

/// Domains are called independently per anchor, so two adjacent calls can
/// claim the same boundary bin. Move both to the shared midpoint so the set
/// is strictly non-overlapping.
pub fn reconcile_overlaps(intervals: &mut [DomainInterval]) {
    for i in 1..intervals.len() {
        if intervals[i].start < intervals[i - 1].stop {
            let mid = (intervals[i].start + intervals[i - 1].stop) / 2;
            intervals[i - 1].stop = mid;
            intervals[i].start = mid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_single_best_domain() {
        // 10 bins, one clearly good candidate covering [2, 7)
        let mut t = ScoreTable::new(10, 3, 6);
        t.set(2, 5, 4.0);
        t.set(0, 3, 0.5);
        let path = find_domain_path(&t, 3, 6);
        let domains = domains_from_path(&path);
        assert_eq!(domains, vec![(2, 7)]);
    }

    #[test]
    fn prefers_two_domains_over_one_spanning_call() {
        let mut t = ScoreTable::new(12, 3, 10);
        t.set(0, 10, 3.0);
        t.set(0, 4, 2.5);
        t.set(5, 4, 2.5);
        let path = find_domain_path(&t, 3, 10);
        let domains = domains_from_path(&path);
        assert_eq!(domains, vec![(0, 4), (5, 9)]);
    }

    #[test]
    fn negative_scores_yield_no_domains() {
        let mut t = ScoreTable::new(8, 3, 5);
        t.set(0, 3, -1.0);
        t.set(4, 4, -0.25);
        let path = find_domain_path(&t, 3, 5);
        assert!(domains_from_path(&path).is_empty());
    }

    #[test]
    fn emitted_domains_never_overlap() {
        let mut t = ScoreTable::new(30, 3, 8);
        // dense competing candidates
        for start in 0..25 {
            for len in 3..=8usize {
                if start + len <= 30 {
                    t.set(start, len, ((start * 7 + len * 13) % 11) as f64 - 3.0);
                }
            }
        }
        let domains = domains_from_path(&find_domain_path(&t, 3, 8));
        for w in domains.windows(2) {
            assert!(w[0].1 <= w[1].0, "{:?} overlaps {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn overlap_reconciliation_moves_both_to_midpoint() {
        let mut iv = vec![
            DomainInterval {
                start: 0,
                stop: 120_000,
            },
            DomainInterval {
                start: 100_000,
                stop: 200_000,
            },
        ];
        reconcile_overlaps(&mut iv);
        assert_eq!(iv[0].stop, 110_000);
        assert_eq!(iv[1].start, 110_000);
    }
}
