use crate::error::{Error, Result};
use crate::heatmap::{ArrayType, BinMapping, Cell, Datatype, HeatmapRequest, HeatmapSource};
use crate::matrix::{AsOption, Matrix, ScoreTable};
use crate::path::{domains_from_path, find_domain_path, DomainInterval, DomainSet};
use crate::pool::WorkerPool;

#[derive(Clone, Debug)]
pub struct ArrowheadConfig {
    pub binsize: u32,
    pub minbins: usize,
    pub maxbins: usize,
}

impl Default for ArrowheadConfig {
    fn default() -> Self {
        Self {
            binsize: 10_000,
            minbins: 5,
            maxbins: 100,
        }
    }
}

impl ArrowheadConfig {
    fn validate(&self) -> Result<()> {
        if self.binsize == 0 {
            return Err(Error::config("binsize must be positive"));
        }
        if self.minbins < 2 || self.minbins > self.maxbins {
            return Err(Error::config(format!(
                "need 2 <= minbins <= maxbins, got {}..{}",
                self.minbins, self.maxbins
            )));
        }
        Ok(())
    }
}

pub struct ArrowheadSegmenter<'a, S: HeatmapSource> {
    source: &'a S,
    config: ArrowheadConfig,
}

/// Running sums over a contiguous offset range of one transform row.
#[derive(Clone, Copy, Default)]
struct RegionStats {
    sum: f64,
    sumsq: f64,
    npos: f64,
    nneg: f64,
    count: f64,
}

impl RegionStats {
    fn add_range(&mut self, prefix: &Matrix<f64>, row: usize, lo: usize, hi: usize) {
        // prefix rows hold cumulative (sum, sumsq, npos, nneg, count) at
        // stride 5, prefix index k covers offsets [0, k)
        let p = &prefix[row];
        self.sum += p[hi * 5] - p[lo * 5];
        self.sumsq += p[hi * 5 + 1] - p[lo * 5 + 1];
        self.npos += p[hi * 5 + 2] - p[lo * 5 + 2];
        self.nneg += p[hi * 5 + 3] - p[lo * 5 + 3];
        self.count += p[hi * 5 + 4] - p[lo * 5 + 4];
    }

    fn mean(&self) -> f64 {
        self.sum / self.count
    }

    fn variance(&self) -> f64 {
        (self.sumsq / self.count - self.mean() * self.mean()).max(0.0)
    }

    fn sign_fraction(&self) -> f64 {
        (self.npos - self.nneg) / self.count
    }
}

/// Corner confidence from the within-domain triangle and one reflected
/// flanking triangle.
fn corner_score(u: &RegionStats, l: &RegionStats) -> Option<f64> {
    if u.count <= 0.0 || l.count <= 0.0 {
        return None;
    }
    Some(
        (l.mean() - u.mean()) + (l.sign_fraction() - u.sign_fraction())
            - (u.variance() + l.variance()).sqrt(),
    )
}

impl<'a, S: HeatmapSource + Sync> ArrowheadSegmenter<'a, S> {
    pub fn new(source: &'a S, config: ArrowheadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { source, config })
    }

    /// Dense symmetric heatmap at the target binsize assembled from 16x, 4x
    /// and 1x resolution passes. Each finer pass overwrites only cells it
    /// actually observed, so sparse regions keep the coarser estimate.
    fn assemble_heatmap(&self, chrom: &str) -> Result<Option<(usize, Vec<Cell>, BinMapping)>> {
        let bs = self.config.binsize;
        let coarse_req =
            HeatmapRequest::new(chrom, bs * 16, Datatype::Fend, ArrayType::Full);
        let (arr16, map16) = match self.source.heatmap(&coarse_req)? {
            Some(hm) => hm,
            None => return Ok(None),
        };
        let start = map16.start(0);
        let stop16 = map16.stop(map16.len() - 1);
        let mut n = map16.len() * 16;
        let mut dense = vec![Cell::default(); n * n];
        for i in 0..map16.len() {
            for j in 0..map16.len() {
                let c = arr16.get(i, j);
                for a in 0..16 {
                    for b in 0..16 {
                        dense[(i * 16 + a) * n + (j * 16 + b)] = c;
                    }
                }
            }
        }

        let mut overlay = |pass_binsize: u32, factor: usize| -> Result<Option<u32>> {
            let req = HeatmapRequest::new(chrom, pass_binsize, Datatype::Fend, ArrayType::Full)
                .range(start, stop16);
            let (arr, map) = match self.source.heatmap(&req)? {
                Some(hm) => hm,
                None => return Ok(None),
            };
            let offset = ((map.start(0) - start) / bs) as usize;
            for i in 0..map.len() {
                for j in 0..map.len() {
                    let c = arr.get(i, j);
                    if c.observed <= 0.0 {
                        continue;
                    }
                    for a in 0..factor {
                        for b in 0..factor {
                            let fi = offset + i * factor + a;
                            let fj = offset + j * factor + b;
                            if fi < n && fj < n {
                                dense[fi * n + fj] = c;
                            }
                        }
                    }
                }
            }
            Ok(Some(map.stop(map.len() - 1)))
        };

        overlay(bs * 4, 4)?;
        let fine_stop = overlay(bs, 1)?;

        // The coarse grid can extend past the chromosome end; truncate to the
        // extent the full-resolution pass covered.
        if let Some(fine_stop) = fine_stop {
            let keep = (((fine_stop - start) / bs) as usize).min(n);
            if keep < n {
                let mut trimmed = vec![Cell::default(); keep * keep];
                for i in 0..keep {
                    trimmed[i * keep..(i + 1) * keep]
                        .copy_from_slice(&dense[i * n..i * n + keep]);
                }
                dense = trimmed;
                n = keep;
            }
        }

        let mapping = BinMapping::from_pairs(
            (0..n)
                .map(|i| (start + i as u32 * bs, start + (i + 1) as u32 * bs))
                .collect(),
        )?;
        Ok(Some((n, dense, mapping)))
    }

    /// Arrowhead transform in compact layout: row `i`, offset `d` holds
    /// `(v(i, i-dist) - v(i, i+dist)) / (v(i, i-dist) + v(i, i+dist))` with
    /// `dist = d + 1`, NaN where either enrichment is undefined.
    fn transform(&self, n: usize, dense: &[Cell], noffsets: usize) -> Matrix<f64> {
        let enrich = |i: usize, j: usize| -> f64 {
            let c = dense[i * n + j];
            if c.expected > 0.0 {
                (c.observed / c.expected) as f64
            } else {
                f64::none()
            }
        };
        let mut a = Matrix::from_shape(n, noffsets, f64::none());
        for i in 0..n {
            for d in 0..noffsets {
                let dist = d + 1;
                if dist > i || i + dist >= n {
                    continue;
                }
                let up = enrich(i - dist, i);
                let down = enrich(i, i + dist);
                if up.is_none() || down.is_none() || up + down == 0.0 {
                    continue;
                }
                a[i][d] = (up - down) / (up + down);
            }
        }
        a
    }

    /// Per-row prefix sums of (value, value^2, sign counts, coverage) over
    /// the transform, NaN entries contributing nothing.
    fn prefix_sums(&self, a: &Matrix<f64>) -> Matrix<f64> {
        let n = a.get_nrows();
        let noffsets = a.get_ncols();
        let mut prefix = Matrix::from_shape(n, (noffsets + 1) * 5, 0.0);
        for i in 0..n {
            for d in 0..noffsets {
                let v = a[i][d];
                let base = d * 5;
                let next = (d + 1) * 5;
                for k in 0..5 {
                    prefix[i][next + k] = prefix[i][base + k];
                }
                if v.is_some() {
                    prefix[i][next] += v;
                    prefix[i][next + 1] += v * v;
                    if v > 0.0 {
                        prefix[i][next + 2] += 1.0;
                    } else if v < 0.0 {
                        prefix[i][next + 3] += 1.0;
                    }
                    prefix[i][next + 4] += 1.0;
                }
            }
        }
        prefix
    }

    /// Corner scores per (start, length). The within-domain triangle U is
    /// contrasted with its reflection across the downstream boundary and,
    /// symmetrically, across the upstream boundary; whichever flanks exist
    /// contribute, scaled by candidate length.
    fn score_candidates(&self, n: usize, prefix: &Matrix<f64>, noffsets: usize) -> ScoreTable {
        let cfg = &self.config;
        let mut table = ScoreTable::new(n, cfg.minbins, cfg.maxbins);
        for s in 0..n {
            for len in cfg.minbins..=cfg.maxbins.min(n - s) {
                let e = s + len - 1;
                let mut u = RegionStats::default();
                for i in s..e {
                    u.add_range(prefix, i, 0, (e - i).min(noffsets));
                }
                let mut total = 0.0;
                let mut sides = 0;
                if e + 1 < n {
                    // reflection of U across the downstream boundary
                    let mut l = RegionStats::default();
                    for i in s..e {
                        let lo = e - i;
                        let hi = (2 * (e - i)).min(noffsets).min(n - 1 - i);
                        if lo < hi {
                            l.add_range(prefix, i, lo, hi);
                        }
                    }
                    if let Some(score) = corner_score(&u, &l) {
                        total += score;
                        sides += 1;
                    }
                }
                if s > 0 {
                    // reflection of U across the upstream boundary
                    let mut l = RegionStats::default();
                    for p in 0..s {
                        // first reflected partner is 2s-1-p, offset 2(s-p-1)
                        let lo = 2 * (s - p - 1);
                        let hi = (e - p).min(noffsets);
                        if lo < hi {
                            l.add_range(prefix, p, lo, hi);
                        }
                    }
                    if let Some(score) = corner_score(&u, &l) {
                        total += score;
                        sides += 1;
                    }
                }
                if sides > 0 && total.is_finite() {
                    table.set(s, len, total * len as f64);
                }
            }
        }
        table
    }

    fn segment_chromosome(&self, chrom: &str) -> Result<Option<DomainSet>> {
        let cfg = &self.config;
        let (n, dense, mapping) = match self.assemble_heatmap(chrom)? {
            Some(hm) => hm,
            None => return Ok(None),
        };
        if n < cfg.minbins + 1 {
            return Ok(Some(DomainSet {
                chrom: chrom.to_owned(),
                intervals: vec![],
            }));
        }
        let noffsets = (2 * cfg.maxbins).min(n - 1);
        let a = self.transform(n, &dense, noffsets);
        let prefix = self.prefix_sums(&a);
        let table = self.score_candidates(n, &prefix, noffsets);
        let path = find_domain_path(&table, cfg.minbins, cfg.maxbins);
        let intervals = domains_from_path(&path)
            .into_iter()
            .map(|(a, b)| DomainInterval {
                start: mapping.start(a),
                stop: mapping.stop(b - 1),
            })
            .collect();
        Ok(Some(DomainSet {
            chrom: chrom.to_owned(),
            intervals,
        }))
    }

    /// Segment every chromosome independently, skipping chromosomes without
    /// data and reporting per-chromosome failures without aborting siblings.
    pub fn run(&self, chroms: &[String], pool: &WorkerPool) -> Result<Vec<DomainSet>> {
        let results = pool.map_gather(chroms.to_vec(), |chrom| self.segment_chromosome(&chrom));
        let mut out = Vec::new();
        for res in results {
            match res {
                Ok(Some(set)) => out.push(set),
                Ok(None) => {}
                Err(e) => eprintln!("warning: skipping chromosome after arrowhead failure: {e}"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heatmap::{DenseSource, DenseSourceBuilder};

    fn block_source(observed: impl Fn(u32, u32) -> f32) -> DenseSource {
        let mut b = DenseSourceBuilder::new(10_000);
        for i in 0..20u32 {
            for j in (i + 1)..20 {
                b.add_contact("chr1", i * 10_000, j * 10_000, observed(i, j), 5.0);
            }
        }
        b.finish().unwrap()
    }

    fn two_block_source() -> DenseSource {
        block_source(|i, j| if (i < 10) == (j < 10) { 20.0 } else { 1.0 })
    }

    fn test_config() -> ArrowheadConfig {
        ArrowheadConfig {
            binsize: 10_000,
            minbins: 5,
            maxbins: 15,
        }
    }

    #[test]
    fn transform_sign_reflects_upstream_bias() {
        let src = two_block_source();
        let seg = ArrowheadSegmenter::new(&src, test_config()).unwrap();
        let (n, dense, _) = seg.assemble_heatmap("chr1").unwrap().unwrap();
        assert_eq!(n, 20);
        let a = seg.transform(n, &dense, 19);
        // row 7, dist 4: upstream pair (3,7) is intra-block, downstream pair
        // (7,11) crosses the boundary, so the transform is strongly positive
        assert!(a[7][3] > 0.8);
        // fully intra-block contrasts cancel
        assert!(a[5][1].abs() < 1e-6);
    }

    #[test]
    fn two_block_matrix_yields_two_domains() {
        let src = two_block_source();
        let seg = ArrowheadSegmenter::new(&src, test_config()).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let sets = seg.run(&["chr1".to_owned()], &pool).unwrap();
        assert_eq!(sets.len(), 1);
        let domains = &sets[0].intervals;
        assert_eq!(domains.len(), 2, "domains: {domains:?}");
        assert!(domains[0].start <= 10_000);
        assert!((90_000..=110_000).contains(&domains[0].stop));
        assert!((90_000..=110_000).contains(&domains[1].start));
        assert!(domains[1].stop >= 190_000);
    }

    #[test]
    fn uniform_matrix_yields_no_domains() {
        let src = block_source(|_, _| 10.0);
        let seg = ArrowheadSegmenter::new(&src, test_config()).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let sets = seg.run(&["chr1".to_owned()], &pool).unwrap();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].intervals.is_empty(), "{:?}", sets[0].intervals);
    }

    #[test]
    fn missing_chromosome_produces_no_entry() {
        let src = two_block_source();
        let seg = ArrowheadSegmenter::new(&src, test_config()).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let sets = seg.run(&["chrZ".to_owned()], &pool).unwrap();
        assert!(sets.is_empty());
    }
}
