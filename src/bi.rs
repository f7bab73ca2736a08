use crate::error::{Error, Result};
use crate::heatmap::{ArrayType, Datatype, HeatmapRequest, HeatmapSource, InteractionArray};
use crate::matrix::ScoreTable;
use crate::path::{domains_from_path, find_domain_path, DomainInterval, DomainSet};
use crate::pool::WorkerPool;

/// Boundary-index segmentation parameters. `width` is the number of spacer
/// bins separating a candidate domain from the flanking region it is
/// contrasted against; `minbins`/`maxbins` bound candidate domain lengths.
#[derive(Clone, Debug)]
pub struct BiConfig {
    pub binsize: u32,
    pub width: usize,
    pub minbins: usize,
    pub maxbins: usize,
}

impl Default for BiConfig {
    fn default() -> Self {
        Self {
            binsize: 10_000,
            width: 2,
            minbins: 5,
            maxbins: 100,
        }
    }
}

impl BiConfig {
    fn validate(&self) -> Result<()> {
        if self.binsize == 0 {
            return Err(Error::config("binsize must be positive"));
        }
        if self.width == 0 {
            return Err(Error::config("spacer width must be at least one bin"));
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

pub struct BiSegmenter<'a, S: HeatmapSource> {
    source: &'a S,
    config: BiConfig,
}

#[derive(Clone, Copy, Default)]
struct Sums {
    obs: f64,
    exp: f64,
}

impl Sums {
    fn add(&mut self, c: crate::heatmap::Cell) {
        self.obs += c.observed as f64;
        self.exp += c.expected as f64;
    }

    fn valid(&self) -> bool {
        self.obs > 0.0 && self.exp > 0.0
    }
}

/// Contrast of intra-domain versus boundary-crossing enrichment. Positive
/// when the domain interior is enriched relative to contacts crossing the
/// boundary into the spacer.
fn boundary_score(intra: Sums, inter: Sums) -> f64 {
    if !intra.valid() || !inter.valid() {
        return f64::NEG_INFINITY;
    }
    (intra.obs * inter.exp).ln() - (inter.obs * intra.exp).ln()
}

impl<'a, S: HeatmapSource + Sync> BiSegmenter<'a, S> {
    pub fn new(source: &'a S, config: BiConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { source, config })
    }

    /// Fill the per-(anchor, length) boundary tables. `side0` scores the
    /// upstream boundary of a domain starting at the anchor; `side1` scores
    /// the downstream boundary of a domain ending at the anchor. Both grow
    /// their running sums one bin at a time in the length direction.
    fn score_tables(&self, array: &InteractionArray) -> (ScoreTable, ScoreTable) {
        let cfg = &self.config;
        let n = array.nbins();
        let mut side0 = ScoreTable::new(n, cfg.minbins, cfg.maxbins);
        let mut side1 = ScoreTable::new(n, cfg.minbins, cfg.maxbins);

        for s in 0..n {
            if s == 0 {
                continue; // no upstream spacer exists
            }
            let spacer = s.saturating_sub(cfg.width)..s;
            let mut intra = Sums::default();
            let mut inter = Sums::default();
            for len in 1..=cfg.maxbins.min(n - s) {
                let e = s + len - 1;
                for b in s..e {
                    intra.add(array.get(b, e));
                }
                for w in spacer.clone() {
                    inter.add(array.get(w, e));
                }
                if len >= cfg.minbins {
                    side0.set(s, len, boundary_score(intra, inter));
                }
            }
        }

        for e in 0..n {
            if e + 1 >= n {
                continue; // no downstream spacer exists
            }
            let spacer = (e + 1)..(e + 1 + cfg.width).min(n);
            let mut intra = Sums::default();
            let mut inter = Sums::default();
            for len in 1..=cfg.maxbins.min(e + 1) {
                let s = e + 1 - len;
                for b in (s + 1)..=e {
                    intra.add(array.get(s, b));
                }
                for w in spacer.clone() {
                    inter.add(array.get(s, w));
                }
                if len >= cfg.minbins {
                    side1.set(e, len, boundary_score(intra, inter));
                }
            }
        }

        (side0, side1)
    }

    /// Per-candidate score: the sum of whichever boundary sides exist, scaled
    /// by candidate length so evidence accumulates over the bins a boundary
    /// supports. A side cut off by the chromosome edge is skipped; a side
    /// with zero observed or expected coverage invalidates the candidate.
    fn combine(&self, n: usize, side0: &ScoreTable, side1: &ScoreTable) -> ScoreTable {
        let cfg = &self.config;
        let mut combined = ScoreTable::new(n, cfg.minbins, cfg.maxbins);
        for s in 0..n {
            for len in cfg.minbins..=cfg.maxbins.min(n - s) {
                let e = s + len - 1;
                let mut total = 0.0;
                let mut sides = 0;
                if s > 0 {
                    total += side0.get(s, len);
                    sides += 1;
                }
                if e + 1 < n {
                    total += side1.get(e, len);
                    sides += 1;
                }
                if sides > 0 && total.is_finite() {
                    combined.set(s, len, total * len as f64);
                }
            }
        }
        combined
    }

    fn segment_chromosome(&self, chrom: &str) -> Result<Option<DomainSet>> {
        let cfg = &self.config;
        let max_distance = (cfg.maxbins + cfg.width + 1) as u32 * cfg.binsize;
        let req = HeatmapRequest::new(chrom, cfg.binsize, Datatype::Enrichment, ArrayType::Compact)
            .max_distance(max_distance);
        let (array, mapping) = match self.source.heatmap(&req)? {
            Some(hm) => hm,
            None => return Ok(None),
        };
        let n = array.nbins();
        let (side0, side1) = self.score_tables(&array);
        let combined = self.combine(n, &side0, &side1);
        let path = find_domain_path(&combined, cfg.minbins, cfg.maxbins);
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

    /// Segment every chromosome independently. Missing chromosomes are
    /// dropped from the output; per-chromosome failures are reported and
    /// skipped without aborting siblings.
    pub fn run(&self, chroms: &[String], pool: &WorkerPool) -> Result<Vec<DomainSet>> {
        let results = pool.map_gather(chroms.to_vec(), |chrom| self.segment_chromosome(&chrom));
        let mut out = Vec::new();
        for res in results {
            match res {
                Ok(Some(set)) => out.push(set),
                Ok(None) => {}
                Err(e) => eprintln!("warning: skipping chromosome after boundary-index failure: {e}"),
            }
        }
        Ok(out)
    }
}
