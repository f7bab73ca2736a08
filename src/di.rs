use crate::error::{Error, Result};
use crate::heatmap::{ArrayType, Datatype, HeatmapRequest, HeatmapSource};
use crate::hmm::{GaussComponent, GaussianHmm};
use crate::path::{reconcile_overlaps, DomainInterval, DomainSet};
use crate::pool::WorkerPool;

/// Directionality-index segmentation parameters. `step` is the fine scoring
/// resolution and must evenly divide `binsize`; `window` bounds the contact
/// distance considered on each side. The three genomic distances parameterize
/// the transition prior of the 3-state boundary HMM.
#[derive(Clone, Debug)]
pub struct DiConfig {
    pub binsize: u32,
    pub step: u32,
    pub window: u32,
    pub smoothing: usize,
    pub trans_within: u32,
    pub trans_border: u32,
    pub trans_escape: u32,
    pub max_iterations: u32,
    pub convergence: f64,
    pub seed: u64,
}

impl Default for DiConfig {
    fn default() -> Self {
        Self {
            binsize: 20_000,
            step: 2_500,
            window: 500_000,
            smoothing: 6,
            trans_within: 250_000,
            trans_border: 500_000,
            trans_escape: 50_000,
            max_iterations: 100,
            convergence: 1e-4,
            seed: 2001,
        }
    }
}

impl DiConfig {
    fn validate(&self) -> Result<()> {
        if self.step == 0 || self.binsize == 0 || self.binsize % self.step != 0 {
            return Err(Error::config(format!(
                "step {} must evenly divide binsize {}",
                self.step, self.binsize
            )));
        }
        if self.window < self.binsize * 2 {
            return Err(Error::config(format!(
                "window {} must cover at least two bins of size {}",
                self.window, self.binsize
            )));
        }
        if self.trans_within < self.step
            || self.trans_border < 2 * self.step
            || self.trans_escape < self.step
        {
            return Err(Error::config(
                "transition distances are too small for the chosen step",
            ));
        }
        Ok(())
    }
}

/// Smoothed, normalized directionality scores for one chromosome.
#[derive(Clone, Debug)]
pub struct DiTrack {
    pub chrom: String,
    /// (position, score), ascending positions
    pub points: Vec<(u32, f64)>,
}

pub struct DiResult {
    pub tracks: Vec<DiTrack>,
    pub domains: Vec<DomainSet>,
}

pub struct DiSegmenter<'a, S: HeatmapSource> {
    source: &'a S,
    config: DiConfig,
}

/// Triangular moving average of half-width `half`: weight `half - |offset|`
/// for offsets within `(-half, half)`. Edge windows renormalize over the
/// weight actually covered instead of zero-padding.
fn smooth_triangular(scores: &[f64], half: usize) -> Vec<f64> {
    if half <= 1 {
        return scores.to_vec();
    }
    let n = scores.len();
    let reach = half as isize - 1;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut acc = 0.0;
        let mut wsum = 0.0;
        for off in -reach..=reach {
            let j = i as isize + off;
            if j < 0 || j >= n as isize {
                continue;
            }
            let w = (half as isize - off.abs()) as f64;
            acc += w * scores[j as usize];
            wsum += w;
        }
        out.push(acc / wsum);
    }
    out
}

impl<'a, S: HeatmapSource + Sync> DiSegmenter<'a, S> {
    pub fn new(source: &'a S, config: DiConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { source, config })
    }

    /// Raw directionality scores for one chromosome, or `None` when the data
    /// layer has nothing for it.
    fn score_chromosome(&self, chrom: &str) -> Result<Option<Vec<(u32, f64)>>> {
        let cfg = &self.config;
        let req = HeatmapRequest::new(chrom, cfg.step, Datatype::Fend, ArrayType::Compact)
            .max_distance(cfg.window);
        let (array, mapping) = match self.source.heatmap(&req)? {
            Some(hm) => hm,
            None => return Ok(None),
        };
        let n = array.nbins();
        let m = match &array {
            crate::heatmap::InteractionArray::Compact { noffsets, .. } => *noffsets,
            _ => return Err(Error::config("directionality scoring needs a compact view")),
        };
        let steps = (cfg.binsize / cfg.step) as usize;
        if m < steps + 1 || n < 2 * m {
            return Ok(Some(vec![]));
        }

        // The window reaches `m - steps + 1` fine bins beyond the anchor
        // block on each side, so only anchors with a full window score.
        let side = m - steps + 1;
        let mut scores = Vec::new();
        for i in side..(n - m) {
            let mut down = (0.0f64, 0.0f64);
            let mut up = (0.0f64, 0.0f64);
            for b in i..i + steps {
                for p in (i + steps)..=(i + m) {
                    let c = array.get(b, p);
                    down.0 += c.observed as f64;
                    down.1 += c.expected as f64;
                }
                for p in (i - side)..i {
                    let c = array.get(p, b);
                    up.0 += c.observed as f64;
                    up.1 += c.expected as f64;
                }
            }
            if down.0 <= 0.0 || up.0 <= 0.0 || down.1 <= 0.0 || up.1 <= 0.0 {
                continue;
            }
            let score = ((down.0 * up.1) / (up.0 * down.1)).ln();
            scores.push((mapping.start(i) + cfg.binsize / 2, score));
        }
        Ok(Some(scores))
    }

    /// Seed the 3-state boundary HMM from pooled positive/negative score
    /// moments. States: 0 = downstream-biased (domain start), 1 = boundary
    /// transition, 2 = upstream-biased (domain end).
    fn seed_hmm(&self, pooled: &[f64]) -> Option<GaussianHmm> {
        let pos: Vec<f64> = pooled.iter().copied().filter(|&s| s > 0.0).collect();
        let neg: Vec<f64> = pooled.iter().copied().filter(|&s| s < 0.0).collect();
        if pos.is_empty() || neg.is_empty() {
            return None;
        }
        let moments = |v: &[f64]| {
            let mean = v.iter().sum::<f64>() / v.len() as f64;
            let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / v.len() as f64;
            (mean, (var / 2.0).max(1e-4))
        };
        let (mp, vp) = moments(&pos);
        let (mn, vn) = moments(&neg);
        let mix = |m: f64, v: f64, lo: f64, hi: f64| {
            vec![
                GaussComponent::new(0.5, hi * m, v),
                GaussComponent::new(0.5, lo * m, v),
            ]
        };
        let step = self.config.step as f64;
        let tw = step / self.config.trans_within as f64;
        let tb = step / self.config.trans_border as f64;
        let te = step / self.config.trans_escape as f64;
        let hmm = GaussianHmm::new(
            vec![0.45, 0.45, 0.1],
            vec![
                vec![1.0 - tw, tw, 0.0],
                vec![tb, 1.0 - 2.0 * tb, tb],
                vec![te, 0.0, 1.0 - te],
            ],
            vec![
                mix(mp, vp, 0.75, 1.25),
                vec![
                    GaussComponent::new(0.5, 0.25 * mp, vp),
                    GaussComponent::new(0.5, 0.25 * mn, vn),
                ],
                mix(mn, vn, 0.75, 1.25),
            ],
        )
        .ok()?;
        Some(hmm)
    }

    /// State runs to domains: a domain opens on the first entry into state 0
    /// and closes on the next departure from state 1. Re-entries into state 0
    /// before the close do not move the start.
    fn extract_domains(&self, states: &[u8], points: &[(u32, f64)]) -> Vec<DomainInterval> {
        let half_step = self.config.step / 2;
        let mut out = Vec::new();
        let mut open: Option<u32> = None;
        for i in 1..states.len() {
            if states[i] == 0 && states[i - 1] != 0 && open.is_none() {
                open = Some(points[i].0.saturating_sub(half_step));
            }
            if states[i - 1] == 1 && states[i] != 1 {
                if let Some(start) = open.take() {
                    let stop = points[i - 1].0 + half_step;
                    if stop > start {
                        out.push(DomainInterval { start, stop });
                    }
                }
            }
        }
        reconcile_overlaps(&mut out);
        out
    }

    /// Score every chromosome, fit one boundary HMM jointly, and decode
    /// per-chromosome TAD calls. Chromosomes without data are skipped;
    /// per-chromosome scoring failures are reported and skipped.
    pub fn run(&self, chroms: &[String], pool: &WorkerPool) -> Result<DiResult> {
        let scored = pool.map_gather(chroms.to_vec(), |chrom| {
            let scores = self.score_chromosome(&chrom)?;
            Ok((chrom, scores))
        });

        let min_len = 2 * self.config.smoothing + 1;
        let mut tracks = Vec::new();
        let mut trainable = Vec::new();
        for res in scored {
            let (chrom, scores) = match res {
                Ok(cs) => cs,
                Err(e) => {
                    eprintln!("warning: skipping chromosome after scoring failure: {e}");
                    continue;
                }
            };
            let raw = match scores {
                Some(raw) => raw,
                None => continue,
            };
            let positions: Vec<u32> = raw.iter().map(|p| p.0).collect();
            let values: Vec<f64> = raw.iter().map(|p| p.1).collect();
            let mut smoothed = smooth_triangular(&values, self.config.smoothing);
            let sd = {
                let n = smoothed.len().max(1) as f64;
                let mean = smoothed.iter().sum::<f64>() / n;
                (smoothed.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n).sqrt()
            };
            if sd > 0.0 {
                smoothed.iter_mut().for_each(|x| *x /= sd);
            }
            let points: Vec<(u32, f64)> = positions.into_iter().zip(smoothed).collect();
            trainable.push(points.len() >= min_len);
            tracks.push(DiTrack {
                chrom: chrom.clone(),
                points,
            });
        }

        let pooled: Vec<f64> = tracks
            .iter()
            .zip(&trainable)
            .filter(|(_, &t)| t)
            .flat_map(|(t, _)| t.points.iter().map(|p| p.1))
            .collect();

        let mut domains: Vec<DomainSet> = tracks
            .iter()
            .map(|t| DomainSet {
                chrom: t.chrom.clone(),
                intervals: vec![],
            })
            .collect();

        if let Some(mut hmm) = self.seed_hmm(&pooled) {
            hmm.perturb(self.config.seed, 1e-3);
            let sequences: Vec<Vec<f64>> = tracks
                .iter()
                .zip(&trainable)
                .filter(|(_, &t)| t)
                .map(|(t, _)| t.points.iter().map(|p| p.1).collect())
                .collect();
            let summary = hmm
                .train(&sequences, self.config.max_iterations, self.config.convergence)
                .map_err(|e| e.in_context("directionality hmm"))?;
            eprintln!(
                "directionality hmm: {} iterations, log-likelihood {:.4}",
                summary.iterations, summary.log_likelihood
            );
            for (set, (track, &eligible)) in
                domains.iter_mut().zip(tracks.iter().zip(&trainable))
            {
                if !eligible {
                    continue;
                }
                let seq: Vec<f64> = track.points.iter().map(|p| p.1).collect();
                let (states, _) = hmm.find_path(&seq);
                set.intervals = self.extract_domains(&states, &track.points);
            }
        }

        Ok(DiResult { tracks, domains })
    }
}
