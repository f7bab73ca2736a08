use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use itertools::Itertools;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::heatmap::{
    dynamically_bin_upper, rebin_upper, ArrayType, Datatype, HeatmapRequest, HeatmapSource,
};
use crate::hmm::{GaussComponent, GaussianHmm};
use crate::path::{CompartmentInterval, CompartmentSet};
use crate::pool::{scatter_ranges, WorkerPool};

#[derive(Clone, Debug)]
pub struct CompartmentConfig {
    pub binsize: u32,
    pub min_observations: u32,
    pub seed: u64,
    pub max_iterations: u32,
    pub convergence: f64,
    pub cache_path: Option<PathBuf>,
}

impl Default for CompartmentConfig {
    fn default() -> Self {
        Self {
            binsize: 1_000_000,
            min_observations: 5,
            seed: 2001,
            max_iterations: 100,
            convergence: 1e-4,
            cache_path: None,
        }
    }
}

impl CompartmentConfig {
    fn validate(&self) -> Result<()> {
        if self.binsize == 0 || self.binsize % 2 != 0 {
            return Err(Error::config(
                "compartment binsize must be positive and even",
            ));
        }
        if self.min_observations == 0 {
            return Err(Error::config("min_observations must be at least 1"));
        }
        Ok(())
    }
}

/// Log-enrichment matrix over valid bins of one chromosome.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Enrichment {
    n: usize,
    /// row-major n x n, symmetric, zero diagonal
    values: Vec<f64>,
    /// genomic (start, stop) per retained bin
    positions: Vec<(u32, u32)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CorrelationMatrix {
    n: usize,
    values: Vec<f64>,
}

/// On-disk cache of per-chromosome enrichment and correlation matrices,
/// reusable across runs with the same binsize.
#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    binsize: u32,
    enrichments: BTreeMap<String, Enrichment>,
    correlations: BTreeMap<String, CorrelationMatrix>,
}

impl CacheFile {
    fn load(path: &PathBuf, binsize: u32) -> Self {
        let empty = CacheFile {
            binsize,
            ..CacheFile::default()
        };
        let f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return empty,
        };
        match bincode::deserialize_from::<_, CacheFile>(BufReader::new(f)) {
            Ok(cache) if cache.binsize == binsize => cache,
            Ok(_) => {
                eprintln!("warning: discarding compartment cache built at a different binsize");
                empty
            }
            Err(e) => {
                eprintln!("warning: discarding unreadable compartment cache: {e}");
                empty
            }
        }
    }

    fn save(&self, path: &PathBuf) -> Result<()> {
        let f = std::fs::File::create(path).map_err(|source| Error::Io {
            source,
            path: Some(path.clone()),
        })?;
        bincode::serialize_into(BufWriter::new(f), self)
            .map_err(|e| Error::Cache(format!("failed to write cache: {e}")))
    }
}

pub struct CompartmentAnalyzer<'a, S: HeatmapSource> {
    source: &'a S,
    config: CompartmentConfig,
}

impl<'a, S: HeatmapSource + Sync> CompartmentAnalyzer<'a, S> {
    pub fn new(source: &'a S, config: CompartmentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { source, config })
    }

    /// Log-enrichment matrix for one chromosome: half-binsize upper heatmap,
    /// rebinned to the target binsize, dynamically rebinned to the minimum
    /// observation count, with zero-coverage bins dropped. `None` when the
    /// chromosome has no usable data.
    fn enrichment(&self, chrom: &str) -> Result<Option<Enrichment>> {
        let cfg = &self.config;
        let req = HeatmapRequest::new(chrom, cfg.binsize / 2, Datatype::Enrichment, ArrayType::Upper);
        let (fine, fine_map) = match self.source.heatmap(&req)? {
            Some(hm) => hm,
            None => return Ok(None),
        };
        let (mut array, mapping) = rebin_upper(&fine, &fine_map, cfg.binsize)?;
        dynamically_bin_upper(&mut array, cfg.min_observations)?;
        let n = array.nbins();
        let keep: Vec<usize> = (0..n)
            .filter(|&i| (0..n).any(|j| j != i && array.get(i, j).expected > 0.0))
            .collect();
        if keep.len() < 3 {
            return Ok(None);
        }
        let m = keep.len();
        let mut values = vec![0.0f64; m * m];
        for (a, &i) in keep.iter().enumerate() {
            for (b, &j) in keep.iter().enumerate().skip(a + 1) {
                let c = array.get(i, j);
                if c.observed > 0.0 && c.expected > 0.0 {
                    let v = (c.observed as f64 / c.expected as f64).ln();
                    values[a * m + b] = v;
                    values[b * m + a] = v;
                }
            }
        }
        let positions = keep.iter().map(|&i| (mapping.start(i), mapping.stop(i))).collect();
        Ok(Some(Enrichment {
            n: m,
            values,
            positions,
        }))
    }

    /// Pairwise Pearson correlation of enrichment rows, two-phase over the
    /// pool: workers first standardize disjoint row ranges (self term
    /// excluded from the moments), then compute disjoint ranges of
    /// upper-triangle entries over the broadcast standardized matrix.
    fn correlate(
        &self,
        chrom: &str,
        enrichment: &Enrichment,
        pool: &WorkerPool,
    ) -> Result<CorrelationMatrix> {
        let n = enrichment.n;
        let data = &enrichment.values;

        let row_ranges = scatter_ranges(n, pool.num_workers());
        let standardized = pool.map_gather(row_ranges, |range| {
            let mut rows = Vec::with_capacity(range.len() * n);
            for a in range.clone() {
                let self_term = data[a * n + a];
                let sum: f64 = data[a * n..(a + 1) * n].iter().sum::<f64>() - self_term;
                let sumsq: f64 = data[a * n..(a + 1) * n].iter().map(|v| v * v).sum::<f64>()
                    - self_term * self_term;
                let mean = sum / (n - 1) as f64;
                let std = (sumsq / (n - 1) as f64 - mean * mean).sqrt();
                if !(std > 0.0) {
                    return Err(Error::numerical(
                        format!("correlation of {chrom}"),
                        format!("enrichment row {a} has zero variance"),
                    ));
                }
                rows.extend(data[a * n..(a + 1) * n].iter().map(|v| (v - mean) / std));
            }
            Ok((range, rows))
        });
        let mut z = vec![0.0f64; n * n];
        for res in standardized {
            let (range, rows) = res?;
            z[range.start * n..range.end * n].copy_from_slice(&rows);
        }

        let pairs: Vec<(usize, usize)> = (0..n).tuple_combinations().collect();
        let pair_ranges = scatter_ranges(pairs.len(), pool.num_workers());
        let entries = pool.map_gather(pair_ranges, |range| {
            let mut out = Vec::with_capacity(range.len());
            for &(a, b) in &pairs[range.clone()] {
                let mut dot = 0.0;
                for k in 0..n {
                    if k != a && k != b {
                        dot += z[a * n + k] * z[b * n + k];
                    }
                }
                out.push(dot / (n - 1) as f64);
            }
            Ok((range, out))
        });

        let mut values = vec![0.0f64; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
        }
        for res in entries {
            let (range, out) = res?;
            for (&(a, b), v) in pairs[range].iter().zip(out) {
                values[a * n + b] = v;
                values[b * n + a] = v;
            }
        }
        Ok(CorrelationMatrix { n, values })
    }

    /// Eigenvector of the largest-magnitude eigenvalue.
    fn leading_eigenvector(&self, chrom: &str, corr: &CorrelationMatrix) -> Result<Vec<f64>> {
        let m = DMatrix::from_row_slice(corr.n, corr.n, &corr.values);
        let eigen = m
            .try_symmetric_eigen(1e-10, 10_000)
            .ok_or_else(|| {
                Error::numerical(
                    format!("eigendecomposition of {chrom}"),
                    "iteration did not converge",
                )
            })?;
        let mut best = 0;
        for i in 1..eigen.eigenvalues.len() {
            if eigen.eigenvalues[i].abs() > eigen.eigenvalues[best].abs() {
                best = i;
            }
        }
        Ok(eigen.eigenvectors.column(best).iter().copied().collect())
    }

    /// Pool eigenvector values across chromosomes, fit the 2-state/3-mixture
    /// HMM seeded from per-sign means, and decode per-chromosome labels.
    fn cluster(&self, eigenvectors: &BTreeMap<String, Vec<f64>>) -> Result<BTreeMap<String, Vec<u8>>> {
        let pooled: Vec<f64> = eigenvectors.values().flatten().copied().collect();
        let pos: Vec<f64> = pooled.iter().copied().filter(|&v| v >= 0.0).collect();
        let neg: Vec<f64> = pooled.iter().copied().filter(|&v| v < 0.0).collect();
        if pos.is_empty() || neg.is_empty() {
            return Err(Error::numerical(
                "compartment clustering",
                "pooled eigenvector values have a single sign",
            ));
        }
        let mean_pos = pos.iter().sum::<f64>() / pos.len() as f64;
        let mean_neg = neg.iter().sum::<f64>() / neg.len() as f64;
        let mix = |mean: f64| {
            let var = (mean.abs() / 4.0).max(1e-6);
            vec![
                GaussComponent::new(0.33, mean * 0.5, var),
                GaussComponent::new(0.34, mean, var),
                GaussComponent::new(0.33, mean * 1.5, var),
            ]
        };
        let mut hmm = GaussianHmm::new(
            vec![0.5, 0.5],
            vec![vec![0.99, 0.01], vec![0.01, 0.99]],
            vec![mix(mean_pos), mix(mean_neg)],
        )?;
        hmm.perturb(self.config.seed, 1e-3);
        let sequences: Vec<Vec<f64>> = eigenvectors.values().cloned().collect();
        hmm.train(&sequences, self.config.max_iterations, self.config.convergence)
            .map_err(|e| e.in_context("compartment hmm"))?;
        let mut out = BTreeMap::new();
        for (chrom, eigen) in eigenvectors {
            let (states, _) = hmm.find_path(eigen);
            out.insert(chrom.clone(), states);
        }
        Ok(out)
    }

    fn collapse(
        &self,
        chrom: &str,
        states: &[u8],
        eigen: &[f64],
        positions: &[(u32, u32)],
    ) -> CompartmentSet {
        let mut intervals = Vec::new();
        let mut run_start = 0usize;
        for i in 1..=states.len() {
            if i == states.len() || states[i] != states[run_start] {
                let mean_score =
                    eigen[run_start..i].iter().sum::<f64>() / (i - run_start) as f64;
                intervals.push(CompartmentInterval {
                    start: positions[run_start].0,
                    stop: positions[i - 1].1,
                    state: states[run_start],
                    mean_score,
                });
                run_start = i;
            }
        }
        CompartmentSet {
            chrom: chrom.to_owned(),
            intervals,
        }
    }

    /// Full compartment analysis. Chromosomes without usable data are
    /// dropped; any other per-chromosome failure aborts the run, since the
    /// joint HMM fit needs every remaining chromosome.
    pub fn run(&self, chroms: &[String], pool: &WorkerPool) -> Result<Vec<CompartmentSet>> {
        let mut cache = match &self.config.cache_path {
            Some(path) => CacheFile::load(path, self.config.binsize),
            None => CacheFile {
                binsize: self.config.binsize,
                ..CacheFile::default()
            },
        };

        let needed: Vec<String> = chroms
            .iter()
            .filter(|c| !cache.enrichments.contains_key(*c))
            .cloned()
            .collect();
        let computed = pool.map_gather(needed, |chrom| {
            let e = self.enrichment(&chrom)?;
            Ok((chrom, e))
        });
        for res in computed {
            let (chrom, enrichment) = res?;
            if let Some(enrichment) = enrichment {
                cache.enrichments.insert(chrom, enrichment);
            }
        }

        let mut eigenvectors = BTreeMap::new();
        for chrom in chroms {
            let enrichment = match cache.enrichments.get(chrom) {
                Some(e) => e,
                None => {
                    let e = Error::DataUnavailable {
                        chrom: chrom.clone(),
                    };
                    eprintln!("warning: {e}, dropping it from the analysis");
                    continue;
                }
            };
            if !cache.correlations.contains_key(chrom) {
                eprintln!("correlating {chrom}");
                let corr = self.correlate(chrom, enrichment, pool)?;
                cache.correlations.insert(chrom.clone(), corr);
            }
            let corr = &cache.correlations[chrom];
            eigenvectors.insert(chrom.clone(), self.leading_eigenvector(chrom, corr)?);
        }

        if let Some(path) = &self.config.cache_path {
            cache.save(path)?;
        }
        if eigenvectors.is_empty() {
            return Ok(vec![]);
        }

        let labels = self.cluster(&eigenvectors)?;
        let mut out = Vec::new();
        for (chrom, states) in &labels {
            let enrichment = &cache.enrichments[chrom];
            out.push(self.collapse(chrom, states, &eigenvectors[chrom], &enrichment.positions));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heatmap::{DenseSource, DenseSourceBuilder};

    /// 20 bins in two interleaved compartments: bins 0-4 and 10-14 versus
    /// bins 5-9 and 15-19.
    fn checkerboard_source() -> DenseSource {
        let comp = |b: u32| (b / 5) % 2;
        let mut builder = DenseSourceBuilder::new(5_000);
        for i in 0..40u32 {
            for j in (i + 1)..40 {
                let same = comp(i / 2) == comp(j / 2);
                let observed = if same { 20.0 } else { 2.0 };
                builder.add_contact("chr1", i * 5_000, j * 5_000, observed, 5.0);
            }
        }
        builder.finish().unwrap()
    }

    fn test_config() -> CompartmentConfig {
        CompartmentConfig {
            binsize: 10_000,
            ..CompartmentConfig::default()
        }
    }

    fn partition_key(sets: &[CompartmentSet]) -> Vec<bool> {
        // expand intervals back to bins, labels normalized so the first bin
        // is `true`
        let mut labels = Vec::new();
        for set in sets {
            for iv in &set.intervals {
                let nbins = ((iv.stop - iv.start) / 10_000) as usize;
                labels.extend(std::iter::repeat(iv.state).take(nbins));
            }
        }
        let first = labels[0];
        labels.into_iter().map(|l| l == first).collect()
    }

    #[test]
    fn rejects_odd_binsize() {
        let src = checkerboard_source();
        let cfg = CompartmentConfig {
            binsize: 10_001,
            ..test_config()
        };
        assert!(matches!(
            CompartmentAnalyzer::new(&src, cfg),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn checkerboard_recovers_two_compartments() {
        let src = checkerboard_source();
        let analyzer = CompartmentAnalyzer::new(&src, test_config()).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let sets = analyzer.run(&["chr1".to_owned()], &pool).unwrap();
        assert_eq!(sets.len(), 1);
        let key = partition_key(&sets);
        assert_eq!(key.len(), 20);
        let expected: Vec<bool> = (0..20u32).map(|b| (b / 5) % 2 == 0).collect();
        assert_eq!(key, expected);
    }

    #[test]
    fn eigenvector_sign_flip_does_not_change_partition() {
        let src = checkerboard_source();
        let analyzer = CompartmentAnalyzer::new(&src, test_config()).unwrap();
        let mut eigen = BTreeMap::new();
        let v: Vec<f64> = (0..20)
            .map(|i| if (i / 5) % 2 == 0 { 0.8 } else { -0.8 } + 0.01 * (i % 3) as f64)
            .collect();
        eigen.insert("chr1".to_owned(), v.clone());
        let labels = analyzer.cluster(&eigen).unwrap();
        eigen.insert("chr1".to_owned(), v.iter().map(|x| -x).collect());
        let flipped = analyzer.cluster(&eigen).unwrap();
        let a = &labels["chr1"];
        let b = &flipped["chr1"];
        for i in 0..a.len() {
            for j in 0..a.len() {
                assert_eq!(a[i] == a[j], b[i] == b[j], "partition differs at ({i},{j})");
            }
        }
    }

    #[test]
    fn missing_chromosome_is_dropped_without_error() {
        let src = checkerboard_source();
        let analyzer = CompartmentAnalyzer::new(&src, test_config()).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let sets = analyzer
            .run(&["chr1".to_owned(), "chrNope".to_owned()], &pool)
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].chrom, "chr1");
    }

    #[test]
    fn cache_round_trip_reuses_matrices() {
        let src = checkerboard_source();
        let path = std::env::temp_dir().join(format!(
            "hicseg-compartment-cache-{}.bin",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let cfg = CompartmentConfig {
            cache_path: Some(path.clone()),
            ..test_config()
        };
        let analyzer = CompartmentAnalyzer::new(&src, cfg).unwrap();
        let pool = WorkerPool::new(1).unwrap();
        let first = analyzer.run(&["chr1".to_owned()], &pool).unwrap();
        assert!(path.exists());
        let cache = CacheFile::load(&path, 10_000);
        assert!(cache.enrichments.contains_key("chr1"));
        assert!(cache.correlations.contains_key("chr1"));
        let second = analyzer.run(&["chr1".to_owned()], &pool).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].intervals, second[0].intervals);
        // a cache built at another binsize is ignored
        let stale = CacheFile::load(&path, 20_000);
        assert!(stale.enrichments.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
