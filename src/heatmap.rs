use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::error::{Error, Result};

/// One bin-pair of a normalized interaction heatmap. `observed == 0` together
/// with `expected == 0` means the pair carries no data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub observed: f32,
    pub expected: f32,
}

impl Cell {
    pub fn new(observed: f32, expected: f32) -> Self {
        Self { observed, expected }
    }

    pub fn is_missing(&self) -> bool {
        self.observed == 0.0 && self.expected == 0.0
    }

    pub fn accumulate(&mut self, other: Cell) {
        self.observed += other.observed;
        self.expected += other.expected;
    }
}

/// Genomic (start, stop) bounds per bin, parallel to the bin axis of an
/// interaction array. Strictly increasing and non-overlapping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BinMapping {
    bounds: Vec<(u32, u32)>,
}

impl BinMapping {
    pub fn from_pairs(bounds: Vec<(u32, u32)>) -> Result<Self> {
        for (i, (start, stop)) in bounds.iter().enumerate() {
            if start >= stop {
                return Err(Error::config(format!(
                    "bin {i} has empty span [{start}, {stop})"
                )));
            }
            if i > 0 && bounds[i - 1].1 > *start {
                return Err(Error::config(format!(
                    "bin {i} overlaps its predecessor (prev stop {}, start {start})",
                    bounds[i - 1].1
                )));
            }
        }
        Ok(Self { bounds })
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn start(&self, bin: usize) -> u32 {
        self.bounds[bin].0
    }

    pub fn stop(&self, bin: usize) -> u32 {
        self.bounds[bin].1
    }

    pub fn midpoint(&self, bin: usize) -> u32 {
        let (start, stop) = self.bounds[bin];
        start + (stop - start) / 2
    }

    pub fn bounds(&self) -> &[(u32, u32)] {
        &self.bounds
    }

    pub fn subset(&self, keep: &[usize]) -> Self {
        Self {
            bounds: keep.iter().map(|&i| self.bounds[i]).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayType {
    Upper,
    Compact,
    Full,
}

/// Which normalization the data layer applies before returning cells. The
/// in-memory [`DenseSource`] stores already-normalized (observed, expected)
/// pairs and serves both datatypes from the same panel; a real data layer
/// would distinguish them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datatype {
    Fend,
    Enrichment,
}

/// Rank of pair (i, j), i < j, in the flat upper-triangle layout.
#[inline]
pub fn upper_rank(n: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < n);
    i * n - i * (i + 1) / 2 + (j - i - 1)
}

/// A symmetric bin-by-bin interaction matrix under one of three equivalent
/// views: flat upper triangle by bin-pair rank, compact (bin, relative
/// offset), or dense symmetric.
#[derive(Clone, Debug)]
pub enum InteractionArray {
    Upper {
        n: usize,
        cells: Vec<Cell>,
    },
    /// `cells[i * noffsets + d]` is the pair `(i, i + d + 1)`.
    Compact {
        nbins: usize,
        noffsets: usize,
        cells: Vec<Cell>,
    },
    Full {
        n: usize,
        cells: Vec<Cell>,
    },
}

impl InteractionArray {
    pub fn nbins(&self) -> usize {
        match self {
            InteractionArray::Upper { n, .. } => *n,
            InteractionArray::Compact { nbins, .. } => *nbins,
            InteractionArray::Full { n, .. } => *n,
        }
    }

    /// Symmetric lookup; pairs outside the stored view read as missing.
    pub fn get(&self, i: usize, j: usize) -> Cell {
        let (a, b) = if i <= j { (i, j) } else { (j, i) };
        match self {
            InteractionArray::Upper { n, cells } => {
                if a == b || b >= *n {
                    Cell::default()
                } else {
                    cells[upper_rank(*n, a, b)]
                }
            }
            InteractionArray::Compact {
                nbins,
                noffsets,
                cells,
            } => {
                if a == b || b >= *nbins || b - a - 1 >= *noffsets {
                    Cell::default()
                } else {
                    cells[a * noffsets + (b - a - 1)]
                }
            }
            InteractionArray::Full { n, cells } => {
                if b >= *n {
                    Cell::default()
                } else {
                    cells[a * n + b]
                }
            }
        }
    }

    pub fn has_data(&self) -> bool {
        let cells = match self {
            InteractionArray::Upper { cells, .. } => cells,
            InteractionArray::Compact { cells, .. } => cells,
            InteractionArray::Full { cells, .. } => cells,
        };
        cells.iter().any(|c| !c.is_missing())
    }
}

#[derive(Clone, Debug)]
pub struct HeatmapRequest {
    pub chrom: String,
    pub binsize: u32,
    pub start: Option<u32>,
    pub stop: Option<u32>,
    pub datatype: Datatype,
    pub array_type: ArrayType,
    pub max_distance: Option<u32>,
}

impl HeatmapRequest {
    pub fn new(chrom: &str, binsize: u32, datatype: Datatype, array_type: ArrayType) -> Self {
        Self {
            chrom: chrom.to_owned(),
            binsize,
            start: None,
            stop: None,
            datatype,
            array_type,
            max_distance: None,
        }
    }

    pub fn range(mut self, start: u32, stop: u32) -> Self {
        self.start = Some(start);
        self.stop = Some(stop);
        self
    }

    pub fn max_distance(mut self, max_distance: u32) -> Self {
        self.max_distance = Some(max_distance);
        self
    }
}

/// Collaborator contract implemented by the Hi-C data layer. `heatmap` returns
/// `None` when the chromosome has no valid filtered data in the requested
/// range.
pub trait HeatmapSource {
    fn heatmap(&self, req: &HeatmapRequest) -> Result<Option<(InteractionArray, BinMapping)>>;
    fn chromosomes(&self) -> Vec<String>;
}

struct ChromPanel {
    origin: u32,
    nbins: usize,
    /// dense nbins x nbins at base resolution, upper half authoritative
    cells: Vec<Cell>,
}

/// In-memory heatmap provider over dense per-chromosome contact panels at a
/// fixed base resolution. Serves any binsize that is a multiple of the base
/// resolution by block aggregation.
pub struct DenseSource {
    resolution: u32,
    chroms: BTreeMap<String, ChromPanel>,
}

pub struct DenseSourceBuilder {
    resolution: u32,
    records: BTreeMap<String, Vec<(u32, u32, f32, f32)>>,
}

impl DenseSourceBuilder {
    pub fn new(resolution: u32) -> Self {
        Self {
            resolution,
            records: BTreeMap::new(),
        }
    }

    /// `pos1`/`pos2` are the bin start coordinates of the pair.
    pub fn add_contact(&mut self, chrom: &str, pos1: u32, pos2: u32, observed: f32, expected: f32) {
        let (a, b) = if pos1 <= pos2 {
            (pos1, pos2)
        } else {
            (pos2, pos1)
        };
        self.records
            .entry(chrom.to_owned())
            .or_default()
            .push((a, b, observed, expected));
    }

    pub fn finish(self) -> Result<DenseSource> {
        let res = self.resolution;
        if res == 0 {
            return Err(Error::config("base resolution must be positive"));
        }
        let mut chroms = BTreeMap::new();
        for (chrom, records) in self.records {
            if records.is_empty() {
                continue;
            }
            let min_pos = records.iter().map(|r| r.0).min().unwrap_or(0);
            let max_pos = records.iter().map(|r| r.1).max().unwrap_or(0);
            let origin = min_pos / res * res;
            let nbins = ((max_pos - origin) / res + 1) as usize;
            let mut cells = vec![Cell::default(); nbins * nbins];
            for (a, b, observed, expected) in records {
                let i = ((a - origin) / res) as usize;
                let j = ((b - origin) / res) as usize;
                cells[i * nbins + j].accumulate(Cell::new(observed, expected));
                if i != j {
                    cells[j * nbins + i] = cells[i * nbins + j];
                }
            }
            chroms.insert(
                chrom,
                ChromPanel {
                    origin,
                    nbins,
                    cells,
                },
            );
        }
        Ok(DenseSource {
            resolution: res,
            chroms,
        })
    }
}

impl DenseSource {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }
}

impl HeatmapSource for DenseSource {
    fn heatmap(&self, req: &HeatmapRequest) -> Result<Option<(InteractionArray, BinMapping)>> {
        let panel = match self.chroms.get(&req.chrom) {
            Some(panel) => panel,
            None => return Ok(None),
        };
        if req.binsize == 0 || req.binsize % self.resolution != 0 {
            return Err(Error::config(format!(
                "binsize {} is not a positive multiple of base resolution {}",
                req.binsize, self.resolution
            )));
        }
        let res = self.resolution;
        let start = req.start.unwrap_or(panel.origin / req.binsize * req.binsize);
        let stop = req
            .stop
            .unwrap_or(panel.origin + panel.nbins as u32 * res)
            .max(start + req.binsize);
        let nb = ((stop - start) as usize).div_ceil(req.binsize as usize);

        // aggregate fine pairs into a coarse dense grid
        let mut coarse = vec![Cell::default(); nb * nb];
        for i in 0..panel.nbins {
            let ci = panel.origin + i as u32 * res;
            if ci < start || ci >= stop {
                continue;
            }
            let bi = ((ci - start) / req.binsize) as usize;
            for j in i..panel.nbins {
                let cj = panel.origin + j as u32 * res;
                if cj < start || cj >= stop {
                    continue;
                }
                let cell = panel.cells[i * panel.nbins + j];
                if cell.is_missing() {
                    continue;
                }
                let bj = ((cj - start) / req.binsize) as usize;
                coarse[bi * nb + bj].accumulate(cell);
                if bi != bj {
                    coarse[bj * nb + bi] = coarse[bi * nb + bj];
                }
            }
        }

        // trim leading/trailing bins with no data at all
        let occupied = |b: usize| (0..nb).any(|k| !coarse[b * nb + k].is_missing());
        let first = match (0..nb).find(|&b| occupied(b)) {
            Some(first) => first,
            None => return Ok(None),
        };
        let last = (0..nb).rev().find(|&b| occupied(b)).unwrap_or(first);
        let n = last - first + 1;

        let bounds = (first..=last)
            .map(|b| {
                (
                    start + b as u32 * req.binsize,
                    start + (b + 1) as u32 * req.binsize,
                )
            })
            .collect();
        let mapping = BinMapping::from_pairs(bounds)?;

        let array = match req.array_type {
            ArrayType::Full => {
                let mut cells = vec![Cell::default(); n * n];
                for i in 0..n {
                    for j in 0..n {
                        cells[i * n + j] = coarse[(first + i) * nb + (first + j)];
                    }
                }
                InteractionArray::Full { n, cells }
            }
            ArrayType::Upper => {
                let mut cells = vec![Cell::default(); n * (n - 1) / 2];
                for i in 0..n {
                    for j in (i + 1)..n {
                        cells[upper_rank(n, i, j)] = coarse[(first + i) * nb + (first + j)];
                    }
                }
                InteractionArray::Upper { n, cells }
            }
            ArrayType::Compact => {
                let max_off = match req.max_distance {
                    Some(d) => ((d / req.binsize) as usize).min(n.saturating_sub(1)),
                    None => n.saturating_sub(1),
                };
                if max_off == 0 {
                    return Ok(None);
                }
                let mut cells = vec![Cell::default(); n * max_off];
                for i in 0..n {
                    for d in 0..max_off {
                        let j = i + d + 1;
                        if j >= n {
                            break;
                        }
                        cells[i * max_off + d] = coarse[(first + i) * nb + (first + j)];
                    }
                }
                InteractionArray::Compact {
                    nbins: n,
                    noffsets: max_off,
                    cells,
                }
            }
        };
        if !array.has_data() {
            return Ok(None);
        }
        Ok(Some((array, mapping)))
    }

    fn chromosomes(&self) -> Vec<String> {
        self.chroms.keys().cloned().collect()
    }
}

/// Merge an upper-triangle array onto a uniform grid of `new_binsize` bins.
pub fn rebin_upper(
    array: &InteractionArray,
    mapping: &BinMapping,
    new_binsize: u32,
) -> Result<(InteractionArray, BinMapping)> {
    let n = match array {
        InteractionArray::Upper { n, .. } => *n,
        _ => return Err(Error::config("rebin_upper expects an upper-triangle array")),
    };
    if n == 0 || mapping.len() != n {
        return Err(Error::config("rebin_upper: mapping does not match array"));
    }
    let base = mapping.start(0) / new_binsize * new_binsize;
    let group = |bin: usize| ((mapping.start(bin) - base) / new_binsize) as usize;
    let ng = group(n - 1) + 1;

    let mut cells = vec![Cell::default(); ng * (ng - 1) / 2];
    for i in 0..n {
        let gi = group(i);
        for j in (i + 1)..n {
            let gj = group(j);
            if gi == gj {
                continue;
            }
            let c = array.get(i, j);
            if !c.is_missing() {
                cells[upper_rank(ng, gi, gj)].accumulate(c);
            }
        }
    }
    let bounds = (0..ng)
        .map(|g| {
            (
                base + g as u32 * new_binsize,
                base + (g + 1) as u32 * new_binsize,
            )
        })
        .collect();
    Ok((
        InteractionArray::Upper { n: ng, cells },
        BinMapping::from_pairs(bounds)?,
    ))
}

/// Dynamic rebinning: every cell whose observed count is below
/// `min_observations` absorbs rings of neighboring cells until the threshold
/// is met or the matrix is exhausted.
pub fn dynamically_bin_upper(array: &mut InteractionArray, min_observations: u32) -> Result<()> {
    let (n, cells) = match array {
        InteractionArray::Upper { n, cells } => (*n, cells),
        _ => {
            return Err(Error::config(
                "dynamically_bin_upper expects an upper-triangle array",
            ))
        }
    };
    let source = cells.clone();
    let read = |i: isize, j: isize| -> Cell {
        if i < 0 || j < 0 || i >= n as isize || j >= n as isize || i == j {
            return Cell::default();
        }
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        source[upper_rank(n, a as usize, b as usize)]
    };
    let min = min_observations as f32;
    for i in 0..n {
        for j in (i + 1)..n {
            let mut acc = source[upper_rank(n, i, j)];
            let mut r = 1isize;
            while acc.observed < min && r < n as isize {
                for di in -r..=r {
                    for dj in -r..=r {
                        if di.abs().max(dj.abs()) != r {
                            continue;
                        }
                        acc.accumulate(read(i as isize + di, j as isize + dj));
                    }
                }
                r += 1;
            }
            cells[upper_rank(n, i, j)] = acc;
        }
    }
    Ok(())
}

/// Load tab-separated contact records: `chrom  pos1  pos2  observed  expected`
/// with positions as bin start coordinates at `resolution`. Lines starting
/// with `#` are skipped.
pub fn load_contact_records(path: impl AsRef<Path>, resolution: u32) -> Result<DenseSource> {
    let p = path.as_ref();
    let f = std::fs::File::open(p).map_err(|source| Error::Io {
        source,
        path: Some(p.to_owned()),
    })?;
    let mut builder = DenseSourceBuilder::new(resolution);
    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line.map_err(|source| Error::Io {
            source,
            path: Some(p.to_owned()),
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split('\t');
        let parse_err = || Error::config(format!("malformed contact record at line {}", lineno + 1));
        let chrom = fields.next().ok_or_else(parse_err)?;
        let pos1: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(parse_err)?;
        let pos2: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(parse_err)?;
        let observed: f32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(parse_err)?;
        let expected: f32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(parse_err)?;
        builder.add_contact(chrom, pos1, pos2, observed, expected);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_source() -> DenseSource {
        // 20 bins at 10 kb, strong 0-9 and 10-19 blocks, weak cross contacts
        let mut b = DenseSourceBuilder::new(10_000);
        for i in 0..20u32 {
            for j in (i + 1)..20 {
                let same_block = (i < 10) == (j < 10);
                let observed = if same_block { 20.0 } else { 1.0 };
                b.add_contact("chr1", i * 10_000, j * 10_000, observed, 5.0);
            }
        }
        b.finish().unwrap()
    }

    #[test]
    fn missing_chromosome_returns_none() {
        let src = two_block_source();
        let req = HeatmapRequest::new("chr9", 10_000, Datatype::Fend, ArrayType::Full);
        assert!(src.heatmap(&req).unwrap().is_none());
    }

    #[test]
    fn views_agree_on_symmetric_lookup() {
        let src = two_block_source();
        let full = HeatmapRequest::new("chr1", 10_000, Datatype::Fend, ArrayType::Full);
        let upper = HeatmapRequest::new("chr1", 10_000, Datatype::Fend, ArrayType::Upper);
        let compact =
            HeatmapRequest::new("chr1", 10_000, Datatype::Fend, ArrayType::Compact).max_distance(50_000);
        let (fa, fm) = src.heatmap(&full).unwrap().unwrap();
        let (ua, um) = src.heatmap(&upper).unwrap().unwrap();
        let (ca, _) = src.heatmap(&compact).unwrap().unwrap();
        assert_eq!(fm.len(), 20);
        assert_eq!(um.len(), 20);
        assert_eq!(fa.get(3, 7), ua.get(3, 7));
        assert_eq!(fa.get(7, 3), ua.get(3, 7));
        assert_eq!(fa.get(2, 4), ca.get(2, 4));
        // beyond max_distance the compact view reads as missing
        assert!(ca.get(0, 10).is_missing());
        assert!(!fa.get(0, 10).is_missing());
    }

    #[test]
    fn aggregation_to_coarser_binsize() {
        let src = two_block_source();
        let req = HeatmapRequest::new("chr1", 20_000, Datatype::Fend, ArrayType::Full);
        let (arr, mapping) = src.heatmap(&req).unwrap().unwrap();
        assert_eq!(mapping.len(), 10);
        // coarse off-diagonal cell pools 2x2 fine cells
        let c = arr.get(0, 4);
        assert_eq!(c.observed, 80.0);
        assert_eq!(c.expected, 20.0);
    }

    #[test]
    fn rebin_upper_groups_pairs() {
        let src = two_block_source();
        let req = HeatmapRequest::new("chr1", 10_000, Datatype::Fend, ArrayType::Upper);
        let (arr, mapping) = src.heatmap(&req).unwrap().unwrap();
        let (coarse, cmap) = rebin_upper(&arr, &mapping, 20_000).unwrap();
        assert_eq!(cmap.len(), 10);
        assert_eq!(coarse.get(0, 4).observed, 80.0);
    }

    #[test]
    fn dynamic_rebin_reaches_threshold() {
        let mut b = DenseSourceBuilder::new(1_000);
        for i in 0..8u32 {
            for j in (i + 1)..8 {
                b.add_contact("c", i * 1_000, j * 1_000, 1.0, 1.0);
            }
        }
        let src = b.finish().unwrap();
        let req = HeatmapRequest::new("c", 1_000, Datatype::Fend, ArrayType::Upper);
        let (mut arr, _) = src.heatmap(&req).unwrap().unwrap();
        dynamically_bin_upper(&mut arr, 5).unwrap();
        if let InteractionArray::Upper { cells, .. } = &arr {
            assert!(cells.iter().all(|c| c.observed >= 5.0));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn mapping_validation_rejects_overlap() {
        assert!(BinMapping::from_pairs(vec![(0, 10), (5, 15)]).is_err());
        assert!(BinMapping::from_pairs(vec![(0, 10), (10, 20)]).is_ok());
    }
}
