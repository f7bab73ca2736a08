use std::ops::Index;
use std::ops::IndexMut;

/// Sentinel-encoded optional values, used for score tables where NaN marks an
/// undefined entry without the overhead of `Option<f64>` per cell.
pub trait AsOption: Sized {
    fn as_option(&self) -> Option<Self>;
    fn is_none(&self) -> bool;
    fn is_some(&self) -> bool;
    fn none() -> Self;
}

impl AsOption for f32 {
    fn as_option(&self) -> Option<Self> {
        match self.is_nan() {
            true => None,
            _ => Some(*self),
        }
    }
    fn is_none(&self) -> bool {
        self.is_nan()
    }
    fn is_some(&self) -> bool {
        !self.is_nan()
    }
    fn none() -> Self {
        f32::NAN
    }
}

impl AsOption for f64 {
    fn as_option(&self) -> Option<Self> {
        match self.is_nan() {
            true => None,
            _ => Some(*self),
        }
    }
    fn is_none(&self) -> bool {
        self.is_nan()
    }
    fn is_some(&self) -> bool {
        !self.is_nan()
    }
    fn none() -> Self {
        f64::NAN
    }
}

/// Flat row-major 2-D array.
#[derive(Clone)]
pub struct Matrix<T>
where
    T: Copy + Default + PartialOrd,
{
    data: Vec<T>,
    ncols: usize,
    nrows: usize,
}

impl<T> Matrix<T>
where
    T: Copy + Default + PartialOrd,
{
    pub fn from_shape(nrows: usize, ncols: usize, init_val: T) -> Self {
        let data = vec![init_val; nrows * ncols];
        Self { data, ncols, nrows }
    }

    pub fn from_shape_vec(nrows: usize, ncols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        Self { data, ncols, nrows }
    }

    pub fn resize_and_clear(&mut self, nrows: usize, ncols: usize, init_val: T) {
        self.data.clear();
        self.data.resize(nrows * ncols, init_val);
        self.ncols = ncols;
        self.nrows = nrows;
    }

    pub fn get_nrows(&self) -> usize {
        self.nrows
    }
    pub fn get_ncols(&self) -> usize {
        self.ncols
    }

    pub fn get_at(&self, row: usize, col: usize) -> T {
        self.data[self.ncols * row + col]
    }

    pub fn set_at(&mut self, row: usize, col: usize, val: T) {
        self.data[self.ncols * row + col] = val;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..]
    }
}

impl<T> Index<usize> for Matrix<T>
where
    T: Copy + Default + PartialOrd,
{
    type Output = [T];
    fn index(&self, index: usize) -> &Self::Output {
        let s = index * self.ncols;
        let e = s + self.ncols;
        &self.data[s..e]
    }
}

impl<T> IndexMut<usize> for Matrix<T>
where
    T: Copy + Default + PartialOrd,
{
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        let s = index * self.ncols;
        let e = s + self.ncols;
        &mut self.data[s..e]
    }
}

/// Flat arena for per-(bin, domain-length) score tables.
///
/// Lengths are stored relative to the minimum candidate length so that a table
/// bounded by `[minbins, maxbins]` wastes no slots. Entries default to
/// negative infinity, which the domain-partition DP treats as "no valid
/// candidate".
pub struct ScoreTable {
    data: Vec<f64>,
    nbins: usize,
    nlens: usize,
    minlen: usize,
}

impl ScoreTable {
    pub fn new(nbins: usize, minlen: usize, maxlen: usize) -> Self {
        assert!(minlen <= maxlen);
        let nlens = maxlen - minlen + 1;
        Self {
            data: vec![f64::NEG_INFINITY; nbins * nlens],
            nbins,
            nlens,
            minlen,
        }
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    #[inline]
    fn idx(&self, bin: usize, len: usize) -> usize {
        debug_assert!(bin < self.nbins);
        debug_assert!((self.minlen..self.minlen + self.nlens).contains(&len));
        bin * self.nlens + (len - self.minlen)
    }

    #[inline]
    pub fn get(&self, bin: usize, len: usize) -> f64 {
        self.data[self.idx(bin, len)]
    }

    #[inline]
    pub fn set(&mut self, bin: usize, len: usize, val: f64) {
        let i = self.idx(bin, len);
        self.data[i] = val;
    }
}
