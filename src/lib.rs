// heatmap layer
// - collaborator contract (HeatmapSource)
// - in-memory dense provider, rebinning, dynamic rebinning

// segmenters
// - di: directionality scores -> 3-state boundary HMM -> TADs
// - bi: boundary-index score table -> DP partition -> TADs
// - arrowhead: multi-resolution assembly -> corner scores -> DP partition
// - compartment: enrichment -> correlation -> eigenvector -> 2-state HMM

// shared machinery
// - hmm: Gaussian-mixture Baum-Welch / Viterbi
// - path: domain-partition DP, interval types, overlap reconciliation
// - pool: map-with-gather over a local thread pool
// - matrix: flat 2-D arrays and (bin, length) score arenas

pub mod args;
pub mod arrowhead;
pub mod bi;
pub mod compartment;
pub mod di;
pub mod error;
pub mod heatmap;
pub mod hmm;
pub mod matrix;
pub mod output;
pub mod path;
pub mod pool;
