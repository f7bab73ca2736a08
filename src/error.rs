use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// `DataUnavailable` is recoverable at the per-chromosome level for the TAD
/// segmenters (the chromosome is skipped); everything else is fatal for the
/// operation that raised it. The compartment analyzer treats any gather-phase
/// failure as fatal because its joint HMM fit needs every chromosome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no heatmap data for chromosome {chrom}")]
    DataUnavailable { chrom: String },

    #[error("numerical error in {context}: {reason}")]
    Numerical { context: String, reason: String },

    #[error("worker communication failure: {0}")]
    WorkerComm(String),

    #[error("io error, source: {source:?}, path: {path:?}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("toml parsing error: {0:?}")]
    TomlParsing(#[from] toml::de::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn numerical(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Numerical {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Replace the context of a numerical error raised by a lower layer.
    pub fn in_context(self, context: &str) -> Self {
        match self {
            Error::Numerical { reason, .. } => Error::Numerical {
                context: context.to_owned(),
                reason,
            },
            other => other,
        }
    }
}
