use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about, name = "hicseg-rs", color=clap::ColorChoice::Always, styles=get_styles())]
pub struct Arguments {
    /// File of normalized contact records. Format: tab-delimited text, one
    /// bin pair per line with columns <chromosome> <position1> <position2>
    /// <observed> <expected>, positions being bin start coordinates at the
    /// base resolution. Lines starting with '#' are ignored.
    #[arg(short = 'i', long, required = true, help_heading = "input data")]
    pub contact_file: String,

    /// Base resolution of the contact records, in bp. All requested binsizes
    /// must be multiples of this.
    #[arg(short = 'r', long, default_value = "10000", help_heading = "input data")]
    pub resolution: u32,

    /// Optional: chromosomes to analyze. When omitted, every chromosome
    /// present in the contact file is used.
    #[arg(short = 'c', long, num_args=1.., help_heading = "input data")]
    pub chroms: Vec<String>,

    /// Output prefix; if not specified the contact file path is used.
    #[arg(short = 'o', long, help_heading = "output data")]
    pub output: Option<String>,

    /// Optional: output file buffer size in bytes
    #[arg(long, help_heading = "output option")]
    pub buffer_size: Option<usize>,

    /// Domain-calling method to run
    #[arg(long, value_enum, default_value = "di", help_heading = "method")]
    pub method: Method,

    /// Bin size in bp for domain calling
    #[arg(long, default_value = "20000", help_heading = "method option")]
    pub binsize: u32,

    /// Directionality scoring resolution in bp; must evenly divide --binsize
    #[arg(long, default_value = "2500", help_heading = "di option")]
    pub step: u32,

    /// Maximum contact distance in bp considered on each side of a bin
    #[arg(long, default_value = "500000", help_heading = "di option")]
    pub window: u32,

    /// Triangular smoothing half-width, in scored bins
    #[arg(long, default_value = "6", help_heading = "di option")]
    pub smoothing: usize,

    /// Optional: TOML file overriding the boundary-HMM transition prior
    /// distances (trans_within/trans_border/trans_escape, in bp)
    #[arg(long, help_heading = "di option")]
    pub prior_config: Option<String>,

    /// Number of spacer bins between a candidate domain and the flanking
    /// region it is contrasted against
    #[arg(long, default_value = "2", help_heading = "bi option")]
    pub width: usize,

    /// Minimum candidate domain length, in bins
    #[arg(long, default_value = "5", help_heading = "domain option")]
    pub minbins: usize,

    /// Maximum candidate domain length, in bins
    #[arg(long, default_value = "100", help_heading = "domain option")]
    pub maxbins: usize,

    /// Minimum observed count per cell when dynamically rebinning
    /// compartment enrichment matrices
    #[arg(long, default_value = "5", help_heading = "compartment option")]
    pub min_observations: u32,

    /// Optional: cache file for compartment enrichment/correlation matrices;
    /// reused on a later run with the same binsize
    #[arg(long, help_heading = "compartment option")]
    pub cache: Option<String>,

    /// Optional: maximum number of Baum-Welch iterations
    #[arg(short = 'm', long, default_value = "100", help_heading = "hmm option")]
    pub max_iter: u32,

    /// Optional: log-likelihood improvement below which training stops
    #[arg(long, default_value = "1e-4", help_heading = "hmm option")]
    pub convergence: f64,

    /// Optional: seed for the HMM parameter perturbation
    #[arg(long, default_value = "2001", help_heading = "hmm option")]
    pub seed: u64,

    /// Optional: number of worker threads; 1 runs everything sequentially
    #[arg(long, default_value = "1", help_heading = "parallelization option")]
    pub num_threads: usize,
}

#[derive(Default, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// directionality-index segmentation
    #[default]
    Di,
    /// boundary-index segmentation
    Bi,
    /// arrowhead segmentation
    Arrowhead,
    /// A/B compartment analysis
    Compartment,
}

/// Overrides for the directionality HMM transition prior, loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PriorConfig {
    pub trans_within: Option<u32>,
    pub trans_border: Option<u32>,
    pub trans_escape: Option<u32>,
}

impl PriorConfig {
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            source,
            path: Some(path.into()),
        })?;
        Ok(toml::from_str(&text)?)
    }
}

pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .header(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .literal(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .invalid(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .error(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .valid(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .placeholder(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::White))),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Arguments::parse_from(["hicseg-rs", "-i", "contacts.txt"]);
        assert_eq!(args.method, Method::Di);
        assert_eq!(args.binsize, 20_000);
        assert_eq!(args.step, 2_500);
        assert_eq!(args.num_threads, 1);
    }

    #[test]
    fn method_selection_parses() {
        let args = Arguments::parse_from([
            "hicseg-rs",
            "-i",
            "contacts.txt",
            "--method",
            "arrowhead",
            "--minbins",
            "4",
        ]);
        assert_eq!(args.method, Method::Arrowhead);
        assert_eq!(args.minbins, 4);
    }

    #[test]
    fn prior_config_parses_partial_overrides() {
        let parsed: PriorConfig = toml::from_str("trans_within = 300000\n").unwrap();
        assert_eq!(parsed.trans_within, Some(300_000));
        assert!(parsed.trans_border.is_none());
    }
}
