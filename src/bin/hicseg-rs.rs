use anyhow::Result;
use clap::Parser;
use hicseg_rs::args::{Arguments, Method, PriorConfig};
use hicseg_rs::arrowhead::{ArrowheadConfig, ArrowheadSegmenter};
use hicseg_rs::bi::{BiConfig, BiSegmenter};
use hicseg_rs::compartment::{CompartmentAnalyzer, CompartmentConfig};
use hicseg_rs::di::{DiConfig, DiSegmenter};
use hicseg_rs::heatmap::{load_contact_records, HeatmapSource};
use hicseg_rs::output::OutputFiles;
use hicseg_rs::pool::WorkerPool;

fn main() -> Result<()> {
    let cli = Arguments::parse();
    let start = std::time::Instant::now();

    let source = load_contact_records(&cli.contact_file, cli.resolution)?;
    let chroms = if cli.chroms.is_empty() {
        source.chromosomes()
    } else {
        cli.chroms.clone()
    };
    let prefix = cli.output.clone().unwrap_or_else(|| cli.contact_file.clone());

    // local pool so this instance's thread count does not leak into other
    // instances of the same program
    let pool = WorkerPool::new(cli.num_threads)?;

    match cli.method {
        Method::Di => {
            let mut config = DiConfig {
                binsize: cli.binsize,
                step: cli.step,
                window: cli.window,
                smoothing: cli.smoothing,
                max_iterations: cli.max_iter,
                convergence: cli.convergence,
                seed: cli.seed,
                ..DiConfig::default()
            };
            if let Some(path) = &cli.prior_config {
                let prior = PriorConfig::from_toml_file(path)?;
                config.trans_within = prior.trans_within.unwrap_or(config.trans_within);
                config.trans_border = prior.trans_border.unwrap_or(config.trans_border);
                config.trans_escape = prior.trans_escape.unwrap_or(config.trans_escape);
            }
            let out = OutputFiles::for_di(&prefix, cli.buffer_size)?;
            let result = DiSegmenter::new(&source, config)?.run(&chroms, &pool)?;
            out.write_di_tracks(&result.tracks)?;
            out.write_tads(&result.domains)?;
            let count: usize = result.domains.iter().map(|s| s.intervals.len()).sum();
            eprintln!("called {count} domains over {} chromosomes", result.domains.len());
        }
        Method::Bi => {
            let config = BiConfig {
                binsize: cli.binsize,
                width: cli.width,
                minbins: cli.minbins,
                maxbins: cli.maxbins,
            };
            let out = OutputFiles::for_tads(&prefix, cli.buffer_size)?;
            let sets = BiSegmenter::new(&source, config)?.run(&chroms, &pool)?;
            out.write_tads(&sets)?;
            let count: usize = sets.iter().map(|s| s.intervals.len()).sum();
            eprintln!("called {count} domains over {} chromosomes", sets.len());
        }
        Method::Arrowhead => {
            let config = ArrowheadConfig {
                binsize: cli.binsize,
                minbins: cli.minbins,
                maxbins: cli.maxbins,
            };
            let out = OutputFiles::for_tads(&prefix, cli.buffer_size)?;
            let sets = ArrowheadSegmenter::new(&source, config)?.run(&chroms, &pool)?;
            out.write_tads(&sets)?;
            let count: usize = sets.iter().map(|s| s.intervals.len()).sum();
            eprintln!("called {count} domains over {} chromosomes", sets.len());
        }
        Method::Compartment => {
            let config = CompartmentConfig {
                binsize: cli.binsize,
                min_observations: cli.min_observations,
                seed: cli.seed,
                max_iterations: cli.max_iter,
                convergence: cli.convergence,
                cache_path: cli.cache.clone().map(Into::into),
            };
            let out = OutputFiles::for_compartments(&prefix, cli.buffer_size)?;
            let sets = CompartmentAnalyzer::new(&source, config)?.run(&chroms, &pool)?;
            out.write_compartments(&sets)?;
            eprintln!("labeled {} chromosomes", sets.len());
        }
    }

    eprintln!("total run time: {:?}", start.elapsed());
    Ok(())
}
