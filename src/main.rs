// ========================================================================================
//
//                                  GRAPHLD COMMAND LINE
//
// ========================================================================================
//
// A thin shell over the library: it parses arguments, reads a run manifest, hands the
// blocks to graphREML and writes the result as TOML. All numerical work lives in the
// library crate.

use clap::{CommandFactory, Parser, Subcommand};
use graphld::io::load_ldgm_dir;
use graphld::reml::{RunManifest, run_graphreml};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "graphld",
    version,
    about = "Heritability partitioning with LD graphical models",
    long_about = "Estimates annotation-stratified heritability and enrichment from GWAS \
                 summary statistics using sparse LDGM precision matrices (graphREML)."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit annotation heritability parameters with graphREML
    Reml {
        /// TOML manifest listing the annotations, the fit settings and the LD blocks
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,

        /// Where to write the TOML result (printed to stdout when omitted)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,

        /// Maximum number of worker threads (overrides the manifest)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Maximum number of Newton iterations (overrides the manifest)
        #[arg(long, value_name = "N")]
        max_iterations: Option<usize>,
    },

    /// List the LDGM blocks found in a directory
    Blocks {
        /// Directory containing .edgelist and .snplist files
        #[arg(value_name = "DIR")]
        directory: PathBuf,

        /// Only load edgelists whose file name contains this population label
        #[arg(long)]
        population: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Reml {
            manifest,
            out,
            workers,
            max_iterations,
        }) => run_reml(&manifest, out.as_deref(), workers, max_iterations),
        Some(Commands::Blocks {
            directory,
            population,
        }) => list_blocks(&directory, population.as_deref()),
        None => Cli::command()
            .print_help()
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_reml(
    manifest_path: &Path,
    out: Option<&Path>,
    workers: Option<usize>,
    max_iterations: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let mut manifest = RunManifest::from_path(manifest_path)?;
    if let Some(workers) = workers {
        manifest.reml.max_workers = workers;
    }
    if let Some(max_iterations) = max_iterations {
        manifest.reml.max_iterations = max_iterations;
    }
    log::info!(
        "Loaded manifest {} with {} block(s)",
        manifest_path.display(),
        manifest.blocks.len()
    );

    let result = run_graphreml(manifest.block_sources(), &manifest.annotations, &manifest.reml)?;
    for estimate in &result.annotations {
        log::info!(
            "{}: h2 = {:.4e} ({:.2e}), enrichment = {:.3} ({:.3})",
            estimate.name,
            estimate.heritability,
            estimate.heritability_se,
            estimate.enrichment,
            estimate.enrichment_se
        );
    }

    let rendered = result.to_toml()?;
    match out {
        Some(path) => {
            fs::write(path, rendered)?;
            log::info!("Wrote graphREML result to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn list_blocks(directory: &Path, population: Option<&str>) -> Result<(), Box<dyn Error>> {
    let blocks = load_ldgm_dir(directory, population)?;
    println!("block\tvariants\trows\tnonzeros");
    for block in &blocks {
        println!(
            "{}\t{}\t{}\t{}",
            block.name(),
            block.variants().len(),
            block.dim(),
            block.nnz()
        );
    }
    Ok(())
}
