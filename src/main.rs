use clap::{Parser, Subcommand};
use imgconvert::batch::{self, JobDescriptor};
use imgconvert::tools::SystemRunner;
use imgconvert::tools::probe::cached_probe;
use imgconvert::{config, logging, output, progress};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "imgconvert")]
#[command(about = "Batch image converter for RAW, HEIC, SVG and standard formats")]
#[command(long_about = "\
Batch image converter for RAW, HEIC, SVG and standard formats

A job descriptor lists the uploaded files, the target format and a private
work directory. Every input yields exactly one archive entry: the converted
image, or a placeholder image explaining why conversion failed.

Job descriptor (JSON):

  {
    \"jobId\": \"7f3a\",
    \"workDir\": \"/tmp/jobs/7f3a\",
    \"outputFormat\": \"webp\",
    \"files\": [
      {\"path\": \"/tmp/uploads/1\", \"originalName\": \"photo.CR2\", \"sizeBytes\": 25165824}
    ]
  }

RAW files are decoded by external tools, tried in order until one works:
dcraw_emu (LibRaw), dcraw, vips, ImageMagick. HEIC needs heif-convert.
Run 'imgconvert probe' to see which are installed.

Run 'imgconvert gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Converter config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert every file of a job descriptor and archive the results
    Convert {
        /// Job descriptor JSON file
        #[arg(long)]
        job: PathBuf,
        /// Write the JSON outcome here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show which external tools are installed
    Probe,
    /// Print a job's progress record
    Progress {
        /// The job's work directory
        work_dir: PathBuf,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Convert { job, out } => {
            let config = config::load_config(cli.config.as_deref())?;
            let content = std::fs::read_to_string(&job)?;
            let descriptor: JobDescriptor = serde_json::from_str(&content)?;

            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_batch_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let outcome = batch::spawn_job(descriptor, config, Some(tx)).wait();
            if printer.join().is_err() {
                eprintln!("output thread panicked");
            }

            let json = serde_json::to_string_pretty(&outcome)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    output::print_outcome(&outcome);
                }
                None => println!("{}", json),
            }
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Probe => {
            let config = config::load_config(cli.config.as_deref())?;
            let availability = cached_probe(&SystemRunner::new(), &config);
            output::print_probe(&availability);
        }
        Command::Progress { work_dir } => {
            let record = progress::read_progress(&work_dir)?;
            output::print_progress(&record);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}
