//! Command line interface for the strata build orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use strata_core::project::FileSettings;
use strata_core::BuildOrchestrator;

#[derive(Parser)]
#[command(name = "strata", version, about = "Layered incremental build orchestrator")]
struct Cli {
    /// Project root directory
    #[arg(short, long, default_value = ".", global = true)]
    project: PathBuf,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the project
    Build {
        /// Changed files for an incremental build; omit for a full build
        files: Vec<PathBuf>,

        /// Force a full build even when files are given
        #[arg(long)]
        full: bool,
    },

    /// Delete everything the build generated
    Clean,

    /// Print the dependency graph, layer by layer, as JSON
    Graph,

    /// Flag a source file to produce an executable (or clear the flag)
    Exe {
        /// Source file, relative to the project root
        file: PathBuf,

        /// Executable name; omit to clear the flag
        name: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("strata_core={level},strata={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut orchestrator = BuildOrchestrator::open(&cli.project)
        .with_context(|| format!("opening project at {}", cli.project.display()))?;

    match cli.command {
        Command::Build { files, full } => {
            let changed = if full || files.is_empty() {
                None
            } else {
                Some(files.as_slice())
            };
            let result = orchestrator.request_build(changed).context("build failed")?;

            for marker in &result.markers.markers {
                eprintln!(
                    "{}:{}:{}-{}: {}",
                    marker.file.display(),
                    marker.line,
                    marker.char_start,
                    marker.char_end,
                    marker.message.replace('\n', " ")
                );
            }
            for cycle in &result.cycles {
                let chain: Vec<String> = cycle.iter().map(|p| p.display().to_string()).collect();
                eprintln!("dependency cycle: {}", chain.join(" -> "));
            }
            for (binary, output) in &result.link_failures {
                eprintln!("failed to link {}:\n{}", binary.display(), output.trim_end());
            }

            if result.cancelled {
                eprintln!("build cancelled");
                return Ok(ExitCode::FAILURE);
            }
            eprintln!(
                "build {}: {} error(s), {} warning(s)",
                if result.success { "succeeded" } else { "failed" },
                result.error_count(),
                result.warning_count()
            );
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Clean => {
            orchestrator.request_clean().context("clean failed")?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Graph => {
            orchestrator.resolve_only().context("resolving project")?;
            let dump = orchestrator.dump_graph();
            println!("{}", serde_json::to_string_pretty(&dump)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Exe { file, name } => {
            let mut settings = orchestrator.settings(&file);
            settings.exe_name = name;
            orchestrator
                .set_file_settings(file, settings)
                .context("saving file settings")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
