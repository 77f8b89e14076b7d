use std::{path::PathBuf, process::ExitCode};

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;
use drip_ssa::{
    Error,
    diagnostics::Diagnostics,
    middle::{
        lir::parser::parse_module,
        optimization::{Pass, PipelineOptions, optimize_module},
    },
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Textual LIR files to optimize
    source_files: Vec<PathBuf>,

    /// Passes to run, comma separated. They always run in pipeline order.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [Pass::Mem2Reg, Pass::Sccp, Pass::SimplifyCfg, Pass::Destruct]
    )]
    passes: Vec<Pass>,

    /// Do not print warnings
    #[arg(long)]
    no_warnings: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Write the optimized LIR to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.no_color {
        colored::control::set_override(false);
    }

    if args.source_files.is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing source files!")
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.exists() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Source file '{}' does not exist!", source_file.display()),
                )
                .exit()
        }

        if !source_file.is_file() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Input path '{}' is not a file!", source_file.display()),
                )
                .exit()
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}: {error}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let options = PipelineOptions::only(args.passes.iter().copied());
    let mut printed = Vec::with_capacity(args.source_files.len());

    for path in &args.source_files {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        let mut module = parse_module(&contents).map_err(|error| {
            tracing::error!(path = %path.display(), "failed to parse");
            error
        })?;

        let mut diagnostics = Diagnostics::new();
        let summaries = optimize_module(&mut module, &options, &mut diagnostics)?;
        tracing::debug!(path = %path.display(), functions = summaries.len(), "optimized module");

        if !args.no_warnings {
            diagnostics.emit();
        }

        printed.push(module.to_string());
    }

    let output = printed.join("\n\n");

    match &args.output {
        Some(path) => std::fs::write(path, strip_ansi_escapes::strip_str(&output) + "\n")
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            }),
        None => {
            println!("{output}");
            Ok(())
        }
    }
}
