//! CRUSH map compiler/decompiler CLI.
//!
//! Usage:
//!   crushtool -c map.txt [-o map] [--clobber] [-v]
//!   crushtool -d map     [-o map.txt] [--clobber] [-v]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{ArgGroup, Parser};
use crush::CrushMap;
use crushtool::{compile, decompile, CompileError};
use tracing::info;

#[derive(Parser)]
#[command(name = "crushtool")]
#[command(about = "Compile and decompile CRUSH placement maps", long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["compile", "decompile"]),
))]
struct Cli {
    /// Compile a text map to its binary form
    #[arg(short = 'c', value_name = "MAP_TXT")]
    compile: Option<PathBuf>,

    /// Decompile a binary map to text
    #[arg(short = 'd', value_name = "MAP")]
    decompile: Option<PathBuf>,

    /// Write output to this file
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Overwrite an existing output file
    #[arg(long)]
    clobber: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders its own message; the exit code is ours
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(path) = &cli.compile {
        run_compile(cli, path)
    } else if let Some(path) = &cli.decompile {
        run_decompile(cli, path)
    } else {
        unreachable!("clap enforces exactly one mode");
    }
}

fn run_compile(cli: &Cli, path: &Path) -> Result<()> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("error reading '{}'", path.display()))?;

    let map = match compile(&source) {
        Ok(map) => map,
        Err(err) => bail!(format_compile_error(path, &err)),
    };
    let bytes = map.encode();

    match &cli.output {
        Some(out) => {
            check_clobber(out, cli.clobber)?;
            fs::write(out, &bytes)
                .with_context(|| format!("error writing '{}'", out.display()))?;
            info!("wrote crush map to {}", out.display());
        }
        None => {
            println!(
                "crushtool successfully compiled '{}'.  Use -o file to write it out.",
                path.display()
            );
        }
    }
    Ok(())
}

fn run_decompile(cli: &Cli, path: &Path) -> Result<()> {
    let raw = fs::read(path).with_context(|| format!("error reading '{}'", path.display()))?;
    let mut cursor = Bytes::from(raw);
    let map = CrushMap::decode(&mut cursor)
        .with_context(|| format!("error decoding '{}'", path.display()))?;
    let text = decompile(&map);

    match &cli.output {
        Some(out) => {
            check_clobber(out, cli.clobber)?;
            fs::write(out, text.as_bytes())
                .with_context(|| format!("error writing '{}'", out.display()))?;
            info!("wrote crush map text to {}", out.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn check_clobber(path: &Path, clobber: bool) -> Result<()> {
    if path.exists() && !clobber {
        bail!(
            "output file '{}' already exists; use --clobber to overwrite",
            path.display()
        );
    }
    Ok(())
}

/// Render a compile failure the way the DSL reader reports it: parse errors
/// carry file and line, semantic errors are a single bare diagnostic.
fn format_compile_error(path: &Path, err: &CompileError) -> String {
    match err.line() {
        Some(line) => format!("{}:{}: error: {}", path.display(), line, err),
        None => err.to_string(),
    }
}
