//! Dump the header of a RAIN stripe file.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rainstor::io::{FsStripeIo, IoEngine, OpenFlags, StripeIo};
use rainstor::StripeHeader;

/// Read and pretty-print the self-describing preamble of one stripe file.
#[derive(Parser)]
#[command(name = "rain-hdr-dump", version, about)]
struct Args {
    /// Path of the stripe file to inspect
    stripe_file: PathBuf,

    /// Emit the header as JSON instead of text
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if !args.stripe_file.exists() {
        bail!("no such file {}", args.stripe_file.display());
    }

    let engine = IoEngine::new().context("failed to start io engine")?;
    let stripe = FsStripeIo::new(&args.stripe_file, engine, false);
    stripe
        .open_async(OpenFlags::read_only())
        .wait()
        .with_context(|| format!("failed to open {}", args.stripe_file.display()))?;

    // Zero sizes adopt whatever the on-disk header records.
    let mut header = StripeHeader::new(0, 0);
    if !header.read_from(&stripe) {
        bail!("failed to read header information");
    }

    if args.json {
        println!("{}", header.dump_json()?);
    } else {
        println!("RAIN header info:");
        println!("{}", header.dump_info());
    }

    Ok(())
}
