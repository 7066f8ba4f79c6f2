//! `kachina pack`

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use kachina_builder::PackRequest;
use kachina_format::Manifest;

#[derive(Args, Debug)]
pub struct PackArgs {
    /// Installer config JSON embedded as the \0CONFIG segment
    #[arg(short, long)]
    config: PathBuf,

    /// Release manifest produced by `gen`
    #[arg(short, long)]
    metadata: Option<PathBuf>,

    /// Content-addressed staging directory produced by `gen`
    #[arg(short = 'd', long)]
    hashed_dir: Option<PathBuf>,

    /// Output package path
    #[arg(short, long)]
    out: PathBuf,

    /// Stub executable; defaults to the running binary
    #[arg(long)]
    stub: Option<PathBuf>,

    /// Theme payload (css or webp) embedded as the \0THEME segment
    #[arg(long)]
    theme: Option<PathBuf>,
}

pub fn handle(args: PackArgs) -> anyhow::Result<()> {
    let stub = match args.stub {
        Some(stub) => stub,
        None => std::env::current_exe().context("cannot locate the running executable")?,
    };

    let config = std::fs::read(&args.config)
        .with_context(|| format!("reading config {:?}", args.config))?;
    let theme = args
        .theme
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .context("reading theme")?;
    let metadata = args
        .metadata
        .as_ref()
        .map(|path| -> anyhow::Result<Manifest> {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading metadata {path:?}"))?;
            Ok(Manifest::from_json(&bytes)?)
        })
        .transpose()?;

    kachina_builder::pack(&PackRequest {
        stub: &stub,
        config: &config,
        theme: theme.as_deref(),
        metadata: metadata.as_ref(),
        hashed_dir: args.hashed_dir.as_deref(),
        out: &args.out,
    })?;

    println!("packed {}", args.out.display());
    Ok(())
}
