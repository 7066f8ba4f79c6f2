//! `kachina gen`

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use kachina_builder::{
    HashTreeOptions, assemble_manifest, compute_deletes, diff_tree, hash_tree, hash_tree_only,
};
use kachina_format::HashAlgorithm;
use kachina_update::InstallerProfile;

#[derive(Args, Debug)]
pub struct GenArgs {
    /// Parallel hashing jobs
    #[arg(short, long, default_value_t = 4)]
    jobs: usize,

    /// Release tree to hash
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Manifest JSON output path
    #[arg(short, long)]
    metadata: PathBuf,

    /// Previous release tree(s) to diff against
    #[arg(short = 'd', long = "diff-against")]
    prev: Vec<PathBuf>,

    /// Content-addressed staging output directory
    #[arg(short, long)]
    out: PathBuf,

    /// Registration name for the generated installer profile
    #[arg(short = 'r', long)]
    reg_name: String,

    /// Version tag of this release
    #[arg(short = 't', long)]
    tag: String,

    /// File name of the updater executable inside the release tree
    #[arg(short = 'u', long)]
    updater: String,

    /// Hash with xxHash-64 instead of MD5
    #[arg(long)]
    xxh: bool,

    /// Extra ignore globs (gitignore semantics)
    #[arg(long = "ignore")]
    ignore_rules: Vec<String>,

    /// Also emit an installer profile JSON next to the manifest
    #[arg(long)]
    config_out: Option<PathBuf>,
}

pub async fn handle(args: GenArgs) -> anyhow::Result<()> {
    let algorithm = if args.xxh {
        HashAlgorithm::Xxh64
    } else {
        HashAlgorithm::Md5
    };

    let options = HashTreeOptions {
        algorithm,
        jobs: args.jobs,
        ignore_rules: args.ignore_rules.clone(),
        installer_name: Some(args.updater.clone()),
    };
    let hashed = hash_tree(&args.input, &args.out, &options)
        .await
        .context("hashing release tree")?;

    let mut patches = Vec::new();
    let mut deletes = Vec::new();
    if !args.prev.is_empty() {
        let prev_dirs: Vec<&std::path::Path> = args.prev.iter().map(PathBuf::as_path).collect();
        patches = diff_tree(&prev_dirs, &args.input, &hashed, algorithm, &args.out, args.jobs)
            .await
            .context("generating patches")?;
        // Deletes come from the most recent prior version.
        let prev_hashed = hash_tree_only(&prev_dirs[0], algorithm, args.jobs).await?;
        deletes = compute_deletes(&prev_hashed, &hashed);
    }

    let manifest = assemble_manifest(&args.tag, hashed, patches, deletes)?;
    std::fs::write(&args.metadata, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("writing manifest {:?}", args.metadata))?;

    if let Some(config_out) = &args.config_out {
        let profile = InstallerProfile {
            name: args.reg_name.clone(),
            reg_name: Some(args.reg_name.clone()),
            publisher: None,
            updater_name: args.updater.clone(),
            metadata_name: ".metadata.json".to_string(),
            user_data_paths: Vec::new(),
        };
        std::fs::write(config_out, serde_json::to_vec_pretty(&profile)?)
            .with_context(|| format!("writing profile {config_out:?}"))?;
    }

    println!(
        "generated {} ({} files, {} patches, {} deletes)",
        manifest.tag_name,
        manifest.hashed.len(),
        manifest.patches.len(),
        manifest.deletes.len()
    );
    Ok(())
}
