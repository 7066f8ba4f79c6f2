//! `kachina extract`

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Args;

use kachina_format::{paths, reader};

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Package to inspect
    #[arg(short, long)]
    input: PathBuf,

    /// List segments and payloads
    #[arg(long, conflicts_with_all = ["all", "meta_name", "name"])]
    list: bool,

    /// Extract every manifest file into a directory
    #[arg(long)]
    all: Option<PathBuf>,

    /// Extract one file by its manifest file name
    #[arg(long)]
    meta_name: Option<String>,

    /// Extract one payload by hash, raw bytes to stdout path
    #[arg(long)]
    name: Option<String>,
}

pub fn handle(args: ExtractArgs) -> anyhow::Result<()> {
    let mut package = reader::open_file(&args.input)
        .with_context(|| format!("opening package {:?}", args.input))?;

    if args.list {
        return list(&package);
    }
    if let Some(out_dir) = &args.all {
        return extract_all(&mut package, out_dir);
    }
    if let Some(meta_name) = &args.meta_name {
        return extract_by_meta_name(&mut package, meta_name);
    }
    if let Some(name) = &args.name {
        let blob = package.read_payload(name)?;
        let out = PathBuf::from(name);
        std::fs::write(&out, blob)?;
        println!("wrote {}", out.display());
        return Ok(());
    }
    bail!("choose one of --list, --all, --meta-name, --name");
}

fn list<R>(package: &reader::PackageReader<R>) -> anyhow::Result<()> {
    let parsed = package.parsed();
    let footer = parsed.footer();
    println!(
        "payload_start {}  config {}  theme {}  index {}  metadata {}",
        footer.payload_start,
        footer.config_size,
        footer.theme_size,
        footer.index_size,
        footer.metadata_size
    );
    if let Some(manifest) = parsed.manifest()? {
        println!("version {}", manifest.tag_name);
    }
    for entry in parsed.entries() {
        println!("{:>10}  {}", entry.size, printable(&entry.name));
    }
    Ok(())
}

fn extract_all<R: std::io::Read + std::io::Seek>(
    package: &mut reader::PackageReader<R>,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let manifest = package
        .parsed()
        .manifest()?
        .context("package carries no metadata segment")?;

    for file in &manifest.hashed {
        let blob = package.read_payload(&file.hash.to_hex())?;
        let decoded = zstd::stream::decode_all(std::io::Cursor::new(blob))
            .with_context(|| format!("decompressing {}", file.file_name))?;
        let out = paths::to_os_path(out_dir, &file.file_name);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, decoded)?;
        println!("extracted {}", file.file_name);
    }
    Ok(())
}

fn extract_by_meta_name<R: std::io::Read + std::io::Seek>(
    package: &mut reader::PackageReader<R>,
    meta_name: &str,
) -> anyhow::Result<()> {
    let manifest = package
        .parsed()
        .manifest()?
        .context("package carries no metadata segment")?;
    let entry = manifest
        .entry(&paths::normalize(meta_name))
        .with_context(|| format!("{meta_name} is not in the manifest"))?;

    let blob = package.read_payload(&entry.hash.to_hex())?;
    let decoded = zstd::stream::decode_all(std::io::Cursor::new(blob))?;
    let out = PathBuf::from(
        entry
            .file_name
            .rsplit('/')
            .next()
            .unwrap_or(&entry.file_name),
    );
    std::fs::write(&out, decoded)?;
    println!("wrote {}", out.display());
    Ok(())
}

fn printable(name: &str) -> String {
    name.replace('\0', "\\0")
}
