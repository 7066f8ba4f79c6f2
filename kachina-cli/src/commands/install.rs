//! `kachina install`
//!
//! The runtime face of the same binary: install or update the product
//! this package carries, offline from embedded payloads or online over
//! an HTTP range source. Interactive runs may prompt to resolve locked
//! files or confirm a downgrade; silent and non-interactive runs never
//! prompt and map errors to categorized exit codes instead.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use tracing::{error, info};

use kachina_update::{
    EmbeddedSource, InstallRequest, InstallerProfile, UpdateContext, UpdateError,
    friendly_message, run_install, uninstall,
};

/// Success
const EXIT_OK: i32 = 0;
/// Unspecified failure
const EXIT_FAILURE: i32 = 1;
/// Targets locked by another process
const EXIT_LOCKED: i32 = 2;
/// Network-category failure
const EXIT_NETWORK: i32 = 3;
/// Package format or verification failure
const EXIT_FORMAT: i32 = 4;
/// Installation state failure (downgrade, corrupt, missing metadata)
const EXIT_STATE: i32 = 5;
/// Cancelled
const EXIT_CANCELLED: i32 = 130;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Target directory; defaults to the running executable's directory
    #[arg(short = 'D', long)]
    target_dir: Option<PathBuf>,

    /// Silent: no output besides errors, implies --non-interactive
    #[arg(short = 'S', long)]
    silent: bool,

    /// Non-interactive: never prompt, fail with an exit code instead
    #[arg(short = 'I', long)]
    non_interactive: bool,

    /// Online-only: ignore embedded payloads
    #[arg(short = 'O', long)]
    online_only: bool,

    /// Uninstall instead of installing
    #[arg(short = 'U', long)]
    uninstall: bool,

    /// Update source URL (http://, https:// or session+https://)
    #[arg(long)]
    source: Option<String>,

    /// Extra JSON forwarded to session-based sources
    #[arg(long)]
    dfs_extras: Option<String>,

    /// Allow installing an older version over a newer one
    #[arg(long)]
    allow_downgrade: bool,
}

pub async fn handle(args: InstallArgs) -> i32 {
    match run(args).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("{}", friendly_message(&e));
            exit_code(&e)
        }
    }
}

async fn run(args: InstallArgs) -> Result<(), UpdateError> {
    let exe = std::env::current_exe()?;
    let dest = match args.target_dir {
        Some(dir) => dir,
        None => exe
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| UpdateError::CorruptInstall {
                reason: "cannot determine a target directory".to_string(),
            })?,
    };
    let interactive = !args.non_interactive && !args.silent;

    if args.uninstall {
        let profile = match open_embedded(&exe)? {
            Some(embedded) => InstallerProfile::from_json(embedded.parsed().config_bytes())?,
            None => InstallerProfile::from_json(br#"{"name":"kachina"}"#)?,
        };
        if interactive
            && !confirm(&format!("Remove the installation in {}?", dest.display())).await?
        {
            return Err(UpdateError::Cancelled);
        }
        uninstall(&dest, &profile)?;
        info!("uninstalled from {dest:?}");
        return Ok(());
    }

    let source_extras: Option<serde_json::Value> = args
        .dfs_extras
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    let ctx = UpdateContext::new()?;
    let (ctx, mut progress) = ctx.with_progress();
    let reporter = (!args.silent).then(|| {
        tokio::spawn(async move {
            while let Some(event) = progress.recv().await {
                info!("{}: {} bytes", event.file_name, event.bytes_downloaded);
            }
        })
    });

    // Interactive runs get a chance to resolve what the planner refuses:
    // close the program holding a locked file, or confirm a downgrade.
    // Non-interactive runs surface the same errors as exit codes.
    let mut allow_downgrade = args.allow_downgrade;
    let result = loop {
        let request = InstallRequest {
            dest: dest.clone(),
            online_only: args.online_only,
            source_url: args.source.clone(),
            source_extras: source_extras.clone(),
            embedded: open_embedded(&exe)?,
            vars: default_vars(),
            allow_downgrade,
        };
        match run_install(&ctx, request).await {
            Err(UpdateError::LockedFiles { paths }) if interactive => {
                eprintln!("These files are in use by another program:");
                for path in &paths {
                    eprintln!("  {path}");
                }
                if !confirm("Close the program using them and retry?").await? {
                    break Err(UpdateError::LockedFiles { paths });
                }
            }
            Err(UpdateError::Downgrade { installed, target })
                if interactive && !allow_downgrade =>
            {
                let question = format!(
                    "Installed version {installed} is newer than {target}. \
                     Install the older version anyway?"
                );
                if !confirm(&question).await? {
                    break Err(UpdateError::Downgrade { installed, target });
                }
                allow_downgrade = true;
            }
            other => break other,
        }
    };
    drop(ctx);
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let report = result?;
    if report.already_current {
        info!("already at latest ({})", report.tag_name);
    } else {
        info!(
            "installed {} ({} files, {} bytes downloaded)",
            report.tag_name, report.files_written, report.bytes_downloaded
        );
    }
    Ok(())
}

/// Open the running binary's embedded package, if it carries one
fn open_embedded(exe: &Path) -> Result<Option<EmbeddedSource>, UpdateError> {
    match EmbeddedSource::open(exe) {
        Ok(embedded) => Ok(Some(embedded)),
        Err(UpdateError::Format(kachina_format::Error::NoMagic)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Ask a yes/no question on the terminal; default answer is no
async fn confirm(question: &str) -> Result<bool, UpdateError> {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || -> Result<bool, UpdateError> {
        let mut out = std::io::stdout();
        write!(out, "{question} [y/N] ")?;
        out.flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(matches!(line.trim(), "y" | "Y" | "yes" | "Yes"))
    })
    .await
    .map_err(|_| UpdateError::Cancelled)?
}

/// Substitution variables for preserved user-data prefixes
fn default_vars() -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        vars.insert("home".to_string(), home.to_string_lossy().into_owned());
    }
    vars
}

fn exit_code(error: &UpdateError) -> i32 {
    match error {
        UpdateError::LockedFiles { .. } => EXIT_LOCKED,
        UpdateError::Download(_) => EXIT_NETWORK,
        UpdateError::Format(_) | UpdateError::HashMismatch { .. } | UpdateError::Patch(_) => {
            EXIT_FORMAT
        }
        UpdateError::Downgrade { .. }
        | UpdateError::CorruptInstall { .. }
        | UpdateError::MissingUninstallMetadata => EXIT_STATE,
        UpdateError::Cancelled => EXIT_CANCELLED,
        UpdateError::TaskFailed { source, .. } => exit_code(source),
        _ => EXIT_FAILURE,
    }
}
