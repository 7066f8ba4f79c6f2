//! High-level install driver
//!
//! Glues the subsystems into the flows the CLI exposes: open the
//! embedded package, resolve the update source, pick the manifest, plan,
//! execute, finalize. Everything stateful travels through the explicit
//! [`UpdateContext`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use kachina_cdn::{RemotePackage, UpdateSource, resolve_source};
use kachina_format::Manifest;

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::finalize::{finalize_install, read_persisted_manifest};
use crate::local::scan_local;
use crate::pipeline::EmbeddedSource;
use crate::plan::{PlanRequest, build_plan, check_downgrade};
use crate::profile::InstallerProfile;
use crate::scheduler::{ExecutionSummary, Executor, RemoteSource};

/// One install or update request
pub struct InstallRequest {
    /// Target installation directory
    pub dest: PathBuf,
    /// Never read payloads from the embedded package
    pub online_only: bool,
    /// Update source URL; `None` for a purely offline install
    pub source_url: Option<String>,
    /// Source-specific extras forwarded to the resolver
    pub source_extras: Option<serde_json::Value>,
    /// The running installer's own package, when it embeds one
    pub embedded: Option<EmbeddedSource>,
    /// Path-variable substitutions for preserved user-data prefixes
    pub vars: HashMap<String, String>,
    /// Permit installing an older version over a newer one
    pub allow_downgrade: bool,
}

/// What an install run did
#[derive(Debug)]
pub struct InstallReport {
    /// Version that is now installed
    pub tag_name: String,
    /// The tree already matched the manifest; nothing was written
    pub already_current: bool,
    /// Files verified and written
    pub files_written: usize,
    /// Bytes fetched over the network
    pub bytes_downloaded: u64,
}

/// Run one install/update to completion
pub async fn run_install(ctx: &UpdateContext, request: InstallRequest) -> Result<InstallReport> {
    let embedded = request.embedded.map(Arc::new);

    // Resolve the remote side first: source plugin, session, chunk URL,
    // remote package header.
    let mut source: Option<Box<dyn UpdateSource>> = None;
    let mut remote: Option<Arc<RemoteSource>> = None;
    let mut online_manifest: Option<Manifest> = None;
    if let Some(url) = &request.source_url {
        let resolved = resolve_source(url, request.source_extras.clone())
            .map_err(UpdateError::Download)?;
        resolved
            .create_session(&ctx.http)
            .await
            .map_err(UpdateError::Download)?;
        let chunk_url = resolved
            .resolve_chunk_url(&ctx.http)
            .await
            .map_err(UpdateError::Download)?;

        let package = RemotePackage::open(&ctx.http, &chunk_url)
            .await
            .map_err(UpdateError::Download)?;
        online_manifest = match package.parsed().manifest()? {
            Some(manifest) => Some(manifest),
            None => Some(
                resolved
                    .resolve_metadata(&ctx.http)
                    .await
                    .map_err(UpdateError::Download)?,
            ),
        };
        remote = Some(Arc::new(RemoteSource {
            url: chunk_url,
            package: package.parsed().clone(),
        }));
        source = Some(resolved);
    }

    let embedded_manifest = match &embedded {
        Some(embedded) => embedded.parsed().manifest()?,
        None => None,
    };

    // Prefer the online manifest when it is at least as new as the
    // embedded one; an online-only run requires it.
    let manifest = choose_manifest(embedded_manifest, online_manifest, request.online_only)?;
    let profile = resolve_profile(embedded.as_deref(), remote.as_deref())?;
    debug!(
        "installing {} ({}) into {:?}",
        profile.name, manifest.tag_name, request.dest
    );

    let installed = read_persisted_manifest(&request.dest, &profile)?;
    if let Some(installed) = &installed {
        if !request.allow_downgrade {
            check_downgrade(&installed.tag_name, &manifest.tag_name)?;
        }
    }

    std::fs::create_dir_all(&request.dest)
        .map_err(|e| UpdateError::filesystem(&request.dest, e))?;
    let preserved = profile.resolved_user_data_paths(&request.vars);
    let local = scan_local(&request.dest, &manifest, &preserved).await?;

    let plan = build_plan(
        &PlanRequest {
            manifest: &manifest,
            dest: &request.dest,
            embedded: embedded.as_ref().map(|e| e.parsed()),
            online: remote.is_some(),
            online_only: request.online_only,
            preserved_prefixes: &preserved,
            updater_name: &profile.updater_name,
        },
        &local,
    )?;

    if plan.is_current() {
        info!("already at latest ({})", manifest.tag_name);
        let same_version = installed.as_ref().map(|m| m.tag_name.as_str())
            == Some(manifest.tag_name.as_str());
        if !same_version {
            finalize_install(&request.dest, &profile, &manifest, &ExecutionSummary::default())?;
        }
        end_session(ctx, source.as_deref()).await;
        return Ok(InstallReport {
            tag_name: manifest.tag_name,
            already_current: true,
            files_written: 0,
            bytes_downloaded: 0,
        });
    }

    let executor = Arc::new(Executor::new(
        ctx.clone(),
        &request.dest,
        embedded,
        remote,
    ));
    let summary = match executor.run(&plan).await {
        Ok(summary) => summary,
        Err(e) => {
            end_session(ctx, source.as_deref()).await;
            return Err(e);
        }
    };

    finalize_install(&request.dest, &profile, &manifest, &summary)?;
    end_session(ctx, source.as_deref()).await;

    Ok(InstallReport {
        tag_name: plan.tag_name,
        already_current: false,
        files_written: summary.files_written,
        bytes_downloaded: summary.bytes_downloaded,
    })
}

async fn end_session(ctx: &UpdateContext, source: Option<&dyn UpdateSource>) {
    if let Some(source) = source {
        let _ = source.end_session(&ctx.http).await;
    }
}

fn choose_manifest(
    embedded: Option<Manifest>,
    online: Option<Manifest>,
    online_only: bool,
) -> Result<Manifest> {
    if online_only {
        return online.ok_or_else(|| UpdateError::CorruptInstall {
            reason: "online-only run without a reachable source".to_string(),
        });
    }
    match (embedded, online) {
        (Some(embedded), Some(online)) => {
            // Ties go to the online manifest: equal tags mean identical
            // content and the online side can still serve patches.
            if check_downgrade(&embedded.tag_name, &online.tag_name).is_ok() {
                Ok(online)
            } else {
                Ok(embedded)
            }
        }
        (Some(embedded), None) => Ok(embedded),
        (None, Some(online)) => Ok(online),
        (None, None) => Err(UpdateError::CorruptInstall {
            reason: "no manifest available from package or source".to_string(),
        }),
    }
}

fn resolve_profile(
    embedded: Option<&EmbeddedSource>,
    remote: Option<&RemoteSource>,
) -> Result<InstallerProfile> {
    if let Some(embedded) = embedded {
        return InstallerProfile::from_json(embedded.parsed().config_bytes());
    }
    if let Some(remote) = remote {
        return InstallerProfile::from_json(remote.package.config_bytes());
    }
    Err(UpdateError::CorruptInstall {
        reason: "no installer profile available".to_string(),
    })
}
