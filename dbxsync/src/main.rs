use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dbx_core::{DropboxClient, OAuthClient};
use dbxsync::config::{ConfigDocument, SyncSettings, default_config_path};
use dbxsync::explorer::{LocalExplorer, RemoteExplorer, SystemLauncher};
use dbxsync::logging;
use dbxsync::remote::{DropboxRemote, RemoteStore};
use dbxsync::sync::engine::SyncEngine;
use dbxsync::sync::ledger::JsonConfigStore;
use dbxsync::tasks::{SyncDirection, TaskAction, TaskOutput, TaskRunner};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Push(Option<PathBuf>),
    Pull(String),
    MarkSynced(Option<PathBuf>),
    CleanLedger,
    Missing { delete: bool },
    Setup {
        app_key: String,
        app_secret: String,
        location: String,
        time_zone: Option<String>,
    },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let rest: Vec<String> = args.collect();
    let mode = match (command.as_str(), rest.as_slice()) {
        ("--help" | "-h" | "help", _) => CliMode::Help,
        ("push", []) => CliMode::Push(None),
        ("push", [path]) => CliMode::Push(Some(PathBuf::from(path))),
        ("pull", [path]) => CliMode::Pull(path.clone()),
        ("mark-synced", []) => CliMode::MarkSynced(None),
        ("mark-synced", [path]) => CliMode::MarkSynced(Some(PathBuf::from(path))),
        ("clean-ledger", []) => CliMode::CleanLedger,
        ("missing", []) => CliMode::Missing { delete: false },
        ("missing", [flag]) if flag == "--delete" => CliMode::Missing { delete: true },
        ("setup", [app_key, app_secret, location]) => CliMode::Setup {
            app_key: app_key.clone(),
            app_secret: app_secret.clone(),
            location: location.clone(),
            time_zone: None,
        },
        ("setup", [app_key, app_secret, location, time_zone]) => CliMode::Setup {
            app_key: app_key.clone(),
            app_secret: app_secret.clone(),
            location: location.clone(),
            time_zone: Some(time_zone.clone()),
        },
        (other, _) => anyhow::bail!("unknown or malformed command: {other}"),
    };
    Ok(mode)
}

fn print_usage() {
    println!("Usage: dbxsync <command>");
    println!("  push [local-path]          Upload new and modified files (default: sync root)");
    println!("  pull <remote-path>         Download a remote file or folder if it changed");
    println!("  mark-synced [local-path]   Record files as pushed without uploading");
    println!("  clean-ledger               Forget pushed paths that no longer exist locally");
    println!("  missing [--delete]         List (or delete remotely) paths removed locally");
    println!("  setup <key> <secret> <dir> [tz]  Authorize the app and write a new config");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    logging::init();

    if let CliMode::Setup {
        app_key,
        app_secret,
        location,
        time_zone,
    } = mode
    {
        return setup(app_key, app_secret, location, time_zone).await;
    }

    let (settings, document) = SyncSettings::load().context("failed to load config")?;
    let store = Arc::new(JsonConfigStore::new(settings.config_path.clone()));
    let token = resolve_access_token(&store, &document).await?;
    let remote: Arc<dyn RemoteStore> = Arc::new(DropboxRemote::new(DropboxClient::new(token)?));
    let engine = Arc::new(SyncEngine::from_settings(
        remote.clone(),
        store.clone(),
        &settings,
    ));
    let launcher = Arc::new(SystemLauncher);
    let (runner, mut events) = TaskRunner::new(
        engine,
        Arc::new(LocalExplorer::new(launcher.clone())),
        Arc::new(RemoteExplorer::new(remote, launcher)),
    );
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let line = format!("[{}] {}: {}", event.id, event.status, event.description);
            match event.error {
                Some(error) => println!("{line} ({error})"),
                None => println!("{line}"),
            }
        }
    });

    let delete_missing = mode == CliMode::Missing { delete: true };
    let root = settings.local_root.clone();
    let action = match mode {
        CliMode::Push(path) => TaskAction::Sync {
            direction: SyncDirection::Push,
            path: absolute(path.unwrap_or(root))?.to_string_lossy().into_owned(),
        },
        CliMode::Pull(path) => TaskAction::Sync {
            direction: SyncDirection::Pull,
            path,
        },
        CliMode::MarkSynced(path) => TaskAction::MarkSynced {
            local: absolute(path.unwrap_or(root))?,
        },
        CliMode::CleanLedger => TaskAction::CleanLedger,
        CliMode::Missing { .. } => TaskAction::FindMissing,
        CliMode::Setup { .. } | CliMode::Help => anyhow::bail!("command does not run a task"),
    };
    let mut output = runner.submit(action).wait().await;
    if let (true, Ok(TaskOutput::Paths(paths))) = (delete_missing, &output) {
        if !paths.is_empty() {
            output = runner
                .submit(TaskAction::DeleteRemote {
                    paths: paths.clone(),
                })
                .wait()
                .await;
        }
    }
    drop(runner);
    printer.await?;

    match output.context("task failed")? {
        TaskOutput::Report(report) => {
            println!(
                "transferred {}, unchanged {}, ignored {}, failed {}",
                report.transferred.len(),
                report.unchanged,
                report.ignored,
                report.failed.len()
            );
            for (path, reason) in &report.failed {
                println!("  failed {path}: {reason}");
            }
        }
        TaskOutput::Count(count) => println!("{count} entries"),
        TaskOutput::Paths(paths) => paths.iter().for_each(|path| println!("{path}")),
        TaskOutput::Job(Some(job)) => println!("batch delete job: {job}"),
        TaskOutput::Job(None) | TaskOutput::Nothing => {}
    }
    Ok(())
}

fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    std::path::absolute(&path).with_context(|| format!("cannot resolve {}", path.display()))
}

/// Refreshes the access token when refresh credentials are configured and
/// persists the new one; falls back to the stored token otherwise.
async fn resolve_access_token(
    store: &JsonConfigStore,
    document: &ConfigDocument,
) -> anyhow::Result<String> {
    if let (Some(key), Some(secret), Some(refresh)) = (
        document.app_key.as_deref(),
        document.app_secret.as_deref(),
        document.refresh_token.as_deref(),
    ) {
        match OAuthClient::new(key, secret)?.refresh_token(refresh).await {
            Ok(token) => {
                store
                    .set_access_token(token.access_token.clone())
                    .context("failed to persist refreshed access token")?;
                info!("access token refreshed");
                return Ok(token.access_token);
            }
            Err(err) => warn!(error = %err, "token refresh failed, using stored access token"),
        }
    }
    document
        .access_token
        .clone()
        .filter(|token| !token.is_empty())
        .context("ACCESS_TOKEN is missing; run `dbxsync setup` first")
}

async fn setup(
    app_key: String,
    app_secret: String,
    location: String,
    time_zone: Option<String>,
) -> anyhow::Result<()> {
    let oauth = OAuthClient::new(app_key.clone(), app_secret.clone())?;
    println!("Open this URL, allow access and paste the code:");
    println!("{}", oauth.authorize_url()?);

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read authorization code")?;
    let token = oauth
        .exchange_code(line.trim())
        .await
        .context("authorization code exchange failed")?;

    let time_zone = time_zone.unwrap_or_else(|| "UTC".to_string());
    let document = ConfigDocument::new_from_setup(location, time_zone, app_key, app_secret, &token);
    document.time_zone()?;
    let path = default_config_path()?;
    document.write(&path)?;
    println!("config written to {}", path.display());
    Ok(())
}
