use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use api::entity::EntityRef;
use api::stats::RunSummary;
use common::config::{VaultConfig, read_config};
use common::error::BackupError;

use engine::pipeline::{ProcessOptions, process_entity};
use engine::remote::RemoteClient;
use engine::remote::fixture::FixtureClient;

#[derive(Parser)]
#[command(name = "chatvault", about = "incremental chat archive mirror")]
struct Cli {
    // toml file with a [config] table; environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    // replay a fixture directory instead of opening a live session
    #[arg(long)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the entities visible to the session
    List,

    /// Back up a single entity, by numeric id or exact name
    Backup {
        entity: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        no_media: bool,
    },

    /// Back up every accessible entity
    BackupAll {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        no_media: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");

            match err.downcast_ref::<BackupError>() {
                Some(BackupError::AuthFailed(_)) => ExitCode::from(2),
                Some(BackupError::DiskFull { .. }) => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = read_config(cli.config.clone()).await?;
    let client = connect(&cli, &config).await?;

    let result = dispatch(&cli, client.clone(), config).await;

    client.close().await?;

    result
}

async fn connect(cli: &Cli, config: &VaultConfig) -> Result<Arc<dyn RemoteClient>> {
    if let Some(dir) = &cli.fixture {
        info!({ dir = ?dir }, "using fixture client");
        return Ok(Arc::new(FixtureClient::from_dir(dir).await?));
    }

    // a live session would be validated and opened here; this build only
    // ships the fixture transport
    config.validate_credentials()?;

    Err(BackupError::AuthFailed(
        "no live session transport is configured in this build; pass --fixture".to_owned(),
    )
    .into())
}

async fn dispatch(
    cli: &Cli,
    client: Arc<dyn RemoteClient>,
    config: Arc<VaultConfig>,
) -> Result<()> {
    match &cli.command {
        Command::List => {
            for entity in client.list_entities().await? {
                let access = if entity.accessible { "" } else { " (inaccessible)" };

                println!("{}\t{:?}\t{}{}", entity.id, entity.kind, entity.name, access);
            }

            Ok(())
        }
        Command::Backup { entity, limit, no_media } => {
            let target = find_entity(&client, entity).await?;

            let summary = process_entity(
                client,
                config,
                &target,
                ProcessOptions {
                    limit: *limit,
                    download_media: !no_media,
                    cancel: interrupt_token(),
                },
            )
            .await?;

            print_summary(&target, &summary);
            Ok(())
        }
        Command::BackupAll { limit, no_media } => {
            let cancel = interrupt_token();

            for entity in client.list_entities().await? {
                let result = process_entity(
                    client.clone(),
                    config.clone(),
                    &entity,
                    ProcessOptions {
                        limit: *limit,
                        download_media: !no_media,
                        cancel: cancel.clone(),
                    },
                )
                .await;

                match result {
                    Ok(summary) => print_summary(&entity, &summary),
                    Err(err) => match err.downcast_ref::<BackupError>() {
                        // inaccessible entities are skipped, not fatal
                        Some(BackupError::AccessDenied(_)) => {
                            warn!({ entity = entity.id }, "access denied, skipping");
                        }
                        // a full disk or an interrupt stops the whole run
                        Some(BackupError::DiskFull { .. }) | Some(BackupError::Cancelled) => {
                            return Err(err);
                        }
                        _ => {
                            warn!({ entity = entity.id, error = %err }, "entity failed, continuing");
                        }
                    },
                }
            }

            Ok(())
        }
    }
}

async fn find_entity(client: &Arc<dyn RemoteClient>, needle: &str) -> Result<EntityRef> {
    let entities = client.list_entities().await?;

    let by_id = needle.parse::<i64>().ok();

    entities
        .into_iter()
        .find(|entity| Some(entity.id) == by_id || entity.name == needle)
        .ok_or_else(|| anyhow::Error::msg(format!("no such entity: {needle}")))
}

// ctrl-c flips the token; the pipeline commits what it has and unwinds
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();

    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current downloads");
            handle.cancel();
        }
    });

    token
}

fn print_summary(entity: &EntityRef, summary: &RunSummary) {
    println!();
    println!("== {} ({}) ==", entity.name, entity.id);
    println!("messages processed:  {}", summary.messages);
    println!(
        "files downloaded:    {} ({} bytes)",
        summary.downloaded, summary.bytes_downloaded
    );
    println!(
        "files skipped:       {} ({} bytes)",
        summary.skipped, summary.bytes_skipped
    );
    println!("elapsed:             {:.1}s", summary.elapsed_seconds);

    if !summary.errors_by_kind.is_empty() {
        println!("errors:");

        let mut kinds: Vec<_> = summary.errors_by_kind.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1));

        for (kind, count) in kinds {
            println!("  {kind}: {count}");
        }
    }
}
