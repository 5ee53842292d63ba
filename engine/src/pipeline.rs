use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use api::entity::EntityRef;
use api::message::RemoteMessage;
use api::stats::{DownloadStats, RunSummary};
use common::config::VaultConfig;
use common::db::BackupDb;
use common::error::BackupError;
use common::media::hash::HashAlgorithm;

use crate::dedup;
use crate::download::{DownloadItem, Downloader};
use crate::reconcile;
use crate::remote::RemoteClient;

// ingestion pipeline
//
// per entity, per run: open the store, reconcile against disk, walk the
// history newest first, resolve media through the dedup tiers, and batch
// whatever actually needs downloading.  every persisted message and every
// completed download commits immediately so progress survives a crash.

pub struct ProcessOptions {
    pub limit: Option<usize>,
    pub download_media: bool,
    pub cancel: CancellationToken,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            limit: None,
            download_media: true,
            cancel: CancellationToken::new(),
        }
    }
}

struct PipelineContext {
    db: Arc<BackupDb>,
    client: Arc<dyn RemoteClient>,
    downloader: Downloader,
    stats: Arc<Mutex<DownloadStats>>,
    media_dir: PathBuf,
    extraction_time: String,
    cancel: CancellationToken,
}

#[instrument(skip_all, fields(entity = entity.id))]
pub async fn process_entity(
    client: Arc<dyn RemoteClient>,
    config: Arc<VaultConfig>,
    entity: &EntityRef,
    opts: ProcessOptions,
) -> Result<RunSummary> {
    if !entity.accessible {
        return Err(BackupError::AccessDenied(entity.name.clone()).into());
    }

    let start = Instant::now();

    let algorithm = HashAlgorithm::from_name(&config.hash_algorithm)?;
    let entity_dir = config.backup_root.join(entity.dir_name());

    info!({ dir = ?entity_dir }, "processing entity");

    let db = Arc::new(BackupDb::open(&entity_dir, algorithm).await?);
    let stats = Arc::new(Mutex::new(DownloadStats::default()));

    if opts.download_media {
        reconcile::pre_pass(&db).await?;
    }

    let context = PipelineContext {
        media_dir: db.media_dir(),
        downloader: Downloader::new(config.clone(), algorithm, stats.clone()),
        db: db.clone(),
        client: client.clone(),
        stats: stats.clone(),
        extraction_time: Utc::now().to_rfc3339(),
        cancel: opts.cancel.clone(),
    };

    let mut batch: Vec<DownloadItem> = Vec::new();
    let mut batch_bytes: i64 = 0;
    let mut deferred: Vec<RemoteMessage> = Vec::new();
    let mut messages: i64 = 0;
    let mut cancelled = false;

    let mut history = client.message_history(entity, opts.limit);

    loop {
        let next = tokio::select! {
            biased;

            _ = opts.cancel.cancelled() => {
                cancelled = true;
                break;
            }

            next = history.next() => next,
        };

        let Some(next) = next else {
            break;
        };

        let msg = next?;
        messages += 1;

        let Some(media) = msg.media.clone().filter(|m| m.downloadable()) else {
            // plain text, service events, and web previews persist directly
            context
                .db
                .save_message(&msg, &context.extraction_time, None)
                .await?;
            continue;
        };

        if !opts.download_media {
            context
                .db
                .save_message(&msg, &context.extraction_time, None)
                .await?;
            continue;
        }

        let resolution = dedup::resolve(&context.db, &media).await?;

        if !resolution.need_download {
            lock_stats(&context.stats).record_skip(media.declared_size().max(0));

            context
                .db
                .save_message(&msg, &context.extraction_time, resolution.media_file_id)
                .await?;
            continue;
        }

        if resolution.path.is_some() && batch.iter().any(|item| item.dest == resolution.path) {
            // a batchmate already claimed this reserved path; once it lands
            // the dedup tiers will resolve this message without a download
            deferred.push(msg);
        } else {
            batch_bytes += media.declared_size().max(0);
            batch.push(DownloadItem {
                message: msg,
                media,
                dest: resolution.path,
            });
        }

        if batch.len() >= config.download_batch_size
            || batch_bytes >= config.download_batch_size_bytes
        {
            flush_batch(&context, &mut batch, &mut deferred).await?;
            batch_bytes = 0;
        }
    }

    if cancelled {
        // everything persisted so far is already committed; pending batch
        // items intentionally leave no rows so the next run retries them
        debug!({ messages = messages }, "run cancelled");
        return Err(BackupError::Cancelled.into());
    }

    flush_batch(&context, &mut batch, &mut deferred).await?;

    if opts.download_media {
        reconcile::post_pass(&db).await?;
    }

    let stats = lock_stats(&stats).clone();

    let summary = RunSummary {
        entity_id: entity.id,
        messages,
        downloaded: stats.files_downloaded,
        skipped: stats.files_skipped,
        bytes_downloaded: stats.bytes_downloaded,
        bytes_skipped: stats.bytes_skipped,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        errors_by_kind: stats.errors_by_kind,
    };

    info!(
        { messages = summary.messages, downloaded = summary.downloaded, skipped = summary.skipped },
        "entity complete"
    );

    Ok(summary)
}

// drive one batch through the executor, then persist message + media for
// every completed item, committing after each file
async fn flush_batch(
    context: &PipelineContext,
    batch: &mut Vec<DownloadItem>,
    deferred: &mut Vec<RemoteMessage>,
) -> Result<()> {
    if batch.is_empty() && deferred.is_empty() {
        return Ok(());
    }

    let items = std::mem::take(batch);

    debug!({ items = items.len() }, "flushing download batch");

    let results = context
        .downloader
        .execute_batch(
            context.client.clone(),
            items,
            &context.media_dir,
            &context.cancel,
        )
        .await?;

    let mut cancelled = false;
    let mut disk_full: Option<BackupError> = None;

    for (item, result) in results {
        match result {
            Ok(done) => {
                match dedup::save_media_file(&context.db, &done.path, Some(&done.hash), &item.media)
                    .await
                {
                    Ok((media_id, kept)) => {
                        // a deduplicated loser still counts as a download,
                        // but its bytes were deleted again
                        lock_stats(&context.stats)
                            .record_success(if kept { done.bytes as i64 } else { 0 });

                        context
                            .db
                            .save_message(&item.message, &context.extraction_time, Some(media_id))
                            .await?;
                    }
                    Err(err) => {
                        let kind = err
                            .downcast_ref::<BackupError>()
                            .map(|e| e.kind())
                            .unwrap_or("Other");

                        lock_stats(&context.stats).record_failure(kind);

                        context
                            .db
                            .save_message(&item.message, &context.extraction_time, None)
                            .await?;
                    }
                }
            }
            Err(BackupError::Cancelled) => {
                cancelled = true;
                lock_stats(&context.stats).record_failure("Cancelled");
            }
            Err(err) => {
                let is_disk_full = matches!(err, BackupError::DiskFull { .. });

                lock_stats(&context.stats).record_failure(err.kind());

                // the message itself is still worth keeping; its media_ref
                // stays null until a later run succeeds
                context
                    .db
                    .save_message(&item.message, &context.extraction_time, None)
                    .await?;

                if is_disk_full {
                    disk_full = Some(err);
                }
            }
        }
    }

    // batchmates that shared a reserved path resolve against the winner
    for msg in std::mem::take(deferred) {
        let Some(media) = msg.media.clone() else {
            continue;
        };

        let resolution = dedup::resolve(&context.db, &media).await?;

        if resolution.need_download {
            // the winner failed; persist without media and retry next run
            context
                .db
                .save_message(&msg, &context.extraction_time, None)
                .await?;
        } else {
            lock_stats(&context.stats).record_skip(media.declared_size().max(0));

            context
                .db
                .save_message(&msg, &context.extraction_time, resolution.media_file_id)
                .await?;
        }
    }

    if let Some(err) = disk_full {
        return Err(err.into());
    }

    if cancelled {
        return Err(BackupError::Cancelled.into());
    }

    Ok(())
}

fn lock_stats(stats: &Mutex<DownloadStats>) -> MutexGuard<'_, DownloadStats> {
    stats.lock().expect("stats lock poisoned")
}
