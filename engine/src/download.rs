use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use fs2::available_space;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, instrument, trace, warn};

use api::stats::DownloadStats;
use common::config::VaultConfig;
use common::error::BackupError;
use common::media::hash::{HashAlgorithm, content_hash};
use common::media::validate::validate_file;

use crate::remote::RemoteClient;

// headroom that must remain free after a download lands
const DISK_SAFETY_MARGIN: u64 = 100 * 1024 * 1024;

// one unit of work for the executor: the message is carried along so the
// pipeline can persist it once the blob settles
#[derive(Clone, Debug)]
pub struct DownloadItem {
    pub message: api::message::RemoteMessage,
    pub media: api::media::RemoteMedia,
    pub dest: Option<PathBuf>,
}

impl DownloadItem {
    pub fn declared_size(&self) -> i64 {
        self.media.declared_size()
    }
}

#[derive(Clone, Debug)]
pub struct CompletedDownload {
    pub path: PathBuf,
    pub hash: String,
    pub bytes: u64,
}

// download executor
//
// a batch of items fans out over a counting semaphore; each worker runs
// preflight checks, the transfer with retry/backoff, validation, and
// hashing.  the merge into the index is the pipeline's job, because it has
// to happen in completion order under the store's dedup region.
pub struct Downloader {
    config: Arc<VaultConfig>,
    algorithm: HashAlgorithm,
    semaphore: Arc<Semaphore>,
    stats: Arc<Mutex<DownloadStats>>,
}

struct WorkerContext {
    client: Arc<dyn RemoteClient>,
    media_dir: PathBuf,
    config: Arc<VaultConfig>,
    algorithm: HashAlgorithm,
    stats: Arc<Mutex<DownloadStats>>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        config: Arc<VaultConfig>,
        algorithm: HashAlgorithm,
        stats: Arc<Mutex<DownloadStats>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads));

        Downloader {
            config,
            algorithm,
            semaphore,
            stats,
        }
    }

    // run one batch to completion.  a batch-level disk shortfall fails the
    // whole call with DiskFull so the pipeline can stop cleanly; individual
    // item failures come back in the per-item results.
    #[instrument(level = Level::DEBUG, skip_all, fields(items = items.len()))]
    pub async fn execute_batch(
        &self,
        client: Arc<dyn RemoteClient>,
        items: Vec<DownloadItem>,
        media_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<(DownloadItem, Result<CompletedDownload, BackupError>)>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(media_dir).await?;

        // results come back in input order, so the pipeline persists
        // messages in the order the server yielded them even though the
        // transfers complete out of order
        let mut slots: Vec<Option<(DownloadItem, Result<CompletedDownload, BackupError>)>> =
            std::iter::repeat_with(|| None).take(items.len()).collect();

        // items over the size limit are rejected up front and never reach
        // the transfer or the disk budget
        let limit = self.config.max_file_size;
        let mut to_fetch: Vec<(usize, DownloadItem)> = Vec::new();

        for (idx, item) in items.into_iter().enumerate() {
            let declared = item.declared_size();

            if declared > limit {
                let err = BackupError::SizeLimitExceeded { declared, limit };
                slots[idx] = Some((item, Err(err)));
            } else {
                to_fetch.push((idx, item));
            }
        }

        let total_declared: i64 = to_fetch
            .iter()
            .map(|(_, item)| item.declared_size().max(0))
            .sum();

        if let Some(free) = free_space(media_dir)
            && free <= total_declared as u64 + DISK_SAFETY_MARGIN
        {
            return Err(BackupError::DiskFull {
                required: total_declared as u64 + DISK_SAFETY_MARGIN,
                available: free,
            }
            .into());
        }

        let context = Arc::new(WorkerContext {
            client,
            media_dir: media_dir.to_owned(),
            config: self.config.clone(),
            algorithm: self.algorithm,
            stats: self.stats.clone(),
            cancel: cancel.clone(),
        });

        let mut tasks = JoinSet::new();

        for (idx, item) in to_fetch {
            let context = context.clone();
            let semaphore = self.semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("download semaphore closed");

                let result = download_one(&context, &item).await;

                (idx, item, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (idx, item, result) = joined?;
            slots[idx] = Some((item, result));
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

fn free_space(path: &Path) -> Option<u64> {
    match available_space(path) {
        Ok(free) => Some(free),
        Err(err) => {
            // if the check itself fails, do not block downloads
            warn!({ error = %err }, "cannot check disk space");
            None
        }
    }
}

async fn download_one(
    context: &WorkerContext,
    item: &DownloadItem,
) -> Result<CompletedDownload, BackupError> {
    if context.cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    let declared = item.declared_size();

    if declared > 0
        && let Some(free) = free_space(&context.media_dir)
        && free <= declared as u64 + DISK_SAFETY_MARGIN
    {
        return Err(BackupError::DiskFull {
            required: declared as u64 + DISK_SAFETY_MARGIN,
            available: free,
        });
    }

    let dest = match &item.dest {
        Some(dest) => dest.clone(),
        None => context
            .media_dir
            .join(format!("message_{}.bin", item.message.id)),
    };

    let msg_id = item.message.id;
    let progress = move |current: u64, total: u64| {
        trace!({ message_id = msg_id, current = current, total = total }, "transfer progress");
    };

    let expected = (declared > 0).then_some(declared);
    let max_retries = context.config.max_download_retries;
    let base_delay = context.config.retry_delay();

    let mut attempt: u32 = 0;
    let mut needed_retry = false;

    loop {
        let result = tokio::select! {
            _ = context.cancel.cancelled() => {
                remove_partial(&dest).await;
                return Err(BackupError::Cancelled);
            }

            res = context.client.download(&item.media, &dest, &progress) => res,
        };

        match result {
            Ok(_) => {
                if let Err(err) = validate_file(&dest, expected).await {
                    // a corrupt transfer is not worth retrying
                    remove_partial(&dest).await;
                    return Err(err);
                }

                let hash = content_hash(&dest, context.algorithm)
                    .await
                    .map_err(|err| BackupError::Other(err.to_string()))?;

                let bytes = tokio::fs::metadata(&dest)
                    .await
                    .map(|meta| meta.len())
                    .unwrap_or(declared.max(0) as u64);

                if needed_retry {
                    lock_stats(&context.stats).record_file_with_retry();
                }

                debug!({ message_id = msg_id, bytes = bytes }, "download complete");
                return Ok(CompletedDownload { path: dest, hash, bytes });
            }
            Err(err) if err.is_retryable() => {
                needed_retry = true;
                lock_stats(&context.stats).record_retry();

                match err.advised_wait() {
                    // server-advised waits are honored verbatim and do not
                    // consume the retry budget
                    Some(wait) => {
                        warn!(
                            { message_id = msg_id, wait_s = wait.as_secs() },
                            "remote asked us to wait"
                        );
                        sleep(wait).await;
                    }
                    None => {
                        attempt += 1;

                        if attempt > max_retries {
                            remove_partial(&dest).await;
                            return Err(err);
                        }

                        let delay = base_delay * 2u32.pow(attempt - 1);

                        warn!(
                            { message_id = msg_id, attempt = attempt, delay_ms = delay.as_millis() as u64, error = %err },
                            "retrying download"
                        );
                        sleep(delay).await;
                    }
                }
            }
            Err(err) => {
                remove_partial(&dest).await;
                return Err(err);
            }
        }
    }
}

async fn remove_partial(dest: &Path) {
    match tokio::fs::remove_file(dest).await {
        Ok(()) => debug!({ path = ?dest }, "removed partial file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!({ path = ?dest, error = %err }, "failed to remove partial file"),
    }
}

fn lock_stats(stats: &Mutex<DownloadStats>) -> std::sync::MutexGuard<'_, DownloadStats> {
    stats.lock().expect("stats lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, Instant};

    use api::media::{PhotoSize, RemoteMedia, RemotePhoto};
    use api::message::RemoteMessage;

    use crate::remote::fixture::FixtureClient;

    fn photo(id: &str, bytes: i64) -> RemoteMedia {
        RemoteMedia::Photo(RemotePhoto {
            id: id.to_owned(),
            access_hash: None,
            sizes: vec![PhotoSize { width: 10, height: 10, bytes }],
        })
    }

    fn message(id: i64, media: RemoteMedia) -> RemoteMessage {
        RemoteMessage {
            id,
            entity_id: 1,
            date: "2024-05-01T10:00:00+00:00".to_owned(),
            text: None,
            media: Some(media),
            service: None,
            forward_origin: None,
            sender_id: None,
            sender_name: None,
            views: None,
            reply_to: None,
            reactions: Vec::new(),
            buttons: Vec::new(),
            is_pinned: false,
        }
    }

    fn item(id: i64, file_id: &str, bytes: i64, dest: &Path) -> DownloadItem {
        let media = photo(file_id, bytes);

        DownloadItem {
            message: message(id, media.clone()),
            media,
            dest: Some(dest.join(format!("{file_id}.jpg"))),
        }
    }

    fn jpeg_blob(len: usize) -> Vec<u8> {
        let mut blob = vec![0xff, 0xd8, 0xff, 0xe0];
        blob.resize(len, 0x11);
        blob
    }

    fn downloader(config: VaultConfig) -> (Downloader, Arc<Mutex<DownloadStats>>) {
        let stats = Arc::new(Mutex::new(DownloadStats::default()));
        let dl = Downloader::new(Arc::new(config), HashAlgorithm::Xxh3_128, stats.clone());
        (dl, stats)
    }

    #[tokio::test]
    async fn batch_downloads_validate_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        let blob = jpeg_blob(2000);
        let mut client = FixtureClient::new();
        client.add_blob("A1", blob.clone());

        let (dl, _stats) = downloader(VaultConfig::default());
        let cancel = CancellationToken::new();

        let results = dl
            .execute_batch(
                Arc::new(client),
                vec![item(1, "A1", 2000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);

        let completed = results[0].1.as_ref().unwrap();
        assert_eq!(completed.bytes, 2000);
        assert!(completed.path.ends_with("A1.jpg"));
        assert_eq!(completed.hash.len(), 32);
    }

    #[tokio::test]
    async fn oversized_items_are_rejected_before_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        let client = Arc::new(FixtureClient::new());

        let config = VaultConfig {
            max_file_size: 1000,
            ..Default::default()
        };
        let (dl, _stats) = downloader(config);
        let cancel = CancellationToken::new();

        let results = dl
            .execute_batch(
                client.clone(),
                vec![item(1, "A1", 5000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(
            results[0].1,
            Err(BackupError::SizeLimitExceeded { declared: 5000, limit: 1000 })
        ));
        assert_eq!(client.downloads_performed(), 0);
    }

    #[tokio::test]
    async fn rate_limit_waits_advised_time_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        let mut client = FixtureClient::new();
        client.add_blob("A1", jpeg_blob(2000));
        client.fail_next("A1", BackupError::RateLimited(1));

        let (dl, stats) = downloader(VaultConfig::default());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let results = dl
            .execute_batch(
                Arc::new(client),
                vec![item(1, "A1", 2000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert!(results[0].1.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(1));

        let stats = stats.lock().unwrap();
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.files_requiring_retry, 1);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_the_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        let mut client = FixtureClient::new();
        client.add_blob("A1", jpeg_blob(2000));
        for _ in 0..5 {
            client.fail_next("A1", BackupError::NetworkTransient("reset".to_owned()));
        }

        let config = VaultConfig {
            max_download_retries: 2,
            retry_delay_secs: 0.01,
            ..Default::default()
        };
        let (dl, stats) = downloader(config);
        let cancel = CancellationToken::new();

        let results = dl
            .execute_batch(
                Arc::new(client),
                vec![item(1, "A1", 2000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(results[0].1, Err(BackupError::NetworkTransient(_))));
        assert_eq!(stats.lock().unwrap().total_retries, 3);
    }

    #[tokio::test]
    async fn invalid_downloads_are_deleted_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        // wrong magic bytes for a .jpg destination
        let mut client = FixtureClient::new();
        client.add_blob("A1", vec![0u8; 2000]);

        let (dl, _stats) = downloader(VaultConfig::default());
        let cancel = CancellationToken::new();

        let results = dl
            .execute_batch(
                Arc::new(client),
                vec![item(1, "A1", 2000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(results[0].1, Err(BackupError::ValidationFailed(_))));
        assert!(!media_dir.join("A1.jpg").exists());
    }

    #[tokio::test]
    async fn cancellation_removes_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");

        let mut client = FixtureClient::new();
        client.add_blob("A1", jpeg_blob(2000));
        client.set_delay("A1", Duration::from_secs(30));

        let (dl, _stats) = downloader(VaultConfig::default());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let results = dl
            .execute_batch(
                Arc::new(client),
                vec![item(1, "A1", 2000, &media_dir)],
                &media_dir,
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(results[0].1, Err(BackupError::Cancelled)));
        assert!(!media_dir.join("A1.jpg").exists());
    }
}
