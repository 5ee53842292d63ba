use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use api::entity::EntityRef;
use api::media::RemoteMedia;
use api::message::RemoteMessage;
use common::error::BackupError;

pub mod fixture;

// transfer progress callback: (bytes_so_far, total_bytes)
pub type Progress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

// remote service seam
//
// session bootstrap, credential handling, and the wire protocol all live
// behind this trait; the engine only needs entity enumeration, a
// newest-first history stream, and a blob fetch.  errors from download()
// are typed so the executor can classify them for retry.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    async fn list_entities(&self) -> Result<Vec<EntityRef>>;

    // newest first; a limit of None walks the full history
    fn message_history(
        &self,
        entity: &EntityRef,
        limit: Option<usize>,
    ) -> BoxStream<'_, Result<RemoteMessage, BackupError>>;

    async fn download(
        &self,
        media: &RemoteMedia,
        dest: &Path,
        progress: Progress<'_>,
    ) -> Result<u64, BackupError>;

    async fn close(&self) -> Result<()>;
}
