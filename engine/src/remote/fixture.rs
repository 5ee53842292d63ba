use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use api::entity::{EntityId, EntityRef};
use api::media::RemoteMedia;
use api::message::RemoteMessage;
use common::error::BackupError;

use crate::remote::{Progress, RemoteClient};

// deterministic stand-in for a live session
//
// the real service sits behind RemoteClient; this client replays a fixed
// set of entities, messages, and blobs, and can inject per-file failure
// sequences and transfer delays.  it backs the integration tests and the
// cli's --fixture mode.
#[derive(Default)]
pub struct FixtureClient {
    entities: Vec<EntityRef>,
    messages: HashMap<EntityId, Vec<RemoteMessage>>,
    blobs: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    fail_plan: Mutex<HashMap<String, VecDeque<BackupError>>>,
    downloads: Mutex<Vec<String>>,
    bytes_served: AtomicU64,
}

#[derive(Deserialize)]
struct FixtureFile {
    entities: Vec<EntityRef>,
    messages: HashMap<String, Vec<RemoteMessage>>,
}

impl FixtureClient {
    pub fn new() -> Self {
        FixtureClient::default()
    }

    // layout: <dir>/fixture.json plus raw blobs under <dir>/blobs/<file_id>
    pub async fn from_dir(dir: &Path) -> Result<Self> {
        let doc = tokio::fs::read_to_string(dir.join("fixture.json")).await?;
        let data: FixtureFile = serde_json::from_str(&doc)?;

        let mut client = FixtureClient::new();
        client.entities = data.entities;

        for (entity_id, messages) in data.messages {
            client.messages.insert(entity_id.parse()?, messages);
        }

        let blob_dir = dir.join("blobs");

        if tokio::fs::try_exists(&blob_dir).await? {
            let mut entries = tokio::fs::read_dir(&blob_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    client.blobs.insert(name, tokio::fs::read(entry.path()).await?);
                }
            }
        }

        Ok(client)
    }

    pub fn add_entity(&mut self, entity: EntityRef) {
        self.entities.push(entity);
    }

    pub fn add_message(&mut self, msg: RemoteMessage) {
        self.messages.entry(msg.entity_id).or_default().push(msg);
    }

    pub fn add_blob(&mut self, file_id: &str, bytes: Vec<u8>) {
        self.blobs.insert(file_id.to_owned(), bytes);
    }

    // queue an error for the next download of file_id; subsequent attempts
    // pop further entries, then succeed
    pub fn fail_next(&self, file_id: &str, err: BackupError) {
        self.fail_plan
            .lock()
            .expect("fail plan lock poisoned")
            .entry(file_id.to_owned())
            .or_default()
            .push_back(err);
    }

    // make a transfer slow enough to be cancelled mid-flight; a partial
    // file is left on disk during the delay
    pub fn set_delay(&mut self, file_id: &str, delay: Duration) {
        self.delays.insert(file_id.to_owned(), delay);
    }

    pub fn downloads_performed(&self) -> usize {
        self.downloads.lock().expect("download log lock poisoned").len()
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteClient for FixtureClient {
    async fn list_entities(&self) -> Result<Vec<EntityRef>> {
        Ok(self.entities.clone())
    }

    fn message_history(
        &self,
        entity: &EntityRef,
        limit: Option<usize>,
    ) -> BoxStream<'_, Result<RemoteMessage, BackupError>> {
        let mut messages = self.messages.get(&entity.id).cloned().unwrap_or_default();

        // the server yields newest first
        messages.sort_by(|a, b| b.id.cmp(&a.id));

        if let Some(limit) = limit {
            messages.truncate(limit);
        }

        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    async fn download(
        &self,
        media: &RemoteMedia,
        dest: &Path,
        progress: Progress<'_>,
    ) -> Result<u64, BackupError> {
        let file_id = media
            .file_id()
            .ok_or_else(|| BackupError::InvalidData("media has no file id".to_owned()))?;

        if let Some(err) = self
            .fail_plan
            .lock()
            .expect("fail plan lock poisoned")
            .get_mut(file_id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let blob = self
            .blobs
            .get(file_id)
            .ok_or_else(|| BackupError::InvalidData(format!("unknown blob {file_id}")))?
            .clone();

        let total = blob.len() as u64;

        progress(0, total);

        if let Some(delay) = self.delays.get(file_id) {
            // leave a partial file behind while we stall, so cancellation
            // paths have something to clean up
            tokio::fs::write(dest, &blob[..blob.len() / 2])
                .await
                .map_err(|err| BackupError::NetworkTransient(err.to_string()))?;

            tokio::time::sleep(*delay).await;
        }

        tokio::fs::write(dest, &blob)
            .await
            .map_err(|err| BackupError::NetworkTransient(err.to_string()))?;

        progress(total, total);

        self.downloads
            .lock()
            .expect("download log lock poisoned")
            .push(file_id.to_owned());
        self.bytes_served.fetch_add(total, Ordering::Relaxed);

        debug!({ file_id = file_id, bytes = total }, "fixture served blob");
        Ok(total)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
