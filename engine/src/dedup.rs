use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs::{remove_file, rename, try_exists};
use tracing::{Level, debug, instrument, warn};

use api::media::{MediaFile, MediaFileId, RemoteMedia};
use common::db::{BackupDb, MetadataQuery, NewMediaFile};
use common::error::BackupError;
use common::media::hash::content_hash;
use common::media::metadata::{
    canonical_extension, extract_file_metadata, extract_remote_metadata,
};

// dedup resolver
//
// decides, per media descriptor, whether the blob already exists locally.
// tiers, first hit wins:
//   1. metadata match (size, duration, resolution, then name filters)
//   2. remote file_id match
//   3. deterministic <file_id><ext> name already on disk but unindexed
//   4. reserve the deterministic path and request a download
#[derive(Clone, Debug)]
pub struct Resolution {
    pub media_file_id: Option<MediaFileId>,
    pub path: Option<PathBuf>,
    pub need_download: bool,
}

#[instrument(level = Level::DEBUG, skip_all)]
pub async fn resolve(db: &BackupDb, media: &RemoteMedia) -> Result<Resolution> {
    // the whole cascade mutates both index and filesystem, so it runs
    // under the store's dedup region
    let _guard = db.dedup_guard().await;

    let info = extract_remote_metadata(media);

    // tier 1: metadata
    let query = MetadataQuery {
        file_size: info.metadata.file_size,
        duration: info.metadata.duration,
        width: info.metadata.width,
        height: info.metadata.height,
        file_name: info.metadata.file_name.clone(),
        file_id: info.file_id.clone(),
    };

    if let Some(hit) = db.find_by_metadata(&query).await? {
        debug!({ media_id = hit.id }, "metadata match");

        db.fill_remote_ids(hit.id, info.file_id.as_deref(), info.access_hash.as_deref())
            .await?;

        let path = try_canonical_rename(db, &hit, info.file_id.as_deref()).await?;

        return Ok(Resolution {
            media_file_id: Some(hit.id),
            path: Some(path),
            need_download: false,
        });
    }

    // tier 2: remote id
    if let Some(file_id) = info.file_id.as_deref()
        && let Some(hit) = db.find_by_file_id(file_id).await?
    {
        debug!({ media_id = hit.id }, "file_id match");

        db.touch_last_used(hit.id).await?;

        let path = try_canonical_rename(db, &hit, Some(file_id)).await?;

        return Ok(Resolution {
            media_file_id: Some(hit.id),
            path: Some(path),
            need_download: false,
        });
    }

    let Some(file_id) = info.file_id.clone() else {
        // no identifier: let the downloader pick a name
        return Ok(Resolution {
            media_file_id: None,
            path: None,
            need_download: true,
        });
    };

    let deterministic = db
        .media_dir()
        .join(format!("{file_id}{}", canonical_extension(media)));

    // tier 3: the canonical file exists but the index does not know it yet
    if try_exists(&deterministic).await? {
        let rel = db.relative_path(&deterministic);

        if let Some(existing) = db.find_by_path(&rel).await? {
            db.touch_last_used(existing.id).await?;

            return Ok(Resolution {
                media_file_id: Some(existing.id),
                path: Some(deterministic),
                need_download: false,
            });
        }

        debug!({ path = ?deterministic }, "indexing unindexed on-disk file");

        let hash = content_hash(&deterministic, db.algorithm()).await?;
        let local = extract_file_metadata(&deterministic).await;

        let id = db
            .upsert_by_identity(&NewMediaFile {
                file_path: rel,
                file_hash: hash,
                file_size: local.file_size,
                file_id: Some(file_id),
                access_hash: info.access_hash.clone(),
                media_type: Some(media.kind().to_owned()),
                mime_type: info.mime_type.clone(),
                file_name: info.metadata.file_name.clone().or(local.file_name),
                file_extension: local.file_extension,
                duration: info.metadata.duration,
                width: info.metadata.width.or(local.width),
                height: info.metadata.height.or(local.height),
            })
            .await?;

        return Ok(Resolution {
            media_file_id: Some(id),
            path: Some(deterministic),
            need_download: false,
        });
    }

    // tier 4: reserve
    Ok(Resolution {
        media_file_id: None,
        path: Some(deterministic),
        need_download: true,
    })
}

// rename an on-disk file to <file_id><ext> when it is not already named
// that way and the target is free; the row update lands in the same
// dedup region as the rename
async fn try_canonical_rename(
    db: &BackupDb,
    media: &MediaFile,
    file_id: Option<&str>,
) -> Result<PathBuf> {
    let current = db.absolute_path(&media.file_path);

    let Some(file_id) = file_id else {
        return Ok(current);
    };

    if !try_exists(&current).await? {
        return Ok(current);
    }

    let already_canonical = current
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(file_id));

    if already_canonical {
        return Ok(current);
    }

    let Some(ext) = current.extension().and_then(|e| e.to_str()) else {
        return Ok(current);
    };

    let target = match current.parent() {
        Some(parent) => parent.join(format!("{file_id}.{ext}")),
        None => return Ok(current),
    };

    if try_exists(&target).await? {
        return Ok(current);
    }

    match rename(&current, &target).await {
        Ok(()) => {
            db.set_path(media.id, &db.relative_path(&target)).await?;

            debug!({ from = ?current, to = ?target }, "renamed to canonical name");
            Ok(target)
        }
        Err(err) => {
            // keep going with the old name; the index still matches disk
            warn!({ path = ?current, error = %err }, "canonical rename failed");
            Ok(current)
        }
    }
}

// post-download merge
//
// the blob is on disk and hashed; insert it under the (hash, size)
// identity, or fold it into an existing row.  returns the row id and
// whether the freshly written file was kept (false means it was a
// duplicate and has been deleted).
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn save_media_file(
    db: &BackupDb,
    downloaded: &Path,
    hash: Option<&str>,
    media: &RemoteMedia,
) -> Result<(MediaFileId, bool)> {
    let _guard = db.dedup_guard().await;

    if !try_exists(downloaded).await? {
        return Err(anyhow::Error::msg(format!(
            "downloaded file vanished before merge: {downloaded:?}"
        )));
    }

    let hash = match hash {
        Some(hash) => hash.to_owned(),
        None => content_hash(downloaded, db.algorithm()).await?,
    };

    // identity uses the size actually on disk, not the declared one
    let local = extract_file_metadata(downloaded).await;
    let size = local.file_size;

    let info = extract_remote_metadata(media);

    if let Some(dup) = db.find_by_identity(&hash, size).await? {
        let dup_abs = db.absolute_path(&dup.file_path);

        if !try_exists(&dup_abs).await? {
            // the indexed copy vanished out-of-band: adopt the new file
            debug!({ media_id = dup.id }, "indexed copy missing, adopting new file");

            db.set_path(dup.id, &db.relative_path(downloaded)).await?;
            db.fill_remote_ids(dup.id, info.file_id.as_deref(), info.access_hash.as_deref())
                .await?;

            return Ok((dup.id, true));
        }

        if dup_abs != downloaded {
            // true duplicate: drop the new copy and reuse the old row
            debug!({ media_id = dup.id }, "duplicate blob, deleting new download");

            remove_file(downloaded).await?;

            db.fill_remote_ids(dup.id, info.file_id.as_deref(), info.access_hash.as_deref())
                .await?;

            if let Some(refreshed) = db.get_media(dup.id).await? {
                try_canonical_rename(db, &refreshed, refreshed.file_id.as_deref()).await?;
            }

            return Ok((dup.id, false));
        }

        db.touch_last_used(dup.id).await?;
        return Ok((dup.id, true));
    }

    let rel = db.relative_path(downloaded);

    let new = NewMediaFile {
        file_path: rel.clone(),
        file_hash: hash.clone(),
        file_size: size,
        file_id: info.file_id.clone(),
        access_hash: info.access_hash.clone(),
        media_type: Some(media.kind().to_owned()),
        mime_type: info.mime_type.clone(),
        file_name: info.metadata.file_name.clone().or(local.file_name),
        file_extension: local.file_extension,
        duration: info.metadata.duration,
        width: info.metadata.width.or(local.width),
        height: info.metadata.height.or(local.height),
    };

    let id = match db.upsert_by_identity(&new).await {
        Ok(id) => id,
        Err(err)
            if matches!(
                err.downcast_ref::<BackupError>(),
                Some(BackupError::IndexConstraintRace(_))
            ) =>
        {
            // a writer slipped in between our lookup and the insert; treat
            // the loss as a hit, reuse the surviving row, and make sure no
            // duplicate file is left behind
            if let Some(existing) = db.find_by_identity(&hash, size).await? {
                debug!({ media_id = existing.id }, "lost identity race, reusing existing row");

                let kept = db.absolute_path(&existing.file_path) == downloaded;

                if !kept {
                    remove_file(downloaded).await?;
                }

                db.fill_remote_ids(
                    existing.id,
                    info.file_id.as_deref(),
                    info.access_hash.as_deref(),
                )
                .await?;

                return Ok((existing.id, kept));
            }

            // no identity match means another row already owns this path;
            // the file on disk is that row's file, so leave it alone
            if let Some(existing) = db.find_by_path(&rel).await? {
                debug!({ media_id = existing.id }, "path already indexed, reusing owning row");

                db.touch_last_used(existing.id).await?;

                return Ok((existing.id, true));
            }

            return Err(err);
        }
        Err(err) => return Err(err),
    };

    // a concurrent writer may have won the (hash, size) race with a
    // different path; in that case our file is the duplicate
    if let Some(row) = db.get_media(id).await?
        && row.file_path != rel
    {
        let row_abs = db.absolute_path(&row.file_path);

        if try_exists(&row_abs).await? {
            debug!({ media_id = id }, "lost insert race, deleting duplicate file");
            remove_file(downloaded).await?;
            return Ok((id, false));
        }

        db.set_path(id, &rel).await?;
    }

    Ok((id, true))
}
