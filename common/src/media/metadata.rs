use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio::task::spawn_blocking;
use tracing::{Level, debug, instrument};

use api::media::{DocumentAttribute, RemoteMedia};

// metadata shared by the dedup tiers, extracted from either a local file
// or a remote descriptor
#[derive(Clone, Debug, Default)]
pub struct FileMetadata {
    pub file_name: Option<String>,
    pub file_extension: Option<String>,
    pub file_size: i64,
    pub duration: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

// the remote flavor additionally carries the identifiers needed for the
// deterministic filename and later api access
#[derive(Clone, Debug, Default)]
pub struct RemoteFileInfo {
    pub file_id: Option<String>,
    pub access_hash: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: FileMetadata,
}

const PROBE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "tiff", "bmp"];

// local file extraction
//
// size comes from the filesystem and dimensions from the image header when
// the extension looks like an image; there is no media-info backend linked,
// so durations stay unset.  extraction is best effort and never fails.
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn extract_file_metadata(path: &Path) -> FileMetadata {
    let mut metadata = FileMetadata {
        file_name: path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_owned()),
        file_extension: path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase())),
        ..Default::default()
    };

    match tokio::fs::metadata(path).await {
        Ok(meta) => metadata.file_size = meta.len() as i64,
        Err(_) => return metadata,
    }

    let probe_image = metadata
        .file_extension
        .as_deref()
        .is_some_and(|ext| PROBE_EXTENSIONS.contains(&ext.trim_start_matches('.')));

    if probe_image {
        let path = path.to_owned();

        // the image crate is synchronous std::io tech, so keep the header
        // decode off the runtime threads
        if let Ok(Ok((width, height))) =
            spawn_blocking(move || image::image_dimensions(&path)).await
        {
            metadata.width = Some(width as i64);
            metadata.height = Some(height as i64);
        }
    }

    debug!({ size = metadata.file_size }, "extracted local metadata");
    metadata
}

// remote descriptor extraction, a total function over the media variant
pub fn extract_remote_metadata(media: &RemoteMedia) -> RemoteFileInfo {
    let mut info = RemoteFileInfo {
        file_id: media.file_id().map(|id| id.to_owned()),
        access_hash: media.access_hash().map(|hash| hash.to_owned()),
        mime_type: media.mime_type().map(|mime| mime.to_owned()),
        ..Default::default()
    };

    info.metadata.file_size = media.declared_size();

    match media {
        RemoteMedia::Photo(photo) => {
            if let Some(largest) = photo.sizes.iter().max_by_key(|s| s.bytes) {
                info.metadata.width = Some(largest.width);
                info.metadata.height = Some(largest.height);
            }

            info.metadata.file_extension = Some(".jpg".to_owned());
        }
        RemoteMedia::Document(doc) => {
            for attr in &doc.attributes {
                match attr {
                    DocumentAttribute::Filename { name } => {
                        info.metadata.file_name = Some(name.clone());

                        if let Some((_, ext)) = name.rsplit_once('.')
                            && !ext.is_empty()
                        {
                            info.metadata.file_extension =
                                Some(format!(".{}", ext.to_lowercase()));
                        }
                    }
                    DocumentAttribute::Video {
                        duration,
                        width,
                        height,
                    } => {
                        info.metadata.duration = Some(*duration);
                        info.metadata.width = Some(*width);
                        info.metadata.height = Some(*height);
                    }
                    DocumentAttribute::Audio { duration, .. } => {
                        if info.metadata.duration.is_none() {
                            info.metadata.duration = Some(*duration);
                        }
                    }
                }
            }

            if info.metadata.file_extension.is_none() {
                info.metadata.file_extension = doc
                    .mime_type
                    .as_deref()
                    .and_then(extension_from_mime);
            }
        }
        RemoteMedia::WebPage(_) => {}
    }

    info
}

// canonical extension for the deterministic <file_id><ext> name: photos are
// always .jpg, documents use the declared filename's extension, then the
// mime map, then .bin
pub fn canonical_extension(media: &RemoteMedia) -> String {
    match media {
        RemoteMedia::Photo(_) => ".jpg".to_owned(),
        _ => extract_remote_metadata(media)
            .metadata
            .file_extension
            .unwrap_or_else(|| ".bin".to_owned()),
    }
}

pub fn extension_from_mime(mime: &str) -> Option<String> {
    let exts = mime_guess::get_mime_extensions_str(mime)?;
    let ext = exts.first()?;

    // the mime tables list jpe first for image/jpeg
    let ext = if *ext == "jpe" { "jpg" } else { ext };

    Some(format!(".{}", ext.to_lowercase()))
}

static NAME_COUNTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(\d+\)\s*$").expect("invalid counter regex"));

// fuzzy-match normalization: strip the extension, a trailing " (n)"
// disambiguator, and surrounding whitespace
pub fn normalize_filename_for_search(filename: &str) -> String {
    let base = match filename.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() => base,
        _ => filename,
    };

    NAME_COUNTER_RE.replace(base, "").trim().to_owned()
}
