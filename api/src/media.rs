use serde::{Deserialize, Serialize};

// structs and types

pub type MediaFileId = i64;

// remote media descriptor
//
// the wire objects are polymorphic, but only a handful of shapes matter
// for the archive, so we model them as a tagged variant instead of
// probing attributes dynamically
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RemoteMedia {
    Photo(RemotePhoto),
    Document(RemoteDocument),
    WebPage(RemoteWebPage),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemotePhoto {
    pub id: String,
    pub access_hash: Option<String>,
    pub sizes: Vec<PhotoSize>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PhotoSize {
    pub width: i64,
    pub height: i64,
    pub bytes: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub access_hash: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub attributes: Vec<DocumentAttribute>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DocumentAttribute {
    Filename { name: String },
    Video { duration: i64, width: i64, height: i64 },
    Audio { duration: i64, voice: bool },
}

// web previews carry no downloadable blob of their own; the snapshot is
// stored on the message row as json
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteWebPage {
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
}

impl RemoteMedia {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteMedia::Photo(_) => "photo",
            RemoteMedia::Document(_) => "document",
            RemoteMedia::WebPage(_) => "webpage",
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            RemoteMedia::Photo(photo) => Some(photo.id.as_str()),
            RemoteMedia::Document(doc) => Some(doc.id.as_str()),
            RemoteMedia::WebPage(_) => None,
        }
    }

    pub fn access_hash(&self) -> Option<&str> {
        match self {
            RemoteMedia::Photo(photo) => photo.access_hash.as_deref(),
            RemoteMedia::Document(doc) => doc.access_hash.as_deref(),
            RemoteMedia::WebPage(_) => None,
        }
    }

    // photos report the largest rendition; web pages have no payload
    pub fn declared_size(&self) -> i64 {
        match self {
            RemoteMedia::Photo(photo) => {
                photo.sizes.iter().map(|s| s.bytes).max().unwrap_or(0)
            }
            RemoteMedia::Document(doc) => doc.size,
            RemoteMedia::WebPage(_) => 0,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            RemoteMedia::Photo(_) => Some("image/jpeg"),
            RemoteMedia::Document(doc) => doc.mime_type.as_deref(),
            RemoteMedia::WebPage(_) => None,
        }
    }

    pub fn is_voice(&self) -> bool {
        match self {
            RemoteMedia::Document(doc) => doc.attributes.iter().any(|attr| {
                matches!(attr, DocumentAttribute::Audio { voice: true, .. })
            }),
            _ => false,
        }
    }

    // anything without a transferable payload is skipped by the
    // ingestion pipeline
    pub fn downloadable(&self) -> bool {
        !matches!(self, RemoteMedia::WebPage(_))
    }
}

// a row in the media index; identity is (file_hash, file_size)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: MediaFileId,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: i64,
    pub file_id: Option<String>,
    pub access_hash: Option<String>,
    pub media_type: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_extension: Option<String>,
    pub duration: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub indexed_at: String,
    pub last_used_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_declared_size_is_largest_rendition() {
        let media = RemoteMedia::Photo(RemotePhoto {
            id: "A1".to_owned(),
            access_hash: None,
            sizes: vec![
                PhotoSize { width: 90, height: 60, bytes: 1200 },
                PhotoSize { width: 1280, height: 960, bytes: 120000 },
            ],
        });

        assert_eq!(media.declared_size(), 120000);
        assert_eq!(media.file_id(), Some("A1"));
        assert!(media.downloadable());
    }

    #[test]
    fn voice_flag_requires_voice_audio_attribute() {
        let doc = |attrs| {
            RemoteMedia::Document(RemoteDocument {
                id: "B2".to_owned(),
                access_hash: None,
                size: 4096,
                mime_type: Some("audio/ogg".to_owned()),
                attributes: attrs,
            })
        };

        assert!(doc(vec![DocumentAttribute::Audio { duration: 3, voice: true }]).is_voice());
        assert!(!doc(vec![DocumentAttribute::Audio { duration: 3, voice: false }]).is_voice());
        assert!(!doc(vec![]).is_voice());
    }
}
