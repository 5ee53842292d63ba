use api::entity::EntityId;
use api::media::MediaFileId;
use api::message::MessageId;

pub mod schema;
pub mod sqlite;

pub use sqlite::BackupDb;

// query parameters for the metadata tier of the dedup cascade
#[derive(Clone, Debug, Default)]
pub struct MetadataQuery {
    pub file_size: i64,
    pub duration: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub file_name: Option<String>,
    pub file_id: Option<String>,
}

// everything needed to insert (or merge) a media row; identity is the
// (file_hash, file_size) pair
#[derive(Clone, Debug, Default)]
pub struct NewMediaFile {
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
}

// the subset of a message row that the reconciler and tests read back
#[derive(Clone, Debug)]
pub struct MessageRow {
    pub id: MessageId,
    pub entity_id: EntityId,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub file_id: Option<String>,
    pub file_size: Option<i64>,
    pub media_file_id: Option<MediaFileId>,
    pub is_service: bool,
    pub is_voice: bool,
    pub is_pinned: bool,
}
