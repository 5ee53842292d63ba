pub mod hash;
pub mod metadata;
pub mod validate;

pub use hash::{HashAlgorithm, content_hash};
