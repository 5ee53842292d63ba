use serde::{Deserialize, Serialize};

// structs and types

pub type EntityId = i64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Group,
    Channel,
    Supergroup,
}

// a remote conversation endpoint, as enumerated by the client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub accessible: bool,
}

impl EntityRef {
    // per-entity backup folders are "<id>_<name>" with anything outside
    // [A-Za-z0-9._ -] replaced, so that arbitrary chat titles cannot
    // escape the backup root
    pub fn dir_name(&self) -> String {
        sanitize_name(&format!("{}_{}", self.id, self.name))
    }
}

pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ' ' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_name("123_my chat"), "123_my chat");
        assert_eq!(sanitize_name("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_name("emoji \u{1f600} name"), "emoji _ name");
    }

    #[test]
    fn dir_name_includes_id_prefix() {
        let entity = EntityRef {
            id: 42,
            name: "dev/ops".to_owned(),
            kind: EntityKind::Group,
            accessible: true,
        };

        assert_eq!(entity.dir_name(), "42_dev_ops");
    }
}
