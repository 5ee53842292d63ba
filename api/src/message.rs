use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::media::RemoteMedia;

// structs and types

pub type MessageId = i64;

// one message as yielded by the remote history iterator, newest first
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub entity_id: EntityId,
    pub date: String,
    pub text: Option<String>,
    pub media: Option<RemoteMedia>,
    pub service: Option<ServiceAction>,
    pub forward_origin: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub views: Option<i64>,
    pub reply_to: Option<ReplyRef>,
    pub reactions: Vec<Reaction>,
    pub buttons: Vec<Vec<Button>>,
    pub is_pinned: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyRef {
    pub msg_id: MessageId,
    pub quote_text: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub data: Option<String>,
    pub url: Option<String>,
}

// an in-text hyperlink, kept separate from keyboard buttons so the two
// cannot collide on the child-table uniqueness constraints
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextLink {
    pub text: String,
    pub href: String,
}

// state-transition events in the conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServiceAction {
    UserJoined { names: Vec<String> },
    UserLeft { name: String },
    JoinedByLink { name: String },
    ChannelCreated { title: String },
    GroupCreated { title: String },
    TitleChanged { title: String },
    CallStarted,
    CallEnded,
    Other { kind: String },
}

impl ServiceAction {
    pub fn render(&self) -> String {
        let text = match self {
            ServiceAction::UserJoined { names } => {
                format!("{} joined the group", names.join(", "))
            }
            ServiceAction::UserLeft { name } => format!("{name} left the group"),
            ServiceAction::JoinedByLink { name } => {
                format!("{name} joined the group via invite link")
            }
            ServiceAction::ChannelCreated { title } => format!("Channel {title} created"),
            ServiceAction::GroupCreated { title } => format!("Group {title} created"),
            ServiceAction::TitleChanged { title } => {
                format!("Group name changed to: {title}")
            }
            ServiceAction::CallStarted => "Group call started".to_owned(),
            ServiceAction::CallEnded => "Group call ended".to_owned(),
            ServiceAction::Other { kind } => format!("Service message: {kind}"),
        };

        format!("<service>{text}</service>")
    }
}
