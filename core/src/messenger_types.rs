/// Shared types for the conversation list
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ConversationId = u64;
pub type MessageId = u64;
pub type UserId = u64;

/// What kind of thread a conversation is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    #[default]
    Direct,
    Group,
    Channel,
}

/// A member of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A single chat message as delivered by the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author_id: UserId,
    pub text: String,
    pub time: DateTime<Utc>,
    /// Users explicitly mentioned in the text
    #[serde(default)]
    pub mentions: Vec<UserId>,
}

/// Small badge shown next to a row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusIcon {
    #[default]
    None,
    Pinned,
    Muted,
    Mentioned,
    Closed,
}

/// Display fields produced by `recalc::recalculate`, never written by handlers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub title: String,
    pub subtitle: String,
    pub avatar_url: Option<String>,
    pub status_icon: StatusIcon,
}

/// Summary of one conversation thread (one row of the list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Server-assigned identifier, unique within a store
    pub id: ConversationId,
    #[serde(default)]
    pub kind: ConversationKind,
    /// Raw title as sent by the server; direct chats usually leave it empty
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Raw JSON metadata blob (avatar, description); may be malformed
    #[serde(default)]
    pub metadata: Option<String>,

    #[serde(default)]
    pub pin: bool,
    pub last_activity_time: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_archived: bool,

    #[serde(default)]
    pub is_selected: bool,
    #[serde(default)]
    pub mentioned: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub mute: bool,

    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub last_seen_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_message_id: Option<MessageId>,

    #[serde(default)]
    pub derived: DerivedFields,
}

impl ConversationSummary {
    /// Minimal summary, mostly for tests and fixtures
    pub fn new(id: ConversationId, last_activity_time: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: ConversationKind::default(),
            title: None,
            participants: Vec::new(),
            metadata: None,
            pin: false,
            last_activity_time,
            unread_count: 0,
            is_archived: false,
            is_selected: false,
            mentioned: false,
            closed: false,
            mute: false,
            last_message: None,
            last_seen_time: None,
            last_seen_message_id: None,
            derived: DerivedFields::default(),
        }
    }

    /// Copy every server-sourced field from `incoming` while keeping local
    /// presentation state (selection) and derived fields untouched.
    pub fn update_from(&mut self, incoming: &ConversationSummary) {
        debug_assert_eq!(self.id, incoming.id);
        self.kind = incoming.kind;
        self.title = incoming.title.clone();
        self.participants = incoming.participants.clone();
        self.metadata = incoming.metadata.clone();
        self.pin = incoming.pin;
        self.last_activity_time = incoming.last_activity_time;
        self.unread_count = incoming.unread_count;
        self.is_archived = incoming.is_archived;
        self.mentioned = incoming.mentioned;
        self.closed = incoming.closed;
        self.mute = incoming.mute;
        self.last_message = incoming.last_message.clone();
        self.last_seen_time = incoming.last_seen_time;
        self.last_seen_message_id = incoming.last_seen_message_id;
    }
}

/// Why a conversation left the list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Deleted,
    Left,
    Spam,
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Non-message events targeting a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadEvent {
    /// Conversation created or joined
    New { summary: ConversationSummary },
    Deleted {
        id: ConversationId,
        reason: RemovalReason,
    },
    Pin { id: ConversationId },
    Unpin { id: ConversationId },
    Mute { id: ConversationId },
    Unmute { id: ConversationId },
    Archive { id: ConversationId },
    Unarchive { id: ConversationId },
    UpdatedInfo {
        id: ConversationId,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        metadata: Option<String>,
    },
    LastSeenUpdated {
        id: ConversationId,
        seen_time: DateTime<Utc>,
        seen_message_id: MessageId,
        unread_count: u32,
    },
    UnreadCount {
        counts: HashMap<ConversationId, u32>,
    },
    ParticipantAdded {
        id: ConversationId,
        participants: Vec<Participant>,
    },
    ParticipantRemoved {
        id: ConversationId,
        participant_ids: Vec<UserId>,
    },
    Closed { id: ConversationId },
}

impl ThreadEvent {
    /// Target conversation, if the event has exactly one
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ThreadEvent::New { summary } => Some(summary.id),
            ThreadEvent::Deleted { id, .. }
            | ThreadEvent::Pin { id }
            | ThreadEvent::Unpin { id }
            | ThreadEvent::Mute { id }
            | ThreadEvent::Unmute { id }
            | ThreadEvent::Archive { id }
            | ThreadEvent::Unarchive { id }
            | ThreadEvent::UpdatedInfo { id, .. }
            | ThreadEvent::LastSeenUpdated { id, .. }
            | ThreadEvent::ParticipantAdded { id, .. }
            | ThreadEvent::ParticipantRemoved { id, .. }
            | ThreadEvent::Closed { id } => Some(*id),
            ThreadEvent::UnreadCount { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreadEvent::New { .. } => "new",
            ThreadEvent::Deleted { .. } => "deleted",
            ThreadEvent::Pin { .. } => "pin",
            ThreadEvent::Unpin { .. } => "unpin",
            ThreadEvent::Mute { .. } => "mute",
            ThreadEvent::Unmute { .. } => "unmute",
            ThreadEvent::Archive { .. } => "archive",
            ThreadEvent::Unarchive { .. } => "unarchive",
            ThreadEvent::UpdatedInfo { .. } => "updated_info",
            ThreadEvent::LastSeenUpdated { .. } => "last_seen_updated",
            ThreadEvent::UnreadCount { .. } => "unread_count",
            ThreadEvent::ParticipantAdded { .. } => "participant_added",
            ThreadEvent::ParticipantRemoved { .. } => "participant_removed",
            ThreadEvent::Closed { .. } => "closed",
        }
    }
}

/// Everything the event bus can deliver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Thread {
        event: ThreadEvent,
    },
    Message {
        conversation_id: ConversationId,
        message: Message,
    },
    ConnectionStatusChanged {
        status: ConnectionStatus,
    },
}
