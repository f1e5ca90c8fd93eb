/// Derived display fields for a conversation row
use crate::error::{Result, SyncError};
use crate::messenger_types::{ConversationKind, ConversationSummary, DerivedFields, StatusIcon, UserId};
use serde::Deserialize;

const SUBTITLE_MAX_CHARS: usize = 80;

/// Parsed form of `ConversationSummary::metadata`
#[derive(Debug, Default, Deserialize)]
struct ThreadMetadata {
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_metadata(raw: Option<&str>) -> Result<ThreadMetadata> {
    match raw {
        None => Ok(ThreadMetadata::default()),
        Some(s) if s.trim().is_empty() => Ok(ThreadMetadata::default()),
        Some(s) => serde_json::from_str(s).map_err(|e| SyncError::Metadata(e.to_string())),
    }
}

/// Compute title, subtitle, avatar and status icon from the summary's inputs.
///
/// This is the only place derived fields come from. Fails when the metadata
/// blob can't be parsed; callers keep the previous derived fields in that case.
pub fn recalculate(summary: &ConversationSummary, viewer_id: UserId) -> Result<DerivedFields> {
    let metadata = parse_metadata(summary.metadata.as_deref())?;

    // Direct chats are named after the other side
    let peer = summary.participants.iter().find(|p| p.id != viewer_id);
    let title = summary
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| match summary.kind {
            ConversationKind::Direct => peer.map(|p| p.name.clone()),
            _ => None,
        })
        .unwrap_or_else(|| format!("Conversation {}", summary.id));

    let subtitle = match &summary.last_message {
        Some(msg) if msg.author_id == viewer_id => truncate(&format!("You: {}", msg.text)),
        Some(msg) => {
            let author = summary
                .participants
                .iter()
                .find(|p| p.id == msg.author_id)
                .map(|p| p.name.as_str());
            match (summary.kind, author) {
                (ConversationKind::Direct, _) | (_, None) => truncate(&msg.text),
                (_, Some(name)) => truncate(&format!("{}: {}", name, msg.text)),
            }
        }
        None => metadata.description.clone().unwrap_or_default(),
    };

    let avatar_url = metadata.avatar.or_else(|| match summary.kind {
        ConversationKind::Direct => peer.and_then(|p| p.avatar_url.clone()),
        _ => None,
    });

    let status_icon = if summary.closed {
        StatusIcon::Closed
    } else if summary.mentioned {
        StatusIcon::Mentioned
    } else if summary.mute {
        StatusIcon::Muted
    } else if summary.pin {
        StatusIcon::Pinned
    } else {
        StatusIcon::None
    };

    Ok(DerivedFields {
        title,
        subtitle,
        avatar_url,
        status_icon,
    })
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= SUBTITLE_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUBTITLE_MAX_CHARS - 1).collect();
    out.push('…');
    out
}
