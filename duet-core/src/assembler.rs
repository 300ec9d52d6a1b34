use thiserror::Error;

use crate::message::ContentSegment;
use crate::message::Message;
use crate::message::SegmentKind;
use crate::message::SegmentPatch;

/// Highest content index a message accepts.
pub const MAX_SEGMENT_INDEX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("segment index {index} exceeds the maximum of {max}")]
    IndexOutOfRange { index: usize, max: usize },
    #[error(
        "segment kind mismatch at index {index}: existing `{existing}`, incoming `{incoming}` (possible cross-run index collision)"
    )]
    SegmentKindMismatch {
        index: usize,
        existing: SegmentKind,
        incoming: SegmentKind,
    },
}

/// Merges `patch` into the segment at `index` and returns the updated
/// message. `message` itself is left untouched.
pub fn assemble(
    message: &Message,
    index: usize,
    patch: SegmentPatch,
    is_final: bool,
) -> Result<Message, AssembleError> {
    let Some(len) = index
        .checked_add(1)
        .filter(|len| *len <= MAX_SEGMENT_INDEX + 1)
    else {
        return Err(AssembleError::IndexOutOfRange {
            index,
            max: MAX_SEGMENT_INDEX,
        });
    };

    let mut updated = message.clone();
    if updated.content.len() < len {
        updated.content.resize(len, None);
    }

    if let Some(slot) = updated.content.get_mut(index) {
        match slot {
            Some(existing) => {
                let existing_kind = existing.kind();
                existing
                    .merge(patch, is_final)
                    .map_err(|rejected| AssembleError::SegmentKindMismatch {
                        index,
                        existing: existing_kind,
                        incoming: rejected.kind(),
                    })?;
            }
            None => *slot = Some(ContentSegment::from_patch(patch, is_final)),
        }
    }

    updated.text = mirrored_text(&updated);
    Ok(updated)
}

/// Appends `patch` after the last written segment.
pub fn append(message: &Message, patch: SegmentPatch) -> Result<Message, AssembleError> {
    assemble(message, message.content.len(), patch, true)
}

/// Moves the segment at `from` to the end of the content. Returns the
/// updated message and the new index, or `None` when `from` is empty.
pub fn relocate(message: &Message, from: usize) -> Option<(Message, usize)> {
    let mut updated = message.clone();
    let segment = updated.content.get_mut(from)?.take()?;
    let to = updated.content.len();
    updated.content.push(Some(segment));
    updated.text = mirrored_text(&updated);
    Some((updated, to))
}

fn mirrored_text(message: &Message) -> String {
    message.first_text().map(str::to_string).unwrap_or_default()
}
