use crate::feed::FeedItem;

/// Which branch of change detection applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// The account has never been relayed.
    NoWatermark,
    /// The watermark was found at `position` in the window.
    Resumed { position: usize },
    /// The watermark fell out of the window (mirror rotated or state cleared).
    Reset,
}

/// Items to relay, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub detection: Detection,
    pub batch: Vec<FeedItem>,
}

impl ChangeSet {
    /// Watermark after the whole batch is delivered.
    pub fn final_watermark(&self) -> Option<&str> {
        self.batch.last().map(|i| i.canonical_identity.as_str())
    }
}

/// Decides which items of a newest-first window are unseen.
///
/// Without a usable watermark only the newest item is relayed, so first
/// contact and resets never flood the destination with backlog. With a
/// watermark at index `i`, everything above it is relayed. The batch is
/// returned oldest-first, the order it must reach the destination in.
pub fn detect(recent: &[FeedItem], watermark: Option<&str>) -> ChangeSet {
    let (detection, newest_first) = match watermark {
        None => (Detection::NoWatermark, &recent[..recent.len().min(1)]),
        Some(mark) => match recent.iter().position(|i| i.canonical_identity == mark) {
            Some(position) => (Detection::Resumed { position }, &recent[..position]),
            None => (Detection::Reset, &recent[..recent.len().min(1)]),
        },
    };

    ChangeSet {
        detection,
        batch: newest_first.iter().rev().cloned().collect(),
    }
}
