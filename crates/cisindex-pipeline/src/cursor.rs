//! Stage cursor: where a checkpointed stage continues from.

use std::ops::RangeInclusive;

use cisindex_core::types::Height;

/// Position of a stage whose checkpoint is persisted asynchronously.
///
/// The persisted checkpoint lags behind what the stage already handed to the
/// Sink, so the next height is the one after the greater of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCursor {
    /// First height when nothing was ever processed.
    pub start_height: Height,
    /// Highest height enqueued by this run.
    pub last_enqueued: Option<Height>,
}

impl StageCursor {
    pub fn new(start_height: Height) -> Self {
        Self {
            start_height,
            last_enqueued: None,
        }
    }

    /// The next height to process given the persisted checkpoint.
    pub fn next_height(&self, persisted: Option<Height>) -> Height {
        [persisted, self.last_enqueued]
            .into_iter()
            .flatten()
            .map(|h| h.saturating_add(1))
            .fold(self.start_height, Height::max)
    }

    /// Up to `max` heights ending at or before `head`, or `None` when caught up.
    pub fn next_range(
        &self,
        persisted: Option<Height>,
        head: Height,
        max: u64,
    ) -> Option<RangeInclusive<Height>> {
        let from = self.next_height(persisted);
        if from > head || max == 0 {
            return None;
        }
        Some(from..=head.min(from.saturating_add(max - 1)))
    }

    pub fn advance(&mut self, height: Height) {
        self.last_enqueued = Some(self.last_enqueued.map_or(height, |h| h.max(height)));
    }

    /// `true` once the persisted checkpoint covers everything enqueued.
    pub fn is_settled(&self, persisted: Option<Height>) -> bool {
        match self.last_enqueued {
            None => true,
            Some(h) => persisted.is_some_and(|p| p >= h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_height_takes_the_furthest_position() {
        let mut cursor = StageCursor::new(100);
        assert_eq!(cursor.next_height(None), 100);
        assert_eq!(cursor.next_height(Some(50)), 100);
        assert_eq!(cursor.next_height(Some(150)), 151);

        cursor.advance(160);
        assert_eq!(cursor.next_height(Some(150)), 161);
        cursor.advance(155);
        assert_eq!(cursor.last_enqueued, Some(160));
    }

    #[test]
    fn ranges_are_capped() {
        let cursor = StageCursor::new(0);
        assert_eq!(cursor.next_range(Some(9), 100, 5), Some(10..=14));
        assert_eq!(cursor.next_range(Some(9), 11, 5), Some(10..=11));
        assert_eq!(cursor.next_range(Some(11), 11, 5), None);
    }

    #[test]
    fn settles_when_checkpoint_catches_up() {
        let mut cursor = StageCursor::new(0);
        assert!(cursor.is_settled(None));
        cursor.advance(8);
        assert!(!cursor.is_settled(Some(7)));
        assert!(cursor.is_settled(Some(8)));
    }
}
