// vim: tw=80
//! Rebuild/copy checkpoints

use crate::types::*;

/// How much of one position has been rebuilt or copied.
///
/// The value is the number of chunks, counted from the start of the drive,
/// that are guaranteed repaired.  It only ever moves forward while an operation
/// is active, and it must only be advanced after the bitmap bits for the
/// chunks it passes have been cleared.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RebuildCursor {
    /// `None` when no rebuild or copy is active on this position
    value: Option<ChunkT>,
    total: ChunkT,
}

impl RebuildCursor {
    pub fn new(total: ChunkT) -> Self {
        RebuildCursor { value: None, total }
    }

    /// Move the cursor to `new_value`.
    ///
    /// Moving backwards is an internal-consistency violation.  It is refused
    /// and the cursor is left unchanged.
    pub fn advance(&mut self, new_value: ChunkT) -> Result<()> {
        let current = self.value.unwrap_or(0);
        if new_value < current {
            tracing::error!(current, requested = new_value,
                "cursor regression refused");
            return Err(Error::CursorRegression {
                current,
                requested: new_value
            });
        }
        if new_value > self.total {
            tracing::error!(total = self.total, requested = new_value,
                "cursor overrun refused");
            return Err(Error::CursorOverrun {
                total: self.total,
                requested: new_value
            });
        }
        self.value = Some(new_value);
        Ok(())
    }

    /// Stop tracking.  The position is either complete or abandoned.
    pub fn deactivate(&mut self) {
        self.value = None;
    }

    pub fn is_active(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.value == Some(self.total)
    }

    pub fn percent_complete(&self) -> f64 {
        match self.value {
            None => 0.0,
            Some(_) if self.total == 0 => 100.0,
            Some(v) => v as f64 * 100.0 / self.total as f64
        }
    }

    /// Start a new operation from the beginning of the drive
    pub fn reset(&mut self) {
        self.value = Some(0);
    }

    pub fn total(&self) -> ChunkT {
        self.total
    }

    pub fn value(&self) -> Option<ChunkT> {
        self.value
    }
}

// LCOV_EXCL_STOP
