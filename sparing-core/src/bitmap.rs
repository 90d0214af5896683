// vim: tw=80
//! Needs-rebuild bitmaps
//!
//! One bit per (position, chunk).  A set bit means that position's copy of
//! the chunk is not known to be consistent.  The bitmap does no locking of its
//! own; callers must already hold an exclusive stripe lock covering whatever
//! they mutate.

use fixedbitset::FixedBitSet;

use crate::types::*;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkBitmap {
    /// Chunk size in blocks
    chunk_size: LbaT,
    /// Number of chunks on each position
    chunks: ChunkT,
    rows: Vec<FixedBitSet>,
}

impl ChunkBitmap {
    /// Is every chunk of `range` on `position` clean?
    pub fn is_clean(&self, position: PositionT, range: LbaRange)
        -> Result<bool>
    {
        let chunks = self.covering(range);
        self.is_chunk_range_clean(position, chunks)
    }

    pub fn is_chunk_range_clean(&self, position: PositionT, range: ChunkRange)
        -> Result<bool>
    {
        self.check_range(range)?;
        let row = self.row(position);
        Ok(row.count_ones(range.start as usize..range.end as usize) == 0)
    }

    /// Does `position` have any chunk marked?
    pub fn any_marked(&self, position: PositionT) -> bool {
        self.row(position).count_ones(..) > 0
    }

    pub fn chunks(&self) -> ChunkT {
        self.chunks
    }

    /// Clear NR for every chunk of `range`.
    ///
    /// Every dirty chunk that `range` touches must be covered completely.  A
    /// dirty chunk that is only partly covered fails the whole call with
    /// `PartialRange`, and nothing is cleared.
    pub fn clear_needs_rebuild(&mut self, position: PositionT, range: LbaRange)
        -> Result<()>
    {
        if range.is_empty() {
            return Ok(());
        }
        let touched = self.covering(range);
        self.check_range(touched)?;
        let first_full = range.start.div_ceil(self.chunk_size);
        let last_full = range.end / self.chunk_size;
        let row = self.row(position);
        for edge in [touched.start, touched.end - 1] {
            let partial = edge < first_full || edge >= last_full;
            if partial && row.contains(edge as usize) {
                return Err(Error::PartialRange(edge));
            }
        }
        if first_full < last_full {
            let full = ChunkRange::new(first_full, last_full);
            self.clear_chunks(position, full)?;
        }
        Ok(())
    }

    /// Clear NR for whole chunks.  Can't be partial.
    pub fn clear_chunks(&mut self, position: PositionT, range: ChunkRange)
        -> Result<()>
    {
        self.check_range(range)?;
        self.row_mut(position)
            .set_range(range.start as usize..range.end as usize, false);
        Ok(())
    }

    /// Clear every chunk on `position`.  Used when its contents are
    /// discarded, as with an abandoned copy destination.
    pub fn clear_position(&mut self, position: PositionT) {
        self.row_mut(position).clear();
    }

    /// Mark every chunk touched by `range` as needing rebuild.  Marking an
    /// already-marked chunk is a no-op.
    pub fn mark_needs_rebuild(&mut self, position: PositionT, range: LbaRange)
        -> Result<()>
    {
        let chunks = self.covering(range);
        self.mark_chunks(position, chunks)
    }

    pub fn mark_chunks(&mut self, position: PositionT, range: ChunkRange)
        -> Result<()>
    {
        self.check_range(range)?;
        self.row_mut(position)
            .set_range(range.start as usize..range.end as usize, true);
        Ok(())
    }

    /// Number of chunks marked on `position`
    pub fn marked_count(&self, position: PositionT) -> ChunkT {
        self.row(position).count_ones(..) as ChunkT
    }

    /// Iterate over the marked chunks on `position`, in ascending order
    pub fn marked(&self, position: PositionT)
        -> impl Iterator<Item=ChunkT> + '_
    {
        self.row(position).ones().map(|c| c as ChunkT)
    }

    /// Create an all-clean bitmap.
    ///
    /// # Parameters
    ///
    /// - `width`:      Number of positions
    /// - `chunks`:     Number of chunks on each position
    /// - `chunk_size`: Chunk size in blocks
    pub fn new(width: PositionT, chunks: ChunkT, chunk_size: LbaT) -> Self {
        assert!(chunk_size.is_power_of_two(),
            "Chunk size must be a power of two, not {chunk_size}");
        let rows = (0..width)
            .map(|_| FixedBitSet::with_capacity(chunks as usize))
            .collect();
        ChunkBitmap { chunk_size, chunks, rows }
    }

    pub fn width(&self) -> PositionT {
        self.rows.len() as PositionT
    }

    fn check_range(&self, range: ChunkRange) -> Result<()> {
        if range.end <= self.chunks {
            Ok(())
        } else {
            Err(Error::OutOfRange{end: range.end, limit: self.chunks})
        }
    }

    fn covering(&self, range: LbaRange) -> ChunkRange {
        if range.is_empty() {
            let c = range.start / self.chunk_size;
            return ChunkRange::new(c, c);
        }
        ChunkRange::new(range.start / self.chunk_size,
                        (range.end - 1) / self.chunk_size + 1)
    }

    fn row(&self, position: PositionT) -> &FixedBitSet {
        &self.rows[usize::from(position)]
    }

    fn row_mut(&mut self, position: PositionT) -> &mut FixedBitSet {
        &mut self.rows[usize::from(position)]
    }
}

// LCOV_EXCL_STOP
