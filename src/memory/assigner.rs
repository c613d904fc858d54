use std::collections::BTreeSet;
use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Abstract, reusable buffer identity handed out by a [`BufferAssigner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(usize);

impl BufferId {
    /// Sentinel meaning "no buffer needed"
    pub const NONE: BufferId = BufferId(usize::MAX);

    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Bookkeeping for one buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    /// Largest size ever requested from this buffer, never decreases
    pub max_bytes: usize,
}

/// Pool allocator over buffer identities
///
/// No real memory is held. The assigner keeps every buffer it ever created
/// plus a free set ordered by size. A request first looks for a freed buffer
/// whose recorded size lies in `[size / match_range, size * match_range]`,
/// preferring the smallest one that already fits and falling back to the
/// largest one that has to grow. Only when nothing matches is a new buffer
/// created. A `match_range` of 0 disables reuse.
///
/// Among equally sized free buffers the one with the lowest id wins, whether
/// it already fits or has to grow.
#[derive(Debug, Clone)]
pub struct BufferAssigner {
    /// Scale used for rough size matching
    match_range: usize,
    /// Freed buffers keyed by (max_bytes, id)
    free: BTreeSet<(usize, BufferId)>,
    /// All buffers created so far, indexed by id
    data: Vec<BufferInfo>,
}

impl BufferAssigner {
    pub fn new(match_range: usize) -> Self {
        Self {
            match_range,
            free: BTreeSet::new(),
            data: Vec::new(),
        }
    }

    pub fn match_range(&self) -> usize {
        self.match_range
    }

    /// Request a buffer able to hold `size` bytes
    pub fn request(&mut self, size: usize) -> BufferId {
        if size == 0 {
            return BufferId::NONE;
        }
        if self.match_range == 0 {
            return self.alloc(size);
        }

        let lower = size / self.match_range;
        let upper = size.saturating_mul(self.match_range);

        // Buffers already large enough, smallest first
        let fitting = self
            .free
            .range((size, BufferId(0))..=(upper, BufferId::NONE))
            .next()
            .copied();
        // Otherwise the largest buffer that has to grow
        let candidate = fitting.or_else(|| {
            let (largest, _) = self
                .free
                .range((lower, BufferId(0))..(size, BufferId(0)))
                .next_back()
                .copied()?;
            self.free
                .range((largest, BufferId(0))..=(largest, BufferId::NONE))
                .next()
                .copied()
        });

        match candidate {
            Some(entry) => {
                self.free.remove(&entry);
                let (_, id) = entry;
                let info = &mut self.data[id.index()];
                info.max_bytes = info.max_bytes.max(size);
                trace!("Reusing buffer {} for {} bytes (now {} bytes)", id, size, info.max_bytes);
                id
            }
            None => self.alloc(size),
        }
    }

    /// Return a buffer to the free set
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        if id.is_none() {
            return Ok(());
        }
        let info = self.info(id)?;
        trace!("Releasing buffer {} ({} bytes)", id, info.max_bytes);
        self.free.insert((info.max_bytes, id));
        Ok(())
    }

    /// Size a buffer must be allocated with
    pub fn query_size(&self, id: BufferId) -> Result<usize> {
        if id.is_none() {
            return Ok(0);
        }
        Ok(self.info(id)?.max_bytes)
    }

    /// Drop every buffer and free entry
    pub fn clear(&mut self) {
        self.free.clear();
        self.data.clear();
    }

    /// Number of distinct buffers created
    pub fn allocated(&self) -> usize {
        self.data.len()
    }

    /// Number of buffers currently in the free set
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Sum of `max_bytes` over all buffers
    pub fn total_bytes(&self) -> usize {
        self.data.iter().map(|info| info.max_bytes).sum()
    }

    /// All buffers in id order
    pub fn buffers(&self) -> impl Iterator<Item = &BufferInfo> + '_ {
        self.data.iter()
    }

    fn info(&self, id: BufferId) -> Result<BufferInfo> {
        self.data.get(id.index()).copied().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Invalid buffer id {} (only {} buffers allocated)",
                id,
                self.data.len()
            ))
        })
    }

    fn alloc(&mut self, size: usize) -> BufferId {
        let id = BufferId(self.data.len());
        self.data.push(BufferInfo { id, max_bytes: size });
        trace!("Allocated new buffer {} with {} bytes", id, size);
        id
    }
}
