//! Frame-scoped object identifiers.
//!
//! An `ObjectId` packs the frame in the high 32 bits and a per-frame sequence in
//! the low 32 bits. `IdGenerator` hands out sequences that never collide with ids
//! already persisted, filling gaps left by deletions first.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{DaoError, DaoResult};

/// Identifier of a segmented object, unique within its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn new(frame: u32, sequence: u32) -> Self {
        ObjectId(((frame as u64) << 32) | sequence as u64)
    }

    pub fn frame(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sequence(self) -> u32 {
        self.0 as u32
    }

    /// Parse the 16-digit hex form used in record keys.
    pub fn from_hex(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(ObjectId)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-frame allocation state.
///
/// `used` is sorted and deduplicated; everything below `used[cursor]` is at or
/// below the watermark already.
#[derive(Debug)]
struct FrameCounter {
    used: Vec<u32>,
    cursor: usize,
    last: i64,
}

impl FrameCounter {
    fn new(frame: u32, mut used: Vec<u32>) -> Self {
        used.sort_unstable();
        used.dedup();
        // sequence 0 at frame 0 is reserved
        let last = if frame == 0 { 0 } else { -1 };
        Self { used, cursor: 0, last }
    }

    fn next(&mut self, frame: u32) -> DaoResult<u32> {
        loop {
            let candidate = self.last + 1;
            if candidate > u32::MAX as i64 {
                return Err(DaoError::IdSpaceExhausted { frame });
            }
            while self.cursor < self.used.len() && (self.used[self.cursor] as i64) < candidate {
                self.cursor += 1;
            }
            self.last = candidate;
            if self.cursor < self.used.len() && self.used[self.cursor] as i64 == candidate {
                // skip the run of used values
                continue;
            }
            return Ok(candidate as u32);
        }
    }
}

/// Collision-free id source for one position.
///
/// Calls for different frames never contend: the frame map is only write-locked
/// to insert a counter for a frame seen for the first time.
#[derive(Debug, Default)]
pub struct IdGenerator {
    frames: RwLock<HashMap<u32, Arc<Mutex<FrameCounter>>>>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from ids already present in the store. Duplicates are tolerated.
    pub fn from_existing<I: IntoIterator<Item = ObjectId>>(ids: I) -> Self {
        let mut by_frame: HashMap<u32, Vec<u32>> = HashMap::new();
        for id in ids {
            by_frame.entry(id.frame()).or_default().push(id.sequence());
        }
        let frames = by_frame
            .into_iter()
            .map(|(frame, used)| (frame, Arc::new(Mutex::new(FrameCounter::new(frame, used)))))
            .collect();
        Self { frames: RwLock::new(frames) }
    }

    /// Next free id at `frame`.
    pub fn next(&self, frame: u32) -> DaoResult<ObjectId> {
        let counter = self.counter(frame);
        let sequence = counter.lock().next(frame)?;
        Ok(ObjectId::new(frame, sequence))
    }

    fn counter(&self, frame: u32) -> Arc<Mutex<FrameCounter>> {
        if let Some(counter) = self.frames.read().get(&frame) {
            return Arc::clone(counter);
        }
        let mut frames = self.frames.write();
        Arc::clone(
            frames
                .entry(frame)
                .or_insert_with(|| Arc::new(Mutex::new(FrameCounter::new(frame, Vec::new())))),
        )
    }
}
