//! Fixed-capacity profile sample buffer.
//!
//! Records are laid out back to back:
//!
//! ```text
//! ┌──────────────────┬─────────┬─────────┬────────┬───────┬───┬───┐
//! │ frames (nonzero) │ tid + 1 │ task id │ cycles │ state │ 0 │ 0 │
//! └──────────────────┴─────────┴─────────┴────────┴───────┴───┴───┘
//! ```
//!
//! No metadata word is ever zero, so a pair of zero words can only be a
//! terminator.

/// Metadata words following the frames of a record.
pub const RECORD_METADATA_WORDS: usize = 4;

/// Zero words closing a record.
pub const RECORD_TERMINATOR_WORDS: usize = 2;

/// Words a record needs beyond its frames.
pub const RECORD_TRAILER_WORDS: usize = RECORD_METADATA_WORDS + RECORD_TERMINATOR_WORDS;

/// State word of a sample taken while the thread was running.
pub const STATE_NOT_SLEEPING: usize = 1;

/// State word of a sample taken while the thread was sleeping.
pub const STATE_SLEEPING: usize = 2;

// =============================================================================
// SampleMetadata
// =============================================================================

/// Metadata of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMetadata {
    /// Thread index plus one.
    pub thread_marker: usize,
    /// Identity of the task that was running.
    pub task_id: usize,
    /// Cycle counter at sample time.
    pub cycles: usize,
    /// [`STATE_NOT_SLEEPING`] or [`STATE_SLEEPING`].
    pub state: usize,
}

impl SampleMetadata {
    pub fn new(tid: usize, task_id: u64, cycles: u64, sleeping: bool) -> Self {
        SampleMetadata {
            thread_marker: tid + 1,
            task_id: (task_id as usize).max(1),
            cycles: (cycles as usize).max(1),
            state: if sleeping {
                STATE_SLEEPING
            } else {
                STATE_NOT_SLEEPING
            },
        }
    }

    fn words(&self) -> [usize; RECORD_METADATA_WORDS] {
        [self.thread_marker, self.task_id, self.cycles, self.state]
    }
}

// =============================================================================
// ProfileBuffer
// =============================================================================

pub struct ProfileBuffer {
    words: Box<[usize]>,
    cursor: usize,
}

impl ProfileBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ProfileBuffer {
            words: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Words written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// No room for even a one-frame record.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.cursor + 1 + RECORD_TRAILER_WORDS > self.words.len()
    }

    /// Written words.
    #[inline]
    pub fn as_words(&self) -> &[usize] {
        &self.words[..self.cursor]
    }

    /// Append one record.
    ///
    /// `capture` fills at most the frames that still leave room for the
    /// trailer and returns how many it wrote; zero entries are dropped.
    /// Returns `false` without writing anything if the buffer is full.
    pub fn record_sample<F>(&mut self, capture: F, metadata: SampleMetadata) -> bool
    where
        F: FnOnce(&mut [usize]) -> usize,
    {
        if self.is_full() {
            return false;
        }
        let room = self.words.len() - self.cursor - RECORD_TRAILER_WORDS;
        let start = self.cursor;
        let window = &mut self.words[start..start + room];
        let written = capture(window).min(room);

        let mut kept = 0;
        for i in 0..written {
            let ip = window[i];
            if ip != 0 {
                window[kept] = ip;
                kept += 1;
            }
        }

        let mut at = start + kept;
        for word in metadata.words() {
            self.words[at] = word;
            at += 1;
        }
        self.words[at] = 0;
        self.words[at + 1] = 0;
        self.cursor = at + RECORD_TERMINATOR_WORDS;
        true
    }

    /// Iterate complete records.
    pub fn records(&self) -> Records<'_> {
        Records {
            words: self.as_words(),
        }
    }

    /// Discard every record.
    pub fn reset(&mut self) {
        self.words[..self.cursor].fill(0);
        self.cursor = 0;
    }
}

impl std::fmt::Debug for ProfileBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileBuffer")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .finish()
    }
}

// =============================================================================
// Records
// =============================================================================

/// One decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileRecord<'a> {
    pub frames: &'a [usize],
    pub metadata: SampleMetadata,
}

/// Iterator over the records of a [`ProfileBuffer`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    words: &'a [usize],
}

impl<'a> Iterator for Records<'a> {
    type Item = ProfileRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.words.windows(2).position(|w| w == [0, 0])?;
        if end < RECORD_METADATA_WORDS {
            self.words = &[];
            return None;
        }
        let (record, rest) = self.words.split_at(end);
        self.words = &rest[RECORD_TERMINATOR_WORDS..];

        let (frames, meta) = record.split_at(end - RECORD_METADATA_WORDS);
        Some(ProfileRecord {
            frames,
            metadata: SampleMetadata {
                thread_marker: meta[0],
                task_id: meta[1],
                cycles: meta[2],
                state: meta[3],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(frames: &'static [usize]) -> impl FnOnce(&mut [usize]) -> usize {
        move |window| {
            let n = frames.len().min(window.len());
            window[..n].copy_from_slice(&frames[..n]);
            n
        }
    }

    #[test]
    fn test_record_layout() {
        let mut buf = ProfileBuffer::with_capacity(32);
        assert!(buf.record_sample(fill(&[0xa, 0xb]), SampleMetadata::new(0, 7, 99, false)));
        assert_eq!(buf.as_words(), &[0xa, 0xb, 1, 7, 99, STATE_NOT_SLEEPING, 0, 0]);
    }

    #[test]
    fn test_zero_frames_are_dropped() {
        let mut buf = ProfileBuffer::with_capacity(32);
        buf.record_sample(fill(&[0xa, 0, 0xc]), SampleMetadata::new(2, 1, 5, true));
        let record = buf.records().next().unwrap();
        assert_eq!(record.frames, &[0xa, 0xc]);
        assert_eq!(record.metadata.thread_marker, 3);
        assert_eq!(record.metadata.state, STATE_SLEEPING);
    }

    #[test]
    fn test_metadata_is_never_zero() {
        let meta = SampleMetadata::new(0, 0, 0, false);
        assert!(meta.words().iter().all(|&w| w != 0));
    }

    #[test]
    fn test_fills_to_capacity_then_reports_full() {
        let mut buf = ProfileBuffer::with_capacity(20);
        let meta = SampleMetadata::new(0, 1, 1, false);
        let mut last = 0;
        while buf.record_sample(fill(&[1, 2, 3]), meta) {
            assert!(buf.len() > last);
            assert!(buf.len() <= buf.capacity());
            last = buf.len();
        }
        assert!(buf.is_full());
        assert_eq!(buf.records().count(), 2);
    }

    #[test]
    fn test_last_record_is_truncated_to_fit() {
        let mut buf = ProfileBuffer::with_capacity(10);
        buf.record_sample(fill(&[1, 2, 3, 4, 5, 6, 7]), SampleMetadata::new(0, 1, 1, false));
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.records().next().unwrap().frames, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_capture_still_writes_record() {
        let mut buf = ProfileBuffer::with_capacity(16);
        buf.record_sample(|_| 0, SampleMetadata::new(1, 2, 3, false));
        let records: Vec<_> = buf.records().collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].frames.is_empty());
        assert_eq!(records[0].metadata.task_id, 2);
    }

    #[test]
    fn test_reset() {
        let mut buf = ProfileBuffer::with_capacity(16);
        buf.record_sample(fill(&[9]), SampleMetadata::new(0, 1, 1, false));
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.records().count(), 0);
    }
}
