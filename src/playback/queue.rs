//! Strict FIFO of audio units awaiting playback.
//!
//! The queue only tracks order and the single "currently playing" slot; the
//! controller owns the output driver and the inter-unit gap timer.

use std::collections::VecDeque;

/// One decoded-from-base64 audio fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUnit {
    pub id: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<AudioUnit>,
    playing: Option<u64>,
    stream_done: bool,
    next_id: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit; returns its id.
    pub fn enqueue(&mut self, bytes: Vec<u8>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(AudioUnit { id, bytes });
        id
    }

    /// Take the head of the queue and mark it playing. Returns `None` while
    /// another unit is playing or when the queue is empty.
    pub fn start_next(&mut self) -> Option<AudioUnit> {
        if self.playing.is_some() {
            return None;
        }
        let unit = self.pending.pop_front()?;
        self.playing = Some(unit.id);
        Some(unit)
    }

    /// Release the playing slot. Returns the id that was playing.
    pub fn finish_current(&mut self) -> Option<u64> {
        self.playing.take()
    }

    /// No further units will be enqueued for this stream.
    pub fn mark_stream_done(&mut self) {
        self.stream_done = true;
    }

    #[cfg(test)]
    fn is_stream_done(&self) -> bool {
        self.stream_done
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Nothing playing and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.playing.is_none() && self.pending.is_empty()
    }

    /// Stream finished and every unit has played.
    pub fn is_drained(&self) -> bool {
        self.stream_done && self.is_idle()
    }

    /// Drop everything without playing it and forget the stream state.
    /// Returns how many pending units were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.playing = None;
        self.stream_done = false;
        dropped
    }
}
