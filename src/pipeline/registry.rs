//! Live speaker streams keyed by source tag.
//!
//! A stream exists from its first frame until its worker evicts it after an
//! idle period, or until teardown. Each stream carries a generation so a
//! worker that goes idle cannot evict a replacement created for the same tag.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

/// Interleaved PCM for one frame.
pub type Frame = Vec<i16>;

/// Registry entry for one live stream.
#[derive(Debug)]
pub struct SpeakerHandle {
    tx: mpsc::Sender<Frame>,
    generation: u64,
}

/// The receiving half of a newly created stream; the caller spawns its worker.
#[derive(Debug)]
pub struct NewStream {
    /// Generation to present on eviction.
    pub generation: u64,
    /// Frames for the worker.
    pub rx: mpsc::Receiver<Frame>,
}

/// Concurrent map of live speaker streams.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    streams: DashMap<u32, SpeakerHandle>,
    next_generation: AtomicU64,
}

impl SpeakerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for `ssrc`, creating the stream when it is absent or its
    /// worker has gone away.
    ///
    /// When a stream was created the second element carries its receiver.
    pub fn sender_or_insert(
        &self,
        ssrc: u32,
        capacity: usize,
    ) -> (mpsc::Sender<Frame>, Option<NewStream>) {
        match self.streams.entry(ssrc) {
            Entry::Occupied(entry) if !entry.get().tx.is_closed() => (entry.get().tx.clone(), None),
            Entry::Occupied(mut entry) => {
                let (handle, stream) = self.fresh(capacity);
                let tx = handle.tx.clone();
                entry.insert(handle);
                (tx, Some(stream))
            }
            Entry::Vacant(entry) => {
                let (handle, stream) = self.fresh(capacity);
                let tx = handle.tx.clone();
                entry.insert(handle);
                (tx, Some(stream))
            }
        }
    }

    fn fresh(&self, capacity: usize) -> (SpeakerHandle, NewStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        (
            SpeakerHandle {
                tx,
                generation,
            },
            NewStream { generation, rx },
        )
    }

    /// Remove `ssrc` only if it still holds `generation`.
    pub fn evict(&self, ssrc: u32, generation: u64) -> bool {
        self.streams
            .remove_if(&ssrc, |_, handle| handle.generation == generation)
            .is_some()
    }

    /// Remove `ssrc` regardless of generation. Its worker drains and exits.
    pub fn remove(&self, ssrc: u32) -> bool {
        self.streams.remove(&ssrc).is_some()
    }

    /// Remove every stream.
    pub fn clear(&self) {
        self.streams.clear();
    }

    /// Whether `ssrc` has a live stream.
    pub fn contains(&self, ssrc: u32) -> bool {
        self.streams.contains_key(&ssrc)
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is live.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
