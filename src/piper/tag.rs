//! Per-call correlation tags.
//!
//! A [`Tag`] is a single-owner completion ticket handed out by a [`TagArena`].
//! It is not `Clone`: whoever holds it owns the pending call, and dropping it
//! is the one and only way it is destroyed. Its [`TagId`] is a `Copy`
//! identity (slot index + generation) small enough to travel as a pipe frame.
//!
//! ```text
//! TagId (u64, native endian on the pipe)
//! ┌──────────────────┬──────────────────┐
//! │ generation (hi)  │ slot index (lo)  │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! Generations start at 1, so a minted id is never zero and [`TagId::NULL`]
//! stays free to mean "this frame is a signal".

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

/// Size of an encoded [`TagId`] frame.
pub const TAG_FRAME_SIZE: usize = std::mem::size_of::<u64>();

/// Copyable identity of a [`Tag`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(u64);

impl TagId {
    /// Reserved id marking a signal notification. Never minted.
    pub const NULL: TagId = TagId(0);

    fn new(index: u32, generation: u32) -> Self {
        TagId((u64::from(generation) << 32) | u64::from(index))
    }

    /// Slot index in the arena.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// Generation the slot had when this id was minted.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Encode as a pipe frame payload.
    #[inline]
    pub fn to_bytes(self) -> [u8; TAG_FRAME_SIZE] {
        self.0.to_ne_bytes()
    }

    /// Decode a pipe frame payload. `None` if the frame is not tag-sized.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; TAG_FRAME_SIZE] = bytes.try_into().ok()?;
        Some(TagId(u64::from_ne_bytes(raw)))
    }
}

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("TagId(null)")
        } else {
            write!(f, "TagId({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

#[derive(Debug, Default)]
struct ArenaInner {
    /// Slot index -> generation of the live tag in it.
    slots: Mutex<Slab<u32>>,
    next_generation: AtomicU32,
}

impl ArenaInner {
    fn release(&self, id: TagId) {
        let mut slots = self.slots.lock();
        match slots.get(id.index() as usize) {
            Some(&generation) if generation == id.generation() => {
                slots.remove(id.index() as usize);
            }
            _ => tracing::error!("tag {} released twice or never minted", id),
        }
    }
}

/// Allocator of [`Tag`]s.
///
/// Cheap to clone; clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct TagArena {
    inner: Arc<ArenaInner>,
}

impl TagArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh tag.
    pub fn mint(&self) -> Tag {
        let generation = loop {
            let generation = self
                .inner
                .next_generation
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if generation != 0 {
                break generation;
            }
        };

        let mut slots = self.inner.slots.lock();
        let entry = slots.vacant_entry();
        // Slot indices stay far below u32::MAX: each live tag is an in-flight call.
        let index = entry.key() as u32;
        entry.insert(generation);

        Tag {
            id: TagId::new(index, generation),
            arena: self.inner.clone(),
        }
    }

    /// Whether `id` names a tag that is still alive.
    pub fn contains(&self, id: TagId) -> bool {
        !id.is_null()
            && self
                .inner
                .slots
                .lock()
                .get(id.index() as usize)
                .is_some_and(|&generation| generation == id.generation())
    }

    /// Number of live tags.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-owner completion ticket.
///
/// Dropping the tag destroys it and frees its arena slot.
#[must_use = "dropping a Tag destroys it"]
pub struct Tag {
    id: TagId,
    arena: Arc<ArenaInner>,
}

impl Tag {
    #[inline]
    pub fn id(&self) -> TagId {
        self.id
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tag").field(&self.id).finish()
    }
}

impl Drop for Tag {
    fn drop(&mut self) {
        self.arena.release(self.id);
    }
}
