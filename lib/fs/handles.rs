//! Open-file handle table: generation-checked slots with per-handle locks.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::error;

/// Opaque identifier for one open file, valid from registration until
/// release.
///
/// Packs a slot index in the low 32 bits and that slot's generation at
/// registration time in the high 32 bits. The generation changes every
/// time a slot is vacated, so a handle that outlives its slot is detected
/// instead of silently addressing whatever file context moved in next.
pub type Handle = u64;

/// An operation addressed a handle that is not currently registered.
///
/// The host contract is open-before-read and no-read-after-release, so
/// this only ever reports a caller bug, never an image problem.
#[derive(Debug, Error)]
#[error("{op} on unknown handle {handle:#x}")]
pub struct HandleViolation {
    /// The offending handle value.
    pub handle: Handle,
    /// The operation that presented it.
    pub op: &'static str,
}

struct Slot<F> {
    generation: u32,
    file: Option<Arc<Mutex<F>>>,
}

struct TableInner<F> {
    slots: Vec<Slot<F>>,
    /// Indices of vacant slots, reused before the table grows.
    free: Vec<u32>,
}

/// Table of open file contexts.
///
/// The table lock is held only long enough to address a slot; each file
/// context sits behind its own mutex, held for the whole of a caller's
/// positioned read. Operations on distinct handles therefore run fully
/// concurrently, while two racing operations on one handle serialize.
pub struct HandleTable<F> {
    inner: Mutex<TableInner<F>>,
}

impl<F> Default for HandleTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> HandleTable<F> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Insert `file` and mint the handle that names it.
    pub fn register(&self, file: F) -> Handle {
        let file = Arc::new(Mutex::new(file));
        let mut inner = self.lock_inner();
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            debug_assert!(slot.file.is_none(), "free list named an occupied slot");
            slot.file = Some(file);
            pack(index, slot.generation)
        } else {
            assert!(
                inner.slots.len() < u32::MAX as usize,
                "handle table exhausted"
            );
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot {
                generation: 0,
                file: Some(file),
            });
            pack(index, 0)
        }
    }

    /// Run `f` with exclusive use of the handle's file context.
    ///
    /// The table lock is released before `f` runs; only the per-handle
    /// lock is held, so slow reads on one handle never stall the others.
    pub fn with_handle<R>(
        &self,
        handle: Handle,
        op: &'static str,
        f: impl FnOnce(&mut F) -> R,
    ) -> Result<R, HandleViolation> {
        let file = {
            let inner = self.lock_inner();
            let Some(file) = inner.find(handle) else {
                return Err(HandleViolation { handle, op });
            };
            Arc::clone(file)
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut file))
    }

    /// Remove the handle and hand its file context back for closing.
    ///
    /// The slot's generation is bumped immediately, so the handle value is
    /// dead even while the context is still being torn down.
    pub fn unregister(&self, handle: Handle, op: &'static str) -> Result<F, HandleViolation> {
        let file = {
            let mut inner = self.lock_inner();
            let (index, generation) = unpack(handle);
            let Some(slot) = inner.slots.get_mut(index as usize) else {
                return Err(HandleViolation { handle, op });
            };
            if slot.generation != generation {
                return Err(HandleViolation { handle, op });
            }
            let Some(file) = slot.file.take() else {
                return Err(HandleViolation { handle, op });
            };
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(index);
            file
        };
        match Arc::try_unwrap(file) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(_still_borrowed) => {
                // The host promises release never races a read on the same
                // handle. The slot is already vacated, so the context just
                // drops when the racing borrow finishes.
                error!(
                    handle,
                    "handle still borrowed at release; this is a programming bug"
                );
                Err(HandleViolation { handle, op })
            }
        }
    }

    /// Number of currently registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.lock_inner();
        inner.slots.len() - inner.free.len()
    }

    /// True when no handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, TableInner<F>> {
        // A poisoned lock means a panic while addressing a slot; the table
        // itself is still structurally sound.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F> TableInner<F> {
    fn find(&self, handle: Handle) -> Option<&Arc<Mutex<F>>> {
        let (index, generation) = unpack(handle);
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.file.as_ref()
    }
}

fn pack(index: u32, generation: u32) -> Handle {
    (u64::from(generation) << 32) | u64::from(index)
}

#[expect(clippy::cast_possible_truncation, reason = "deliberate field split")]
fn unpack(handle: Handle) -> (u32, u32) {
    (handle as u32, (handle >> 32) as u32)
}
