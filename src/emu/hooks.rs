//! Hook registration with handle-based unregistration.
//!
//! A `HookHandle` shares a liveness flag with its table entry. Dropping or
//! closing the handle clears the flag; the entry is skipped from then on and
//! purged on the next dispatch, so unregistering never needs a borrow of
//! the emulator.

use std::cell::Cell;
use std::rc::Rc;

use super::{CodeCallback, CodeEvent, MemoryAccess, MemoryCallback};

/// Registration of one hook. Unregisters on drop.
#[must_use = "dropping a HookHandle unregisters the hook"]
#[derive(Debug)]
pub struct HookHandle {
    id: u64,
    alive: Rc<Cell<bool>>,
}

impl HookHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.alive.get()
    }

    /// Unregister the hook now.
    pub fn close(self) {}
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.alive.set(false);
    }
}

struct Entry<C: ?Sized> {
    alive: Rc<Cell<bool>>,
    callback: Box<C>,
}

/// Hooks of one event type, in registration order.
pub struct HookList<C: ?Sized> {
    entries: Vec<Entry<C>>,
}

impl<C: ?Sized> Default for HookList<C> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<C: ?Sized> HookList<C> {
    fn add(&mut self, id: u64, callback: Box<C>) -> HookHandle {
        let alive = Rc::new(Cell::new(true));
        self.entries.push(Entry {
            alive: alive.clone(),
            callback,
        });
        HookHandle { id, alive }
    }

    fn purge(&mut self) {
        self.entries.retain(|e| e.alive.get());
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.alive.get()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The full hook set of an emulator.
#[derive(Default)]
pub struct Hooks {
    code: HookList<dyn FnMut(&CodeEvent)>,
    read: HookList<dyn FnMut(&MemoryAccess)>,
    write: HookList<dyn FnMut(&MemoryAccess)>,
    next_id: u64,
    muted: bool,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("code", &self.code.len())
            .field("read", &self.read.len())
            .field("write", &self.write.len())
            .field("muted", &self.muted)
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_code(&mut self, callback: CodeCallback) -> HookHandle {
        let id = self.next_id();
        self.code.add(id, callback)
    }

    pub fn add_read(&mut self, callback: MemoryCallback) -> HookHandle {
        let id = self.next_id();
        self.read.add(id, callback)
    }

    pub fn add_write(&mut self, callback: MemoryCallback) -> HookHandle {
        let id = self.next_id();
        self.write.add(id, callback)
    }

    pub fn set_muted(&mut self, muted: bool) -> bool {
        std::mem::replace(&mut self.muted, muted)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Number of live hooks across all event types.
    pub fn active(&self) -> usize {
        self.code.len() + self.read.len() + self.write.len()
    }

    /// Deliver the events of one committed step.
    pub fn dispatch(&mut self, code: &CodeEvent, memory: &[MemoryAccess]) {
        if self.muted {
            return;
        }
        self.code.purge();
        self.read.purge();
        self.write.purge();

        for e in self.code.entries.iter_mut() {
            if e.alive.get() {
                (e.callback)(code);
            }
        }
        for access in memory {
            let list = match access.kind {
                super::AccessKind::Read => &mut self.read,
                super::AccessKind::Write => &mut self.write,
            };
            for e in list.entries.iter_mut() {
                if e.alive.get() {
                    (e.callback)(access);
                }
            }
        }
    }
}
