//! Side-effect-free speculative execution.
//!
//! An excursion snapshots the emulator, mutes its hooks, hands it to a probe,
//! and restores both the snapshot and the previous mute state when the guard
//! goes away, whether the probe returned normally, returned an error, or
//! unwound.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use tracing::trace;

use super::Emulator;

/// Scoped owner of speculative probes for one exploration.
#[derive(Debug, Default)]
pub struct ExcursionManager {
    excursions: Cell<u64>,
    depth: Cell<u32>,
}

impl ExcursionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` against `emu` and restore the emulator afterwards.
    pub fn with_temporary_excursion<E, T, F>(&self, emu: &mut E, body: F) -> T
    where
        E: Emulator,
        F: FnOnce(&mut E) -> T,
    {
        let mut guard = self.begin(emu);
        body(&mut guard)
    }

    /// Start an excursion; state is restored when the returned guard drops.
    pub fn begin<'a, E: Emulator>(&'a self, emu: &'a mut E) -> Excursion<'a, E> {
        self.excursions.set(self.excursions.get() + 1);
        self.depth.set(self.depth.get() + 1);
        let snapshot = emu.snapshot();
        let was_muted = emu.set_hooks_muted(true);
        trace!(
            ip = %emu.instruction_pointer(),
            depth = self.depth.get(),
            "excursion started"
        );
        Excursion {
            emu,
            snapshot: Some(snapshot),
            was_muted,
            depth: &self.depth,
        }
    }

    /// Excursions started through this manager.
    pub fn excursions(&self) -> u64 {
        self.excursions.get()
    }

    /// Excursions currently open.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }
}

/// An open excursion. Dereferences to the emulator being probed.
pub struct Excursion<'a, E: Emulator> {
    emu: &'a mut E,
    snapshot: Option<E::Snapshot>,
    was_muted: bool,
    depth: &'a Cell<u32>,
}

impl<E: Emulator> Deref for Excursion<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.emu
    }
}

impl<E: Emulator> DerefMut for Excursion<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.emu
    }
}

impl<E: Emulator> Drop for Excursion<'_, E> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.emu.restore(snapshot);
        }
        self.emu.set_hooks_muted(self.was_muted);
        self.depth.set(self.depth.get().saturating_sub(1));
        trace!(ip = %self.emu.instruction_pointer(), "excursion restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::core::address::VirtualAddress;
    use crate::core::address_space::{AddressSpace, ImageAddressSpace, Permissions, Region};
    use crate::core::disassembler::Architecture;
    use crate::emu::{EmulatorError, X86Emulator};
    use std::sync::Arc;

    fn emulator(code: &[u8]) -> X86Emulator {
        let mut img = ImageAddressSpace::new();
        img.map(Region::new("code", VirtualAddress(0x1000), 0x100, code, Permissions::RX))
            .unwrap();
        let mut emu =
            X86Emulator::with_stack(Architecture::X86, Arc::new(img), &StackConfig::default()).unwrap();
        emu.set_instruction_pointer(VirtualAddress(0x1000));
        emu
    }

    #[test]
    fn test_state_restored_after_probe() {
        // push eax; push eax; call 0x1000
        let mut emu = emulator(&[0x50, 0x50, 0xe8, 0xf9, 0xff, 0xff, 0xff]);
        let manager = ExcursionManager::new();
        let (ip, sp) = (emu.instruction_pointer(), emu.stack_pointer());
        let top = emu.read_u32(VirtualAddress(sp.value() - 4)).unwrap();

        let landed = manager.with_temporary_excursion(&mut emu, |e| {
            for _ in 0..3 {
                e.step_into().unwrap();
            }
            e.instruction_pointer()
        });

        assert_eq!(landed, VirtualAddress(0x1000));
        assert_eq!(emu.instruction_pointer(), ip);
        assert_eq!(emu.stack_pointer(), sp);
        assert_eq!(emu.read_u32(VirtualAddress(sp.value() - 4)).unwrap(), top);
        assert_eq!(manager.excursions(), 1);
        assert_eq!(manager.depth(), 0);
    }

    #[test]
    fn test_restored_on_error_and_hooks_muted() {
        // int3
        let mut emu = emulator(&[0xcc]);
        let fired = std::rc::Rc::new(Cell::new(0));
        let f = fired.clone();
        let _hook = emu.hook_code(Box::new(move |_| f.set(f.get() + 1)));
        let manager = ExcursionManager::new();
        emu.set_register_value("eax", 9).unwrap();

        let result: Result<(), EmulatorError> = manager.with_temporary_excursion(&mut emu, |e| {
            e.set_register_value("eax", 1)?;
            e.step_into()
        });

        assert!(matches!(result, Err(EmulatorError::Interrupt { .. })));
        assert_eq!(emu.register_value("eax").unwrap(), 9);
        assert_eq!(fired.get(), 0);
        assert!(!emu.set_hooks_muted(false));
    }

    #[test]
    fn test_nested_excursions() {
        let mut emu = emulator(&[0x90, 0x90]);
        let manager = ExcursionManager::new();
        {
            let mut outer = manager.begin(&mut emu);
            outer.step_into().unwrap();
            manager.with_temporary_excursion(&mut *outer, |inner| inner.step_into().unwrap());
            assert_eq!(outer.instruction_pointer(), VirtualAddress(0x1001));
        }
        assert_eq!(emu.instruction_pointer(), VirtualAddress(0x1000));
        assert_eq!(manager.excursions(), 2);
    }
}
