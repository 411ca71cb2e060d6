//! Register file and flags for the x86 interpreter.
//!
//! General-purpose registers are stored as sixteen 64-bit slots in
//! encoding order (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15).
//! Sub-registers are views described by [`RegRef`].

use iced_x86::Register;
use serde::{Deserialize, Serialize};

pub const RAX: usize = 0;
pub const RCX: usize = 1;
pub const RDX: usize = 2;
pub const RSP: usize = 4;
pub const RBP: usize = 5;

const NAMES64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];
const NAMES32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const NAMES16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const NAMES8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8l", "r9l", "r10l", "r11l", "r12l",
    "r13l", "r14l", "r15l",
];
const NAMES8_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];

/// Mask covering the low `size` bytes.
pub fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Sign-extend the low `size` bytes of `value` to 64 bits.
pub fn sign_extend(value: u64, size: usize) -> u64 {
    if size >= 8 {
        return value;
    }
    let shift = 64 - size * 8;
    (((value << shift) as i64) >> shift) as u64
}

/// A view onto a general-purpose register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegRef {
    pub index: usize,
    /// Width in bytes (1, 2, 4, 8)
    pub size: usize,
    /// ah/ch/dh/bh: bits 8..16 of the slot
    pub high_byte: bool,
}

impl RegRef {
    pub fn full(index: usize) -> Self {
        Self {
            index,
            size: 8,
            high_byte: false,
        }
    }

    /// Map an iced general-purpose register. `None` for every other class.
    pub fn from_iced(reg: Register) -> Option<Self> {
        if !reg.is_gpr() {
            return None;
        }
        let high_byte = matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH);
        let index = if high_byte {
            reg as usize - Register::AH as usize
        } else {
            reg.full_register() as usize - Register::RAX as usize
        };
        Some(Self {
            index,
            size: reg.size(),
            high_byte,
        })
    }

    /// Look up a register by lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        fn find(table: &[&str], name: &str) -> Option<usize> {
            table.iter().position(|n| *n == name)
        }
        if let Some(i) = find(&NAMES64, name) {
            return Some(Self::full(i));
        }
        for (table, size) in [(NAMES32, 4), (NAMES16, 2), (NAMES8, 1)] {
            if let Some(index) = find(&table, name) {
                return Some(Self {
                    index,
                    size,
                    high_byte: false,
                });
            }
        }
        find(&NAMES8_HIGH, name).map(|index| Self {
            index,
            size: 1,
            high_byte: true,
        })
    }
}

/// Arithmetic flags tracked by the interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub cf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
    pub pf: bool,
    pub df: bool,
}

impl Flags {
    fn set_result(&mut self, result: u64, size: usize) {
        let r = result & mask(size);
        self.zf = r == 0;
        self.sf = (r >> (size * 8 - 1)) & 1 == 1;
        self.pf = (r as u8).count_ones() % 2 == 0;
    }

    pub fn update_add(&mut self, a: u64, b: u64, carry_in: bool, size: usize) -> u64 {
        let m = mask(size);
        let (a, b) = (a & m, b & m);
        let wide = a as u128 + b as u128 + carry_in as u128;
        let r = (wide as u64) & m;
        self.set_result(r, size);
        self.cf = wide > m as u128;
        let sign = 1u64 << (size * 8 - 1);
        self.of = (a & sign) == (b & sign) && (a & sign) != (r & sign);
        r
    }

    pub fn update_sub(&mut self, a: u64, b: u64, borrow_in: bool, size: usize) -> u64 {
        let m = mask(size);
        let (a, b) = (a & m, b & m);
        let r = a.wrapping_sub(b).wrapping_sub(borrow_in as u64) & m;
        self.set_result(r, size);
        self.cf = (a as u128) < b as u128 + borrow_in as u128;
        let sign = 1u64 << (size * 8 - 1);
        self.of = (a & sign) != (b & sign) && (a & sign) != (r & sign);
        r
    }

    pub fn update_logic(&mut self, result: u64, size: usize) -> u64 {
        let r = result & mask(size);
        self.set_result(r, size);
        self.cf = false;
        self.of = false;
        r
    }

    /// inc/dec leave CF untouched.
    pub fn update_inc_dec(&mut self, value: u64, increment: bool, size: usize) -> u64 {
        let cf = self.cf;
        let r = if increment {
            self.update_add(value, 1, false, size)
        } else {
            self.update_sub(value, 1, false, size)
        };
        self.cf = cf;
        r
    }

    /// Evaluate an iced condition code.
    pub fn condition(&self, cc: iced_x86::ConditionCode) -> bool {
        use iced_x86::ConditionCode as C;
        match cc {
            C::None => true,
            C::o => self.of,
            C::no => !self.of,
            C::b => self.cf,
            C::ae => !self.cf,
            C::e => self.zf,
            C::ne => !self.zf,
            C::be => self.cf || self.zf,
            C::a => !self.cf && !self.zf,
            C::s => self.sf,
            C::ns => !self.sf,
            C::p => self.pf,
            C::np => !self.pf,
            C::l => self.sf != self.of,
            C::ge => self.sf == self.of,
            C::le => self.zf || self.sf != self.of,
            C::g => !self.zf && self.sf == self.of,
        }
    }
}

/// Complete register state. Cloned per step so a faulting step can be
/// discarded without undo logic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub ip: u64,
    pub flags: Flags,
}

impl CpuState {
    pub fn read(&self, r: RegRef) -> u64 {
        let slot = self.gpr[r.index];
        if r.high_byte {
            (slot >> 8) & 0xff
        } else {
            slot & mask(r.size)
        }
    }

    /// Write with x86 merge rules: 32-bit writes zero the upper half,
    /// 8/16-bit writes preserve the rest of the slot.
    pub fn write(&mut self, r: RegRef, value: u64) {
        let slot = &mut self.gpr[r.index];
        if r.high_byte {
            *slot = (*slot & !0xff00) | ((value & 0xff) << 8);
            return;
        }
        match r.size {
            8 => *slot = value,
            4 => *slot = value & 0xffff_ffff,
            size => {
                let m = mask(size);
                *slot = (*slot & !m) | (value & m);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_views() {
        let mut s = CpuState::default();
        s.write(RegRef::from_iced(Register::RAX).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(s.read(RegRef::from_iced(Register::EAX).unwrap()), 0x5566_7788);
        assert_eq!(s.read(RegRef::from_iced(Register::AX).unwrap()), 0x7788);
        assert_eq!(s.read(RegRef::from_iced(Register::AL).unwrap()), 0x88);
        assert_eq!(s.read(RegRef::from_iced(Register::AH).unwrap()), 0x77);

        s.write(RegRef::from_iced(Register::AH).unwrap(), 0xab);
        assert_eq!(s.gpr[RAX], 0x1122_3344_5566_ab88);

        s.write(RegRef::from_iced(Register::EAX).unwrap(), 1);
        assert_eq!(s.gpr[RAX], 1);
    }

    #[test]
    fn test_name_lookup_matches_iced() {
        for (name, reg) in [
            ("r11", Register::R11),
            ("r11d", Register::R11D),
            ("esp", Register::ESP),
            ("bh", Register::BH),
            ("sil", Register::SIL),
        ] {
            assert_eq!(RegRef::from_name(name), RegRef::from_iced(reg), "{}", name);
        }
        assert_eq!(RegRef::from_name("xmm0"), None);
        assert_eq!(RegRef::from_iced(Register::XMM0), None);
    }

    #[test]
    fn test_flags() {
        let mut f = Flags::default();
        assert_eq!(f.update_sub(1, 2, false, 4), 0xffff_ffff);
        assert!(f.cf && f.sf && !f.zf);
        assert_eq!(f.update_add(0x7fff_ffff, 1, false, 4), 0x8000_0000);
        assert!(f.of && !f.cf);
        f.update_logic(0, 4);
        assert!(f.zf && f.condition(iced_x86::ConditionCode::e));
        assert!(f.condition(iced_x86::ConditionCode::ge));
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xff, 1), u64::MAX);
        assert_eq!(sign_extend(0x7f, 1), 0x7f);
        assert_eq!(sign_extend(0x8000_0000, 4) & mask(4), 0x8000_0000);
    }
}
