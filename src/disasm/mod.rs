//! Instruction decoder backends.
//!
//! - iced-x86 for x86/x64

pub mod iced;

pub use iced::IcedDecoder;
