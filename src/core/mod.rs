//! Core data types for emuflow.
//!
//! This module contains the fundamental types shared by the decoder, the
//! emulator, and the analysis engine, starting with `VirtualAddress`.

pub mod address;
pub mod address_space;
pub mod artifact;
pub mod basic_block;
pub mod disassembler;
pub mod instruction;
pub mod reference;
pub mod symbol;
