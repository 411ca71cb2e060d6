use emuflow::core::address_space::{ImageAddressSpace, Permissions, Region};
use emuflow::core::disassembler::{DecodeError, Decoder};
use emuflow::core::instruction::Operand;
use emuflow::disasm::IcedDecoder;
use emuflow::{Architecture, VirtualAddress};

#[test]
fn decode_x86_64_minimal() {
    // xor rax, rax; ret
    let bytes: [u8; 4] = [0x48, 0x31, 0xC0, 0xC3];
    let decoder = IcedDecoder::new(Architecture::X86_64);
    let ins1 = decoder
        .decode_bytes(VirtualAddress(0x401000), &bytes)
        .expect("insn");
    assert!(ins1.mnemonic.starts_with("xor"));
    assert_eq!(ins1.size, 3);
    assert!(!ins1.is_block_end());
    let ins2 = decoder
        .decode_bytes(ins1.next_address(), &bytes[3..])
        .expect("insn2");
    assert!(ins2.is_return());
}

#[test]
fn decode_from_address_space() {
    // call dword [0x402000]
    let mut image = ImageAddressSpace::new();
    image
        .map(Region::new(
            ".text",
            VirtualAddress(0x401000),
            0x10,
            &[0xff, 0x15, 0x00, 0x20, 0x40, 0x00],
            Permissions::RX,
        ))
        .unwrap();
    let decoder = IcedDecoder::new(Architecture::X86);
    let insn = decoder.decode(&image, VirtualAddress(0x401000)).expect("call");
    assert!(insn.is_call() && insn.is_indirect());
    assert_eq!(insn.direct_target(), None);
    assert_eq!(
        insn.operands.first(),
        Some(&Operand::Memory {
            base: None,
            index: None,
            scale: 1,
            displacement: 0x402000,
        })
    );

    let err = decoder.decode(&image, VirtualAddress(0x500000)).unwrap_err();
    assert!(matches!(err, DecodeError::Memory(_)));
}

#[test]
fn undecodable_bytes_are_rejected() {
    let decoder = IcedDecoder::new(Architecture::X86_64);
    // 0x06 (push es) is invalid in 64-bit mode
    let err = decoder.decode_bytes(VirtualAddress(0x1000), &[0x06]).unwrap_err();
    assert_eq!(err, DecodeError::InvalidInstruction(VirtualAddress(0x1000)));
}
