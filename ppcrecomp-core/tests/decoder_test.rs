// Integration tests for the PowerPC decoder
mod utils;

use ppcrecomp_core::recompiler::decoder::{Instruction, Mnemonic, Operand};
use ppcrecomp_core::RecompilerError;
use utils::*;

fn text(word: u32, address: u32) -> String {
    Instruction::decode(word, address).unwrap().to_string()
}

#[test]
fn test_decode_addi() {
    let decoded = Instruction::decode(addi(3, 4, 5), 0x8000_0000).unwrap();
    assert_eq!(decoded.mnemonic(), Mnemonic::Addi);
    assert_eq!(decoded.instruction.gpr(0), Some(3));
    assert_eq!(decoded.instruction.gpr(1), Some(4));
    assert_eq!(decoded.instruction.operand(2), Some(&Operand::Immediate(5)));
    assert_eq!(decoded.address, 0x8000_0000);
    assert!(!decoded.is_branch());
}

#[test]
fn test_simplified_mnemonics() {
    assert_eq!(text(addi(3, 4, 5), BASE), "addi r3,r4,5");
    assert_eq!(text(li(3, 10), BASE), "li r3,10");
    assert_eq!(text(li(3, -1), BASE), "li r3,-1");
    assert_eq!(text(NOP, BASE), "nop");
    assert_eq!(text(mtctr(12), BASE), "mtctr r12");
    assert_eq!(text(rlwinm(12, 3, 2, 0, 29), BASE), "slwi r12,r3,2");
    assert_eq!(text(lwz(4, 3, 0), BASE), "lwz r4,0(r3)");
    assert_eq!(text(stw(4, 1, -8), BASE), "stw r4,-8(r1)");
}

#[test]
fn test_branch_targets_are_absolute() {
    let call = Instruction::decode(bl(0x1000, 0x1100), 0x1000).unwrap();
    assert!(call.is_branch());
    assert!(call.instruction.flags.lk);
    assert_eq!(call.instruction.branch_target(), Some(0x1100));
    assert_eq!(call.to_string(), "bl 0x00001100");

    let back = Instruction::decode(b(0x1010, 0x1000), 0x1010).unwrap();
    assert_eq!(back.instruction.branch_target(), Some(0x1000));
    assert!(back.instruction.is_unconditional());

    assert_eq!(text(beq(0x1008, 0x1010), 0x1008), "beq 0x00001010");
    assert_eq!(text(bc(12, 6, 0x1008, 0x1010), 0x1008), "beq cr1,0x00001010");
    assert_eq!(text(BLR, BASE), "blr");
    assert_eq!(text(BCTR, BASE), "bctr");
}

#[test]
fn test_conditional_branch_options() {
    let decoded = Instruction::decode(bne(0x1004, 0x100C), 0x1004).unwrap();
    assert_eq!(decoded.instruction.branch_options(), Some((4, 2)));
    assert_eq!(decoded.next_address(), 0x1008);
    assert!(!decoded.instruction.is_unconditional());
}

#[test]
fn test_zero_word_is_a_decode_error() {
    let err = Instruction::decode(0x0000_0000, 0x8000_1234).unwrap_err();
    match err {
        RecompilerError::Decode { address, raw, .. } => {
            assert_eq!(address, 0x8000_1234);
            assert_eq!(raw, 0);
        }
        other => panic!("expected a decode error, got {:?}", other),
    }
}
