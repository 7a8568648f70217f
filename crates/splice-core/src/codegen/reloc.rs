//! Relocation of position-dependent instructions.
//!
//! A fragment captured at address A and re-executed inside a cave at
//! address B cannot keep relative branches computed against A. Each
//! relative Jcc is re-pointed at an absolute-jump stub appended to the
//! fragment, preserving the original opcode and condition; relative
//! calls are rewritten in place as absolute calls through a scratch
//! register.

use crate::codegen::{self, pop_reg, push_reg, Reg};
use crate::error::{Error, Result};

/// Location of a relative branch inside a captured fragment.
///
/// `offset` is the branch's position in the fragment *as originally
/// captured*; if bytes were spliced in ahead of the branch afterwards,
/// pass their total length as `added_offset` so the branch is found at
/// its shifted position while target arithmetic still uses the original
/// layout.
#[derive(Debug, Clone, Copy)]
pub struct BranchSite {
    pub offset: usize,
    pub opcode_len: usize,
    pub instr_len: usize,
}

/// Length of the absolute-call sequence emitted by [`fix_relative_call`].
pub const ABSOLUTE_CALL_LEN: usize = 17;

/// Re-point a relative conditional jump in a relocated fragment.
///
/// The branch is re-encoded to reach an absolute-jump stub appended at
/// the end of the fragment; the stub targets the address the branch
/// reached in the original code (`next_instruction + displacement`).
/// Only 1-byte and 4-byte displacements are understood; anything else
/// fails fast rather than producing a corrupt jump.
pub fn fix_relative_branch(
    bytes: &[u8],
    original_address: u64,
    site: BranchSite,
    added_offset: usize,
) -> Result<Vec<u8>> {
    let pos = site.offset + added_offset;
    if pos + site.instr_len > bytes.len() {
        return Err(Error::RelocationUnsupported(format!(
            "branch at offset {pos:#x} lies outside the {}-byte fragment",
            bytes.len()
        )));
    }

    let disp_len = site.instr_len - site.opcode_len;
    let displacement: i64 = match disp_len {
        1 => bytes[pos + site.opcode_len] as i8 as i64,
        4 => i32::from_le_bytes(
            bytes[pos + site.opcode_len..pos + site.instr_len]
                .try_into()
                .expect("4-byte displacement"),
        ) as i64,
        other => {
            return Err(Error::RelocationUnsupported(format!(
                "relative displacement width {other}"
            )));
        }
    };

    // The displacement is computed from the start of the next instruction
    // in the ORIGINAL code.
    let next_instruction = original_address + (site.offset + site.instr_len) as u64;
    let absolute_target = next_instruction.wrapping_add_signed(displacement);

    // The stub goes at the current end of the fragment.
    let new_displacement = bytes.len() - (site.offset + site.instr_len + added_offset);
    let encoded: Vec<u8> = match disp_len {
        1 => {
            if new_displacement > i8::MAX as usize {
                return Err(Error::RelocationUnsupported(format!(
                    "8-bit displacement cannot reach stub {new_displacement} bytes away"
                )));
            }
            vec![new_displacement as u8]
        }
        _ => (new_displacement as u32).to_le_bytes().to_vec(),
    };

    let mut out = Vec::with_capacity(bytes.len() + codegen::JUMP_STUB_LEN);
    out.extend_from_slice(&bytes[..pos + site.opcode_len]);
    out.extend_from_slice(&encoded);
    out.extend_from_slice(&bytes[pos + site.instr_len..]);
    out.extend(codegen::absolute_jump(absolute_target));
    Ok(out)
}

/// Rewrite a relative `call rel32` as an absolute call through r9.
///
/// Returns the transformed fragment and the length of the replacement
/// sequence. r9 is saved and restored around the call; the callee must
/// not rely on it.
pub fn fix_relative_call(
    bytes: &[u8],
    original_address: u64,
    call_offset: usize,
    call_len: usize,
) -> Result<(Vec<u8>, usize)> {
    if call_offset + call_len > bytes.len() {
        return Err(Error::RelocationUnsupported(format!(
            "call at offset {call_offset:#x} lies outside the {}-byte fragment",
            bytes.len()
        )));
    }
    if call_len != 5 || bytes[call_offset] != 0xE8 {
        return Err(Error::RelocationUnsupported(
            "only call rel32 (E8) can be made absolute".to_string(),
        ));
    }

    let displacement = i32::from_le_bytes(
        bytes[call_offset + 1..call_offset + 5]
            .try_into()
            .expect("4-byte displacement"),
    ) as i64;
    let absolute_target =
        (original_address + (call_offset + call_len) as u64).wrapping_add_signed(displacement);

    let mut replacement = Vec::with_capacity(ABSOLUTE_CALL_LEN);
    replacement.extend(push_reg(Reg::R9));
    replacement.extend([0x49, 0xB9]); // mov r9, imm64
    replacement.extend_from_slice(&absolute_target.to_le_bytes());
    replacement.extend([0x41, 0xFF, 0xD1]); // call r9
    replacement.extend(pop_reg(Reg::R9));
    debug_assert_eq!(replacement.len(), ABSOLUTE_CALL_LEN);

    let mut out = Vec::with_capacity(bytes.len() + ABSOLUTE_CALL_LEN - call_len);
    out.extend_from_slice(&bytes[..call_offset]);
    out.extend_from_slice(&replacement);
    out.extend_from_slice(&bytes[call_offset + call_len..]);
    Ok((out, ABSOLUTE_CALL_LEN))
}
