//! Builders for the short x86-64 fragments the engine injects.
//!
//! Everything here is a pure function from inputs to a byte sequence; no
//! builder touches process memory. Encodings are the handful the hooks
//! actually need, not a general assembler.

pub mod reloc;

use crate::error::{Error, Result};

/// Single-byte no-op used for padding.
pub const NOP: u8 = 0x90;

/// Length of the absolute jump stub produced by [`absolute_jump`].
pub const JUMP_STUB_LEN: usize = 14;

/// General-purpose registers for push/pop encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn low(self) -> u8 {
        (self as u8) & 0x7
    }

    fn extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE registers xmm0..xmm7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

/// `push <reg>`
pub fn push_reg(reg: Reg) -> Vec<u8> {
    if reg.extended() {
        vec![0x41, 0x50 + reg.low()]
    } else {
        vec![0x50 + reg.low()]
    }
}

/// `pop <reg>`
pub fn pop_reg(reg: Reg) -> Vec<u8> {
    if reg.extended() {
        vec![0x41, 0x58 + reg.low()]
    } else {
        vec![0x58 + reg.low()]
    }
}

/// `mov rax, [moffs64]` — load rax from an absolute 64-bit address.
pub fn load_rax_from(address: u64) -> Vec<u8> {
    let mut bytes = vec![0x48, 0xA1];
    bytes.extend_from_slice(&address.to_le_bytes());
    bytes
}

/// `mov [moffs64], rax` — store rax to an absolute 64-bit address.
pub fn store_rax_to(address: u64) -> Vec<u8> {
    let mut bytes = vec![0x48, 0xA3];
    bytes.extend_from_slice(&address.to_le_bytes());
    bytes
}

/// `mov dword [rsp+disp8], imm32`
pub fn mov_imm32_to_rsp(disp: u8, imm: u32) -> Vec<u8> {
    let mut bytes = vec![0xC7, 0x44, 0x24, disp];
    bytes.extend_from_slice(&imm.to_le_bytes());
    bytes
}

/// `add rax, imm8`
pub fn add_rax_imm8(imm: u8) -> Vec<u8> {
    vec![0x48, 0x83, 0xC0, imm]
}

/// `sub rsp, imm8`
pub fn sub_rsp_imm8(imm: u8) -> Vec<u8> {
    vec![0x48, 0x83, 0xEC, imm]
}

/// `add rsp, imm8`
pub fn add_rsp_imm8(imm: u8) -> Vec<u8> {
    vec![0x48, 0x83, 0xC4, imm]
}

/// `movdqu [rsp], xmmN` — spill a vector register to the stack.
pub fn movdqu_store_rsp(reg: Xmm) -> Vec<u8> {
    vec![0xF3, 0x0F, 0x7F, 0x04 | ((reg as u8) << 3), 0x24]
}

/// `movdqu xmmN, [rsp]` — restore a vector register from the stack.
pub fn movdqu_load_rsp(reg: Xmm) -> Vec<u8> {
    vec![0xF3, 0x0F, 0x6F, 0x04 | ((reg as u8) << 3), 0x24]
}

/// `xorps xmmN, xmmN` — zero a vector register.
pub fn xorps_self(reg: Xmm) -> Vec<u8> {
    vec![0x0F, 0x57, 0xC0 | ((reg as u8) << 3) | (reg as u8)]
}

/// `mulps dst, src`
pub fn mulps(dst: Xmm, src: Xmm) -> Vec<u8> {
    vec![0x0F, 0x59, 0xC0 | ((dst as u8) << 3) | (src as u8)]
}

/// `addps dst, src`
pub fn addps(dst: Xmm, src: Xmm) -> Vec<u8> {
    vec![0x0F, 0x58, 0xC0 | ((dst as u8) << 3) | (src as u8)]
}

/// Unconditional jump to an absolute 64-bit address, with no register
/// clobber: push the low dword (sign-extended), overwrite the high dword
/// on the stack, then `ret` into the target.
///
/// `push imm32` / `mov [rsp+4], imm32` / `ret` — 14 bytes total.
pub fn absolute_jump(target: u64) -> Vec<u8> {
    let low = (target & 0xFFFF_FFFF) as u32;
    let high = (target >> 32) as u32;

    let mut bytes = Vec::with_capacity(JUMP_STUB_LEN);
    bytes.push(0x68);
    bytes.extend_from_slice(&low.to_le_bytes());
    bytes.extend(mov_imm32_to_rsp(0x04, high));
    bytes.push(0xC3);
    bytes
}

/// Jump stub padded with no-ops to exactly `replace_len` bytes.
///
/// Fails if the stub does not fit — a too-short injection point is a
/// configuration error and must never be silently truncated.
pub fn absolute_jump_padded(target: u64, replace_len: usize) -> Result<Vec<u8>> {
    pad_with_nops(absolute_jump(target), replace_len)
}

/// Verify `replace_len` can hold a jump stub, without generating one.
pub fn check_stub_fits(replace_len: usize) -> Result<()> {
    if replace_len < JUMP_STUB_LEN {
        return Err(Error::PatchSpaceOverflow {
            required: JUMP_STUB_LEN,
            available: replace_len,
        });
    }
    Ok(())
}

/// Extend `bytes` with no-ops to exactly `total_len`.
pub fn pad_with_nops(mut bytes: Vec<u8>, total_len: usize) -> Result<Vec<u8>> {
    if bytes.len() > total_len {
        return Err(Error::PatchSpaceOverflow {
            required: bytes.len(),
            available: total_len,
        });
    }
    bytes.resize(total_len, NOP);
    Ok(bytes)
}

/// Append-style builder for cave bodies, mirroring how hook code is
/// written down: opcode literals interleaved with little-endian immediates.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn append_i16(mut self, value: i16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_i32(mut self, value: i32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Insert `insert` into `bytes` at `at`, returning the combined sequence.
pub fn splice(bytes: &[u8], insert: &[u8], at: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + insert.len());
    out.extend_from_slice(&bytes[..at]);
    out.extend_from_slice(insert);
    out.extend_from_slice(&bytes[at..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_encodings() {
        assert_eq!(push_reg(Reg::Rax), vec![0x50]);
        assert_eq!(push_reg(Reg::Rdx), vec![0x52]);
        assert_eq!(pop_reg(Reg::Rcx), vec![0x59]);
        assert_eq!(push_reg(Reg::R9), vec![0x41, 0x51]);
        assert_eq!(pop_reg(Reg::R9), vec![0x41, 0x59]);
    }

    #[test]
    fn absolute_jump_layout() {
        let stub = absolute_jump(0x1122_3344_5566_7788);
        assert_eq!(stub.len(), JUMP_STUB_LEN);
        assert_eq!(stub[0], 0x68);
        assert_eq!(&stub[1..5], &0x5566_7788u32.to_le_bytes());
        assert_eq!(&stub[5..9], [0xC7, 0x44, 0x24, 0x04]);
        assert_eq!(&stub[9..13], &0x1122_3344u32.to_le_bytes());
        assert_eq!(stub[13], 0xC3);
    }

    #[test]
    fn padded_jump_fills_with_nops() {
        let stub = absolute_jump_padded(0x1000, 0x17).unwrap();
        assert_eq!(stub.len(), 0x17);
        assert!(stub[JUMP_STUB_LEN..].iter().all(|&b| b == NOP));
    }

    #[test]
    fn too_small_injection_point_fails_loudly() {
        let err = absolute_jump_padded(0x1000, 0x0D).unwrap_err();
        assert!(matches!(
            err,
            Error::PatchSpaceOverflow {
                required: JUMP_STUB_LEN,
                available: 0x0D
            }
        ));
        assert!(check_stub_fits(0x0E).is_ok());
    }

    #[test]
    fn vector_encodings_match_known_bytes() {
        // The sequences the speed-multiplier cave uses.
        assert_eq!(movdqu_store_rsp(Xmm::Xmm2), vec![0xF3, 0x0F, 0x7F, 0x14, 0x24]);
        assert_eq!(movdqu_load_rsp(Xmm::Xmm3), vec![0xF3, 0x0F, 0x6F, 0x1C, 0x24]);
        assert_eq!(xorps_self(Xmm::Xmm3), vec![0x0F, 0x57, 0xDB]);
        assert_eq!(mulps(Xmm::Xmm3, Xmm::Xmm2), vec![0x0F, 0x59, 0xDA]);
        assert_eq!(addps(Xmm::Xmm0, Xmm::Xmm3), vec![0x0F, 0x58, 0xC3]);
    }

    #[test]
    fn code_buffer_appends_little_endian() {
        let bytes = CodeBuffer::new()
            .append(&[0x48, 0xA3])
            .append_u64(0x0102_0304_0506_0708)
            .append_i32(-1)
            .into_vec();
        assert_eq!(&bytes[..2], [0x48, 0xA3]);
        assert_eq!(&bytes[2..10], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[10..], &(-1i32).to_le_bytes());
    }

    #[test]
    fn splice_inserts_mid_sequence() {
        let out = splice(&[1, 2, 3, 4], &[9, 9], 2);
        assert_eq!(out, vec![1, 2, 9, 9, 3, 4]);
    }
}
