//! The internal machine form of compiled code.
//!
//! This module owns everything about the word-coded instruction stream:
//! - [`Opcode`] — the instruction set with per-opcode widths
//! - [`StructuralVerifier`] — the default bytecode verifier
//! - [`MachineCode`] — the interpretable internal form a code object
//!   materializes exactly once (opcode copy, instruction boundaries,
//!   embedded-reference offsets, debugging state, executor cells)
//! - [`Assembler`] — a small word emitter used by tests and tools
//!
//! # Encoding
//!
//! An instruction occupies one opcode word (opcode in the low byte) followed
//! by zero or more operand words. `PushRef` operands are raw [`ObjRef`]
//! handles embedded directly in the stream; their offsets are recorded in
//! [`MachineCode::references`] so the collector can relocate them in place.
//!
//! # Mutability
//!
//! The opcode copy is a slice of `AtomicU32` words. After publication it is
//! only written from the GC mark walk, which runs with mutators stopped; all
//! other access is read-only.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::code::CompiledCode;
use crate::dispatch::{self, AtomicExecutor, Executor};
use crate::interop::BytecodeVerifier;
use crate::symbol::Symbol;
use crate::types::{CodeError, JitToken, ObjRef};

// ── Instruction set ──────────────────────────────────────────────────────────

/// One instruction opcode. The discriminant is the low byte of the opcode
/// word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    PushNil = 1,
    PushTrue = 2,
    PushFalse = 3,
    /// Operand: immediate `i32`.
    PushInt = 4,
    /// Operand: index into the literal pool.
    PushLiteral = 5,
    /// Operand: a raw [`ObjRef`] embedded in the stream.
    PushRef = 6,
    /// Operands: message symbol, argument count.
    Send = 7,
    /// Operand: absolute target ip.
    Jump = 8,
    /// Operand: absolute target ip.
    JumpIfFalse = 9,
    Pop = 10,
    Ret = 11,
}

impl Opcode {
    /// Total instruction width in words, opcode word included.
    pub fn width(self) -> usize {
        match self {
            Opcode::Nop
            | Opcode::PushNil
            | Opcode::PushTrue
            | Opcode::PushFalse
            | Opcode::Pop
            | Opcode::Ret => 1,
            Opcode::PushInt
            | Opcode::PushLiteral
            | Opcode::PushRef
            | Opcode::Jump
            | Opcode::JumpIfFalse => 2,
            Opcode::Send => 3,
        }
    }

    /// Decode the opcode byte of an instruction word.
    pub fn decode(word: u32) -> Option<Opcode> {
        Opcode::try_from((word & 0xff) as u8).ok()
    }
}

/// Maximum argument count `Send` may encode.
pub const MAX_SEND_ARGS: u32 = 255;

// ── Structural verifier ──────────────────────────────────────────────────────

/// The default [`BytecodeVerifier`]: structural validation of the body.
///
/// Checks opcode validity, operand-word presence, literal-index range,
/// `Send` argument-count bounds, jump targets landing on instruction
/// boundaries, and `Ret` termination. Pure; mutates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralVerifier;

impl BytecodeVerifier for StructuralVerifier {
    fn verify(&self, code: &CompiledCode) -> Result<(), CodeError> {
        let stream = code.bytecode();
        if stream.is_empty() {
            return Err(CodeError::Verification {
                reason: "empty bytecode body".to_string(),
            });
        }

        let boundaries = scan_boundaries(stream)?;

        let mut ip = 0usize;
        let mut last_op = Opcode::Nop;
        while ip < stream.len() {
            let op = Opcode::decode(stream[ip]).expect("boundary scan validated opcodes");
            match op {
                Opcode::PushLiteral => {
                    let idx = stream[ip + 1] as usize;
                    if idx >= code.literal_count() {
                        return Err(CodeError::Verification {
                            reason: format!(
                                "literal index {idx} out of range at ip {ip} (pool size {})",
                                code.literal_count()
                            ),
                        });
                    }
                }
                Opcode::Send => {
                    let argc = stream[ip + 2];
                    if argc > MAX_SEND_ARGS {
                        return Err(CodeError::Verification {
                            reason: format!("argument count {argc} exceeds {MAX_SEND_ARGS} at ip {ip}"),
                        });
                    }
                }
                Opcode::Jump | Opcode::JumpIfFalse => {
                    let target = stream[ip + 1] as usize;
                    if target >= stream.len() || !boundaries[target] {
                        return Err(CodeError::Verification {
                            reason: format!("jump target {target} at ip {ip} is not an instruction boundary"),
                        });
                    }
                }
                _ => {}
            }
            last_op = op;
            ip += op.width();
        }

        if last_op != Opcode::Ret {
            return Err(CodeError::Verification {
                reason: "bytecode does not end in Ret".to_string(),
            });
        }
        Ok(())
    }
}

/// Walk `stream` by instruction widths and return the boundary map.
///
/// Fails on unknown opcode bytes and on instructions whose operand words run
/// past the end of the stream.
fn scan_boundaries(stream: &[u32]) -> Result<Vec<bool>, CodeError> {
    let mut boundaries = vec![false; stream.len()];
    let mut ip = 0usize;
    while ip < stream.len() {
        let op = Opcode::decode(stream[ip]).ok_or_else(|| CodeError::Verification {
            reason: format!("unknown opcode {:#x} at ip {ip}", stream[ip] & 0xff),
        })?;
        boundaries[ip] = true;
        let width = op.width();
        if ip + width > stream.len() {
            return Err(CodeError::Verification {
                reason: format!("truncated {op:?} at ip {ip}"),
            });
        }
        ip += width;
    }
    Ok(boundaries)
}

// ── Interpreter variants ─────────────────────────────────────────────────────

/// Which interpreter entry the generic fallback selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterpreterVariant {
    Normal = 0,
    Debugging = 1,
}

// ── MachineCode ──────────────────────────────────────────────────────────────

/// The interpretable internal form of a [`CompiledCode`].
///
/// Built once per code object (see `CompiledCode::internalize`), published
/// with release semantics, and never replaced. Interior mutability covers
/// the pieces that legitimately change after publication: the debugging
/// flag, the interpreter variant, the executor cells, jit bookkeeping, and
/// (during stop-the-world marking only) embedded reference words.
pub struct MachineCode {
    opcodes: Box<[AtomicU32]>,
    boundaries: Box<[bool]>,
    references: Vec<usize>,
    call_site_ips: Vec<u32>,
    constant_cache_ips: Vec<u32>,

    debugging: AtomicBool,
    variant: AtomicU8,
    fallback: AtomicExecutor,
    unspecialized: AtomicExecutor,
    jit_eligible: AtomicBool,
    jit_data: AtomicU64,

    name: Symbol,
}

impl MachineCode {
    /// Construct the internal form from a verified code object.
    ///
    /// Copies the opcode stream, computes instruction boundaries, and
    /// records the offsets of embedded references and the ips of send and
    /// reference-load instructions. The fallback executor starts as the
    /// generic interpreter entry; internalization replaces it with a
    /// primitive or argument-shape handler.
    pub fn new(code: &CompiledCode) -> MachineCode {
        let stream = code.bytecode();
        let opcodes: Box<[AtomicU32]> = stream.iter().map(|&w| AtomicU32::new(w)).collect();
        let boundaries = scan_boundaries(stream)
            .expect("MachineCode::new requires verified bytecode")
            .into_boxed_slice();

        let mut references = Vec::new();
        let mut call_site_ips = Vec::new();
        let mut constant_cache_ips = Vec::new();
        let mut ip = 0usize;
        while ip < stream.len() {
            let op = Opcode::decode(stream[ip]).expect("verified stream");
            match op {
                Opcode::PushRef => {
                    references.push(ip + 1);
                    constant_cache_ips.push(ip as u32);
                }
                Opcode::Send => call_site_ips.push(ip as u32),
                _ => {}
            }
            ip += op.width();
        }

        MachineCode {
            opcodes,
            boundaries,
            references,
            call_site_ips,
            constant_cache_ips,
            debugging: AtomicBool::new(false),
            variant: AtomicU8::new(InterpreterVariant::Normal as u8),
            fallback: AtomicExecutor::new(dispatch::interpreter_dispatch),
            unspecialized: AtomicExecutor::empty(),
            jit_eligible: AtomicBool::new(false),
            jit_data: AtomicU64::new(0),
            name: code.name(),
        }
    }

    /// Total length of the opcode stream in words.
    pub fn total(&self) -> usize {
        self.opcodes.len()
    }

    /// True if `ip` falls on an instruction boundary.
    pub fn is_boundary(&self, ip: u32) -> bool {
        self.boundaries.get(ip as usize).copied().unwrap_or(false)
    }

    /// Offsets of operand words holding embedded object references.
    pub fn references(&self) -> &[usize] {
        &self.references
    }

    /// Instruction pointers of `Send` instructions.
    pub fn call_site_ips(&self) -> &[u32] {
        &self.call_site_ips
    }

    /// Instruction pointers of embedded-reference loads.
    pub fn constant_cache_ips(&self) -> &[u32] {
        &self.constant_cache_ips
    }

    /// Read an opcode word.
    pub fn opcode_word(&self, offset: usize) -> u32 {
        self.opcodes[offset].load(Ordering::Relaxed)
    }

    /// Rewrite an opcode word. Only the GC mark walk does this, and only
    /// while mutators are stopped.
    pub(crate) fn store_opcode_word(&self, offset: usize, word: u32) {
        self.opcodes[offset].store(word, Ordering::Relaxed);
    }

    /// The name of the owning code object, for diagnostics.
    pub fn name(&self) -> Symbol {
        self.name
    }

    // ── Debugging state ──────────────────────────────────────────────────

    pub fn debugging(&self) -> bool {
        self.debugging.load(Ordering::Acquire)
    }

    pub fn variant(&self) -> InterpreterVariant {
        if self.variant.load(Ordering::Acquire) == InterpreterVariant::Debugging as u8 {
            InterpreterVariant::Debugging
        } else {
            InterpreterVariant::Normal
        }
    }

    /// Flip the debugging flag and interpreter variant together.
    pub(crate) fn set_debugging(&self, on: bool) {
        let variant = if on {
            InterpreterVariant::Debugging
        } else {
            InterpreterVariant::Normal
        };
        self.debugging.store(on, Ordering::Release);
        self.variant.store(variant as u8, Ordering::Release);
    }

    // ── Executor cells ───────────────────────────────────────────────────

    /// The executor used when no specialized variant matches.
    pub fn fallback(&self) -> Executor {
        self.fallback
            .load()
            .expect("fallback executor is always installed")
    }

    pub(crate) fn set_fallback(&self, f: Executor) {
        self.fallback.store(f);
    }

    /// The generic unspecialized executor, if one has been installed.
    pub fn unspecialized(&self) -> Option<Executor> {
        self.unspecialized.load()
    }

    pub(crate) fn set_unspecialized_fn(&self, f: Executor) {
        self.unspecialized.store(f);
    }

    // ── JIT bookkeeping ──────────────────────────────────────────────────

    pub fn jit_eligible(&self) -> bool {
        self.jit_eligible.load(Ordering::Acquire)
    }

    pub(crate) fn mark_jit_eligible(&self) {
        self.jit_eligible.store(true, Ordering::Release);
    }

    pub fn jit_data(&self) -> JitToken {
        self.jit_data.load(Ordering::Acquire)
    }

    pub(crate) fn set_jit_data(&self, token: JitToken) {
        self.jit_data.store(token, Ordering::Release);
    }
}

impl std::fmt::Debug for MachineCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineCode")
            .field("name", &self.name.as_str())
            .field("total", &self.total())
            .field("references", &self.references.len())
            .field("debugging", &self.debugging())
            .finish()
    }
}

// ── Assembler ────────────────────────────────────────────────────────────────

/// A small instruction-word emitter for building bytecode bodies by hand.
pub struct Assembler {
    words: Vec<u32>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler { words: Vec::new() }
    }

    /// The ip the next emitted instruction will occupy.
    pub fn here(&self) -> u32 {
        self.words.len() as u32
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.words.push(op as u8 as u32);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop)
    }

    pub fn push_nil(&mut self) -> &mut Self {
        self.op(Opcode::PushNil)
    }

    pub fn push_true(&mut self) -> &mut Self {
        self.op(Opcode::PushTrue)
    }

    pub fn push_false(&mut self) -> &mut Self {
        self.op(Opcode::PushFalse)
    }

    pub fn push_int(&mut self, value: i32) -> &mut Self {
        self.op(Opcode::PushInt);
        self.words.push(value as u32);
        self
    }

    pub fn push_literal(&mut self, index: u32) -> &mut Self {
        self.op(Opcode::PushLiteral);
        self.words.push(index);
        self
    }

    pub fn push_ref(&mut self, reference: ObjRef) -> &mut Self {
        self.op(Opcode::PushRef);
        self.words.push(reference.0);
        self
    }

    pub fn send(&mut self, name: Symbol, argc: u32) -> &mut Self {
        self.op(Opcode::Send);
        self.words.push(name.raw());
        self.words.push(argc);
        self
    }

    pub fn jump(&mut self, target: u32) -> &mut Self {
        self.op(Opcode::Jump);
        self.words.push(target);
        self
    }

    pub fn jump_if_false(&mut self, target: u32) -> &mut Self {
        self.op(Opcode::JumpIfFalse);
        self.words.push(target);
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Ret)
    }

    pub fn finish(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.words)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeInfo, CompiledCode};

    fn code_with(bytecode: Vec<u32>, literals: usize) -> CompiledCode {
        CompiledCode::new(CodeInfo {
            bytecode,
            literals: vec![ObjRef(9); literals],
            ..CodeInfo::default()
        })
    }

    #[test]
    fn test_opcode_widths_cover_every_opcode() {
        for raw in 0u8..=11 {
            let op = Opcode::try_from(raw).expect("raw in range");
            assert!(op.width() >= 1 && op.width() <= 3);
        }
        assert!(Opcode::try_from(12u8).is_err(), "13th opcode must not exist");
    }

    #[test]
    fn test_verifier_accepts_minimal_body() {
        let body = Assembler::new().push_nil().ret().finish();
        let code = code_with(body, 0);
        assert_eq!(StructuralVerifier.verify(&code), Ok(()));
    }

    #[test]
    fn test_verifier_rejects_empty_body() {
        let code = code_with(Vec::new(), 0);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        assert!(matches!(err, CodeError::Verification { .. }));
    }

    #[test]
    fn test_verifier_rejects_unknown_opcode() {
        let code = code_with(vec![0xfe], 0);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        let CodeError::Verification { reason } = err else {
            panic!("expected Verification");
        };
        assert!(reason.contains("unknown opcode"), "got: {reason}");
    }

    #[test]
    fn test_verifier_rejects_truncated_operand() {
        // PushInt wants one operand word; the stream ends after the opcode.
        let code = code_with(vec![Opcode::PushInt as u8 as u32], 0);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        let CodeError::Verification { reason } = err else {
            panic!("expected Verification");
        };
        assert!(reason.contains("truncated"), "got: {reason}");
    }

    #[test]
    fn test_verifier_rejects_literal_out_of_range() {
        let body = Assembler::new().push_literal(3).ret().finish();
        let code = code_with(body, 2);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        let CodeError::Verification { reason } = err else {
            panic!("expected Verification");
        };
        assert!(reason.contains("literal index 3"), "got: {reason}");
    }

    #[test]
    fn test_verifier_rejects_mid_instruction_jump_target() {
        // Jump into the operand word of PushInt (ip 1).
        let mut asm = Assembler::new();
        asm.push_int(5); // ips 0..2
        asm.jump(1); //     ips 2..4
        asm.ret();
        let code = code_with(asm.finish(), 0);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        let CodeError::Verification { reason } = err else {
            panic!("expected Verification");
        };
        assert!(reason.contains("not an instruction boundary"), "got: {reason}");
    }

    #[test]
    fn test_verifier_rejects_missing_ret() {
        let body = Assembler::new().push_nil().pop().finish();
        let code = code_with(body, 0);
        let err = StructuralVerifier.verify(&code).unwrap_err();
        let CodeError::Verification { reason } = err else {
            panic!("expected Verification");
        };
        assert!(reason.contains("end in Ret"), "got: {reason}");
    }

    #[test]
    fn test_machine_code_boundaries_and_references() {
        let mut asm = Assembler::new();
        asm.push_ref(ObjRef(77)); // ip 0, operand at offset 1
        asm.push_int(3); //          ip 2
        asm.send(Symbol::intern("frob"), 1); // ip 4
        asm.ret(); //                ip 7
        let code = code_with(asm.finish(), 0);
        StructuralVerifier.verify(&code).expect("valid body");
        let mc = MachineCode::new(&code);

        assert!(mc.is_boundary(0));
        assert!(!mc.is_boundary(1), "operand word is not a boundary");
        assert!(mc.is_boundary(2));
        assert!(mc.is_boundary(4));
        assert!(mc.is_boundary(7));
        assert!(!mc.is_boundary(99));

        assert_eq!(mc.references(), &[1]);
        assert_eq!(mc.call_site_ips(), &[4]);
        assert_eq!(mc.constant_cache_ips(), &[0]);
        assert_eq!(mc.opcode_word(1), 77);
    }

    #[test]
    fn test_debugging_toggle_switches_variant() {
        let body = Assembler::new().push_nil().ret().finish();
        let code = code_with(body, 0);
        let mc = MachineCode::new(&code);
        assert_eq!(mc.variant(), InterpreterVariant::Normal);

        mc.set_debugging(true);
        assert!(mc.debugging());
        assert_eq!(mc.variant(), InterpreterVariant::Debugging);

        mc.set_debugging(false);
        assert!(!mc.debugging());
        assert_eq!(mc.variant(), InterpreterVariant::Normal);
    }
}
