//! Script interpreter.

use std::str;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::host::{Crypto, ScriptTable, Signable};
use crate::interop::InteropDispatch;
use crate::op_code::{is_push, OpCode, LAST_PUSH, PUSHBYTES_MAX, PUSHBYTES_MIN};
use crate::stack_item::StackItem;

/// Hard bound on executed control/operator opcodes per interpreter.
///
/// Counted once for every opcode above the numeric-push block; CHECKMULTISIG
/// additionally charges its public-key count. The counter spans nested
/// invocations and successive `execute_script` calls on one interpreter.
pub const MAX_STEPS: usize = 1200;

/// Longest method name accepted by `SYSCALL`.
const MAX_SYSCALL_NAME: usize = 252;

/// Why the interpreter faulted. Purely diagnostic: the observable outcome of
/// a script is the boolean returned by [`Interpreter::execute_script`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultReason {
    /// No fault recorded.
    None,
    /// An opcode found fewer operands than it needs.
    StackUnderflow,
    /// FROMALTSTACK on an empty alt stack.
    AltStackUnderflow,
    /// Unassigned opcode byte.
    BadOpcode,
    /// A decode read past the end of the script.
    TruncatedScript,
    /// Non-push opcode in push-only mode.
    NotPushOnly,
    /// Op counter exceeded [`MAX_STEPS`].
    StepLimit,
    /// Control-transfer target outside `[0, script.len()]`.
    JumpOutOfRange,
    /// A view conversion was undefined for the operand's kind.
    TypeMismatch,
    /// Element counts of a binary elementwise op differ.
    CountMismatch,
    /// Negative or out-of-bounds count, index, or length field.
    InvalidOperand,
    /// A narrowing integer cast failed.
    NumericRange,
    /// Zero divisor in DIV or MOD.
    DivisionByZero,
    /// Aggregate opcode over an empty sequence.
    EmptyAggregate,
    /// APPCALL hash not present in the script table.
    UnknownScript,
    /// SYSCALL to an unregistered name, a non-UTF-8 name, or a handler that
    /// returned false.
    SyscallFailed,
    /// The final stack of a verification run was not a single truthy item.
    EvalFalse,
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use FaultReason::*;

        let description = match *self {
            None => "no fault recorded",
            StackUnderflow => "stack underflow",
            AltStackUnderflow => "alt stack underflow",
            BadOpcode => "unassigned opcode byte",
            TruncatedScript => "read past end of script",
            NotPushOnly => "non-push opcode in push-only mode",
            StepLimit => "op counter exceeded the step limit",
            JumpOutOfRange => "control transfer target out of range",
            TypeMismatch => "undefined view conversion for operand kind",
            CountMismatch => "element count mismatch",
            InvalidOperand => "invalid count, index, or length field",
            NumericRange => "integer cast out of range",
            DivisionByZero => "division by zero",
            EmptyAggregate => "aggregate over an empty sequence",
            UnknownScript => "unknown script hash",
            SyscallFailed => "interop call failed",
            EvalFalse => "script evaluated to false",
        };
        f.write_str(description)
    }
}

impl std::error::Error for FaultReason {}

/// Terminal condition of the most recent `execute_script` call.
///
/// `None` means the frame ran off the end of its byte stream, which counts
/// as success like `Halt` does.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmState {
    None,
    Halt,
    Fault,
}

enum Flow {
    Continue,
    Halt,
}

/// Cursor over a script's byte stream with fallible reads.
struct ScriptReader<'s> {
    script: &'s [u8],
    position: usize,
}

impl<'s> ScriptReader<'s> {
    fn new(script: &'s [u8]) -> Self {
        Self {
            script,
            position: 0,
        }
    }

    fn len(&self) -> usize {
        self.script.len()
    }

    fn position(&self) -> usize {
        self.position
    }

    fn at_end(&self) -> bool {
        self.position >= self.script.len()
    }

    fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn read_byte(&mut self) -> Result<u8, FaultReason> {
        let byte = *self
            .script
            .get(self.position)
            .ok_or(FaultReason::TruncatedScript)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'s [u8], FaultReason> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.script.len())
            .ok_or(FaultReason::TruncatedScript)?;
        let bytes = &self.script[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> Result<u16, FaultReason> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_i16(&mut self) -> Result<i16, FaultReason> {
        Ok(self.read_u16()? as i16)
    }

    fn read_u32(&mut self) -> Result<u32, FaultReason> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, FaultReason> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64, FaultReason> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a varint length prefix, then that many bytes. Lengths above
    /// `max` are malformed.
    fn read_var_bytes(&mut self, max: usize) -> Result<&'s [u8], FaultReason> {
        let length = match self.read_byte()? {
            0xFD => self.read_u16()? as u64,
            0xFE => self.read_u32()? as u64,
            0xFF => self.read_u64()?,
            prefix => prefix as u64,
        };
        if length > max as u64 {
            return Err(FaultReason::InvalidOperand);
        }
        self.read_bytes(length as usize)
    }
}

/// The virtual machine.
///
/// Owns the evaluation and alt stacks, which nested `APPCALL` frames share;
/// bound for its lifetime to a [`Signable`] and a [`Crypto`] provider, and
/// optionally to a [`ScriptTable`]. Strictly single-threaded and
/// synchronous.
pub struct Interpreter<'h> {
    signable: &'h dyn Signable,
    crypto: &'h dyn Crypto,
    table: Option<&'h dyn ScriptTable>,
    interop: InteropDispatch,
    stack: Vec<StackItem>,
    alt_stack: Vec<StackItem>,
    /// Scripts of the active frames, entry first.
    frames: Vec<Vec<u8>>,
    op_count: usize,
    state: VmState,
    last_fault: FaultReason,
}

impl<'h> Interpreter<'h> {
    /// Interpreter with the reserved `System.ScriptEngine.*` interops
    /// pre-registered and no script table (APPCALL faults).
    pub fn new(signable: &'h dyn Signable, crypto: &'h dyn Crypto) -> Self {
        Self {
            signable,
            crypto,
            table: None,
            interop: InteropDispatch::with_builtins(),
            stack: Vec::new(),
            alt_stack: Vec::new(),
            frames: Vec::new(),
            op_count: 0,
            state: VmState::None,
            last_fault: FaultReason::None,
        }
    }

    pub fn with_script_table(mut self, table: &'h dyn ScriptTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Registers a host interop; `false` when the name is already taken.
    pub fn register_interop<F>(&mut self, name: &str, handler: F) -> bool
    where
        F: Fn(&mut Interpreter<'_>) -> bool + 'static,
    {
        self.interop.register(name, handler)
    }

    /// Dispatches a registered interop by name; `false` when the name is
    /// unknown or the handler reports failure.
    pub fn invoke_interop(&mut self, name: &str) -> bool {
        match self.interop.get(name) {
            Some(handler) => (&*handler)(self),
            None => false,
        }
    }

    /// Executes `script` as a frame on the shared stacks.
    ///
    /// Returns `true` on HALT or on running off the end of the stream,
    /// `false` on any fault. In push-only mode every opcode must belong to
    /// the push block. Nested frames opened by `APPCALL` re-enter here.
    pub fn execute_script(&mut self, script: &[u8], push_only: bool) -> bool {
        self.frames.push(script.to_vec());
        let result = self.run_frame(script, push_only);
        self.frames.pop();
        match result {
            Ok(state) => {
                self.state = state;
                true
            }
            Err(fault) => {
                self.last_fault = fault;
                self.state = VmState::Fault;
                false
            }
        }
    }

    /// Terminal condition of the most recent frame.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Diagnostic detail for the most recent fault.
    pub fn last_fault(&self) -> FaultReason {
        self.last_fault
    }

    pub fn signable(&self) -> &dyn Signable {
        self.signable
    }

    pub fn crypto(&self) -> &dyn Crypto {
        self.crypto
    }

    /// Evaluation stack, bottom first.
    pub fn stack(&self) -> &[StackItem] {
        &self.stack
    }

    pub fn alt_stack(&self) -> &[StackItem] {
        &self.alt_stack
    }

    pub fn op_count(&self) -> usize {
        self.op_count
    }

    pub fn push(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    pub fn pop(&mut self) -> Option<StackItem> {
        self.stack.pop()
    }

    pub fn peek(&self) -> Option<&StackItem> {
        self.stack.last()
    }

    /// Byte-code of the current frame; empty outside execution.
    pub fn executing_script(&self) -> &[u8] {
        self.frames.last().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Byte-code of the frame that invoked the current one; empty for the
    /// entry frame.
    pub fn calling_script(&self) -> &[u8] {
        match self.frames.len() {
            0 | 1 => &[],
            depth => &self.frames[depth - 2],
        }
    }

    /// Byte-code of the outermost frame; empty outside execution.
    pub fn entry_script(&self) -> &[u8] {
        self.frames.first().map(Vec::as_slice).unwrap_or(&[])
    }

    fn run_frame(&mut self, script: &[u8], push_only: bool) -> Result<VmState, FaultReason> {
        let mut reader = ScriptReader::new(script);
        while !reader.at_end() {
            let opcode = reader.read_byte()?;
            if push_only && !is_push(opcode) {
                return Err(FaultReason::NotPushOnly);
            }
            match self.execute_op(opcode, &mut reader)? {
                Flow::Continue => {}
                Flow::Halt => return Ok(VmState::Halt),
            }
        }
        Ok(VmState::None)
    }

    fn execute_op(
        &mut self,
        opcode: u8,
        reader: &mut ScriptReader<'_>,
    ) -> Result<Flow, FaultReason> {
        if opcode > LAST_PUSH {
            self.op_count += 1;
            if self.op_count > MAX_STEPS {
                return Err(FaultReason::StepLimit);
            }
        }

        if (PUSHBYTES_MIN..=PUSHBYTES_MAX).contains(&opcode) {
            let data = reader.read_bytes(opcode as usize)?;
            self.stack.push(StackItem::from(data));
            return Ok(Flow::Continue);
        }

        let op = OpCode::from_byte(opcode).ok_or(FaultReason::BadOpcode)?;

        match op {
            OpCode::Push0 => self.stack.push(StackItem::from(Vec::<u8>::new())),
            OpCode::PushData1 => {
                let length = reader.read_byte()? as usize;
                let data = reader.read_bytes(length)?;
                self.stack.push(StackItem::from(data));
            }
            OpCode::PushData2 => {
                let length = reader.read_u16()? as usize;
                let data = reader.read_bytes(length)?;
                self.stack.push(StackItem::from(data));
            }
            OpCode::PushData4 => {
                let length = reader.read_i32()?;
                if length < 0 {
                    return Err(FaultReason::InvalidOperand);
                }
                let data = reader.read_bytes(length as usize)?;
                self.stack.push(StackItem::from(data));
            }
            OpCode::PushNeg1 => self.stack.push(StackItem::from(-1i64)),
            OpCode::Push1
            | OpCode::Push2
            | OpCode::Push3
            | OpCode::Push4
            | OpCode::Push5
            | OpCode::Push6
            | OpCode::Push7
            | OpCode::Push8
            | OpCode::Push9
            | OpCode::Push10
            | OpCode::Push11
            | OpCode::Push12
            | OpCode::Push13
            | OpCode::Push14
            | OpCode::Push15
            | OpCode::Push16 => {
                let value = (op.to_u8() - OpCode::Push1.to_u8() + 1) as i64;
                self.stack.push(StackItem::from(value));
            }

            OpCode::Nop => {}
            OpCode::Jmp | OpCode::JmpIf | OpCode::JmpIfNot => {
                self.op_jump(op, reader)?;
            }
            OpCode::Call => {
                // The return address skips the two displacement bytes.
                let return_address = reader.position() + 2;
                self.stack
                    .push(StackItem::from(BigInt::from(return_address)));
                self.op_jump(OpCode::Jmp, reader)?;
            }
            OpCode::Ret => {
                let result = self.pop_item()?;
                let position = self
                    .pop_item()?
                    .to_int()
                    .ok_or(FaultReason::TypeMismatch)?
                    .to_usize()
                    .ok_or(FaultReason::NumericRange)?;
                if position > reader.len() {
                    return Err(FaultReason::JumpOutOfRange);
                }
                self.stack.push(result);
                reader.seek(position);
            }
            OpCode::AppCall => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(reader.read_bytes(20)?);
                let table = self.table.ok_or(FaultReason::UnknownScript)?;
                let script = table
                    .get_script(&hash)
                    .ok_or(FaultReason::UnknownScript)?;
                if !self.execute_script(&script, false) {
                    return Err(self.last_fault);
                }
            }
            OpCode::Syscall => {
                let raw = reader.read_var_bytes(MAX_SYSCALL_NAME)?;
                let name = str::from_utf8(raw).map_err(|_| FaultReason::SyscallFailed)?;
                if !self.invoke_interop(name) {
                    return Err(FaultReason::SyscallFailed);
                }
            }
            OpCode::HaltIfNot => {
                let top = self.stack.last().ok_or(FaultReason::StackUnderflow)?;
                let truthy = top.to_bool().ok_or(FaultReason::TypeMismatch)?;
                if truthy {
                    self.stack.pop();
                } else {
                    // A falsy coercion halts without consuming the operand.
                    return Ok(Flow::Halt);
                }
            }
            OpCode::Halt => return Ok(Flow::Halt),

            OpCode::ToAltStack => {
                let item = self.pop_item()?;
                self.alt_stack.push(item);
            }
            OpCode::FromAltStack => {
                let item = self
                    .alt_stack
                    .pop()
                    .ok_or(FaultReason::AltStackUnderflow)?;
                self.stack.push(item);
            }
            OpCode::Drop2 => {
                self.require_stack(2)?;
                self.stack.pop();
                self.stack.pop();
            }
            OpCode::Dup2 => {
                self.require_stack(2)?;
                let len = self.stack.len();
                let first = self.stack[len - 2].clone();
                let second = self.stack[len - 1].clone();
                self.stack.push(first);
                self.stack.push(second);
            }
            OpCode::Dup3 => {
                self.require_stack(3)?;
                let len = self.stack.len();
                let first = self.stack[len - 3].clone();
                let second = self.stack[len - 2].clone();
                let third = self.stack[len - 1].clone();
                self.stack.push(first);
                self.stack.push(second);
                self.stack.push(third);
            }
            OpCode::Over2 => {
                self.require_stack(4)?;
                let len = self.stack.len();
                let first = self.stack[len - 4].clone();
                let second = self.stack[len - 3].clone();
                self.stack.push(first);
                self.stack.push(second);
            }
            OpCode::Rot2 => {
                self.require_stack(6)?;
                let len = self.stack.len();
                let first = self.stack[len - 6].clone();
                let second = self.stack[len - 5].clone();
                self.stack.drain(len - 6..len - 4);
                self.stack.push(first);
                self.stack.push(second);
            }
            OpCode::Swap2 => {
                self.require_stack(4)?;
                let len = self.stack.len();
                self.stack.swap(len - 4, len - 2);
                self.stack.swap(len - 3, len - 1);
            }
            OpCode::IfDup => {
                let top = self.stack.last().ok_or(FaultReason::StackUnderflow)?;
                let truthy = top.to_bool().ok_or(FaultReason::TypeMismatch)?;
                if truthy {
                    let copy = self.stack[self.stack.len() - 1].clone();
                    self.stack.push(copy);
                }
            }
            OpCode::Depth => {
                let depth = BigInt::from(self.stack.len());
                self.stack.push(StackItem::from(depth));
            }
            OpCode::Drop => {
                self.pop_item()?;
            }
            OpCode::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or(FaultReason::StackUnderflow)?;
                self.stack.push(top);
            }
            OpCode::Nip => {
                self.require_stack(2)?;
                let index = self.stack.len() - 2;
                self.stack.remove(index);
            }
            OpCode::Over => {
                self.require_stack(2)?;
                let item = self.stack[self.stack.len() - 2].clone();
                self.stack.push(item);
            }
            OpCode::Pick => {
                let depth = self.pop_index()?;
                if depth >= self.stack.len() {
                    return Err(FaultReason::StackUnderflow);
                }
                let index = self.stack.len() - 1 - depth;
                let item = self.stack[index].clone();
                self.stack.push(item);
            }
            OpCode::Roll => {
                let depth = self.pop_index()?;
                if depth >= self.stack.len() {
                    return Err(FaultReason::StackUnderflow);
                }
                let index = self.stack.len() - 1 - depth;
                let item = self.stack.remove(index);
                self.stack.push(item);
            }
            OpCode::Rot => {
                self.require_stack(3)?;
                let len = self.stack.len();
                self.stack.swap(len - 3, len - 2);
                self.stack.swap(len - 2, len - 1);
            }
            OpCode::Swap => {
                self.require_stack(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 2, len - 1);
            }
            OpCode::Tuck => {
                self.require_stack(2)?;
                let len = self.stack.len();
                let top = self.stack[len - 1].clone();
                self.stack.insert(len - 2, top);
            }

            OpCode::Cat => {
                let (a, b) = self.pop_bytes_pair()?;
                let joined = a
                    .into_iter()
                    .zip(b)
                    .map(|(mut left, right)| {
                        left.extend(right);
                        left
                    })
                    .collect();
                self.stack.push(StackItem::Bytes(joined));
            }
            OpCode::SubStr => {
                let count = self.pop_index()?;
                let index = self.pop_index()?;
                let strings = self.pop_bytes_view()?;
                let sliced = strings
                    .into_iter()
                    .map(|s| {
                        let start = index.min(s.len());
                        let end = index.saturating_add(count).min(s.len());
                        s[start..end].to_vec()
                    })
                    .collect();
                self.stack.push(StackItem::Bytes(sliced));
            }
            OpCode::Left => {
                let count = self.pop_index()?;
                let strings = self.pop_bytes_view()?;
                let sliced = strings
                    .into_iter()
                    .map(|mut s| {
                        s.truncate(count);
                        s
                    })
                    .collect();
                self.stack.push(StackItem::Bytes(sliced));
            }
            OpCode::Right => {
                let count = self.pop_index()?;
                let strings = self.pop_bytes_view()?;
                if strings.iter().any(|s| s.len() < count) {
                    return Err(FaultReason::InvalidOperand);
                }
                let sliced = strings
                    .into_iter()
                    .map(|s| s[s.len() - count..].to_vec())
                    .collect();
                self.stack.push(StackItem::Bytes(sliced));
            }
            OpCode::Size => {
                let strings = self.pop_bytes_view()?;
                let sizes = strings.iter().map(|s| BigInt::from(s.len())).collect();
                self.stack.push(StackItem::Int(sizes));
            }

            OpCode::Invert => {
                let values = self.pop_int_view()?;
                let inverted: Vec<BigInt> = values
                    .into_iter()
                    .map(|n| -(n + BigInt::from(1)))
                    .collect();
                self.stack.push(StackItem::Int(inverted));
            }
            OpCode::And | OpCode::Or | OpCode::Xor => {
                let (a, b) = self.pop_int_pair()?;
                let f: fn(BigInt, BigInt) -> BigInt = match op {
                    OpCode::And => |a, b| a & b,
                    OpCode::Or => |a, b| a | b,
                    _ => |a, b| a ^ b,
                };
                let out = a.into_iter().zip(b).map(|(a, b)| f(a, b)).collect();
                self.stack.push(StackItem::Int(out));
            }
            OpCode::Equal => {
                let (a, b) = self.pop_bytes_pair()?;
                let out = a.iter().zip(b.iter()).map(|(a, b)| a == b).collect();
                self.stack.push(StackItem::Bool(out));
            }

            OpCode::Add1
            | OpCode::Sub1
            | OpCode::Mul2
            | OpCode::Div2
            | OpCode::Negate
            | OpCode::Abs => {
                let values = self.pop_int_view()?;
                let f: fn(BigInt) -> BigInt = match op {
                    OpCode::Add1 => |n| n + 1,
                    OpCode::Sub1 => |n| n - 1,
                    OpCode::Mul2 => |n| n << 1usize,
                    OpCode::Div2 => |n| n >> 1usize,
                    OpCode::Negate => |n| -n,
                    _ => |n| n.abs(),
                };
                let out = values.into_iter().map(f).collect();
                self.stack.push(StackItem::Int(out));
            }
            OpCode::Not => {
                let flags = self.pop_bool_view()?;
                let out = flags.into_iter().map(|b| !b).collect();
                self.stack.push(StackItem::Bool(out));
            }
            OpCode::NotZero => {
                let values = self.pop_int_view()?;
                let out = values.iter().map(|n| !n.is_zero()).collect();
                self.stack.push(StackItem::Bool(out));
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Min
            | OpCode::Max => {
                let (a, b) = self.pop_int_pair()?;
                if matches!(op, OpCode::Div | OpCode::Mod) && b.iter().any(Zero::is_zero) {
                    return Err(FaultReason::DivisionByZero);
                }
                let f: fn(BigInt, BigInt) -> BigInt = match op {
                    OpCode::Add => |a, b| a + b,
                    OpCode::Sub => |a, b| a - b,
                    OpCode::Mul => |a, b| a * b,
                    OpCode::Div => |a, b| a / b,
                    OpCode::Mod => |a, b| a % b,
                    OpCode::Min => |a, b| a.min(b),
                    _ => |a, b| a.max(b),
                };
                let out = a.into_iter().zip(b).map(|(a, b)| f(a, b)).collect();
                self.stack.push(StackItem::Int(out));
            }
            OpCode::Shl | OpCode::Shr => {
                let (a, b) = self.pop_int_pair()?;
                let mut out = Vec::with_capacity(a.len());
                for (value, amount) in a.into_iter().zip(b) {
                    let amount = amount.to_i32().ok_or(FaultReason::NumericRange)?;
                    out.push(shift_integer(value, op == OpCode::Shl, amount));
                }
                self.stack.push(StackItem::Int(out));
            }
            OpCode::BoolAnd | OpCode::BoolOr => {
                let (a, b) = self.pop_bool_pair()?;
                let out = a
                    .into_iter()
                    .zip(b)
                    .map(|(a, b)| if op == OpCode::BoolAnd { a && b } else { a || b })
                    .collect();
                self.stack.push(StackItem::Bool(out));
            }
            OpCode::NumEqual
            | OpCode::NumNotEqual
            | OpCode::Lt
            | OpCode::Gt
            | OpCode::Le
            | OpCode::Ge => {
                let (a, b) = self.pop_int_pair()?;
                let f: fn(&BigInt, &BigInt) -> bool = match op {
                    OpCode::NumEqual => |a, b| a == b,
                    OpCode::NumNotEqual => |a, b| a != b,
                    OpCode::Lt => |a, b| a < b,
                    OpCode::Gt => |a, b| a > b,
                    OpCode::Le => |a, b| a <= b,
                    _ => |a, b| a >= b,
                };
                let out = a.iter().zip(b.iter()).map(|(a, b)| f(a, b)).collect();
                self.stack.push(StackItem::Bool(out));
            }
            OpCode::Within => {
                let upper = self.pop_int_view()?;
                let lower = self.pop_int_view()?;
                let values = self.pop_int_view()?;
                if values.len() != lower.len() || values.len() != upper.len() {
                    return Err(FaultReason::CountMismatch);
                }
                let out = values
                    .iter()
                    .zip(lower.iter().zip(upper.iter()))
                    .map(|(x, (lo, hi))| lo <= x && x < hi)
                    .collect();
                self.stack.push(StackItem::Bool(out));
            }

            OpCode::Sha1 => self.op_hash_elementwise(|data| Sha1::digest(data).to_vec())?,
            OpCode::Sha256 => self.op_hash_elementwise(|data| Sha256::digest(data).to_vec())?,
            OpCode::Hash160 => {
                let crypto = self.crypto;
                self.op_hash_elementwise(|data| crypto.hash160(data).to_vec())?;
            }
            OpCode::Hash256 => {
                let crypto = self.crypto;
                self.op_hash_elementwise(|data| crypto.hash256(data).to_vec())?;
            }
            OpCode::CheckSig => self.op_checksig()?,
            OpCode::CheckMultiSig => self.op_checkmultisig()?,

            OpCode::ArraySize => {
                let item = self.pop_item()?;
                self.stack.push(StackItem::from(BigInt::from(item.count())));
            }
            OpCode::Pack => {
                let count = self.pop_index()?;
                self.require_stack(count)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop_item()?);
                }
                // Popped top-first; the old top of stack becomes the last
                // element.
                items.reverse();
                self.stack.push(StackItem::Array(items));
            }
            OpCode::Unpack => {
                let item = self.pop_item()?;
                let elements = item.as_array().ok_or(FaultReason::TypeMismatch)?.to_vec();
                let length = elements.len();
                for element in elements {
                    self.stack.push(element);
                }
                self.stack.push(StackItem::from(BigInt::from(length)));
            }
            OpCode::Distinct => {
                let item = self.pop_item()?;
                let distinct = item.distinct_slots().ok_or(FaultReason::TypeMismatch)?;
                self.stack.push(distinct);
            }
            OpCode::Sort => {
                let mut values = self.pop_int_view()?;
                values.sort();
                self.stack.push(StackItem::Int(values));
            }
            OpCode::Reverse => {
                let item = self.pop_item()?;
                let reversed = item.reverse_slots().ok_or(FaultReason::TypeMismatch)?;
                self.stack.push(reversed);
            }
            OpCode::Concat | OpCode::Union => {
                let count = self.pop_index()?;
                if count < 1 {
                    return Err(FaultReason::InvalidOperand);
                }
                let mut item = self.pop_item()?;
                // Later pops were pushed earlier and become the prefix.
                for _ in 1..count {
                    item = self
                        .pop_item()?
                        .concat(item)
                        .ok_or(FaultReason::TypeMismatch)?;
                }
                if op == OpCode::Union {
                    item = item.distinct_slots().ok_or(FaultReason::TypeMismatch)?;
                }
                self.stack.push(item);
            }
            OpCode::Intersect => {
                let count = self.pop_index()?;
                if count < 1 {
                    return Err(FaultReason::InvalidOperand);
                }
                let mut item = self.pop_item()?;
                for _ in 1..count {
                    item = self
                        .pop_item()?
                        .intersect(&item)
                        .ok_or(FaultReason::TypeMismatch)?;
                }
                self.stack.push(item);
            }
            OpCode::Except => {
                let x2 = self.pop_item()?;
                let x1 = self.pop_item()?;
                let difference = x1.except(&x2).ok_or(FaultReason::TypeMismatch)?;
                self.stack.push(difference);
            }
            OpCode::Take => {
                let count = self.pop_index()?;
                let item = self.pop_item()?;
                let taken = item.take_slots(count).ok_or(FaultReason::TypeMismatch)?;
                self.stack.push(taken);
            }
            OpCode::Skip => {
                let count = self.pop_index()?;
                let item = self.pop_item()?;
                let rest = item.skip_slots(count).ok_or(FaultReason::TypeMismatch)?;
                self.stack.push(rest);
            }
            OpCode::PickItem => {
                let index = self.pop_index()?;
                let item = self.pop_item()?;
                // A scalar byte-string indexes into its bytes; everything
                // else indexes into element slots.
                let element = match &item {
                    StackItem::Bytes(strings) if strings.len() == 1 => strings[0]
                        .get(index)
                        .map(|&byte| StackItem::from(vec![byte])),
                    other => other.element(index),
                }
                .ok_or(FaultReason::InvalidOperand)?;
                self.stack.push(element);
            }
            OpCode::All | OpCode::Any => {
                let flags = self.pop_bool_view()?;
                let result = if op == OpCode::All {
                    flags.iter().all(|&b| b)
                } else {
                    flags.iter().any(|&b| b)
                };
                self.stack.push(StackItem::from(result));
            }
            OpCode::Sum | OpCode::Average => {
                let values = self.pop_int_view()?;
                if op == OpCode::Average && values.is_empty() {
                    return Err(FaultReason::EmptyAggregate);
                }
                let sum = values
                    .iter()
                    .fold(BigInt::zero(), |acc, value| acc + value);
                let result = if op == OpCode::Average {
                    sum / BigInt::from(values.len())
                } else {
                    sum
                };
                self.stack.push(StackItem::from(result));
            }
            OpCode::MaxItem | OpCode::MinItem => {
                let values = self.pop_int_view()?;
                let result = if op == OpCode::MaxItem {
                    values.into_iter().max()
                } else {
                    values.into_iter().min()
                }
                .ok_or(FaultReason::EmptyAggregate)?;
                self.stack.push(StackItem::from(result));
            }
        }

        Ok(Flow::Continue)
    }

    /// JMP/JMPIF/JMPIFNOT. The signed displacement is relative to the
    /// opcode's own offset; the valid target range is `[0, script.len()]`.
    fn op_jump(&mut self, op: OpCode, reader: &mut ScriptReader<'_>) -> Result<(), FaultReason> {
        let base = reader.position() - 1;
        let displacement = reader.read_i16()? as isize;
        let target = base as isize + displacement;
        if target < 0 || target > reader.len() as isize {
            return Err(FaultReason::JumpOutOfRange);
        }
        let mut jump = true;
        if op != OpCode::Jmp {
            let condition = self.pop_item()?;
            let mut truthy = condition.to_bool().ok_or(FaultReason::TypeMismatch)?;
            if op == OpCode::JmpIfNot {
                truthy = !truthy;
            }
            jump = truthy;
        }
        if jump {
            reader.seek(target as usize);
        }
        Ok(())
    }

    fn op_hash_elementwise(
        &mut self,
        hash: impl Fn(&[u8]) -> Vec<u8>,
    ) -> Result<(), FaultReason> {
        let strings = self.pop_bytes_view()?;
        let digests = strings.iter().map(|s| hash(s)).collect();
        self.stack.push(StackItem::Bytes(digests));
        Ok(())
    }

    fn op_checksig(&mut self) -> Result<(), FaultReason> {
        let pubkey = self.pop_bytes()?;
        let signature = self.pop_bytes()?;
        let message = self.signable.message();
        let valid = self.crypto.verify(&message, &signature, &pubkey);
        self.stack.push(StackItem::from(valid));
        Ok(())
    }

    fn op_checkmultisig(&mut self) -> Result<(), FaultReason> {
        let n = self.pop_index()?;
        if n < 1 {
            return Err(FaultReason::InvalidOperand);
        }
        // The key count charges the op counter before any verification.
        self.op_count += n;
        if self.op_count > MAX_STEPS {
            return Err(FaultReason::StepLimit);
        }
        self.require_stack(n)?;
        let mut pubkeys = Vec::with_capacity(n);
        for _ in 0..n {
            pubkeys.push(self.pop_bytes()?);
        }

        let m = self.pop_index()?;
        if m < 1 || m > n {
            return Err(FaultReason::InvalidOperand);
        }
        let mut signatures = Vec::with_capacity(m);
        for _ in 0..m {
            signatures.push(self.pop_bytes()?);
        }

        // Two-pointer match over the popped (reversed) orders: a signature
        // pointer that only advances on a successful verification, a key
        // pointer that advances every round, and an early abort once the
        // remaining signatures outnumber the remaining keys.
        let message = self.signable.message();
        let mut success = true;
        let mut sig_index = 0usize;
        let mut key_index = 0usize;
        while success && sig_index < m && key_index < n {
            if self
                .crypto
                .verify(&message, &signatures[sig_index], &pubkeys[key_index])
            {
                sig_index += 1;
            }
            key_index += 1;
            if m - sig_index > n - key_index {
                success = false;
            }
        }
        self.stack.push(StackItem::from(success));
        Ok(())
    }

    fn require_stack(&self, depth: usize) -> Result<(), FaultReason> {
        if self.stack.len() < depth {
            Err(FaultReason::StackUnderflow)
        } else {
            Ok(())
        }
    }

    fn pop_item(&mut self) -> Result<StackItem, FaultReason> {
        self.stack.pop().ok_or(FaultReason::StackUnderflow)
    }

    fn pop_bytes(&mut self) -> Result<Vec<u8>, FaultReason> {
        self.pop_item()?
            .to_bytes()
            .ok_or(FaultReason::TypeMismatch)
    }

    /// Pops a scalar integer and narrows it to a non-negative index.
    fn pop_index(&mut self) -> Result<usize, FaultReason> {
        self.pop_item()?
            .to_int()
            .ok_or(FaultReason::TypeMismatch)?
            .to_usize()
            .ok_or(FaultReason::InvalidOperand)
    }

    fn pop_bytes_view(&mut self) -> Result<Vec<Vec<u8>>, FaultReason> {
        self.pop_item()?
            .as_bytes_array()
            .ok_or(FaultReason::TypeMismatch)
    }

    fn pop_int_view(&mut self) -> Result<Vec<BigInt>, FaultReason> {
        self.pop_item()?
            .as_int_array()
            .ok_or(FaultReason::TypeMismatch)
    }

    fn pop_bool_view(&mut self) -> Result<Vec<bool>, FaultReason> {
        self.pop_item()?
            .as_bool_array()
            .ok_or(FaultReason::TypeMismatch)
    }

    /// Pops two operands for a binary elementwise integer op; the deeper
    /// operand comes first. Element counts must match.
    fn pop_int_pair(&mut self) -> Result<(Vec<BigInt>, Vec<BigInt>), FaultReason> {
        let x2 = self.pop_item()?;
        let x1 = self.pop_item()?;
        if x1.count() != x2.count() {
            return Err(FaultReason::CountMismatch);
        }
        let b = x2.as_int_array().ok_or(FaultReason::TypeMismatch)?;
        let a = x1.as_int_array().ok_or(FaultReason::TypeMismatch)?;
        Ok((a, b))
    }

    fn pop_bool_pair(&mut self) -> Result<(Vec<bool>, Vec<bool>), FaultReason> {
        let x2 = self.pop_item()?;
        let x1 = self.pop_item()?;
        if x1.count() != x2.count() {
            return Err(FaultReason::CountMismatch);
        }
        let b = x2.as_bool_array().ok_or(FaultReason::TypeMismatch)?;
        let a = x1.as_bool_array().ok_or(FaultReason::TypeMismatch)?;
        Ok((a, b))
    }

    fn pop_bytes_pair(&mut self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), FaultReason> {
        let x2 = self.pop_item()?;
        let x1 = self.pop_item()?;
        if x1.count() != x2.count() {
            return Err(FaultReason::CountMismatch);
        }
        let b = x2.as_bytes_array().ok_or(FaultReason::TypeMismatch)?;
        let a = x1.as_bytes_array().ok_or(FaultReason::TypeMismatch)?;
        Ok((a, b))
    }
}

/// A negative amount shifts the opposite direction, mirroring the reference
/// engine's BigInteger semantics.
fn shift_integer(value: BigInt, left: bool, amount: i32) -> BigInt {
    let left = if amount < 0 { !left } else { left };
    let amount = amount.unsigned_abs() as usize;
    if left {
        value << amount
    } else {
        value >> amount
    }
}
