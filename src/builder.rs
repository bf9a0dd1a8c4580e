//! Script construction helper.

use num_bigint::BigInt;

use crate::op_code::OpCode;
use crate::stack_item::encode_integer;

/// Incremental script emitter with minimal push selection.
///
/// ```
/// use scriptvm::{OpCode, ScriptBuilder};
///
/// let script = ScriptBuilder::new()
///     .push_int(1)
///     .push_int(2)
///     .emit(OpCode::Add)
///     .emit(OpCode::HaltIfNot)
///     .into_script();
/// assert_eq!(script, [0x51, 0x52, 0x93, 0x66]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder {
    script: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, op: OpCode) -> Self {
        self.script.push(op.to_u8());
        self
    }

    /// Emits the shortest push for `data`: a PUSHBYTES opcode up to 75
    /// bytes, then PUSHDATA1/2/4. Empty data becomes PUSH0.
    pub fn push_data(mut self, data: &[u8]) -> Self {
        match data.len() {
            0 => self.script.push(OpCode::Push0.to_u8()),
            len @ 1..=0x4B => self.script.push(len as u8),
            len @ 0x4C..=0xFF => {
                self.script.push(OpCode::PushData1.to_u8());
                self.script.push(len as u8);
            }
            len @ 0x100..=0xFFFF => {
                self.script.push(OpCode::PushData2.to_u8());
                self.script.extend_from_slice(&(len as u16).to_le_bytes());
            }
            len => {
                self.script.push(OpCode::PushData4.to_u8());
                self.script.extend_from_slice(&(len as u32).to_le_bytes());
            }
        }
        self.script.extend_from_slice(data);
        self
    }

    /// Emits an integer constant: the PUSH0/PUSHNEG1/PUSH1..PUSH16 opcodes
    /// where they apply, the canonical byte encoding otherwise.
    pub fn push_int(self, value: i64) -> Self {
        match value {
            0 => self.emit(OpCode::Push0),
            -1 => self.emit(OpCode::PushNeg1),
            1..=16 => {
                let byte = OpCode::Push1.to_u8() + (value - 1) as u8;
                let mut builder = self;
                builder.script.push(byte);
                builder
            }
            _ => {
                let encoded = encode_integer(&BigInt::from(value));
                self.push_data(&encoded)
            }
        }
    }

    pub fn push_bool(self, value: bool) -> Self {
        if value {
            self.push_int(1)
        } else {
            self.emit(OpCode::Push0)
        }
    }

    /// Emits a jump-family opcode with its signed displacement, which is
    /// relative to the opcode byte being emitted.
    pub fn emit_jump(mut self, op: OpCode, displacement: i16) -> Self {
        self.script.push(op.to_u8());
        self.script.extend_from_slice(&displacement.to_le_bytes());
        self
    }

    pub fn emit_appcall(mut self, hash: &[u8; 20]) -> Self {
        self.script.push(OpCode::AppCall.to_u8());
        self.script.extend_from_slice(hash);
        self
    }

    /// Emits SYSCALL with the varint-length-prefixed UTF-8 name.
    pub fn emit_syscall(mut self, name: &str) -> Self {
        self.script.push(OpCode::Syscall.to_u8());
        let bytes = name.as_bytes();
        match bytes.len() {
            len @ 0..=0xFC => self.script.push(len as u8),
            len @ 0xFD..=0xFFFF => {
                self.script.push(0xFD);
                self.script.extend_from_slice(&(len as u16).to_le_bytes());
            }
            len => {
                self.script.push(0xFE);
                self.script.extend_from_slice(&(len as u32).to_le_bytes());
            }
        }
        self.script.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.script.len()
    }

    pub fn is_empty(&self) -> bool {
        self.script.is_empty()
    }

    pub fn into_script(self) -> Vec<u8> {
        self.script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_push_selection() {
        assert_eq!(ScriptBuilder::new().push_data(&[]).into_script(), [0x00]);
        assert_eq!(
            ScriptBuilder::new().push_data(&[0xAB]).into_script(),
            [0x01, 0xAB]
        );
        let script = ScriptBuilder::new().push_data(&[0x11; 75]).into_script();
        assert_eq!(script[0], 0x4B);
        assert_eq!(script.len(), 76);
        let script = ScriptBuilder::new().push_data(&[0x22; 76]).into_script();
        assert_eq!(&script[..2], &[0x4C, 76]);
        let script = ScriptBuilder::new().push_data(&[0x33; 300]).into_script();
        assert_eq!(&script[..3], &[0x4D, 0x2C, 0x01]);
    }

    #[test]
    fn integer_constants() {
        assert_eq!(ScriptBuilder::new().push_int(0).into_script(), [0x00]);
        assert_eq!(ScriptBuilder::new().push_int(-1).into_script(), [0x4F]);
        assert_eq!(ScriptBuilder::new().push_int(1).into_script(), [0x51]);
        assert_eq!(ScriptBuilder::new().push_int(16).into_script(), [0x60]);
        assert_eq!(
            ScriptBuilder::new().push_int(17).into_script(),
            [0x01, 0x11]
        );
        assert_eq!(
            ScriptBuilder::new().push_int(-2).into_script(),
            [0x01, 0xFE]
        );
    }

    #[test]
    fn syscall_encoding() {
        let script = ScriptBuilder::new().emit_syscall("Ab").into_script();
        assert_eq!(script, [0x69, 0x02, b'A', b'b']);
    }

    #[test]
    fn jump_encoding() {
        let script = ScriptBuilder::new()
            .emit_jump(OpCode::Jmp, -3)
            .into_script();
        assert_eq!(script, [0x62, 0xFD, 0xFF]);
    }
}
