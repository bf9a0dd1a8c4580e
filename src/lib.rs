//! Deterministic stack virtual machine for byte-coded verification scripts.
//!
//! The goal of this crate is a consensus-grade interpreter: a script either
//! halts successfully or faults, identically on every run and every
//! implementation, with no observable output besides interop effects and the
//! final success flag. Cryptography, script resolution, and the signed
//! message are pluggable host adapters ([`Crypto`], [`ScriptTable`],
//! [`Signable`]); the instruction set, stack discipline, and execution
//! limits live here.

mod builder;
mod host;
mod interop;
mod op_code;
mod script;
mod stack_item;

pub use builder::ScriptBuilder;
pub use host::{Crypto, MemoryScriptTable, ScriptTable, Signable, StdCrypto};
pub use interop::{
    InteropDispatch, InteropHandler, ScriptContainer, GET_CALLING_SCRIPT_HASH,
    GET_ENTRY_SCRIPT_HASH, GET_EXECUTING_SCRIPT_HASH, GET_SCRIPT_CONTAINER,
};
pub use op_code::{is_push, OpCode};
pub use script::{FaultReason, Interpreter, VmState, MAX_STEPS};
pub use stack_item::{decode_integer, encode_integer, InteropObject, StackItem};

/// Verifies a signed object against one invocation/verification script pair.
///
/// The invocation script runs in push-only mode to stage the witness data,
/// then the verification script runs over the same stacks; the spend is
/// valid when both succeed and exactly one truthy item remains.
pub fn verify_scripts(
    invocation: &[u8],
    verification: &[u8],
    signable: &dyn Signable,
    crypto: &dyn Crypto,
    table: Option<&dyn ScriptTable>,
) -> bool {
    verify_scripts_detailed(invocation, verification, signable, crypto, table).is_ok()
}

/// Same as [`verify_scripts`] but reports the interpreter's [`FaultReason`].
pub fn verify_scripts_detailed(
    invocation: &[u8],
    verification: &[u8],
    signable: &dyn Signable,
    crypto: &dyn Crypto,
    table: Option<&dyn ScriptTable>,
) -> Result<(), FaultReason> {
    let mut engine = Interpreter::new(signable, crypto);
    if let Some(table) = table {
        engine = engine.with_script_table(table);
    }
    if !engine.execute_script(invocation, true) {
        return Err(engine.last_fault());
    }
    if !engine.execute_script(verification, false) {
        return Err(engine.last_fault());
    }
    if engine.stack().len() != 1 {
        return Err(FaultReason::EvalFalse);
    }
    let truthy = engine
        .peek()
        .and_then(StackItem::to_bool)
        .unwrap_or(false);
    if truthy {
        Ok(())
    } else {
        Err(FaultReason::EvalFalse)
    }
}
