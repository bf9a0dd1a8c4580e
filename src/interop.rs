//! Interop service registry.
//!
//! `SYSCALL` resolves a UTF-8 method name against this registry and runs the
//! handler against the interpreter. Four `System.ScriptEngine.*` names are
//! reserved and pre-registered on every interpreter.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::script::Interpreter;
use crate::stack_item::{InteropObject, StackItem};

pub const GET_SCRIPT_CONTAINER: &str = "System.ScriptEngine.GetScriptContainer";
pub const GET_EXECUTING_SCRIPT_HASH: &str = "System.ScriptEngine.GetExecutingScriptHash";
pub const GET_CALLING_SCRIPT_HASH: &str = "System.ScriptEngine.GetCallingScriptHash";
pub const GET_ENTRY_SCRIPT_HASH: &str = "System.ScriptEngine.GetEntryScriptHash";

/// Marker wrapped in the handle pushed by `GetScriptContainer`.
///
/// The handle stands for the interpreter's bound [`Signable`]; a host interop
/// that receives it back downcasts to this type and then consults
/// [`Interpreter::signable`].
///
/// [`Signable`]: crate::host::Signable
#[derive(Debug, Copy, Clone)]
pub struct ScriptContainer;

/// Handler invoked by `SYSCALL`; returning `false` faults the script.
pub type InteropHandler = Rc<dyn Fn(&mut Interpreter<'_>) -> bool>;

/// Name-keyed registry of host callbacks.
#[derive(Default, Clone)]
pub struct InteropDispatch {
    handlers: BTreeMap<String, InteropHandler>,
}

impl InteropDispatch {
    /// Empty registry, without the reserved built-ins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four `System.ScriptEngine.*` built-ins.
    pub fn with_builtins() -> Self {
        let mut dispatch = Self::new();
        dispatch.register(GET_SCRIPT_CONTAINER, get_script_container);
        dispatch.register(GET_EXECUTING_SCRIPT_HASH, get_executing_script_hash);
        dispatch.register(GET_CALLING_SCRIPT_HASH, get_calling_script_hash);
        dispatch.register(GET_ENTRY_SCRIPT_HASH, get_entry_script_hash);
        dispatch
    }

    /// Registers a handler under `name`. Registration is idempotent:
    /// returns `false` and leaves the registry unchanged when the name is
    /// already taken.
    pub fn register<F>(&mut self, name: &str, handler: F) -> bool
    where
        F: Fn(&mut Interpreter<'_>) -> bool + 'static,
    {
        if self.handlers.contains_key(name) {
            return false;
        }
        self.handlers.insert(name.to_owned(), Rc::new(handler));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<InteropHandler> {
        self.handlers.get(name).cloned()
    }
}

fn get_script_container(engine: &mut Interpreter<'_>) -> bool {
    engine.push(StackItem::Interop(InteropObject::new(ScriptContainer)));
    true
}

fn get_executing_script_hash(engine: &mut Interpreter<'_>) -> bool {
    let hash = engine.crypto().hash160(engine.executing_script());
    engine.push(StackItem::from(hash.to_vec()));
    true
}

fn get_calling_script_hash(engine: &mut Interpreter<'_>) -> bool {
    let hash = engine.crypto().hash160(engine.calling_script());
    engine.push(StackItem::from(hash.to_vec()));
    true
}

fn get_entry_script_hash(engine: &mut Interpreter<'_>) -> bool {
    let hash = engine.crypto().hash160(engine.entry_script());
    engine.push(StackItem::from(hash.to_vec()));
    true
}
