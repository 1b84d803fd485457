use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use lb_core::{BridgeError, HostValue};
use mlua::{Lua, Value, Variadic};

use crate::bridge::{host_to_lua, lua_to_host};
use crate::runner::bind_error;

pub type HostFunction = Arc<dyn Fn(&[HostValue]) -> HostValue + Send + Sync>;

/// Table of host callables reachable by name from scripted code.
///
/// Owned by one `ScriptRunner`, so two runners registering the same name
/// never collide. Registration happens on the control thread while a worker
/// thread may be resolving a call, hence the mutex.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: Mutex<BTreeMap<String, HostFunction>>,
}

impl FunctionRegistry {
    /// Stores the callable under `name`, replacing any previous entry.
    pub fn insert(&self, name: &str, function: HostFunction) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), function);
    }

    pub fn lookup(&self, name: &str) -> Option<HostFunction> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Installs a native closure under `name` in the interpreter's globals.
///
/// The closure captures only the name and the owning registry; the callable
/// is resolved at call time, so re-registering a name rebinds every
/// trampoline already installed under it. An unknown name yields nil instead
/// of raising inside the interpreter.
pub(crate) fn install_trampoline(
    lua: &Lua,
    registry: &Arc<FunctionRegistry>,
    name: &str,
) -> Result<(), BridgeError> {
    let registry = Arc::clone(registry);
    let resolved = name.to_string();
    let trampoline = lua
        .create_function(move |lua, args: Variadic<Value>| {
            let host_args = args.iter().map(lua_to_host).collect::<Vec<_>>();
            let result = match registry.lookup(&resolved) {
                Some(function) => function(&host_args),
                None => HostValue::Absent,
            };
            host_to_lua(lua, &result)
        })
        .map_err(bind_error)?;
    lua.globals().set(name, trampoline).map_err(bind_error)?;
    Ok(())
}
