//! The engine: one Lua state plus the bridge's bookkeeping for it.

use crate::bridge::CallFrame;
use crate::config::EngineConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::library::Library;
use crate::marshal::{to_multi_value, to_script_values, IntoScript, IntoScriptArgs};
use crate::module::ModuleRegistry;
use crate::sandbox::{Sandbox, SandboxState};
use crate::types::TypeRegistry;
use crate::value::ScriptValue;
use mlua::{IntoLua, Lua, LuaOptions, MultiValue, Table, Value};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// Bookkeeping shared by an engine and every host callback running inside it.
pub(crate) struct EngineState {
    pub(crate) frames: RefCell<Vec<CallFrame>>,
    pub(crate) types: TypeRegistry,
    pub(crate) modules: ModuleRegistry,
    pub(crate) sandbox: Option<SandboxState>,
}

impl EngineState {
    fn new(sandbox: Option<SandboxState>) -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
            types: TypeRegistry::default(),
            modules: ModuleRegistry::default(),
            sandbox,
        }
    }

    fn clear(&self) {
        self.frames.borrow_mut().clear();
        self.types.clear();
        self.modules.clear();
        if let Some(sandbox) = &self.sandbox {
            sandbox.clear();
        }
    }
}

/// A script execution context.
///
/// An engine owns exactly one Lua state. It is single-threaded: use one
/// engine per worker when parallelism is needed. Host functions receive a
/// borrowed `&Engine` for the same state, so they can pop their arguments,
/// push results and call back into script code.
pub struct Engine {
    pub(crate) lua: Lua,
    pub(crate) state: Rc<EngineState>,
}

impl Engine {
    /// Create an engine with Lua's safe standard libraries.
    pub fn new() -> Self {
        Self::with_state(Lua::new(), None)
    }

    /// Create an engine that opens only the given standard libraries.
    ///
    /// The base library is always available.
    pub fn with_libraries(libraries: &[Library]) -> BridgeResult<Self> {
        let lua = Lua::new_with(Library::std_libs(libraries), LuaOptions::default())?;
        Ok(Self::with_state(lua, None))
    }

    /// Create an engine running in secure mode with the default sandbox.
    pub fn new_secure() -> BridgeResult<Self> {
        Self::new_custom_secure(Sandbox::default())
    }

    /// Create an engine running in secure mode with a custom sandbox.
    ///
    /// The sandbox setup script runs before the engine is returned; if it
    /// fails, no engine is created.
    pub fn new_custom_secure(sandbox: Sandbox) -> BridgeResult<Self> {
        Self::secure_with(Lua::new(), sandbox)
    }

    /// Create an engine from a loaded configuration.
    pub fn from_config(config: &EngineConfig) -> BridgeResult<Self> {
        let lua = match &config.libraries {
            Some(libraries) => Lua::new_with(Library::std_libs(libraries), LuaOptions::default())?,
            None => Lua::new(),
        };
        match config.sandbox()? {
            Some(sandbox) => Self::secure_with(lua, sandbox),
            None => Ok(Self::with_state(lua, None)),
        }
    }

    fn secure_with(lua: Lua, sandbox: Sandbox) -> BridgeResult<Self> {
        let state = SandboxState::install(&lua, sandbox)?;
        Ok(Self::with_state(lua, Some(state)))
    }

    fn with_state(lua: Lua, sandbox: Option<SandboxState>) -> Self {
        let state = Rc::new(EngineState::new(sandbox));
        lua.set_app_data(Rc::clone(&state));
        debug!(secure = state.sandbox.is_some(), "Created engine");
        Self { lua, state }
    }

    /// Handle for host callbacks running inside `lua`.
    pub(crate) fn attach(lua: &Lua) -> mlua::Result<Self> {
        let state = lua
            .app_data_ref::<Rc<EngineState>>()
            .map(|state| Rc::clone(&state))
            .ok_or_else(|| mlua::Error::runtime("engine state is not available"))?;
        Ok(Self {
            lua: lua.clone(),
            state,
        })
    }

    /// Shut down the engine and its Lua state.
    pub fn close(self) {
        self.state.clear();
        self.lua.remove_app_data::<Rc<EngineState>>();
        debug!("Closed engine");
    }

    /// Whether the engine runs scripts in a sandbox.
    pub fn is_secure(&self) -> bool {
        self.state.sandbox.is_some()
    }

    /// The sandbox descriptor, in secure mode.
    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.state.sandbox.as_ref().map(|s| s.descriptor())
    }

    /// Whether `name` has already been bound to the restricted environment.
    pub fn is_restricted(&self, name: &str) -> bool {
        self.state
            .sandbox
            .as_ref()
            .is_some_and(|s| s.is_restricted(name))
    }

    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Run a script file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> BridgeResult<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.exec(&source, &format!("@{}", path.display()))
    }

    /// Run script source.
    pub fn load_string(&self, source: &str) -> BridgeResult<()> {
        self.exec(source, "=string")
    }

    fn exec(&self, source: &str, chunk: &str) -> BridgeResult<()> {
        debug!(chunk, "Loading chunk");
        self.lua
            .load(source)
            .set_name(chunk)
            .exec()
            .map_err(|source| BridgeError::Load {
                chunk: chunk.to_string(),
                source,
            })
    }

    /// Call the global `name` with `args`, returning exactly `nret` results.
    ///
    /// The global may be a function or any value Lua can call, such as a
    /// table with a `__call` metamethod. Script errors are captured and
    /// returned with Lua's own message; missing results are padded with nil
    /// and extra results are dropped.
    pub fn call(
        &self,
        name: &str,
        nret: usize,
        args: impl IntoScriptArgs,
    ) -> BridgeResult<Vec<ScriptValue>> {
        let call_error = |source| BridgeError::Call {
            name: name.to_string(),
            source,
        };

        let callee: Value = self.lua.globals().get(name).map_err(call_error)?;
        if let (Some(sandbox), Value::Function(func)) = (&self.state.sandbox, &callee) {
            sandbox
                .restrict(&self.lua, name, func)
                .map_err(call_error)?;
        }

        let args = to_multi_value(&self.lua, args.into_script_args()).map_err(call_error)?;
        debug!(function = name, args = args.len(), "Calling script function");
        let returned: MultiValue = match callee {
            Value::Function(func) => func.call::<MultiValue>(args),
            other => self.call_value(name, other, args),
        }
        .map_err(call_error)?;

        let mut results = to_script_values(returned);
        results.resize(nret, ScriptValue::Nil);
        Ok(results)
    }

    /// Let Lua itself call a global that is not a plain function, so
    /// `__call` is honored and failures carry the interpreter's message.
    fn call_value(
        &self,
        name: &str,
        callee: Value,
        mut args: MultiValue,
    ) -> mlua::Result<MultiValue> {
        if is_identifier(name) {
            return self
                .lua
                .load(format!("return {}(...)", name))
                .set_name("=call")
                .call(args);
        }
        args.push_front(callee);
        self.lua
            .load("local callee = ...\nreturn callee(select(2, ...))")
            .set_name("=call")
            .call(args)
    }

    /// Marshal a host value. Script values are returned unchanged.
    pub fn value_for(&self, value: impl IntoScript) -> ScriptValue {
        value.into_script()
    }

    /// Create an empty table.
    pub fn new_table(&self) -> BridgeResult<ScriptValue> {
        Ok(ScriptValue::Table(self.lua.create_table()?))
    }

    /// Set a global variable.
    pub fn set_global(&self, name: &str, value: impl IntoScript) -> BridgeResult<()> {
        let value = value.into_script().into_lua(&self.lua)?;
        self.install_global(name, value)
    }

    /// Read a global variable; missing globals read as nil.
    pub fn get_global(&self, name: &str) -> ScriptValue {
        match self.lua.globals().get::<ScriptValue>(name) {
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to read global '{}': {}", name, e);
                ScriptValue::Nil
            }
        }
    }

    /// Set `table[key] = value`, honoring metamethods. Does nothing when
    /// `table` is not a table.
    pub fn set_field(
        &self,
        table: &ScriptValue,
        key: impl IntoScript,
        value: impl IntoScript,
    ) -> BridgeResult<()> {
        if let Some(t) = table.as_table() {
            t.set(key.into_script(), value.into_script())?;
        }
        Ok(())
    }

    /// Install a host-provided global. In secure mode the value is mirrored
    /// into the restricted environment so restricted functions can reach it.
    pub(crate) fn install_global(&self, name: &str, value: Value) -> BridgeResult<()> {
        self.lua.globals().set(name, value.clone())?;
        if let Some(sandbox) = &self.state.sandbox {
            let env: Table = sandbox
                .environment(&self.lua)
                .map_err(|e| BridgeError::registration(name, e))?;
            env.raw_set(name, value)?;
        }
        Ok(())
    }
}

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Whether `name` can be written as a bare global reference in Lua source.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name)
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
