//! Secure mode.
//!
//! A secure engine runs a setup script once at construction. The script
//! builds a restricted environment table and stores it in a global. Then,
//! the first time each global function is called through
//! [`Engine::call`](crate::Engine::call), its environment is replaced with
//! that table, so global lookups inside it no longer see `io`, `require`
//! and the other capabilities left out of the table. Restriction happens
//! once per function name; later calls skip it.
//!
//! This is environment substitution, not isolation. It keeps well-behaved
//! scripts away from ambient capabilities; it is not hardened against
//! hostile code.

use crate::error::{BridgeError, BridgeResult};
use mlua::{Function, Lua, Table, Value};
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, trace};

/// Global the default setup script stores the restricted environment in.
pub const DEFAULT_ENV_NAME: &str = "__sandbox";

/// The default setup script.
///
/// The restricted environment keeps the pure base functions, copies of the
/// `coroutine`, `math`, `string` and `table` libraries, and the clock
/// functions of `os`. Setup scripts receive the environment name as their
/// only argument.
pub const DEFAULT_SETUP_SCRIPT: &str = r#"
local env_name = ...
local safe = {}

for _, name in ipairs({
    "assert", "error", "ipairs", "next", "pairs", "pcall", "print", "select",
    "tonumber", "tostring", "type", "unpack", "xpcall", "rawequal", "rawget",
    "rawset", "getmetatable", "setmetatable", "_VERSION",
}) do
    safe[name] = _G[name]
end

local function copy(lib)
    if lib == nil then
        return nil
    end
    local t = {}
    for k, v in pairs(lib) do
        t[k] = v
    end
    return t
end

safe.coroutine = copy(coroutine)
safe.math = copy(math)
safe.string = copy(string)
safe.table = copy(table)

if os ~= nil then
    safe.os = {
        clock = os.clock,
        date = os.date,
        difftime = os.difftime,
        time = os.time,
    }
end

safe._G = safe
_G[env_name] = safe
"#;

/// A setup script and the global it leaves the restricted environment in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    setup: String,
    env_name: String,
}

impl Sandbox {
    pub fn new(setup: impl Into<String>, env_name: impl Into<String>) -> Self {
        Self {
            setup: setup.into(),
            env_name: env_name.into(),
        }
    }

    /// Read the setup script from a file.
    pub fn from_file(path: impl AsRef<Path>, env_name: impl Into<String>) -> BridgeResult<Self> {
        let setup = std::fs::read_to_string(path)?;
        Ok(Self::new(setup, env_name))
    }

    pub fn setup_script(&self) -> &str {
        &self.setup
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(DEFAULT_SETUP_SCRIPT, DEFAULT_ENV_NAME)
    }
}

/// An installed sandbox and the names already restricted by it.
pub(crate) struct SandboxState {
    descriptor: Sandbox,
    /// `setfenv` as it was before any script ran; later reassignments of the
    /// global do not affect restriction.
    setfenv: Function,
    restricted: RefCell<HashSet<String>>,
}

impl SandboxState {
    /// Run the setup script and check that it produced an environment table.
    pub(crate) fn install(lua: &Lua, sandbox: Sandbox) -> BridgeResult<Self> {
        let env_name = sandbox.env_name.as_str();
        let setfenv = match lua.globals().raw_get::<Value>("setfenv")? {
            Value::Function(f) => f,
            other => {
                return Err(BridgeError::registration(
                    env_name,
                    format!("setfenv is a {}, not a function", other.type_name()),
                ))
            }
        };
        lua.load(sandbox.setup.as_str())
            .set_name("=sandbox")
            .call::<()>(env_name)
            .map_err(|e| BridgeError::registration(env_name, e))?;

        let env: Value = lua.globals().raw_get(env_name)?;
        if !matches!(env, Value::Table(_)) {
            return Err(BridgeError::registration(
                env_name,
                format!("setup script left a {}, not a table", env.type_name()),
            ));
        }

        debug!(env = env_name, "Installed sandbox");
        Ok(Self {
            descriptor: sandbox,
            setfenv,
            restricted: RefCell::new(HashSet::new()),
        })
    }

    pub(crate) fn descriptor(&self) -> &Sandbox {
        &self.descriptor
    }

    pub(crate) fn is_restricted(&self, name: &str) -> bool {
        self.restricted.borrow().contains(name)
    }

    pub(crate) fn environment(&self, lua: &Lua) -> mlua::Result<Table> {
        lua.globals().raw_get(self.descriptor.env_name.as_str())
    }

    /// Bind `func`'s environment to the restricted table, once per name.
    pub(crate) fn restrict(&self, lua: &Lua, name: &str, func: &Function) -> mlua::Result<()> {
        if self.is_restricted(name) {
            return Ok(());
        }

        // Host functions have no script environment to replace.
        if func.info().what != "C" {
            let env = self.environment(lua)?;
            self.setfenv.call::<()>((func.clone(), env))?;
            trace!(function = name, env = %self.descriptor.env_name, "Restricted function");
        }

        self.restricted.borrow_mut().insert(name.to_string());
        Ok(())
    }

    pub(crate) fn clear(&self) {
        self.restricted.borrow_mut().clear();
    }
}
