//! Lazily loaded modules.
//!
//! Modules are installed as loaders in `package.preload`, so a module's table
//! is only materialized when script code first `require`s it. Lua records the
//! result in `package.loaded`, and every later `require` of the same name sees
//! the same table.

use crate::bridge::{bridge_function, native_function, BridgeFn, NativeFn, NativeFunction};
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::IntoScript;
use crate::value::ScriptValue;
use mlua::{Function, IntoLua, MultiValue, Table};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::debug;

enum Export {
    Bridge(BridgeFn),
    Native(NativeFn),
    Value(ScriptValue),
}

/// The exported bindings of a module, assembled eagerly into a table.
#[derive(Default)]
pub struct ModuleFields {
    exports: Vec<(String, Export)>,
}

impl ModuleFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a stack-protocol host function.
    pub fn func<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&Engine) -> usize + 'static,
    {
        self.exports
            .push((name.to_string(), Export::Bridge(Rc::new(func))));
        self
    }

    /// Export a typed host function.
    pub fn native<Args, F>(mut self, name: &str, func: F) -> Self
    where
        F: NativeFunction<Args>,
    {
        self.exports
            .push((name.to_string(), Export::Native(func.into_native())));
        self
    }

    /// Export a plain value.
    pub fn value(mut self, name: &str, value: impl IntoScript) -> Self {
        self.exports
            .push((name.to_string(), Export::Value(value.into_script())));
        self
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// Names of the modules registered with an engine.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    names: RefCell<BTreeSet<String>>,
}

impl ModuleRegistry {
    fn insert(&self, name: &str) {
        self.names.borrow_mut().insert(name.to_string());
    }

    fn names(&self) -> Vec<String> {
        self.names.borrow().iter().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.names.borrow_mut().clear();
    }
}

impl Engine {
    /// Build a table holding the given exports.
    pub fn generate_module(&self, fields: &ModuleFields) -> BridgeResult<ScriptValue> {
        let table = self.lua.create_table()?;
        for (name, export) in &fields.exports {
            let value = match export {
                Export::Bridge(func) => {
                    bridge_function(&self.lua, name, Rc::clone(func))?.into_lua(&self.lua)?
                }
                Export::Native(func) => {
                    native_function(&self.lua, name, Rc::clone(func))?.into_lua(&self.lua)?
                }
                Export::Value(value) => value.clone().into_lua(&self.lua)?,
            };
            table.raw_set(name.as_str(), value)?;
        }
        Ok(ScriptValue::Table(table))
    }

    /// Register a module from a field map. The table is built now and
    /// handed out by a loader on first `require`.
    pub fn register_module(&self, name: &str, fields: ModuleFields) -> BridgeResult<()> {
        let module = self.generate_module(&fields)?;
        let loader = self
            .lua
            .create_function(move |_, _: MultiValue| Ok(module.clone()))?;
        self.install_loader(name, loader)?;
        debug!(module = name, exports = fields.len(), "Registered module");
        Ok(())
    }

    /// Register a module whose table is produced by `loader` on first
    /// `require`. The loader should return a table.
    pub fn register_module_loader<F>(&self, name: &str, loader: F) -> BridgeResult<()>
    where
        F: Fn(&Engine) -> ScriptValue + 'static,
    {
        let module_name = name.to_string();
        let loader = self.lua.create_function(move |lua, _: MultiValue| {
            let engine = Engine::attach(lua)?;
            debug!(module = %module_name, "Materializing module");
            Ok(loader(&engine))
        })?;
        self.install_loader(name, loader)?;
        debug!(module = name, "Registered lazy module");
        Ok(())
    }

    /// Names of all registered modules, sorted.
    pub fn registered_modules(&self) -> Vec<String> {
        self.state.modules.names()
    }

    fn install_loader(&self, name: &str, loader: Function) -> BridgeResult<()> {
        let package: Option<Table> = self.lua.globals().get("package")?;
        let package = package
            .ok_or_else(|| BridgeError::registration(name, "the package library is not loaded"))?;
        let preload: Table = package
            .get("preload")
            .map_err(|e| BridgeError::registration(name, e))?;
        preload.set(name, loader)?;
        self.state.modules.insert(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Library;
    use std::cell::Cell;

    fn test_fields() -> ModuleFields {
        ModuleFields::new()
            .func("double", |e| {
                let x = e.pop_number();
                e.push_ret(x * 2.0);
                1
            })
            .func("hello", |e| {
                let name = e.pop_string();
                e.push_ret(format!("Hello, {}!", name));
                1
            })
            .native("triple", |x: f64| x * 3.0)
            .value("version", "1.0")
    }

    #[test]
    fn test_field_map_module() {
        let engine = Engine::new();
        engine.register_module("test_mod", test_fields()).unwrap();
        engine
            .load_string(
                r#"
                local test = require("test_mod")

                function test_double(x) return test.double(x) end
                function test_hello(name) return test.hello(name) end
                function test_triple(x) return test.triple(x) end
                function test_version() return test.version end
                "#,
            )
            .unwrap();

        assert_eq!(engine.call("test_double", 1, 10.0).unwrap()[0].as_number(), 20.0);
        assert_eq!(
            engine.call("test_hello", 1, "World").unwrap()[0].as_string(),
            "Hello, World!"
        );
        assert_eq!(engine.call("test_triple", 1, 2.0).unwrap()[0].as_number(), 6.0);
        assert_eq!(engine.call("test_version", 1, ()).unwrap()[0].as_string(), "1.0");
        assert_eq!(engine.registered_modules(), vec!["test_mod".to_string()]);
    }

    #[test]
    fn test_loader_runs_once_on_first_require() {
        let engine = Engine::new();
        let loads = Rc::new(Cell::new(0));
        let counter = Rc::clone(&loads);
        engine
            .register_module_loader("lazy", move |e| {
                counter.set(counter.get() + 1);
                e.generate_module(&ModuleFields::new().value("answer", 42))
                    .unwrap_or_default()
            })
            .unwrap();
        assert_eq!(loads.get(), 0);

        engine
            .load_string(
                r#"
                local a = require("lazy")
                local b = require("lazy")
                same = rawequal(a, b)
                answer = b.answer
                "#,
            )
            .unwrap();

        assert_eq!(loads.get(), 1);
        assert!(engine.get_global("same").as_bool());
        assert_eq!(engine.get_global("answer").as_number(), 42.0);
    }

    #[test]
    fn test_generate_module() {
        let engine = Engine::new();
        let module = engine
            .generate_module(&ModuleFields::new().value("name", "mod"))
            .unwrap();
        assert_eq!(module.table_raw_get("name").as_string(), "mod");
    }

    #[test]
    fn test_register_without_package_library() {
        let engine = Engine::with_libraries(&[Library::String]).unwrap();
        let err = engine
            .register_module("m", ModuleFields::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Registration { .. }));
    }
}
