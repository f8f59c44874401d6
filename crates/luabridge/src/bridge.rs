//! Stack-based protocol for host functions called from script code.
//!
//! When a script calls a host function, the bridge pushes a [`CallFrame`]
//! holding the call's arguments onto the engine's frame stack. The host
//! function pops its arguments (the last argument is on top), pushes its
//! results with [`Engine::push_ret`] and returns how many values it pushed.
//! The bridge then hands the top `n` values of the frame back to the script.
//!
//! Frames nest: a host function may call [`Engine::call`], and the script it
//! calls may invoke host functions again, each with its own frame.

use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{to_multi_value, to_script_values, FromScript, IntoReturns, IntoScript};
use crate::value::{HostObject, ScriptValue};
use mlua::{Function, IntoLua, Lua, MultiValue, Table};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

/// A host function using the stack protocol.
pub type BridgeFn = Rc<dyn Fn(&Engine) -> usize>;

/// A host function with a typed signature, after its glue has been generated.
pub type NativeFn = Rc<dyn Fn(Vec<ScriptValue>) -> BridgeResult<Vec<ScriptValue>>>;

/// Value stack for one host function call.
#[derive(Debug, Default)]
pub(crate) struct CallFrame {
    stack: Vec<ScriptValue>,
}

impl CallFrame {
    pub(crate) fn new(args: Vec<ScriptValue>) -> Self {
        Self { stack: args }
    }

    /// Split off the top `count` values as the call's results.
    fn into_returns(mut self, count: usize) -> BridgeResult<Vec<ScriptValue>> {
        if count > self.stack.len() {
            return Err(BridgeError::Host(format!(
                "host function returned {} values but only {} are on the stack",
                count,
                self.stack.len()
            )));
        }
        let at = self.stack.len() - count;
        Ok(self.stack.split_off(at))
    }
}

impl Engine {
    /// Pop the top value of the current call frame.
    ///
    /// Returns nil when the frame is empty or no host call is active.
    pub fn pop_arg(&self) -> ScriptValue {
        self.state
            .frames
            .borrow_mut()
            .last_mut()
            .and_then(|frame| frame.stack.pop())
            .unwrap_or_default()
    }

    /// Pop a number, coercing like Lua does.
    pub fn pop_number(&self) -> f64 {
        self.pop_arg().as_number()
    }

    /// Pop a string, coercing like Lua does.
    pub fn pop_string(&self) -> String {
        self.pop_arg().as_string()
    }

    /// Pop a value and test its truthiness.
    pub fn pop_bool(&self) -> bool {
        self.pop_arg().as_bool()
    }

    /// Pop a table; non-table values yield `None`.
    pub fn pop_table(&self) -> Option<Table> {
        match self.pop_arg() {
            ScriptValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Pop an opaque host object.
    pub fn pop_interface(&self) -> Option<HostObject> {
        self.pop_arg().interface()
    }

    /// Pop a host object holding a `T`.
    pub fn pop_host<T: Any>(&self) -> Option<Rc<RefCell<T>>> {
        self.pop_arg().downcast::<T>()
    }

    /// Pop a value with strict conversion.
    pub fn pop_typed<T: FromScript>(&self) -> BridgeResult<T> {
        T::from_script(self.pop_arg())
    }

    /// Number of values on the current call frame.
    pub fn arg_count(&self) -> usize {
        self.state
            .frames
            .borrow()
            .last()
            .map(|frame| frame.stack.len())
            .unwrap_or(0)
    }

    /// Push a result onto the current call frame.
    pub fn push_ret(&self, value: impl IntoScript) {
        match self.state.frames.borrow_mut().last_mut() {
            Some(frame) => frame.stack.push(value.into_script()),
            None => warn!("push_ret called outside of a host function call"),
        }
    }

    /// Register a stack-protocol host function as a global.
    pub fn register_func<F>(&self, name: &str, func: F) -> BridgeResult<()>
    where
        F: Fn(&Engine) -> usize + 'static,
    {
        let func = bridge_function(&self.lua, name, Rc::new(func))?;
        self.install_global(name, func.into_lua(&self.lua)?)?;
        debug!(function = name, "Registered host function");
        Ok(())
    }

    /// Register a typed host function as a global. Its arguments and results
    /// are marshalled from its signature.
    pub fn register_native_func<Args, F>(&self, name: &str, func: F) -> BridgeResult<()>
    where
        F: NativeFunction<Args>,
    {
        let func = native_function(&self.lua, name, func.into_native())?;
        self.install_global(name, func.into_lua(&self.lua)?)?;
        debug!(function = name, "Registered native host function");
        Ok(())
    }
}

/// Wrap a stack-protocol host function as a Lua function.
pub(crate) fn bridge_function(lua: &Lua, name: &str, func: BridgeFn) -> mlua::Result<Function> {
    let name = name.to_string();
    lua.create_function(move |lua, args: MultiValue| {
        let engine = Engine::attach(lua)?;
        engine
            .state
            .frames
            .borrow_mut()
            .push(CallFrame::new(to_script_values(args)));

        let count = func(&engine);

        let frame = engine
            .state
            .frames
            .borrow_mut()
            .pop()
            .ok_or_else(|| mlua::Error::runtime("host call frame missing"))?;
        let results = frame.into_returns(count).map_err(|e| {
            warn!(function = %name, "{}", e);
            mlua::Error::from(e)
        })?;
        to_multi_value(lua, results)
    })
}

/// Wrap a typed host function as a Lua function.
pub(crate) fn native_function(lua: &Lua, name: &str, func: NativeFn) -> mlua::Result<Function> {
    let name = name.to_string();
    lua.create_function(move |lua, args: MultiValue| {
        let results = func(to_script_values(args)).map_err(|e| {
            debug!(function = %name, "Native host function failed: {}", e);
            mlua::Error::from(e)
        })?;
        to_multi_value(lua, results)
    })
}

/// A host function whose glue is derived from its signature.
///
/// Implemented for `Fn(A1, .., An) -> R` with up to eight arguments, where
/// every `Ai: FromScript` and `R: IntoReturns`. Missing arguments read as
/// nil and extra arguments are ignored.
pub trait NativeFunction<Args>: 'static {
    fn invoke(&self, args: Vec<ScriptValue>) -> BridgeResult<Vec<ScriptValue>>;

    fn into_native(self) -> NativeFn
    where
        Self: Sized,
    {
        Rc::new(move |args| self.invoke(args))
    }
}

macro_rules! impl_native_function {
    ($($arg:ident $var:ident),*) => {
        impl<Func, Ret, $($arg,)*> NativeFunction<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + 'static,
            Ret: IntoReturns,
            $($arg: FromScript,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn invoke(&self, args: Vec<ScriptValue>) -> BridgeResult<Vec<ScriptValue>> {
                let mut args = args.into_iter();
                let mut position = 0;
                $(
                    position += 1;
                    let $var = $arg::from_script(args.next().unwrap_or_default())
                        .map_err(|e| e.at_argument(position))?;
                )*
                (self)($($var),*).into_returns()
            }
        }
    };
}

impl_native_function!();
impl_native_function!(A1 a1);
impl_native_function!(A1 a1, A2 a2);
impl_native_function!(A1 a1, A2 a2, A3 a3);
impl_native_function!(A1 a1, A2 a2, A3 a3, A4 a4);
impl_native_function!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_native_function!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
impl_native_function!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
impl_native_function!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_function_doubles() {
        let engine = Engine::new();
        engine
            .register_func("double", |e| {
                let n = e.pop_number();
                e.push_ret(n * 2.0);
                1
            })
            .unwrap();
        engine
            .load_string("function test(x) return double(x) end")
            .unwrap();

        let ret = engine.call("test", 1, 10.0).unwrap();
        assert_eq!(ret[0].as_number(), 20.0);
    }

    #[test]
    fn test_arguments_pop_in_reverse_order() {
        let engine = Engine::new();
        engine
            .register_func("sub", |e| {
                let b = e.pop_number();
                let a = e.pop_number();
                e.push_ret(a - b);
                1
            })
            .unwrap();
        engine
            .load_string("function f() return sub(10, 4) end")
            .unwrap();
        assert_eq!(engine.call("f", 1, ()).unwrap()[0].as_number(), 6.0);
    }

    #[test]
    fn test_multiple_returns_keep_push_order() {
        let engine = Engine::new();
        engine
            .register_func("pair", |e| {
                e.push_ret("first");
                e.push_ret("second");
                2
            })
            .unwrap();
        engine
            .load_string("function f() local a, b = pair() return a .. b end")
            .unwrap();
        assert_eq!(engine.call("f", 1, ()).unwrap()[0].as_string(), "firstsecond");
    }

    #[test]
    fn test_overcounted_returns_raise_script_error() {
        let engine = Engine::new();
        engine.register_func("liar", |_| 3).unwrap();
        engine.load_string("function f() return liar() end").unwrap();
        assert!(engine.call("f", 1, ()).is_err());
    }

    #[test]
    fn test_pop_outside_call_is_nil() {
        let engine = Engine::new();
        assert!(engine.pop_arg().is_nil());
        assert_eq!(engine.arg_count(), 0);
        engine.push_ret(1);
    }

    #[test]
    fn test_native_function() {
        let engine = Engine::new();
        engine
            .register_native_func("add", |a: f64, b: f64| a + b)
            .unwrap();
        engine
            .register_native_func("greet", |name: String| format!("Hello, {}!", name))
            .unwrap();
        engine
            .load_string(
                r#"
                function sum() return add(2, 3) end
                function hello() return greet("World") end
                function bad() return add("x", 1) end
                "#,
            )
            .unwrap();

        assert_eq!(engine.call("sum", 1, ()).unwrap()[0].as_number(), 5.0);
        assert_eq!(engine.call("hello", 1, ()).unwrap()[0].as_string(), "Hello, World!");

        let err = engine.call("bad", 1, ()).unwrap_err();
        assert!(err.to_string().contains("Bad argument #1"));
    }

    #[test]
    fn test_native_function_errors_become_script_errors() {
        let engine = Engine::new();
        engine
            .register_native_func("checked", |n: f64| -> Result<f64, String> {
                if n < 0.0 {
                    Err("negative input".to_string())
                } else {
                    Ok(n.sqrt())
                }
            })
            .unwrap();
        engine
            .load_string(
                r#"
                function root(n) return checked(n) end
                function safe(n)
                    local ok, err = pcall(checked, n)
                    return ok
                end
                "#,
            )
            .unwrap();

        assert_eq!(engine.call("root", 1, 9.0).unwrap()[0].as_number(), 3.0);
        assert!(engine.call("root", 1, -1.0).is_err());
        assert!(!engine.call("safe", 1, -1.0).unwrap()[0].as_bool());
    }
}
