//! Conversion between host values and [`ScriptValue`].
//!
//! The traits here decide what can cross the boundary:
//!
//! - [`IntoScript`]: host value to script value. Total for primitives;
//!   arbitrary host data crosses as an opaque [`HostObject`].
//! - [`FromScript`]: strict script-to-host conversion used by typed glue
//!   (native functions, typed fields, methods). Mismatches are errors.
//! - [`IntoScriptArgs`]: argument lists for [`Engine::call`](crate::Engine::call).
//! - [`IntoReturns`]: return values of native host functions.
//!
//! The permissive accessors on [`ScriptValue`] (`as_number`, `as_string`, ...)
//! are the default for hand-written bridge functions; `FromScript` is the
//! strict opt-in.

use crate::error::{BridgeError, BridgeResult};
use crate::value::{HostObject, ScriptValue, ValueKind};
use bstr::BString;
use mlua::{FromLua, Function, IntoLua, Lua, MultiValue, Table, Value};
use std::any::Any;
use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

/// Convert a host value into a script value.
pub trait IntoScript {
    fn into_script(self) -> ScriptValue;
}

/// Strictly convert a script value into a host value.
pub trait FromScript: Sized {
    fn from_script(value: ScriptValue) -> BridgeResult<Self>;

    /// The kind this conversion accepts, when there is exactly one.
    fn expected_kind() -> Option<ValueKind> {
        None
    }
}

impl IntoScript for ScriptValue {
    fn into_script(self) -> ScriptValue {
        self
    }
}

impl IntoScript for &ScriptValue {
    fn into_script(self) -> ScriptValue {
        self.clone()
    }
}

impl FromScript for ScriptValue {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        Ok(value)
    }
}

impl IntoScript for bool {
    fn into_script(self) -> ScriptValue {
        ScriptValue::Bool(self)
    }
}

impl FromScript for bool {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        value.try_bool()
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::Boolean)
    }
}

macro_rules! impl_float {
    ($($ty:ty),*) => {
        $(
            impl IntoScript for $ty {
                fn into_script(self) -> ScriptValue {
                    ScriptValue::Number(self as f64)
                }
            }

            impl FromScript for $ty {
                fn from_script(value: ScriptValue) -> BridgeResult<Self> {
                    value.try_number().map(|n| n as $ty)
                }

                fn expected_kind() -> Option<ValueKind> {
                    Some(ValueKind::Number)
                }
            }
        )*
    };
}

impl_float!(f64, f32);

// Integer targets take only integral numbers inside the type's range.
// `MAX as f64 + 1.0` is exact for every width (it rounds to 2^63 or 2^64 for
// the 64-bit types), so the upper check never admits a saturating cast.
macro_rules! impl_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoScript for $ty {
                fn into_script(self) -> ScriptValue {
                    ScriptValue::Number(self as f64)
                }
            }

            impl FromScript for $ty {
                fn from_script(value: ScriptValue) -> BridgeResult<Self> {
                    let n = value.try_number()?;
                    if n.fract() != 0.0
                        || n < <$ty>::MIN as f64
                        || n >= <$ty>::MAX as f64 + 1.0
                    {
                        return Err(BridgeError::NumberRange {
                            value: n,
                            target: stringify!($ty),
                        });
                    }
                    Ok(n as $ty)
                }

                fn expected_kind() -> Option<ValueKind> {
                    Some(ValueKind::Number)
                }
            }
        )*
    };
}

impl_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl IntoScript for String {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(BString::from(self))
    }
}

impl IntoScript for &str {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(BString::from(self))
    }
}

impl IntoScript for &String {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(BString::from(self.as_str()))
    }
}

impl IntoScript for BString {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(self)
    }
}

impl IntoScript for Vec<u8> {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(BString::from(self))
    }
}

impl IntoScript for &[u8] {
    fn into_script(self) -> ScriptValue {
        ScriptValue::String(BString::from(self))
    }
}

/// Only UTF-8 strings convert; binary data goes through [`BString`] or `Vec<u8>`.
impl FromScript for String {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        let bytes = Vec::<u8>::from_script(value)?;
        String::from_utf8(bytes).map_err(|e| BridgeError::NotUtf8(e.utf8_error()))
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::String)
    }
}

impl FromScript for BString {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        match value {
            ScriptValue::String(s) => Ok(s),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::String)
    }
}

impl FromScript for Vec<u8> {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        BString::from_script(value).map(Vec::from)
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::String)
    }
}

impl<T: IntoScript> IntoScript for Option<T> {
    fn into_script(self) -> ScriptValue {
        match self {
            Some(v) => v.into_script(),
            None => ScriptValue::Nil,
        }
    }
}

impl<T: FromScript> FromScript for Option<T> {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        match value {
            ScriptValue::Nil => Ok(None),
            other => T::from_script(other).map(Some),
        }
    }

    fn expected_kind() -> Option<ValueKind> {
        T::expected_kind()
    }
}

impl IntoScript for Table {
    fn into_script(self) -> ScriptValue {
        ScriptValue::Table(self)
    }
}

impl FromScript for Table {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        match value {
            ScriptValue::Table(t) => Ok(t),
            other => Err(other.mismatch(ValueKind::Table)),
        }
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::Table)
    }
}

impl IntoScript for Function {
    fn into_script(self) -> ScriptValue {
        ScriptValue::Function(self)
    }
}

impl FromScript for Function {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        match value {
            ScriptValue::Function(f) => Ok(f),
            other => Err(other.mismatch(ValueKind::Function)),
        }
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::Function)
    }
}

impl IntoScript for HostObject {
    fn into_script(self) -> ScriptValue {
        ScriptValue::Host(self)
    }
}

impl FromScript for HostObject {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        match value {
            ScriptValue::Host(obj) => Ok(obj),
            other => Err(other.mismatch(ValueKind::UserData)),
        }
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::UserData)
    }
}

impl<T: Any> IntoScript for Rc<RefCell<T>> {
    fn into_script(self) -> ScriptValue {
        ScriptValue::Host(HostObject::from_shared(self))
    }
}

impl<T: Any> FromScript for Rc<RefCell<T>> {
    fn from_script(value: ScriptValue) -> BridgeResult<Self> {
        HostObject::from_script(value)?.try_downcast::<T>()
    }

    fn expected_kind() -> Option<ValueKind> {
        Some(ValueKind::UserData)
    }
}

/// Argument lists accepted by [`Engine::call`](crate::Engine::call).
pub trait IntoScriptArgs {
    fn into_script_args(self) -> Vec<ScriptValue>;
}

impl IntoScriptArgs for () {
    fn into_script_args(self) -> Vec<ScriptValue> {
        Vec::new()
    }
}

impl IntoScriptArgs for Vec<ScriptValue> {
    fn into_script_args(self) -> Vec<ScriptValue> {
        self
    }
}

impl IntoScriptArgs for &[ScriptValue] {
    fn into_script_args(self) -> Vec<ScriptValue> {
        self.to_vec()
    }
}

impl<T: IntoScript> IntoScriptArgs for T {
    fn into_script_args(self) -> Vec<ScriptValue> {
        vec![self.into_script()]
    }
}

/// Values a native host function may return.
pub trait IntoReturns {
    fn into_returns(self) -> BridgeResult<Vec<ScriptValue>>;
}

impl IntoReturns for () {
    fn into_returns(self) -> BridgeResult<Vec<ScriptValue>> {
        Ok(Vec::new())
    }
}

impl<T: IntoScript> IntoReturns for T {
    fn into_returns(self) -> BridgeResult<Vec<ScriptValue>> {
        Ok(vec![self.into_script()])
    }
}

impl<R: IntoReturns, E: Display> IntoReturns for Result<R, E> {
    fn into_returns(self) -> BridgeResult<Vec<ScriptValue>> {
        match self {
            Ok(r) => r.into_returns(),
            Err(e) => Err(BridgeError::Host(e.to_string())),
        }
    }
}

macro_rules! impl_tuples {
    ($($name:ident),+) => {
        impl<$($name: IntoScript),+> IntoScriptArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_script_args(self) -> Vec<ScriptValue> {
                let ($($name,)+) = self;
                vec![$($name.into_script()),+]
            }
        }

        impl<$($name: IntoScript),+> IntoReturns for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_returns(self) -> BridgeResult<Vec<ScriptValue>> {
                let ($($name,)+) = self;
                Ok(vec![$($name.into_script()),+])
            }
        }
    };
}

impl_tuples!(A);
impl_tuples!(A, B);
impl_tuples!(A, B, C);
impl_tuples!(A, B, C, D);
impl_tuples!(A, B, C, D, E);
impl_tuples!(A, B, C, D, E, F);

impl IntoLua for ScriptValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            ScriptValue::Nil => Ok(Value::Nil),
            ScriptValue::Bool(b) => Ok(Value::Boolean(b)),
            ScriptValue::Number(n) => Ok(Value::Number(n)),
            ScriptValue::String(s) => lua.create_string(s.as_slice()).map(Value::String),
            ScriptValue::Table(t) => Ok(Value::Table(t)),
            ScriptValue::Function(f) => Ok(Value::Function(f)),
            ScriptValue::Host(obj) => crate::types::host_object_into_lua(lua, obj),
            ScriptValue::Raw(v) => Ok(v),
        }
    }
}

impl FromLua for ScriptValue {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        Ok(ScriptValue::from_value(value))
    }
}

pub(crate) fn to_script_values(values: MultiValue) -> Vec<ScriptValue> {
    values.into_iter().map(ScriptValue::from_value).collect()
}

pub(crate) fn to_multi_value(lua: &Lua, values: Vec<ScriptValue>) -> mlua::Result<MultiValue> {
    values
        .into_iter()
        .map(|v| v.into_lua(lua))
        .collect::<mlua::Result<MultiValue>>()
}
