//! Script values as seen from the host.
//!
//! [`ScriptValue`] wraps one value understood by the Lua runtime. Primitive
//! variants are stored host-side; tables and functions are handles into the
//! owning engine's Lua state and must not be passed to another engine.
//!
//! Lua strings are byte strings. [`ScriptValue::String`] keeps the bytes as
//! they are, so data that is not UTF-8 survives a trip through the host.

use crate::error::{BridgeError, BridgeResult};
use crate::marshal::IntoScript;
use bstr::{BString, ByteSlice};
use mlua::{AnyUserData, Function, Table, Value};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// The kind of a script value, named after Lua's `type()` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl ValueKind {
    /// Lua type name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Function => "function",
            ValueKind::UserData => "userdata",
            ValueKind::Thread => "thread",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host-owned value referenced from script code.
///
/// The value lives in an `Rc<RefCell<T>>` shared between the host and every
/// script reference to it. Nothing is copied when it crosses the boundary, so
/// host-side mutation is visible to the script on its next read. No
/// synchronization is applied to this sharing; engines are single-threaded.
#[derive(Clone)]
pub struct HostObject {
    value: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
    handle: Option<AnyUserData>,
}

impl HostObject {
    /// Wrap an owned host value.
    pub fn new<T: Any>(value: T) -> Self {
        Self::from_shared(Rc::new(RefCell::new(value)))
    }

    /// Wrap a value the host keeps a handle to.
    pub fn from_shared<T: Any>(value: Rc<RefCell<T>>) -> Self {
        Self {
            value,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            handle: None,
        }
    }

    /// Recover the shared host value if it holds a `T`.
    pub fn downcast<T: Any>(&self) -> Option<Rc<RefCell<T>>> {
        Rc::clone(&self.value).downcast::<RefCell<T>>().ok()
    }

    /// Like [`downcast`](Self::downcast) but reports the mismatch.
    pub fn try_downcast<T: Any>(&self) -> BridgeResult<Rc<RefCell<T>>> {
        self.downcast::<T>()
            .ok_or_else(|| BridgeError::HostTypeMismatch {
                expected: std::any::type_name::<T>(),
                actual: self.type_name,
            })
    }

    /// Whether the object holds a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn addr(&self) -> *const () {
        Rc::as_ptr(&self.value) as *const ()
    }

    /// Whether both handles refer to the same host value.
    pub fn same(&self, other: &HostObject) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.value), Rc::as_ptr(&other.value))
    }

    /// Userdata this object was read from, reused so the script sees the same identity.
    pub(crate) fn handle(&self) -> Option<&AnyUserData> {
        self.handle.as_ref()
    }

    pub(crate) fn with_handle(mut self, handle: AnyUserData) -> Self {
        self.handle = Some(handle);
        self
    }

    pub(crate) fn without_handle(&self) -> Self {
        Self {
            handle: None,
            ..self.clone()
        }
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject<{}>({:p})", self.type_name, Rc::as_ptr(&self.value))
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

/// One dynamic script value.
#[derive(Clone, Debug, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(BString),
    Table(Table),
    Function(Function),
    /// An opaque host value; see [`HostObject`].
    Host(HostObject),
    /// A runtime value the bridge does not model (coroutines, foreign
    /// userdata). Passed through unchanged.
    Raw(Value),
}

impl ScriptValue {
    /// Wrap an arbitrary host value as an opaque object.
    pub fn host<T: Any>(value: T) -> Self {
        ScriptValue::Host(HostObject::new(value))
    }

    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            ScriptValue::Nil => ValueKind::Nil,
            ScriptValue::Bool(_) => ValueKind::Boolean,
            ScriptValue::Number(_) => ValueKind::Number,
            ScriptValue::String(_) => ValueKind::String,
            ScriptValue::Table(_) => ValueKind::Table,
            ScriptValue::Function(_) => ValueKind::Function,
            ScriptValue::Host(_) => ValueKind::UserData,
            ScriptValue::Raw(Value::Thread(_)) => ValueKind::Thread,
            ScriptValue::Raw(Value::Nil) => ValueKind::Nil,
            ScriptValue::Raw(_) => ValueKind::UserData,
        }
    }

    /// Lua type name of this value.
    pub fn type_name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// True only for nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// True for the values Lua treats as false: nil and `false`.
    pub fn is_false(&self) -> bool {
        matches!(self, ScriptValue::Nil | ScriptValue::Bool(false))
    }

    /// Lua truthiness of the value. Never fails.
    pub fn as_bool(&self) -> bool {
        !self.is_false()
    }

    /// Numeric value following Lua's coercion rules; anything that does not
    /// coerce yields `0.0`.
    pub fn as_number(&self) -> f64 {
        match self {
            ScriptValue::Number(n) => *n,
            ScriptValue::String(s) => parse_number(&s.to_str_lossy()).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// String value following Lua's coercion rules; only strings and numbers
    /// convert, anything else yields an empty string. Bytes that are not
    /// UTF-8 are replaced with U+FFFD.
    pub fn as_string(&self) -> String {
        match self {
            ScriptValue::String(s) => s.to_str_lossy().into_owned(),
            ScriptValue::Number(n) => format_number(*n),
            _ => String::new(),
        }
    }

    /// Strict number accessor.
    pub fn try_number(&self) -> BridgeResult<f64> {
        match self {
            ScriptValue::Number(n) => Ok(*n),
            other => Err(other.mismatch(ValueKind::Number)),
        }
    }

    /// Strict string accessor. Fails on non-strings and on strings that are
    /// not UTF-8; use [`try_bytes`](Self::try_bytes) for binary data.
    pub fn try_string(&self) -> BridgeResult<&str> {
        Ok(std::str::from_utf8(self.try_bytes()?)?)
    }

    /// Strict accessor for the raw bytes of a string.
    pub fn try_bytes(&self) -> BridgeResult<&[u8]> {
        self.as_bytes()
            .ok_or_else(|| self.mismatch(ValueKind::String))
    }

    /// The raw bytes, if this is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::String(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    /// Strict boolean accessor.
    pub fn try_bool(&self) -> BridgeResult<bool> {
        match self {
            ScriptValue::Bool(b) => Ok(*b),
            other => Err(other.mismatch(ValueKind::Boolean)),
        }
    }

    /// Strict table accessor.
    pub fn try_table(&self) -> BridgeResult<&Table> {
        self.as_table().ok_or_else(|| self.mismatch(ValueKind::Table))
    }

    /// The table handle, if this is a table.
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            ScriptValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// The function handle, if this is a function.
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            ScriptValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The opaque host object, if this value wraps one.
    pub fn interface(&self) -> Option<HostObject> {
        match self {
            ScriptValue::Host(obj) => Some(obj.clone()),
            _ => None,
        }
    }

    /// Recover a shared host value of type `T`.
    pub fn downcast<T: Any>(&self) -> Option<Rc<RefCell<T>>> {
        match self {
            ScriptValue::Host(obj) => obj.downcast::<T>(),
            _ => None,
        }
    }

    pub(crate) fn mismatch(&self, expected: ValueKind) -> BridgeError {
        BridgeError::TypeMismatch {
            expected,
            actual: self.kind(),
        }
    }

    pub(crate) fn from_value(value: Value) -> Self {
        match value {
            Value::Nil => ScriptValue::Nil,
            Value::Boolean(b) => ScriptValue::Bool(b),
            Value::Integer(i) => ScriptValue::Number(i as f64),
            Value::Number(n) => ScriptValue::Number(n),
            Value::String(s) => ScriptValue::String(BString::from(s.as_bytes().to_vec())),
            Value::Table(t) => ScriptValue::Table(t),
            Value::Function(f) => ScriptValue::Function(f),
            Value::UserData(ud) => match crate::types::host_object_of(&ud) {
                Some(obj) => ScriptValue::Host(obj.with_handle(ud)),
                None => ScriptValue::Raw(Value::UserData(ud)),
            },
            other => ScriptValue::Raw(other),
        }
    }

    // Table operations. Each one only acts on tables; on any other value it
    // does nothing and returns nil (or zero).

    /// Append a value after the last array element.
    pub fn table_append(&self, value: impl IntoScript) {
        if let Some(t) = self.as_table() {
            let next = t.raw_len() as i64 + 1;
            report(t.raw_insert(next, value.into_script()), "append");
        }
    }

    /// Insert a value at `pos`, shifting later array elements up.
    pub fn table_insert(&self, pos: i64, value: impl IntoScript) {
        if let Some(t) = self.as_table() {
            report(t.raw_insert(pos, value.into_script()), "insert");
        }
    }

    /// Remove and return the array element at `pos`.
    pub fn table_remove(&self, pos: i64) -> ScriptValue {
        let Some(t) = self.as_table() else {
            return ScriptValue::Nil;
        };
        let removed = t.raw_get::<Value>(pos).map(ScriptValue::from_value);
        match removed {
            Ok(value) => {
                report(t.raw_remove(pos), "remove");
                value
            }
            Err(e) => {
                debug!("table remove failed: {}", e);
                ScriptValue::Nil
            }
        }
    }

    /// Border of the array part (`#t` without metamethods); 0 for non-tables.
    pub fn table_len(&self) -> usize {
        self.as_table().map(|t| t.raw_len()).unwrap_or(0)
    }

    /// Largest positive numeric key, as Lua 5.1's `table.maxn`.
    pub fn table_max_n(&self) -> f64 {
        let mut max = 0.0;
        self.table_for_each(|key, _| {
            if let ScriptValue::Number(n) = key {
                if n > max {
                    max = n;
                }
            }
        });
        max
    }

    /// The entry following `key` in traversal order; nil starts a traversal
    /// and `(nil, nil)` marks its end.
    ///
    /// Each call walks the table from the start until it passes `key`, so a
    /// full traversal built from `table_next` is quadratic in the table size.
    /// Prefer [`table_for_each`](Self::table_for_each) or
    /// [`table_pairs`](Self::table_pairs) to visit every entry.
    pub fn table_next(&self, key: &ScriptValue) -> (ScriptValue, ScriptValue) {
        let Some(t) = self.as_table() else {
            return (ScriptValue::Nil, ScriptValue::Nil);
        };
        let mut found = key.is_nil();
        let mut entry = None;
        let walked = t.for_each::<Value, Value>(|k, v| {
            if entry.is_some() {
                return Ok(());
            }
            let k = ScriptValue::from_value(k);
            if found {
                entry = Some((k, ScriptValue::from_value(v)));
            } else if &k == key {
                found = true;
            }
            Ok(())
        });
        report(walked, "next");
        entry.unwrap_or((ScriptValue::Nil, ScriptValue::Nil))
    }

    /// Snapshot of every entry in traversal order, collected in one pass.
    pub fn table_pairs(&self) -> Vec<(ScriptValue, ScriptValue)> {
        let mut entries = Vec::new();
        if let Some(t) = self.as_table() {
            for pair in t.pairs::<Value, Value>() {
                match pair {
                    Ok((k, v)) => {
                        entries.push((ScriptValue::from_value(k), ScriptValue::from_value(v)))
                    }
                    Err(e) => {
                        debug!("table pairs failed: {}", e);
                        break;
                    }
                }
            }
        }
        entries
    }

    /// Visit every entry of the table in one pass.
    pub fn table_for_each(&self, mut visit: impl FnMut(ScriptValue, ScriptValue)) {
        if let Some(t) = self.as_table() {
            let walked = t.for_each::<Value, Value>(|k, v| {
                visit(ScriptValue::from_value(k), ScriptValue::from_value(v));
                Ok(())
            });
            report(walked, "for_each");
        }
    }

    /// Read a key without invoking metamethods.
    pub fn table_raw_get(&self, key: impl IntoScript) -> ScriptValue {
        match self.as_table() {
            Some(t) => raw_get(t, key.into_script()),
            None => ScriptValue::Nil,
        }
    }

    /// Read an array slot without invoking metamethods.
    pub fn table_raw_get_int(&self, index: i64) -> ScriptValue {
        self.table_raw_get(index)
    }

    /// Read a key as a hash key. Lua's API keeps no separate hash-part
    /// access, so this reads the same slot as [`table_raw_get`](Self::table_raw_get).
    pub fn table_raw_get_h(&self, key: impl IntoScript) -> ScriptValue {
        self.table_raw_get(key)
    }

    /// Write a key without invoking metamethods.
    pub fn table_raw_set(&self, key: impl IntoScript, value: impl IntoScript) {
        if let Some(t) = self.as_table() {
            report(t.raw_set(key.into_script(), value.into_script()), "raw_set");
        }
    }

    /// Write an array slot without invoking metamethods.
    pub fn table_raw_set_int(&self, index: i64, value: impl IntoScript) {
        self.table_raw_set(index, value);
    }

    /// Write a key as a hash key; see [`table_raw_get_h`](Self::table_raw_get_h).
    pub fn table_raw_set_h(&self, key: impl IntoScript, value: impl IntoScript) {
        self.table_raw_set(key, value);
    }
}

fn raw_get(table: &Table, key: ScriptValue) -> ScriptValue {
    match table.raw_get::<Value>(key) {
        Ok(value) => ScriptValue::from_value(value),
        Err(e) => {
            debug!("table raw_get failed: {}", e);
            ScriptValue::Nil
        }
    }
}

fn report(result: mlua::Result<()>, op: &str) {
    if let Err(e) = result {
        debug!("table {} failed: {}", op, e);
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::Table(a), ScriptValue::Table(b)) => a.to_pointer() == b.to_pointer(),
            (ScriptValue::Function(a), ScriptValue::Function(b)) => {
                a.to_pointer() == b.to_pointer()
            }
            (ScriptValue::Host(a), ScriptValue::Host(b)) => a.same(b),
            (ScriptValue::Raw(a), ScriptValue::Raw(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => f.write_str(&format_number(*n)),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::Table(t) => write!(f, "table: {:p}", t.to_pointer()),
            ScriptValue::Function(func) => write!(f, "function: {:p}", func.to_pointer()),
            ScriptValue::Host(obj) => write!(f, "userdata: {}", obj.type_name()),
            ScriptValue::Raw(v) => f.write_str(v.type_name()),
        }
    }
}

/// Significant digits Lua 5.1 prints for numbers (`LUA_NUMBER_FMT` is `%.14g`).
const NUMBER_DIGITS: i32 = 14;

/// Format a number the way Lua's `tostring` does, i.e. C's `%.14g`.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    // Round to the significant digits first; the exponent of the rounded
    // value picks the notation, as in C.
    let scientific = format!("{:.*e}", (NUMBER_DIGITS - 1) as usize, n);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };
    if exponent < -4 || exponent >= NUMBER_DIGITS {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (NUMBER_DIGITS - 1 - exponent) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    }
}

/// Drop trailing zeros of a fraction, and the point if nothing is left.
fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// Parse a string the way Lua's `tonumber` does: surrounding whitespace is
/// allowed and `0x` prefixes select hexadecimal.
pub(crate) fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    // Rust accepts "inf" and "nan"; Lua does not.
    if digits.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        let n = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -n } else { n });
    }
    s.parse::<f64>().ok()
}
