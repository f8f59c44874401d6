//! Host types as script-constructible objects.
//!
//! A type opts in by implementing [`Reflect`], which describes its shape
//! once: its fields (with accessors) and its methods. `#[derive(Reflect)]`
//! writes the field accessors; methods and computed fields go through a
//! [`StructBuilder`] by hand. The resulting [`TypeDescriptor`] is cached per
//! engine by `TypeId` and shared by every instance, so script code can construct objects, read and assign fields
//! (case-insensitively) and call methods without per-type glue.
//!
//! ```ignore
//! #[derive(Clone, Default, Reflect)]
//! #[reflect(methods = song_methods)]
//! struct Song { title: String, artist: String }
//!
//! fn song_methods(builder: StructBuilder<Song>) -> StructBuilder<Song> {
//!     builder.method("Describe", |s: &mut Song| format!("{} - {}", s.title, s.artist))
//! }
//!
//! engine.register_type("Song", Song::default())?;
//! ```

use crate::bridge::{native_function, NativeFunction};
use crate::engine::{Engine, EngineState};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{to_multi_value, to_script_values, FromScript, IntoReturns, IntoScript};
use crate::value::{HostObject, ScriptValue, ValueKind};
use mlua::{
    AnyUserData, Function, IntoLua, Lua, MetaMethod, MultiValue, Table, UserData,
    UserDataMethods, Value,
};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use tracing::debug;

type Getter = Rc<dyn Fn(&HostObject) -> BridgeResult<ScriptValue>>;
type Setter = Rc<dyn Fn(&HostObject, ScriptValue) -> BridgeResult<()>>;
type MethodFn = Rc<dyn Fn(&HostObject, Vec<ScriptValue>) -> BridgeResult<Vec<ScriptValue>>>;

/// The shape of a host type.
pub enum Shape {
    /// A struct with fields and methods scripts can use.
    Struct(TypeDescriptor),
    /// A primitive; these cannot be registered as types.
    Scalar(ValueKind),
}

/// Host types that describe their own shape.
pub trait Reflect: Any {
    fn reflect() -> Shape
    where
        Self: Sized;
}

macro_rules! impl_scalar_reflect {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl Reflect for $ty {
                fn reflect() -> Shape {
                    Shape::Scalar($kind)
                }
            }
        )*
    };
}

impl_scalar_reflect!(
    f64 => ValueKind::Number,
    f32 => ValueKind::Number,
    i64 => ValueKind::Number,
    i32 => ValueKind::Number,
    u32 => ValueKind::Number,
    usize => ValueKind::Number,
    bool => ValueKind::Boolean,
    String => ValueKind::String,
);

/// A field exposed to scripts.
pub struct FieldDescriptor {
    name: String,
    kind: Option<ValueKind>,
    get: Getter,
    set: Option<Setter>,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value kind the field accepts, when it has exactly one.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }
}

/// A method exposed to scripts.
pub struct MethodDescriptor {
    name: String,
    arity: usize,
    call: MethodFn,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments, not counting the receiver.
    pub fn arity(&self) -> usize {
        self.arity
    }
}

#[derive(Clone, Copy)]
enum Member {
    Field(usize),
    Method(usize),
}

/// Cached description of a host type's fields and methods.
pub struct TypeDescriptor {
    name: String,
    type_name: &'static str,
    type_id: TypeId,
    fields: Vec<FieldDescriptor>,
    methods: Vec<MethodDescriptor>,
    members: HashMap<String, Member>,
}

impl TypeDescriptor {
    /// Start describing the struct type `T`.
    pub fn builder<T: Any>() -> StructBuilder<T> {
        let type_name = std::any::type_name::<T>();
        let short = type_name.rsplit("::").next().unwrap_or(type_name);
        StructBuilder {
            descriptor: TypeDescriptor {
                name: short.to_string(),
                type_name,
                type_id: TypeId::of::<T>(),
                fields: Vec::new(),
                methods: Vec::new(),
                members: HashMap::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Name scripts know the type by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Look up a field, ignoring case.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        match self.member(name)? {
            Member::Field(i) => self.fields.get(i),
            Member::Method(_) => None,
        }
    }

    /// Look up a method, ignoring case.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        match self.member(name)? {
            Member::Method(i) => self.methods.get(i),
            Member::Field(_) => None,
        }
    }

    fn member(&self, name: &str) -> Option<Member> {
        self.members.get(&name.to_lowercase()).copied()
    }

    /// Read a field of `object`.
    pub fn get_field(&self, object: &HostObject, name: &str) -> BridgeResult<ScriptValue> {
        match self.field(name) {
            Some(field) => (field.get)(object),
            None => Err(self.no_field(name)),
        }
    }

    /// Assign a field of `object`.
    pub fn set_field(
        &self,
        object: &HostObject,
        name: &str,
        value: ScriptValue,
    ) -> BridgeResult<()> {
        match self.field(name).and_then(|f| f.set.as_ref()) {
            Some(set) => set(object, value),
            None => Err(self.no_field(name)),
        }
    }

    fn no_field(&self, name: &str) -> BridgeError {
        BridgeError::Field {
            type_name: self.name.clone(),
            field: name.to_string(),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("fields", &self.fields.iter().map(|f| &f.name).collect::<Vec<_>>())
            .field("methods", &self.methods.iter().map(|m| &m.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for a struct's [`TypeDescriptor`].
pub struct StructBuilder<T> {
    descriptor: TypeDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any> StructBuilder<T> {
    /// Expose a readable and assignable field.
    pub fn field<V, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        V: IntoScript + FromScript + 'static,
        G: Fn(&T) -> V + 'static,
        S: Fn(&mut T, V) + 'static,
    {
        let setter: Setter = Rc::new(
            move |object: &HostObject, value: ScriptValue| -> BridgeResult<()> {
                let value = V::from_script(value)?;
                let cell = object.try_downcast::<T>()?;
                let mut target = cell
                    .try_borrow_mut()
                    .map_err(|_| BridgeError::Borrowed(object.type_name()))?;
                set(&mut *target, value);
                Ok(())
            },
        );
        self.add_field(name, V::expected_kind(), getter(get), Some(setter))
    }

    /// Expose a field scripts can read but not assign.
    pub fn readonly_field<V, G>(self, name: &str, get: G) -> Self
    where
        V: IntoScript + 'static,
        G: Fn(&T) -> V + 'static,
    {
        self.add_field(name, None, getter(get), None)
    }

    /// Expose a method. The receiver is borrowed mutably for the call.
    pub fn method<Args, M>(mut self, name: &str, method: M) -> Self
    where
        M: HostMethod<T, Args>,
    {
        let arity = method.arity();
        let call: MethodFn = Rc::new(move |object: &HostObject, args: Vec<ScriptValue>| {
            let cell = object.try_downcast::<T>()?;
            let mut target = cell
                .try_borrow_mut()
                .map_err(|_| BridgeError::Borrowed(object.type_name()))?;
            method.invoke(&mut *target, args)
        });
        let index = self.descriptor.methods.len();
        self.descriptor.methods.push(MethodDescriptor {
            name: name.to_string(),
            arity,
            call,
        });
        self.descriptor
            .members
            .insert(name.to_lowercase(), Member::Method(index));
        self
    }

    pub fn build(self) -> Shape {
        Shape::Struct(self.descriptor)
    }

    fn add_field(
        mut self,
        name: &str,
        kind: Option<ValueKind>,
        get: Getter,
        set: Option<Setter>,
    ) -> Self {
        let index = self.descriptor.fields.len();
        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            kind,
            get,
            set,
        });
        self.descriptor
            .members
            .insert(name.to_lowercase(), Member::Field(index));
        self
    }
}

fn getter<T: Any, V: IntoScript + 'static>(get: impl Fn(&T) -> V + 'static) -> Getter {
    Rc::new(move |object: &HostObject| -> BridgeResult<ScriptValue> {
        let cell = object.try_downcast::<T>()?;
        let target = cell
            .try_borrow()
            .map_err(|_| BridgeError::Borrowed(object.type_name()))?;
        Ok(get(&*target).into_script())
    })
}

/// A method whose glue is derived from its signature.
///
/// Implemented for `Fn(&mut T, A1, .., An) -> R` with up to six arguments.
pub trait HostMethod<T, Args>: 'static {
    fn invoke(&self, target: &mut T, args: Vec<ScriptValue>) -> BridgeResult<Vec<ScriptValue>>;

    fn arity(&self) -> usize;
}

macro_rules! impl_host_method {
    ($($arg:ident $var:ident),*) => {
        impl<T, Func, Ret, $($arg,)*> HostMethod<T, ($($arg,)*)> for Func
        where
            Func: Fn(&mut T, $($arg),*) -> Ret + 'static,
            Ret: IntoReturns,
            $($arg: FromScript,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn invoke(
                &self,
                target: &mut T,
                args: Vec<ScriptValue>,
            ) -> BridgeResult<Vec<ScriptValue>> {
                let mut args = args.into_iter();
                let mut position = 0;
                $(
                    position += 1;
                    let $var = $arg::from_script(args.next().unwrap_or_default())
                        .map_err(|e| e.at_argument(position))?;
                )*
                (self)(target, $($var),*).into_returns()
            }

            fn arity(&self) -> usize {
                let args: &[&str] = &[$(stringify!($arg)),*];
                args.len()
            }
        }
    };
}

impl_host_method!();
impl_host_method!(A1 a1);
impl_host_method!(A1 a1, A2 a2);
impl_host_method!(A1 a1, A2 a2, A3 a3);
impl_host_method!(A1 a1, A2 a2, A3 a3, A4 a4);
impl_host_method!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
impl_host_method!(A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);

/// Descriptors of the types registered with an engine.
#[derive(Default)]
pub(crate) struct TypeRegistry {
    descriptors: RefCell<HashMap<TypeId, Rc<TypeDescriptor>>>,
}

impl TypeRegistry {
    fn insert(&self, descriptor: TypeDescriptor) -> Rc<TypeDescriptor> {
        let descriptor = Rc::new(descriptor);
        self.descriptors
            .borrow_mut()
            .insert(descriptor.type_id, Rc::clone(&descriptor));
        descriptor
    }

    pub(crate) fn get(&self, type_id: TypeId) -> Option<Rc<TypeDescriptor>> {
        self.descriptors.borrow().get(&type_id).cloned()
    }

    pub(crate) fn clear(&self) {
        self.descriptors.borrow_mut().clear();
    }
}

/// Userdata payload for a host object inside the Lua state.
struct HostCell {
    object: HostObject,
    descriptor: Option<Rc<TypeDescriptor>>,
}

impl HostCell {
    fn name(&self) -> &str {
        match &self.descriptor {
            Some(descriptor) => descriptor.name(),
            None => self.object.type_name(),
        }
    }

    fn descriptor(&self) -> mlua::Result<&TypeDescriptor> {
        self.descriptor.as_deref().ok_or_else(|| {
            mlua::Error::runtime(format!(
                "cannot index opaque host object of type {}",
                self.object.type_name()
            ))
        })
    }

    fn index(&self, lua: &Lua, key: ScriptValue) -> mlua::Result<Value> {
        let Ok(key) = key.try_string() else {
            return Ok(Value::Nil);
        };
        let descriptor = self.descriptor()?;
        if let Some(field) = descriptor.field(key) {
            return (field.get)(&self.object)?.into_lua(lua);
        }
        match descriptor.method(key) {
            Some(method) => bound_method(lua, self.object.clone(), method).map(Value::Function),
            None => Ok(Value::Nil),
        }
    }

    fn new_index(&self, key: &str, value: ScriptValue) -> mlua::Result<()> {
        self.descriptor()?.set_field(&self.object, key, value)?;
        Ok(())
    }
}

impl UserData for HostCell {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: ScriptValue| {
            this.index(lua, key)
        });
        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_, this, (key, value): (String, ScriptValue)| this.new_index(&key, value),
        );
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(host_object_of(&other).is_some_and(|o| o.same(&this.object)))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{}: {:p}", this.name(), this.object.addr()))
        });
    }
}

/// A Lua function calling `method` on `object`. Works with both `obj:m()`
/// and `obj.m()`: a leading receiver argument is dropped.
fn bound_method(
    lua: &Lua,
    object: HostObject,
    method: &MethodDescriptor,
) -> mlua::Result<Function> {
    let call = Rc::clone(&method.call);
    lua.create_function(move |lua, args: MultiValue| {
        let mut args = to_script_values(args);
        if matches!(args.first(), Some(ScriptValue::Host(first)) if first.same(&object)) {
            args.remove(0);
        }
        let results = call(&object, args)?;
        to_multi_value(lua, results)
    })
}

/// The host object stored in `ud`, if it is one of ours.
pub(crate) fn host_object_of(ud: &AnyUserData) -> Option<HostObject> {
    ud.borrow::<HostCell>().ok().map(|cell| cell.object.clone())
}

/// Push a host object into Lua, attaching its type's descriptor when the
/// type is registered with the engine.
pub(crate) fn host_object_into_lua(lua: &Lua, object: HostObject) -> mlua::Result<Value> {
    if let Some(handle) = object.handle() {
        return Ok(Value::UserData(handle.clone()));
    }
    let descriptor = lua
        .app_data_ref::<Rc<EngineState>>()
        .and_then(|state| state.types.get(object.type_id()));
    let cell = HostCell {
        object: object.without_handle(),
        descriptor,
    };
    lua.create_userdata(cell).map(Value::UserData)
}

impl Engine {
    /// Register `T` with a global constructor: scripts call `Name(...)`.
    ///
    /// Each construction clones `template`. An optional table argument
    /// initializes fields: `Name{Title = "x"}`.
    pub fn register_type<T: Reflect + Clone>(&self, name: &str, template: T) -> BridgeResult<()> {
        let descriptor = self.describe::<T>(name)?;
        let ctor = template_constructor(&self.lua, descriptor, template, None)?;
        self.install_global(name, Value::Function(ctor))?;
        debug!(type_name = name, "Registered type");
        Ok(())
    }

    /// Register `T` as a class: scripts call `Name.new(...)`.
    pub fn register_class<T: Reflect + Clone>(&self, name: &str, template: T) -> BridgeResult<()> {
        let descriptor = self.describe::<T>(name)?;
        let class = self.lua.create_table()?;
        let ctor = template_constructor(&self.lua, descriptor, template, Some(class.clone()))?;
        class.raw_set("new", ctor)?;
        self.install_global(name, Value::Table(class))?;
        debug!(type_name = name, "Registered class");
        Ok(())
    }

    /// Register `T` as a class whose `Name.new(...)` runs `ctor`.
    ///
    /// The constructor is marshalled like any native host function; objects
    /// of type `T` it returns get the type's fields and methods.
    pub fn register_class_with_constructor<T, Args, F>(
        &self,
        name: &str,
        ctor: F,
    ) -> BridgeResult<()>
    where
        T: Reflect,
        F: NativeFunction<Args>,
    {
        self.describe::<T>(name)?;
        let class = self.lua.create_table()?;
        let ctor = native_function(&self.lua, name, ctor.into_native())?;
        class.raw_set("new", ctor)?;
        self.install_global(name, Value::Table(class))?;
        debug!(type_name = name, "Registered class with constructor");
        Ok(())
    }

    /// The descriptor registered for `T`, if any.
    pub fn type_descriptor<T: Any>(&self) -> Option<Rc<TypeDescriptor>> {
        self.state.types.get(TypeId::of::<T>())
    }

    fn describe<T: Reflect>(&self, name: &str) -> BridgeResult<Rc<TypeDescriptor>> {
        match T::reflect() {
            Shape::Struct(mut descriptor) => {
                if descriptor.type_id != TypeId::of::<T>() {
                    return Err(BridgeError::registration(
                        name,
                        format!(
                            "descriptor describes {}, not {}",
                            descriptor.type_name,
                            std::any::type_name::<T>()
                        ),
                    ));
                }
                descriptor.name = name.to_string();
                Ok(self.state.types.insert(descriptor))
            }
            Shape::Scalar(kind) => Err(BridgeError::registration(
                name,
                format!(
                    "{} is a {} type, not a struct",
                    std::any::type_name::<T>(),
                    kind
                ),
            )),
        }
    }
}

/// Constructor cloning `template`. For classes, a leading class-table
/// argument (from `Name:new()`) is skipped.
fn template_constructor<T: Clone + 'static>(
    lua: &Lua,
    descriptor: Rc<TypeDescriptor>,
    template: T,
    class: Option<Table>,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let mut args = args.into_iter();
        let mut init = args.next();
        if let (Some(class), Some(Value::Table(first))) = (&class, &init) {
            if first.to_pointer() == class.to_pointer() {
                init = args.next();
            }
        }

        let object = HostObject::new(template.clone());
        if let Some(Value::Table(fields)) = init {
            fields.for_each::<String, Value>(|key, value| {
                descriptor
                    .set_field(&object, &key, ScriptValue::from_value(value))
                    .map_err(mlua::Error::from)
            })?;
        }

        let cell = HostCell {
            object,
            descriptor: Some(Rc::clone(&descriptor)),
        };
        lua.create_userdata(cell)
    })
}
