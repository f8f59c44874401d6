//! # luabridge
//!
//! Embedding bridge between Rust host code and a Lua 5.1 runtime.
//!
//! This crate provides:
//! - An [`Engine`] that loads script files and strings and calls script
//!   functions by name
//! - [`ScriptValue`], a dynamic value that crosses the boundary in both
//!   directions, with table helpers
//! - Host functions, either stack-based (`pop_*` / `push_ret`) or typed
//! - Lazily loaded modules for `require`
//! - Host structs exposed as script objects with fields and methods, with
//!   `#[derive(Reflect)]` for the field glue
//! - A secure mode that strips ambient capabilities from script functions
//!
//! ## Example
//!
//! ```ignore
//! use luabridge::Engine;
//!
//! let engine = Engine::new();
//! engine.register_func("double", |e| {
//!     let x = e.pop_number();
//!     e.push_ret(x * 2.0);
//!     1
//! })?;
//! engine.load_string("function test(x) return double(x) end")?;
//!
//! let ret = engine.call("test", 1, 10.0)?;
//! assert_eq!(ret[0].as_number(), 20.0);
//! ```
//!
//! ## Threading
//!
//! An engine owns one Lua state and is single-threaded. Use one engine per
//! worker when parallelism is needed.

// Lets `#[derive(Reflect)]` expand to `::luabridge` paths inside this crate too.
extern crate self as luabridge;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod library;
pub mod marshal;
pub mod module;
pub mod sandbox;
pub mod types;
pub mod value;

pub use bridge::NativeFunction;
pub use config::{EngineConfig, SandboxConfig};
pub use engine::Engine;
pub use error::{BridgeError, BridgeResult};
pub use library::Library;
pub use marshal::{FromScript, IntoReturns, IntoScript, IntoScriptArgs};
pub use module::ModuleFields;
pub use sandbox::Sandbox;
pub use types::{HostMethod, Reflect, Shape, StructBuilder, TypeDescriptor};
pub use value::{HostObject, ScriptValue, ValueKind};

pub use bstr::BString;
pub use luabridge_derive::Reflect;
pub use mlua;
