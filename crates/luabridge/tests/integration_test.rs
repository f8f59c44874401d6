//! Integration tests for the luabridge engine.
//!
//! These tests cover:
//! - Loading scripts from files and strings
//! - Host to script calls and script to host callbacks
//! - Tables and host objects crossing the boundary
//! - Modules, types and classes
//! - Secure mode and configuration files

use luabridge::{
    BridgeError, Engine, EngineConfig, ModuleFields, Reflect, Sandbox, ScriptValue,
    StructBuilder,
};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

/// Write a file into the test directory.
fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[derive(Clone, Default, Debug, PartialEq, Reflect)]
#[reflect(methods = song_methods)]
struct Song {
    title: String,
    artist: String,
    #[reflect(readonly)]
    plays: f64,
}

fn song_methods(builder: StructBuilder<Song>) -> StructBuilder<Song> {
    builder
        .method("Describe", |s: &mut Song| format!("{} - {}", s.title, s.artist))
        .method("Play", |s: &mut Song, times: f64| {
            s.plays += times;
            s.plays
        })
}

// ==============================================================================
// Loading
// ==============================================================================

#[test]
fn test_load_file() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_file(
        temp_dir.path(),
        "greet.lua",
        r#"
        function greet(name)
            return "Hello, " .. name .. "!"
        end
        "#,
    );

    let engine = Engine::new();
    engine.load_file(&script).unwrap();

    let ret = engine.call("greet", 1, "Lua").unwrap();
    assert_eq!(ret[0].as_string(), "Hello, Lua!");
}

#[test]
fn test_load_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::new();
    let result = engine.load_file(temp_dir.path().join("missing.lua"));
    assert!(matches!(result, Err(BridgeError::Io(_))));
}

#[test]
fn test_load_file_syntax_error_names_chunk() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_file(temp_dir.path(), "broken.lua", "function (");

    let engine = Engine::new();
    match engine.load_file(&script) {
        Err(BridgeError::Load { chunk, .. }) => assert!(chunk.ends_with("broken.lua")),
        other => panic!("expected load error, got {:?}", other.err()),
    }
}

// ==============================================================================
// Calls
// ==============================================================================

#[test]
fn test_double_scenario() {
    let engine = Engine::new();
    engine
        .register_func("double", |e| {
            let x = e.pop_number();
            e.push_ret(x * 2.0);
            1
        })
        .unwrap();
    engine
        .load_string("function test(x) return double(x) end")
        .unwrap();

    let ret = engine.call("test", 1, 10.0).unwrap();
    assert_eq!(ret, vec![ScriptValue::Number(20.0)]);
}

#[test]
fn test_arguments_arrive_in_order() {
    let engine = Engine::new();
    engine
        .load_string("function sub(x, y) return x - y end")
        .unwrap();

    let ret = engine.call("sub", 1, (10, 3)).unwrap();
    assert_eq!(ret[0].as_number(), 7.0);
}

#[test]
fn test_primitives_round_trip_through_script() {
    let engine = Engine::new();
    engine.load_string("function id(v) return v end").unwrap();

    for n in [0.0, 1.5, -42.0] {
        assert_eq!(engine.call("id", 1, n).unwrap()[0].as_number(), n);
    }
    for s in ["", "text", "with \0 nul"] {
        assert_eq!(engine.call("id", 1, s).unwrap()[0].as_string(), s);
    }
    for b in [true, false] {
        assert_eq!(engine.call("id", 1, b).unwrap()[0].as_bool(), b);
    }
}

#[test]
fn test_binary_strings_pass_through_host_functions() {
    let engine = Engine::new();
    engine
        .register_func("echo", |e| {
            let v = e.pop_arg();
            e.push_ret(v);
            1
        })
        .unwrap();
    engine
        .load_string(
            r#"
            function roundtrip()
                local s = "\255\0\200"
                local r = echo(s)
                return r == s, #r
            end
            binary = "\255\0\200"
            "#,
        )
        .unwrap();

    let ret = engine.call("roundtrip", 2, ()).unwrap();
    assert!(ret[0].as_bool());
    assert_eq!(ret[1].as_number(), 3.0);

    let binary = engine.get_global("binary");
    assert_eq!(binary.as_bytes(), Some(&[0xff_u8, 0x00, 0xc8][..]));
    assert!(binary.try_string().is_err());
}

#[test]
fn test_numbers_convert_to_strings_like_lua() {
    let engine = Engine::new();
    engine
        .load_string(
            r#"
            function sum() return 0.1 + 0.2 end
            function big() return 1e20 end
            function third() return 1 / 3 end
            function same_as_lua(n) return tostring(n) end
            "#,
        )
        .unwrap();

    for name in ["sum", "big", "third"] {
        let n = engine.call(name, 1, ()).unwrap().remove(0);
        let lua = engine.call("same_as_lua", 1, &n).unwrap();
        assert_eq!(n.as_string(), lua[0].as_string(), "{}", name);
    }
    assert_eq!(engine.call("sum", 1, ()).unwrap()[0].as_string(), "0.3");
    assert_eq!(engine.call("big", 1, ()).unwrap()[0].as_string(), "1e+20");
}

#[test]
fn test_native_integer_arguments_must_be_exact() {
    let engine = Engine::new();
    engine
        .register_native_func("idx", |i: i32| i)
        .unwrap();
    engine
        .load_string(
            r#"
            function whole() return idx(4) end
            function fraction() return idx(2.9) end
            function huge() return idx(1e20) end
            "#,
        )
        .unwrap();

    assert_eq!(engine.call("whole", 1, ()).unwrap()[0].as_number(), 4.0);
    for name in ["fraction", "huge"] {
        let err = engine.call(name, 1, ()).unwrap_err();
        assert!(err.to_string().contains("Bad argument #1"), "{}: {}", name, err);
        assert!(err.to_string().contains("does not fit in i32"), "{}: {}", name, err);
    }
}

#[test]
fn test_reentrant_calls() {
    let engine = Engine::new();
    engine
        .register_func("host_outer", |e| {
            let x = e.pop_number();
            let inner = e.call("script_inner", 1, x + 1.0).unwrap_or_default();
            e.push_ret(inner.first().cloned().unwrap_or_default());
            1
        })
        .unwrap();
    engine
        .register_func("host_inner", |e| {
            let x = e.pop_number();
            e.push_ret(x * 10.0);
            1
        })
        .unwrap();
    engine
        .load_string(
            r#"
            function script_inner(x) return host_inner(x) end
            function script_outer(x) return host_outer(x) end
            "#,
        )
        .unwrap();

    let ret = engine.call("script_outer", 1, 1.0).unwrap();
    assert_eq!(ret[0].as_number(), 20.0);
    assert_eq!(engine.arg_count(), 0);
}

#[test]
fn test_script_error_does_not_poison_engine() {
    let engine = Engine::new();
    engine
        .load_string(
            r#"
            function fail() error("failure") end
            function ok() return "ok" end
            "#,
        )
        .unwrap();

    assert!(matches!(
        engine.call("fail", 0, ()),
        Err(BridgeError::Call { .. })
    ));
    assert_eq!(engine.call("ok", 1, ()).unwrap()[0].as_string(), "ok");
}

// ==============================================================================
// Tables
// ==============================================================================

#[test]
fn test_table_scenario() {
    let engine = Engine::new();
    let table = engine.new_table().unwrap();
    table.table_raw_set_int(1, engine.value_for("x"));
    assert_eq!(table.table_len(), 1);
    assert_eq!(table.table_raw_get_int(1).as_string(), "x");
}

#[test]
fn test_table_operations_from_script() {
    let engine = Engine::new();
    engine
        .load_string(r#"list = { "a", "b", "c" }"#)
        .unwrap();

    let list = engine.get_global("list");
    list.table_append("d");
    list.table_insert(1, "start");
    assert_eq!(list.table_len(), 5);
    assert_eq!(list.table_remove(2).as_string(), "a");
    assert_eq!(list.table_len(), 4);
    assert_eq!(list.table_max_n(), 4.0);

    let mut values = Vec::new();
    let (mut key, mut value) = list.table_next(&ScriptValue::Nil);
    while !key.is_nil() {
        values.push(value.as_string());
        (key, value) = list.table_next(&key);
    }
    values.sort();
    assert_eq!(values, vec!["b", "c", "d", "start"]);

    let pairs = list.table_pairs();
    assert_eq!(pairs.len(), 4);
    let mut walked: Vec<String> = pairs.iter().map(|(_, v)| v.as_string()).collect();
    walked.sort();
    assert_eq!(walked, values);

    engine.load_string("joined = table.concat(list, ',')").unwrap();
    assert_eq!(engine.get_global("joined").as_string(), "start,b,c,d");
}

#[test]
fn test_table_operations_ignore_non_tables() {
    let value = ScriptValue::Number(1.0);
    value.table_append("x");
    value.table_raw_set("k", "v");
    assert_eq!(value.table_len(), 0);
    assert!(value.table_remove(1).is_nil());
    assert!(value.table_raw_get("k").is_nil());
}

// ==============================================================================
// Host Objects
// ==============================================================================

#[test]
fn test_shared_host_object_mutation_is_visible() {
    let engine = Engine::new();
    engine.register_type("Song", Song::default()).unwrap();

    let song = Rc::new(RefCell::new(Song {
        title: "Before".into(),
        ..Song::default()
    }));
    engine.set_global("song", Rc::clone(&song)).unwrap();
    engine
        .load_string(
            r#"
            function read_title() return song.title end
            function rename(t) song.Title = t end
            "#,
        )
        .unwrap();

    song.borrow_mut().title = "Host".into();
    assert_eq!(engine.call("read_title", 1, ()).unwrap()[0].as_string(), "Host");

    engine.call("rename", 0, "Script").unwrap();
    assert_eq!(song.borrow().title, "Script");
}

#[test]
fn test_host_object_identity_is_preserved() {
    let engine = Engine::new();
    engine.set_global("token", ScriptValue::host(7_u32)).unwrap();
    engine
        .load_string(
            r#"
            function echo(v) return v end
            function same(a) return rawequal(a, token) end
            "#,
        )
        .unwrap();

    let token = engine.get_global("token");
    let echoed = engine.call("echo", 1, &token).unwrap();
    assert_eq!(echoed[0], token);
    assert!(engine.call("same", 1, &token).unwrap()[0].as_bool());
}

// ==============================================================================
// Types and Classes
// ==============================================================================

#[test]
fn test_song_scenario() {
    let engine = Engine::new();
    engine.register_type("Song", Song::default()).unwrap();
    engine
        .load_string(
            r#"
            local s = Song()
            s.Title = "A"
            s.Artist = "B"
            function f() return s.Title .. " - " .. s.Artist end
            function g() return s:Describe() end
            "#,
        )
        .unwrap();

    assert_eq!(engine.call("f", 1, ()).unwrap()[0].as_string(), "A - B");
    assert_eq!(engine.call("g", 1, ()).unwrap()[0].as_string(), "A - B");
}

#[test]
fn test_type_objects_return_to_host() {
    let engine = Engine::new();
    engine.register_type("Song", Song::default()).unwrap();
    engine
        .load_string(
            r#"
            function make()
                local s = Song{ title = "Blue", artist = "Joni" }
                s:Play(2)
                return s
            end
            "#,
        )
        .unwrap();

    let ret = engine.call("make", 1, ()).unwrap();
    let song = ret[0].downcast::<Song>().unwrap();
    assert_eq!(
        *song.borrow(),
        Song {
            title: "Blue".into(),
            artist: "Joni".into(),
            plays: 2.0,
        }
    );
}

#[test]
fn test_field_type_errors() {
    let engine = Engine::new();
    engine.register_type("Song", Song::default()).unwrap();
    engine
        .load_string(
            r#"
            function bad_value() local s = Song() s.Title = {} end
            function read_only() local s = Song() s.Plays = 3 end
            function unknown() local s = Song() s.Album = "x" end
            "#,
        )
        .unwrap();

    for name in ["bad_value", "read_only", "unknown"] {
        assert!(engine.call(name, 0, ()).is_err(), "{} should fail", name);
    }
}

#[test]
fn test_register_class() {
    let engine = Engine::new();
    engine.register_class("Song", Song::default()).unwrap();
    engine
        .load_string(
            r#"
            function make(title)
                local a = Song.new{ Title = title }
                local b = Song:new()
                b.Title = "other"
                return a.Title, b.Title
            end
            "#,
        )
        .unwrap();

    let ret = engine.call("make", 2, "first").unwrap();
    assert_eq!(ret[0].as_string(), "first");
    assert_eq!(ret[1].as_string(), "other");
}

#[test]
fn test_register_class_with_constructor() {
    let engine = Engine::new();
    engine
        .register_class_with_constructor::<Song, _, _>("Song", |title: String, artist: String| {
            Rc::new(RefCell::new(Song {
                title,
                artist,
                plays: 0.0,
            }))
        })
        .unwrap();
    engine
        .load_string(
            r#"
            function describe()
                local s = Song.new("So What", "Miles Davis")
                return s:Describe()
            end
            "#,
        )
        .unwrap();

    let ret = engine.call("describe", 1, ()).unwrap();
    assert_eq!(ret[0].as_string(), "So What - Miles Davis");
}

#[test]
fn test_scalar_types_are_rejected() {
    let engine = Engine::new();
    let result = engine.register_class("Title", String::new());
    assert!(matches!(result, Err(BridgeError::Registration { .. })));
}

// ==============================================================================
// Modules
// ==============================================================================

#[test]
fn test_module_is_materialized_once() {
    let engine = Engine::new();
    let loads = Rc::new(Cell::new(0));
    let counter = Rc::clone(&loads);
    engine
        .register_module_loader("stats", move |e| {
            counter.set(counter.get() + 1);
            e.generate_module(
                &ModuleFields::new().native("sum", |a: f64, b: f64| a + b),
            )
            .unwrap_or_default()
        })
        .unwrap();
    engine
        .load_string(
            r#"
            function total()
                local first = require("stats")
                local second = require("stats")
                return first.sum(1, 2), rawequal(first, second)
            end
            "#,
        )
        .unwrap();

    let ret = engine.call("total", 2, ()).unwrap();
    assert_eq!(ret[0].as_number(), 3.0);
    assert!(ret[1].as_bool());
    engine.call("total", 2, ()).unwrap();
    assert_eq!(loads.get(), 1);
}

#[test]
fn test_module_state_is_shared_between_functions() {
    let engine = Engine::new();
    engine
        .register_module("m", ModuleFields::new().value("version", "1.0"))
        .unwrap();
    engine
        .load_string(
            r#"
            function write() require("m").x = 1 end
            function read() return require("m").x end
            "#,
        )
        .unwrap();

    assert!(engine.call("read", 1, ()).unwrap()[0].is_nil());
    engine.call("write", 0, ()).unwrap();
    assert_eq!(engine.call("read", 1, ()).unwrap()[0].as_number(), 1.0);
}

// ==============================================================================
// Secure Mode
// ==============================================================================

#[test]
fn test_sandbox_enforcement() {
    let inspect = r#"
        function inspect()
            return io ~= nil, os ~= nil and os.execute ~= nil
        end
    "#;

    let plain = Engine::new();
    plain.load_string(inspect).unwrap();
    let ret = plain.call("inspect", 2, ()).unwrap();
    assert!(ret[0].as_bool());
    assert!(ret[1].as_bool());

    let secure = Engine::new_secure().unwrap();
    secure.load_string(inspect).unwrap();
    let ret = secure.call("inspect", 2, ()).unwrap();
    assert!(!ret[0].as_bool());
    assert!(!ret[1].as_bool());
    assert!(secure.is_restricted("inspect"));
    assert_eq!(secure.sandbox(), Some(&Sandbox::default()));
}

#[test]
fn test_secure_engine_with_types() {
    let engine = Engine::new_secure().unwrap();
    engine.register_type("Song", Song::default()).unwrap();
    engine
        .load_string(
            r#"
            function describe()
                local s = Song{ Title = "A", Artist = "B" }
                return s:Describe()
            end
            "#,
        )
        .unwrap();

    assert_eq!(engine.call("describe", 1, ()).unwrap()[0].as_string(), "A - B");
}

// ==============================================================================
// Configuration
// ==============================================================================

#[test]
fn test_engine_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    write_file(
        temp_dir.path(),
        "jail.lua",
        r#"
        local name = ...
        _G[name] = { tostring = tostring, string = string }
        "#,
    );
    let config_path = write_file(
        temp_dir.path(),
        "engine.toml",
        r#"
libraries = ["string", "io"]

[sandbox]
enabled = true
env_name = "jail"
setup_file = "jail.lua"
"#,
    );

    let config = EngineConfig::load(&config_path).unwrap();
    assert_eq!(
        config.sandbox.setup_file.as_deref(),
        Some(temp_dir.path().join("jail.lua").as_path())
    );

    let engine = Engine::from_config(&config).unwrap();
    assert!(engine.is_secure());
    engine
        .load_string(
            r#"
            has_io_globally = io ~= nil
            function inspect() return io ~= nil, string.rep("a", 3) end
            "#,
        )
        .unwrap();

    assert!(engine.get_global("has_io_globally").as_bool());
    let ret = engine.call("inspect", 2, ()).unwrap();
    assert!(!ret[0].as_bool());
    assert_eq!(ret[1].as_string(), "aaa");
}

#[test]
fn test_config_with_missing_setup_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_file(
        temp_dir.path(),
        "engine.toml",
        "[sandbox]\nenabled = true\nsetup_file = \"nowhere.lua\"\n",
    );

    let config = EngineConfig::load(&config_path).unwrap();
    assert!(matches!(
        Engine::from_config(&config),
        Err(BridgeError::Io(_))
    ));
}
