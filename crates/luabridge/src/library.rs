//! Selection of the Lua standard libraries an engine opens.
//!
//! The base library is always loaded. `debug` is never offered: it can
//! break out of any sandbox.

use mlua::StdLib;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A standard library an engine can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Library {
    /// `table`
    Table,

    /// `string`
    String,

    /// `math`
    Math,

    /// `io`: files and standard streams.
    Io,

    /// `os`: clock, environment, processes.
    Os,

    /// `package` and `require`. Needed for modules.
    Package,
}

impl Library {
    /// Every library a default engine opens.
    pub const ALL: [Library; 6] = [
        Library::Table,
        Library::String,
        Library::Math,
        Library::Io,
        Library::Os,
        Library::Package,
    ];

    /// Parse a library from its name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(Library::Table),
            "string" => Some(Library::String),
            "math" => Some(Library::Math),
            "io" => Some(Library::Io),
            "os" => Some(Library::Os),
            "package" => Some(Library::Package),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Library::Table => "table",
            Library::String => "string",
            Library::Math => "math",
            Library::Io => "io",
            Library::Os => "os",
            Library::Package => "package",
        }
    }

    fn std_lib(self) -> StdLib {
        match self {
            Library::Table => StdLib::TABLE,
            Library::String => StdLib::STRING,
            Library::Math => StdLib::MATH,
            Library::Io => StdLib::IO,
            Library::Os => StdLib::OS,
            Library::Package => StdLib::PACKAGE,
        }
    }

    /// The `mlua` flags for a selection of libraries.
    pub(crate) fn std_libs(libraries: &[Library]) -> StdLib {
        libraries
            .iter()
            .fold(StdLib::NONE, |libs, lib| libs | lib.std_lib())
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
