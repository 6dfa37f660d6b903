//! Violation Catalog
//!
//! The closed set of rules the static validator checks a script against.
//! Imports are allow-list-first: a module is usable only if it is a
//! whitelisted library or one of its submodules. Bare identifiers and
//! attribute names are deny-list-first.
//!
//! Everything here is static, read-only data shared by every request.

use serde::{Deserialize, Serialize};

// ============================================================================
// RULES
// ============================================================================

/// Category of a validation violation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Source could not be parsed
    SyntaxError,
    /// Reference to a dangerous bare identifier (eval, open, ...)
    DisallowedName,
    /// Import of, or reference to, a known-dangerous module
    DisallowedModule,
    /// Import of a module outside the whitelist
    ModuleNotWhitelisted,
    /// Relative import (`from . import x`)
    RelativeImport,
    /// `from module import *`
    WildcardImport,
    /// Attribute name that reaches the filesystem, a process or a serializer
    DisallowedMethod,
    /// Dunder or frame access into interpreter internals
    InterpreterIntrospection,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::SyntaxError => "syntax_error",
            RuleId::DisallowedName => "disallowed_name",
            RuleId::DisallowedModule => "disallowed_module",
            RuleId::ModuleNotWhitelisted => "module_not_whitelisted",
            RuleId::RelativeImport => "relative_import",
            RuleId::WildcardImport => "wildcard_import",
            RuleId::DisallowedMethod => "disallowed_method",
            RuleId::InterpreterIntrospection => "interpreter_introspection",
        }
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single catalog entry: what is matched and why it is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationRule {
    pub id: RuleId,
    pub pattern: &'static str,
    pub reason: &'static str,
}

impl ViolationRule {
    const fn name(pattern: &'static str, reason: &'static str) -> Self {
        Self {
            id: RuleId::DisallowedName,
            pattern,
            reason,
        }
    }

    const fn module(pattern: &'static str, reason: &'static str) -> Self {
        Self {
            id: RuleId::DisallowedModule,
            pattern,
            reason,
        }
    }

    const fn method(pattern: &'static str, reason: &'static str) -> Self {
        Self {
            id: RuleId::DisallowedMethod,
            pattern,
            reason,
        }
    }
}

const DYNAMIC_EVAL: &str = "dynamic code evaluation";
const RAW_IO: &str = "raw file or stream access";
const INTERPRETER: &str = "interpreter control";
const REFLECTION: &str = "reflective access to namespaces and attributes";
const PROCESS: &str = "process, environment or system-call access";
const NETWORK: &str = "network access";
const SERIALIZATION: &str = "serialization capable of arbitrary object reconstruction";
const FILE_WRITE: &str = "writes to the filesystem";

/// Bare identifiers a script may never reference
pub static DISALLOWED_NAMES: &[ViolationRule] = &[
    ViolationRule::name("eval", DYNAMIC_EVAL),
    ViolationRule::name("exec", DYNAMIC_EVAL),
    ViolationRule::name("compile", DYNAMIC_EVAL),
    ViolationRule::name("__import__", DYNAMIC_EVAL),
    ViolationRule::name("open", RAW_IO),
    ViolationRule::name("file", RAW_IO),
    ViolationRule::name("input", RAW_IO),
    ViolationRule::name("raw_input", RAW_IO),
    ViolationRule::name("execfile", RAW_IO),
    ViolationRule::name("reload", INTERPRETER),
    ViolationRule::name("breakpoint", INTERPRETER),
    ViolationRule::name("exit", INTERPRETER),
    ViolationRule::name("quit", INTERPRETER),
    ViolationRule::name("help", INTERPRETER),
    ViolationRule::name("globals", REFLECTION),
    ViolationRule::name("locals", REFLECTION),
    ViolationRule::name("vars", REFLECTION),
    ViolationRule::name("dir", REFLECTION),
    ViolationRule::name("getattr", REFLECTION),
    ViolationRule::name("setattr", REFLECTION),
    ViolationRule::name("delattr", REFLECTION),
    ViolationRule::name("system", PROCESS),
    ViolationRule::name("popen", PROCESS),
    ViolationRule::name("spawn", PROCESS),
    ViolationRule::name("fork", PROCESS),
    ViolationRule::name("kill", PROCESS),
    ViolationRule::name("getenv", PROCESS),
    ViolationRule::name("putenv", PROCESS),
    ViolationRule::name("environ", PROCESS),
    ViolationRule::name("create_connection", NETWORK),
    ViolationRule::name("urlopen", NETWORK),
    ViolationRule::name("cPickle", SERIALIZATION),
    ViolationRule::name("dill", SERIALIZATION),
];

/// Modules refused with a specific reason, whether imported or referenced
pub static DISALLOWED_MODULES: &[ViolationRule] = &[
    ViolationRule::module("os", PROCESS),
    ViolationRule::module("sys", INTERPRETER),
    ViolationRule::module("subprocess", PROCESS),
    ViolationRule::module("multiprocessing", PROCESS),
    ViolationRule::module("signal", PROCESS),
    ViolationRule::module("pty", PROCESS),
    ViolationRule::module("fcntl", PROCESS),
    ViolationRule::module("resource", PROCESS),
    ViolationRule::module("threading", PROCESS),
    ViolationRule::module("asyncio", PROCESS),
    ViolationRule::module("ctypes", PROCESS),
    ViolationRule::module("socket", NETWORK),
    ViolationRule::module("urllib", NETWORK),
    ViolationRule::module("requests", NETWORK),
    ViolationRule::module("http", NETWORK),
    ViolationRule::module("ftplib", NETWORK),
    ViolationRule::module("telnetlib", NETWORK),
    ViolationRule::module("webbrowser", NETWORK),
    ViolationRule::module("pickle", SERIALIZATION),
    ViolationRule::module("shelve", SERIALIZATION),
    ViolationRule::module("marshal", SERIALIZATION),
    ViolationRule::module("shutil", RAW_IO),
    ViolationRule::module("pathlib", RAW_IO),
    ViolationRule::module("io", RAW_IO),
    ViolationRule::module("tempfile", RAW_IO),
    ViolationRule::module("builtins", INTERPRETER),
    ViolationRule::module("importlib", INTERPRETER),
    ViolationRule::module("inspect", INTERPRETER),
    ViolationRule::module("gc", INTERPRETER),
    ViolationRule::module("code", DYNAMIC_EVAL),
    ViolationRule::module("codeop", DYNAMIC_EVAL),
    ViolationRule::module("operator", REFLECTION),
];

/// Attribute names refused on any object
pub static DISALLOWED_METHODS: &[ViolationRule] = &[
    ViolationRule::method("system", PROCESS),
    ViolationRule::method("popen", PROCESS),
    ViolationRule::method("spawnv", PROCESS),
    ViolationRule::method("spawnl", PROCESS),
    ViolationRule::method("execv", PROCESS),
    ViolationRule::method("execve", PROCESS),
    ViolationRule::method("savefig", FILE_WRITE),
    ViolationRule::method("to_csv", FILE_WRITE),
    ViolationRule::method("to_excel", FILE_WRITE),
    ViolationRule::method("to_parquet", FILE_WRITE),
    ViolationRule::method("to_hdf", FILE_WRITE),
    ViolationRule::method("to_feather", FILE_WRITE),
    ViolationRule::method("tofile", FILE_WRITE),
    ViolationRule::method("save", FILE_WRITE),
    ViolationRule::method("savez", FILE_WRITE),
    ViolationRule::method("savetxt", FILE_WRITE),
    ViolationRule::method("to_sql", NETWORK),
    ViolationRule::method("read_sql", NETWORK),
    ViolationRule::method("to_pickle", SERIALIZATION),
    ViolationRule::method("read_pickle", SERIALIZATION),
    ViolationRule::method("fromfile", SERIALIZATION),
    ViolationRule::method("load", SERIALIZATION),
];

/// Denylisted module names that are also ordinary variable names. They are
/// refused on import but not when they appear as a bare identifier.
pub static AMBIGUOUS_MODULE_NAMES: &[&str] = &[
    "code", "io", "signal", "resource", "http", "inspect", "gc", "requests", "operator",
];

/// Frame, generator and traceback attributes that lead to other frames and
/// their global or builtin tables
pub static FRAME_ATTRIBUTES: &[&str] = &[
    "gi_frame", "cr_frame", "ag_frame", "tb_frame", "f_back", "f_globals", "f_locals",
    "f_builtins", "f_code", "gi_code", "cr_code", "ag_code", "tb_next",
];

/// Dunder attributes that are harmless to read
pub static PERMITTED_DUNDER_ATTRIBUTES: &[&str] = &["__init__", "__str__", "__repr__"];

/// Dunder identifiers a script may reference as bare names
pub static PERMITTED_DUNDER_NAMES: &[&str] = &["__name__"];

// ============================================================================
// WHITELIST
// ============================================================================

/// A library the namespace preloads, with the aliases it is bound under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WhitelistedModule {
    pub module: &'static str,
    pub aliases: &'static [&'static str],
}

/// Libraries a script may import. Submodules are reached through their root.
pub static WHITELISTED_MODULES: &[WhitelistedModule] = &[
    WhitelistedModule {
        module: "numpy",
        aliases: &["np", "numpy"],
    },
    WhitelistedModule {
        module: "pandas",
        aliases: &["pd", "pandas"],
    },
    WhitelistedModule {
        module: "matplotlib",
        aliases: &["matplotlib"],
    },
    WhitelistedModule {
        module: "matplotlib.pyplot",
        aliases: &["plt"],
    },
    WhitelistedModule {
        module: "seaborn",
        aliases: &["sns", "seaborn"],
    },
];

// ============================================================================
// LOOKUPS
// ============================================================================

fn root_module(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

/// Rule for a disallowed bare identifier
pub fn disallowed_name(identifier: &str) -> Option<&'static ViolationRule> {
    DISALLOWED_NAMES.iter().find(|rule| rule.pattern == identifier)
}

/// Rule for a denylisted module; matches on the root package
pub fn disallowed_module(module: &str) -> Option<&'static ViolationRule> {
    let root = root_module(module);
    DISALLOWED_MODULES.iter().find(|rule| rule.pattern == root)
}

/// Rule for a bare identifier that names a denylisted module (`os`, `sys`)
pub fn module_reference(identifier: &str) -> Option<&'static ViolationRule> {
    if AMBIGUOUS_MODULE_NAMES.contains(&identifier) {
        return None;
    }
    DISALLOWED_MODULES
        .iter()
        .find(|rule| rule.pattern == identifier)
}

/// Rule for an attribute or import segment naming a denylisted module.
///
/// Libraries carry the modules they import as attributes (`matplotlib.subprocess`),
/// so unlike [`module_reference`] this includes the ambiguous names.
pub fn module_attribute(name: &str) -> Option<&'static ViolationRule> {
    DISALLOWED_MODULES.iter().find(|rule| rule.pattern == name)
}

/// Rule for a disallowed attribute name
pub fn disallowed_method(attribute: &str) -> Option<&'static ViolationRule> {
    DISALLOWED_METHODS.iter().find(|rule| rule.pattern == attribute)
}

/// Whether `module` is a whitelisted library or a submodule of one
pub fn is_whitelisted(module: &str) -> bool {
    let root = root_module(module);
    WHITELISTED_MODULES.iter().any(|entry| entry.module == root)
}

pub fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Whether reading attribute `name` reaches toward interpreter internals
pub fn is_introspective_attribute(name: &str) -> bool {
    (is_dunder(name) && !PERMITTED_DUNDER_ATTRIBUTES.contains(&name))
        || FRAME_ATTRIBUTES.contains(&name)
}

/// Whether the bare identifier `name` names interpreter internals
pub fn is_introspective_name(name: &str) -> bool {
    is_dunder(name)
        && !PERMITTED_DUNDER_NAMES.contains(&name)
        && !PERMITTED_DUNDER_ATTRIBUTES.contains(&name)
        && disallowed_name(name).is_none()
}
