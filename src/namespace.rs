//! Capability Namespace Builder
//!
//! A [`CapabilityNamespace`] describes everything a script can see: a reduced
//! set of built-ins, the preloaded whitelisted libraries under their usual
//! aliases, the staged dataset path, and the resolution table behind the
//! import hook. The worker harness materializes it into the globals the script
//! runs against.
//!
//! Import resolution is decided here. The script's import statements are
//! resolved ahead of time into a table, and the harness hook only looks
//! requests up in it: anything missing from the table is denied.

use crate::analyzer::ValidatedScript;
use crate::catalog::{self, WhitelistedModule};
use crate::config::SandboxConfig;
use crate::errors::Result;
use crate::workspace::IsolatedWorkspace;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::error;

/// Name under which the staged dataset path is bound
pub const DATASET_BINDING: &str = "file_path";

/// Built-ins exposed to scripts. Reflective and dynamic-execution primitives
/// and anything that opens a resource are absent; `__import__` is replaced by
/// the whitelist resolution hook.
pub static SAFE_BUILTINS: &[&str] = &[
    "print", "len", "range", "enumerate", "zip", "map", "filter", "sum", "min", "max", "abs",
    "round", "sorted", "reversed", "list", "dict", "set", "frozenset", "tuple", "str", "int",
    "float", "bool", "isinstance", "type", "any", "all", "divmod", "pow", "repr", "format",
    "slice", "iter", "next", "Exception", "ArithmeticError", "AttributeError", "ImportError",
    "IndexError", "KeyError", "LookupError", "NameError", "RuntimeError", "StopIteration",
    "TypeError", "ValueError", "ZeroDivisionError",
];

/// Raised when the resolution hook is asked for a module outside the whitelist
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capability denied: module `{module}` cannot be resolved in the sandbox")]
pub struct CapabilityDenied {
    pub module: String,
}

/// Where an import request lands: a preloaded library, then attribute lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub library: &'static str,
    pub attribute_path: Vec<String>,
}

/// The restricted environment for exactly one execution
#[derive(Debug)]
pub struct CapabilityNamespace {
    builtins: &'static [&'static str],
    libraries: &'static [WhitelistedModule],
    dataset_path: Option<PathBuf>,
    max_table_rows: usize,
    max_output_bytes: usize,
    workspace: IsolatedWorkspace,
}

impl CapabilityNamespace {
    /// The only file the script is given a path to
    pub fn dataset_path(&self) -> Option<&Path> {
        self.dataset_path.as_deref()
    }

    pub fn workspace(&self) -> &IsolatedWorkspace {
        &self.workspace
    }

    /// Resolve one import request.
    ///
    /// The longest preloaded library that prefixes `module` wins and the rest
    /// of the dotted path is walked as attributes. Anything else fails closed.
    pub fn resolve(&self, module: &str) -> std::result::Result<Resolution, CapabilityDenied> {
        let denied = || CapabilityDenied {
            module: module.to_string(),
        };

        let library = self
            .libraries
            .iter()
            .filter(|library| {
                module == library.module
                    || module
                        .strip_prefix(library.module)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
            .max_by_key(|library| library.module.len())
            .ok_or_else(denied)?;

        let rest = &module[library.module.len()..];
        let attribute_path: Vec<String> = rest
            .split('.')
            .skip(1)
            .map(str::to_string)
            .collect();
        if attribute_path
            .iter()
            .any(|part| part.is_empty() || catalog::is_dunder(part))
        {
            return Err(denied());
        }

        Ok(Resolution {
            library: library.module,
            attribute_path,
        })
    }

    /// Resolve every import `script` makes. Requests that fail are left out,
    /// so the hook denies them when the script reaches them.
    pub fn resolution_table(&self, script: &ValidatedScript) -> BTreeMap<String, Resolution> {
        let mut table = BTreeMap::new();
        for module in script.imports() {
            match self.resolve(module) {
                Ok(resolution) => {
                    table.insert(module.clone(), resolution);
                }
                Err(denied) => error!(
                    module = %denied.module,
                    "[SANDBOX] Validated import has no resolution; the validator has a gap"
                ),
            }
        }
        table
    }

    pub(crate) fn harness_spec(&self, script: &ValidatedScript) -> NamespaceSpec<'_> {
        NamespaceSpec {
            builtins: self.builtins,
            libraries: self.libraries,
            resolutions: self.resolution_table(script),
            dataset_binding: DATASET_BINDING,
            dataset_path: self.dataset_path.as_deref(),
            max_table_rows: self.max_table_rows,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

/// Wire form of the namespace handed to the worker harness
#[derive(Debug, Serialize)]
pub(crate) struct NamespaceSpec<'a> {
    builtins: &'a [&'static str],
    libraries: &'a [WhitelistedModule],
    resolutions: BTreeMap<String, Resolution>,
    dataset_binding: &'static str,
    dataset_path: Option<&'a Path>,
    max_table_rows: usize,
    max_output_bytes: usize,
}

/// Builds a fresh [`CapabilityNamespace`] per execution
#[derive(Debug, Clone)]
pub struct NamespaceBuilder {
    workspace_base: PathBuf,
    max_table_rows: usize,
    max_output_bytes: usize,
}

impl NamespaceBuilder {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            workspace_base: config.workspace_base.clone(),
            max_table_rows: config.max_table_rows,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Create a new workspace, stage `input_file` into it and bind the copy
    pub fn build(&self, input_file: Option<&Path>) -> Result<CapabilityNamespace> {
        let workspace = IsolatedWorkspace::new(&self.workspace_base)?;
        let dataset_path = input_file
            .map(|path| workspace.stage_input(path))
            .transpose()?;

        Ok(CapabilityNamespace {
            builtins: SAFE_BUILTINS,
            libraries: catalog::WHITELISTED_MODULES,
            dataset_path,
            max_table_rows: self.max_table_rows,
            max_output_bytes: self.max_output_bytes,
            workspace,
        })
    }
}
