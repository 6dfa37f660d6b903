//! Static validation of candidate scripts.
//!
//! The source is parsed with the tree-sitter Python grammar and every node of
//! the resulting tree is checked against the [`crate::catalog`]. Nothing is
//! compiled or executed here.

use crate::catalog::{self, RuleId};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tree_sitter::{Node, Parser, Tree};

/// 1-based position of a node in the source; columns count characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// One broken rule, pinned to the offending node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RuleId,
    #[serde(flatten)]
    pub location: Location,
    pub message: String,
}

/// Result of a validation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    passed: bool,
    violations: Vec<Violation>,
}

impl ValidationVerdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Violations in source order
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

/// Source text that passed validation.
///
/// Only [`check`] constructs this, so holding one proves the text was
/// accepted by the validator.
#[derive(Debug, Clone)]
pub struct ValidatedScript {
    source: String,
    imports: Vec<String>,
}

impl ValidatedScript {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Modules named by the script's import statements, in source order
    pub fn imports(&self) -> &[String] {
        &self.imports
    }
}

/// Validate `source` and, if it passes, wrap it for execution
pub fn check(source: &str) -> Result<ValidatedScript, ValidationVerdict> {
    let (verdict, imports) = walk(source);
    if verdict.passed() {
        Ok(ValidatedScript {
            source: source.to_owned(),
            imports,
        })
    } else {
        Err(verdict)
    }
}

/// Walk the syntax tree of `source` and collect every violation.
///
/// A source that does not parse yields exactly one `syntax_error` violation.
pub fn validate(source: &str) -> ValidationVerdict {
    walk(source).0
}

fn walk(source: &str) -> (ValidationVerdict, Vec<String>) {
    let tree = match parse(source) {
        Ok(tree) => tree,
        Err(message) => {
            let violation = Violation {
                rule: RuleId::SyntaxError,
                location: Location { line: 1, column: 1 },
                message,
            };
            return (ValidationVerdict::from_violations(vec![violation]), Vec::new());
        }
    };

    let root = tree.root_node();
    let mut walker = Walker {
        source,
        violations: Vec::new(),
        imports: Vec::new(),
    };

    if root.has_error() {
        walker.report_syntax_error(root);
    } else {
        preorder(root, |node, field| {
            walker.visit(node, field);
            ControlFlow::<()>::Continue(())
        });
    }

    (
        ValidationVerdict::from_violations(walker.violations),
        walker.imports,
    )
}

fn parse(source: &str) -> Result<Tree, String> {
    let mut parser = Parser::new();
    let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    parser
        .set_language(&language)
        .map_err(|e| format!("Python grammar unavailable: {}", e))?;
    parser
        .parse(source, None)
        .ok_or_else(|| "parser produced no syntax tree".to_string())
}

/// Visit every node under `root` exactly once, parents before children.
///
/// The callback also receives the field name the node occupies in its parent.
fn preorder<'t, B>(
    root: Node<'t>,
    mut visit: impl FnMut(Node<'t>, Option<&'static str>) -> ControlFlow<B>,
) -> Option<B> {
    let mut cursor = root.walk();
    loop {
        if let ControlFlow::Break(value) = visit(cursor.node(), cursor.field_name()) {
            return Some(value);
        }
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

struct Walker<'s> {
    source: &'s str,
    violations: Vec<Violation>,
    imports: Vec<String>,
}

impl<'s> Walker<'s> {
    fn visit(&mut self, node: Node<'_>, field: Option<&'static str>) {
        match node.kind() {
            "import_statement" => self.visit_import(node),
            "import_from_statement" => self.visit_import_from(node),
            "future_import_statement" => self.check_import("__future__", node),
            "identifier" => self.visit_identifier(node, field),
            "string_content" => self.visit_string_content(node),
            // Python 2 form; CPython refuses it anyway but it is still dynamic evaluation
            "exec_statement" => self.push(
                RuleId::DisallowedName,
                node,
                "use of `exec` is not allowed (dynamic code evaluation)".to_string(),
            ),
            _ => {}
        }
    }

    fn visit_import(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let module_node = match child.kind() {
                "dotted_name" => Some(child),
                "aliased_import" => child.child_by_field_name("name"),
                _ => None,
            };
            if let Some(module_node) = module_node {
                let module = self.dotted_text(module_node);
                self.check_import(&module, module_node);
            }
        }
    }

    fn visit_import_from(&mut self, node: Node<'_>) {
        if let Some(module_node) = node.child_by_field_name("module_name") {
            if module_node.kind() == "relative_import" {
                self.push(
                    RuleId::RelativeImport,
                    module_node,
                    "relative imports are not allowed".to_string(),
                );
            } else {
                let module = self.dotted_text(module_node);
                self.check_import(&module, module_node);
            }
        }

        let mut cursor = node.walk();
        if let Some(wildcard) = node
            .named_children(&mut cursor)
            .find(|child| child.kind() == "wildcard_import")
        {
            self.push(
                RuleId::WildcardImport,
                wildcard,
                "wildcard imports are not allowed; import names explicitly".to_string(),
            );
        }

        // `from numpy import load` pulls a refused attribute in by name
        for child in node.children_by_field_name("name", &mut cursor) {
            let name_node = match child.kind() {
                "aliased_import" => child.child_by_field_name("name"),
                _ => Some(child),
            };
            let Some(name_node) = name_node else { continue };
            let name = self.dotted_text(name_node);
            if let Some(rule) = catalog::disallowed_method(&name) {
                let message = format!("import of `{}` is not allowed ({})", name, rule.reason);
                self.push(rule.id, name_node, message);
            } else if let Some(rule) = catalog::module_attribute(&name) {
                let message = format!("import of module `{}` is not allowed ({})", name, rule.reason);
                self.push(rule.id, name_node, message);
            } else if catalog::is_introspective_attribute(&name) {
                let message = format!("import of `{}` is not allowed (interpreter internals)", name);
                self.push(RuleId::InterpreterIntrospection, name_node, message);
            }
        }
    }

    fn check_import(&mut self, module: &str, node: Node<'_>) {
        self.imports.push(module.to_string());

        // `import numpy.os` walks into a module the library imported itself
        let nested = module
            .split('.')
            .skip(1)
            .find_map(|segment| catalog::module_attribute(segment).map(|rule| (segment, rule)));

        if let Some(rule) = catalog::disallowed_module(module) {
            let message = format!("import of `{}` is not allowed ({})", module, rule.reason);
            self.push(rule.id, node, message);
        } else if !catalog::is_whitelisted(module) {
            let allowed = catalog::WHITELISTED_MODULES
                .iter()
                .filter(|entry| !entry.module.contains('.'))
                .map(|entry| entry.module)
                .collect::<Vec<_>>()
                .join(", ");
            let message = format!(
                "import of `{}` is not allowed; importable modules: {}",
                module, allowed
            );
            self.push(RuleId::ModuleNotWhitelisted, node, message);
        } else if let Some((segment, rule)) = nested {
            let message = format!(
                "import of `{}` reaches module `{}` ({})",
                module, segment, rule.reason
            );
            self.push(rule.id, node, message);
        } else if module.split('.').any(catalog::is_introspective_attribute) {
            let message = format!("import of `{}` is not allowed (interpreter internals)", module);
            self.push(RuleId::InterpreterIntrospection, node, message);
        }
    }

    fn visit_identifier(&mut self, node: Node<'_>, field: Option<&'static str>) {
        let parent_kind = node.parent().map(|parent| parent.kind());
        let name = self.text(node);

        match (parent_kind, field) {
            (Some("attribute"), Some("attribute")) => self.check_attribute(name, node),
            // import paths are judged as whole modules
            (Some("dotted_name"), _) => {}
            // `f(input=...)` names a parameter, not the builtin
            (Some("keyword_argument"), Some("name")) => {}
            _ => self.check_bare_name(name, node),
        }
    }

    fn check_attribute(&mut self, name: &str, node: Node<'_>) {
        if catalog::is_introspective_attribute(name) {
            let message = format!("access to `{}` is not allowed (interpreter internals)", name);
            self.push(RuleId::InterpreterIntrospection, node, message);
        } else if let Some(rule) = catalog::disallowed_method(name) {
            let message = format!("use of `.{}` is not allowed ({})", name, rule.reason);
            self.push(rule.id, node, message);
        } else if let Some(rule) = catalog::module_attribute(name) {
            let message = format!("access to module `.{}` is not allowed ({})", name, rule.reason);
            self.push(rule.id, node, message);
        }
    }

    fn check_bare_name(&mut self, name: &str, node: Node<'_>) {
        if let Some(rule) = catalog::disallowed_name(name) {
            let message = format!("use of `{}` is not allowed ({})", name, rule.reason);
            self.push(rule.id, node, message);
        } else if let Some(rule) = catalog::module_reference(name) {
            let message = format!("reference to module `{}` is not allowed ({})", name, rule.reason);
            self.push(rule.id, node, message);
        } else if catalog::is_introspective_name(name) {
            let message = format!("use of `{}` is not allowed (interpreter internals)", name);
            self.push(RuleId::InterpreterIntrospection, node, message);
        }
    }

    /// `"{0.__class__}".format(x)` reads dunders without naming them in code.
    /// Any literal with such a replacement field is refused, wherever it is
    /// later formatted.
    fn visit_string_content(&mut self, node: Node<'_>) {
        if let Some(name) = format_field_dunder(self.text(node)) {
            let message = format!(
                "format field reaching into `{}` is not allowed (interpreter internals)",
                name
            );
            self.push(RuleId::InterpreterIntrospection, node, message);
        }
    }

    fn report_syntax_error(&mut self, root: Node<'_>) {
        let offending = preorder(root, |node, _| {
            if node.is_error() || node.is_missing() {
                ControlFlow::Break(node)
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap_or(root);

        let message = if offending.is_missing() {
            format!("invalid syntax: missing `{}`", offending.kind())
        } else {
            "invalid syntax".to_string()
        };
        self.push(RuleId::SyntaxError, offending, message);
    }

    fn push(&mut self, rule: RuleId, node: Node<'_>, message: String) {
        let location = self.location(node);
        self.violations.push(Violation {
            rule,
            location,
            message,
        });
    }

    fn text(&self, node: Node<'_>) -> &'s str {
        self.source.get(node.byte_range()).unwrap_or_default()
    }

    fn dotted_text(&self, node: Node<'_>) -> String {
        self.text(node).split_whitespace().collect()
    }

    fn location(&self, node: Node<'_>) -> Location {
        let point = node.start_position();
        let start = node.start_byte();
        let line_start = start.saturating_sub(point.column);
        let prefix = self.source.get(line_start..start).unwrap_or_default();
        Location {
            line: point.row + 1,
            column: prefix.chars().count() + 1,
        }
    }
}

/// First introspective name inside a `{...}` replacement field of `text`
fn format_field_dunder(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let field = &rest[open + 1..];
        let close = field.find('}').unwrap_or(field.len());
        let found = field[..close]
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|token| catalog::is_introspective_attribute(token));
        if found.is_some() {
            return found;
        }
        rest = &field[close..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(verdict: &ValidationVerdict) -> Vec<RuleId> {
        verdict.violations().iter().map(|v| v.rule).collect()
    }

    fn at(verdict: &ValidationVerdict, index: usize) -> (RuleId, usize, usize) {
        let v = &verdict.violations()[index];
        (v.rule, v.location.line, v.location.column)
    }

    #[test]
    fn test_print_passes() {
        let verdict = validate("print(\"hi\")");
        assert!(verdict.passed());
        assert!(verdict.violations().is_empty());
    }

    #[test]
    fn test_whitelisted_analysis_script_passes() {
        let code = r#"
import pandas as pd
import numpy as np
import matplotlib.pyplot as plt
import seaborn as sns
from pandas import DataFrame

def summarize(frame):
    return frame.describe()

df = pd.read_csv(file_path)
totals = df.groupby("region")["sales"].sum()
print(summarize(df))
print(f"mean: {np.mean([1, 2, 3]):.2f}")
plt.figure(figsize=(4, 3))
sns.barplot(x=totals.index, y=totals.values)
if __name__ == "__main__":
    print(len(totals), sorted(totals.index))
"#;
        let verdict = validate(code);
        assert!(verdict.passed(), "{:?}", verdict.violations());
    }

    #[test]
    fn test_import_socket_is_rejected() {
        let verdict = validate("import socket");
        assert!(!verdict.passed());
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedModule, 1, 8));
        assert!(verdict.violations()[0].message.contains("network"));
    }

    #[test]
    fn test_unknown_module_is_not_whitelisted() {
        let verdict = validate("import scipy.stats as st\nfrom sklearn import tree");
        assert_eq!(
            rules(&verdict),
            vec![RuleId::ModuleNotWhitelisted, RuleId::ModuleNotWhitelisted]
        );
        assert_eq!(at(&verdict, 0), (RuleId::ModuleNotWhitelisted, 1, 8));
        assert_eq!(at(&verdict, 1), (RuleId::ModuleNotWhitelisted, 2, 6));
    }

    #[test]
    fn test_system_command_collects_every_violation() {
        let verdict = validate("import os\nos.system(\"ls\")");
        assert_eq!(
            verdict
                .violations()
                .iter()
                .map(|v| (v.rule, v.location.line, v.location.column))
                .collect::<Vec<_>>(),
            vec![
                (RuleId::DisallowedModule, 1, 8),
                (RuleId::DisallowedModule, 2, 1),
                (RuleId::DisallowedMethod, 2, 4),
            ]
        );
    }

    #[test]
    fn test_dynamic_evaluation_is_rejected() {
        let verdict = validate("x = 1\nresult = eval(\"x + 1\")");
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedName, 2, 10));

        let verdict = validate("print(f\"{eval('1')}\")");
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedName]);
    }

    #[test]
    fn test_walk_does_not_stop_at_first_violation() {
        let verdict = validate("eval('1')\nopen('/etc/passwd')\nimport subprocess");
        assert_eq!(
            rules(&verdict),
            vec![
                RuleId::DisallowedName,
                RuleId::DisallowedName,
                RuleId::DisallowedModule
            ]
        );
        assert_eq!(at(&verdict, 1).1, 2);
        assert_eq!(at(&verdict, 2).1, 3);
    }

    #[test]
    fn test_dunder_chain_is_introspection() {
        let verdict = validate("x = ().__class__.__bases__[0].__subclasses__()");
        assert_eq!(
            rules(&verdict),
            vec![RuleId::InterpreterIntrospection; 3]
        );
        assert_eq!(at(&verdict, 0), (RuleId::InterpreterIntrospection, 1, 8));

        let verdict = validate("b = __builtins__");
        assert_eq!(rules(&verdict), vec![RuleId::InterpreterIntrospection]);
    }

    #[test]
    fn test_format_string_bypass_is_rejected() {
        let verdict = validate("print(\"{0.__class__}\".format(1))");
        assert_eq!(rules(&verdict), vec![RuleId::InterpreterIntrospection]);
    }

    #[test]
    fn test_format_field_in_stored_literal_is_rejected() {
        let verdict = validate("fmt = \"{0.__class__.__init__.__globals__}\"\nprint(fmt.format(x))");
        assert_eq!(rules(&verdict), vec![RuleId::InterpreterIntrospection]);
        assert_eq!(at(&verdict, 0), (RuleId::InterpreterIntrospection, 1, 8));

        let verdict = validate("print(\"{:>10}\".format('__main__'), \"__doc__ without braces\")");
        assert!(verdict.passed(), "{:?}", verdict.violations());
    }

    #[test]
    fn test_generator_frame_walk_is_rejected() {
        let code = "def g():\n    yield gen.gi_frame.f_back\ngen = g()\nhost = next(gen).f_back.f_globals";
        let verdict = validate(code);
        assert_eq!(
            verdict
                .violations()
                .iter()
                .map(|v| (v.rule, v.location.line, v.location.column))
                .collect::<Vec<_>>(),
            vec![
                (RuleId::InterpreterIntrospection, 2, 15),
                (RuleId::InterpreterIntrospection, 2, 24),
                (RuleId::InterpreterIntrospection, 4, 18),
                (RuleId::InterpreterIntrospection, 4, 25),
            ]
        );
        assert!(check(code).is_err());
    }

    #[test]
    fn test_traceback_frames_are_rejected() {
        let verdict = validate("try:\n    1 / 0\nexcept ZeroDivisionError as e:\n    t = e.args\n    f = t.tb_frame.f_locals");
        assert_eq!(rules(&verdict), vec![RuleId::InterpreterIntrospection; 2]);
    }

    #[test]
    fn test_modules_reached_through_libraries_are_rejected() {
        let verdict = validate("matplotlib.subprocess.run(['id'])");
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedModule]);
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedModule, 1, 12));

        let verdict = validate("from matplotlib import subprocess as sp\nsp.run(['id'])");
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedModule, 1, 24));

        let verdict = validate("import numpy.os as o");
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedModule]);

        let verdict = validate("x = pd.core.common.inspect");
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedModule]);

        // plain library attributes are untouched
        let verdict = validate("import matplotlib.pyplot as plt\nx = np.linalg.norm([3, 4])");
        assert!(verdict.passed(), "{:?}", verdict.violations());
    }

    #[test]
    fn test_wildcard_import_is_rejected() {
        let verdict = validate("from pandas import *");
        assert_eq!(rules(&verdict), vec![RuleId::WildcardImport]);
        assert_eq!(at(&verdict, 0), (RuleId::WildcardImport, 1, 20));
    }

    #[test]
    fn test_check_records_imports() {
        let script = check("import pandas as pd\nfrom matplotlib import pyplot\nimport numpy.linalg").unwrap();
        assert_eq!(script.imports(), ["pandas", "matplotlib", "numpy.linalg"]);
    }

    #[test]
    fn test_file_writers_and_pickle_are_rejected() {
        let verdict = validate("df.to_pickle('x.pkl')\nfrom numpy import load");
        assert_eq!(
            rules(&verdict),
            vec![RuleId::DisallowedMethod, RuleId::DisallowedMethod]
        );
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedMethod, 1, 4));
    }

    #[test]
    fn test_relative_import_is_rejected() {
        let verdict = validate("from . import helpers");
        assert_eq!(rules(&verdict), vec![RuleId::RelativeImport]);
    }

    #[test]
    fn test_keyword_argument_names_are_not_builtins() {
        let verdict = validate("def f(**kw):\n    return kw\nf(input=1)");
        assert!(verdict.passed(), "{:?}", verdict.violations());
    }

    #[test]
    fn test_syntax_error_is_single_violation() {
        let verdict = validate("def broken(:\n    pass\neval('x')");
        assert!(!verdict.passed());
        assert_eq!(rules(&verdict), vec![RuleId::SyntaxError]);
    }

    #[test]
    fn test_columns_count_characters() {
        let verdict = validate("s = \"é\"; eval(s)");
        assert_eq!(at(&verdict, 0), (RuleId::DisallowedName, 1, 10));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let code = "import os\nx = open('a')\nprint(x.__dict__)";
        assert_eq!(validate(code), validate(code));
    }

    #[test]
    fn test_check_gates_execution() {
        let script = check("print('hi')").unwrap();
        assert_eq!(script.source(), "print('hi')");

        let verdict = check("exec('print(1)')").unwrap_err();
        assert_eq!(rules(&verdict), vec![RuleId::DisallowedName]);
    }

    #[test]
    fn test_violation_serializes_flat_location() {
        let verdict = validate("eval('1')");
        let json = serde_json::to_value(&verdict.violations()[0]).unwrap();
        assert_eq!(json["rule"], "disallowed_name");
        assert_eq!(json["line"], 1);
        assert_eq!(json["column"], 1);
    }
}
