//! The caller's environment: named values, functions and files that
//! commands may depend on, and the scanner that turns reachable bindings
//! into dependency sets.

use crate::analyze::{self, DepSet};
use crate::error::EngineError;
use crate::eval::{self, Scope, Value};
use crate::parse::{Func, ImportDecl};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub enum Import {
    /// A plain value; its identity is its content hash.
    Value(Value),
    /// A function; analyzed like a command over its body.
    Function(Func),
    /// A file on disk; its identity is its fingerprint.
    File(String),
}

/// A mapping from identifier to import, the analyzer's view of "everything
/// the caller brought along".
#[derive(Debug, Default, Clone)]
pub struct Environment {
    map: BTreeMap<String, Import>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        self.map.insert(name.into(), Import::Value(value));
    }

    pub fn insert_function(&mut self, name: impl Into<String>, func: Func) {
        self.map.insert(name.into(), Import::Function(func));
    }

    pub fn insert_file(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.map.insert(name.into(), Import::File(path.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Import> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    /// Build an environment from the import declarations of a plan file.
    /// `let` initializers are evaluated eagerly, with earlier bindings in
    /// scope; `file` imports bind the name to the path string.
    pub fn from_decls(decls: &[ImportDecl]) -> Result<Self, EngineError> {
        let mut env = Environment::new();
        let mut scope = Scope::new(0);
        for decl in decls {
            match decl {
                ImportDecl::Value { name, expr } => {
                    let value = eval::eval(expr, &scope).map_err(|err| EngineError::Parse(
                        format!("import {:?}: {}", name, err),
                    ))?;
                    scope.vars.insert(name.clone(), value.clone());
                    env.insert_value(name.clone(), value);
                }
                ImportDecl::Function { name, func } => {
                    scope.funcs.insert(name.clone(), func.clone());
                    env.insert_function(name.clone(), func.clone());
                }
                ImportDecl::File { name, path } => {
                    let path = analyze::normalize_path(path);
                    scope.vars.insert(name.clone(), Value::Str(path.clone()));
                    env.insert_file(name.clone(), path);
                }
            }
        }
        Ok(env)
    }

    /// Populate an evaluation scope with every binding: values and file
    /// paths as vars, functions as callables.
    pub fn fill_scope(&self, scope: &mut Scope) {
        for (name, import) in &self.map {
            match import {
                Import::Value(v) => {
                    scope.vars.insert(name.clone(), v.clone());
                }
                Import::File(path) => {
                    scope.vars.insert(name.clone(), Value::Str(path.clone()));
                }
                Import::Function(f) => {
                    scope.funcs.insert(name.clone(), f.clone());
                }
            }
        }
    }
}

/// Compute the dependency set of every binding reachable from `roots`,
/// closing over the identifier graph: a global referenced by an imported
/// function that resolves to another binding becomes that binding's entry
/// too.
pub fn scan(env: &Environment, roots: &BTreeSet<String>) -> BTreeMap<String, DepSet> {
    let mut out = BTreeMap::new();
    let mut queue: VecDeque<String> = roots
        .iter()
        .filter(|name| env.contains(name))
        .cloned()
        .collect();
    while let Some(name) = queue.pop_front() {
        if out.contains_key(&name) {
            continue;
        }
        let deps = match env.get(&name) {
            Some(Import::Function(func)) => analyze::analyze_function(func),
            Some(Import::Value(_)) | Some(Import::File(_)) => DepSet::default(),
            None => continue,
        };
        for dep in deps.name_deps() {
            if env.contains(dep) && !out.contains_key(dep) {
                queue.push_back(dep.clone());
            }
        }
        out.insert(name, deps);
    }
    out
}

/// The standardized source text of an import, hashed to detect redefinition.
/// Functions hash their canonical body; values hash their serialized form;
/// files are fingerprinted separately by the staleness oracle.
pub fn import_identity(import: &Import) -> String {
    match import {
        Import::Function(func) => {
            let unwrapped = analyze::unwrap_vectorized(func);
            format!(
                "fn({}) {}",
                unwrapped.params.join(", "),
                crate::parse::deparse(&unwrapped.body)
            )
        }
        Import::Value(value) => {
            serde_json::to_string(value).expect("value serialization cannot fail")
        }
        Import::File(path) => format!("file:{}", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_expr_text, Expr};

    fn func(text: &str) -> Func {
        match parse_expr_text(text).unwrap() {
            Expr::Func(f) => f,
            other => panic!("expected func, got {:?}", other),
        }
    }

    #[test]
    fn scan_closes_over_references() {
        let mut env = Environment::new();
        env.insert_function("f", func("fn(x) g(x) + k"));
        env.insert_function("g", func("fn(x) x * 2"));
        env.insert_value("k", Value::Int(5));
        env.insert_value("unused", Value::Int(9));

        let roots: BTreeSet<String> = ["f".to_string()].into();
        let scanned = scan(&env, &roots);
        assert_eq!(
            scanned.keys().cloned().collect::<Vec<_>>(),
            ["f", "g", "k"]
        );
        let f_deps = &scanned["f"];
        assert!(f_deps.globals.contains("g"));
        assert!(f_deps.globals.contains("k"));
    }

    #[test]
    fn function_identity_tracks_redefinition() {
        let a = import_identity(&Import::Function(func("fn(x) x + 1")));
        let b = import_identity(&Import::Function(func("fn(x) x + 100")));
        let c = import_identity(&Import::Function(func("fn(x)   x + 1")));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn from_decls_evaluates_lets_in_order() {
        let plan = crate::parse::parse_plan(
            std::path::Path::new("p"),
            "let k = 10\nlet m = k * 2\n",
        )
        .unwrap();
        let env = Environment::from_decls(&plan.imports).unwrap();
        match env.get("m") {
            Some(Import::Value(Value::Int(20))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
