//! Static dependency analysis of command expressions.
//!
//! Walks a parsed command and classifies every reference it finds: other
//! targets (`load`/`read` markers), files read and written (`file_in`/
//! `file_out`), literate sub-documents (`subdoc_in`), namespaced calls, and
//! plain identifiers that may resolve to imports or targets.  `ignore(..)`
//! blocks contribute nothing.
//!
//! The result is purely a function of the command's syntax; nothing here
//! looks at live values.

use crate::parse::{Arg, Expr, Func};
use crate::subdoc::SubdocExtractor;
use std::collections::BTreeSet;

/// Marker calls recognized by the analyzer.
const MARKERS: &[&str] = &["load", "read", "file_in", "file_out", "subdoc_in", "ignore"];

/// Builtins provided by the evaluator; they are not dependencies.
const BUILTINS: &[&str] = &[
    "vectorized",
    "read_file",
    "write_file",
    "rand",
    "len",
    "sum",
    "cat",
];

/// The classified references of one command or function body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DepSet {
    /// Free identifiers that may resolve to targets or imports.
    pub globals: BTreeSet<String>,
    /// Target names named via load()/read().
    pub loads: BTreeSet<String>,
    /// File paths named via file_in().
    pub reads: BTreeSet<String>,
    /// File paths named via file_out().
    pub writes: BTreeSet<String>,
    /// Sub-document paths named via subdoc_in().
    pub subdocs: BTreeSet<String>,
    /// Qualified names of namespaced calls, e.g. "pkg::fn".
    pub namespaced: BTreeSet<String>,
    /// Canonical text of ignore()d sub-expressions, for inspection.
    pub ignored: BTreeSet<String>,
}

impl DepSet {
    /// Names that become graph edges to other nodes by name.
    pub fn name_deps(&self) -> impl Iterator<Item = &String> {
        self.globals.iter().chain(self.loads.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
            && self.loads.is_empty()
            && self.reads.is_empty()
            && self.writes.is_empty()
            && self.subdocs.is_empty()
            && self.namespaced.is_empty()
    }
}

/// Analyze a command expression.
pub fn analyze(expr: &Expr) -> DepSet {
    let mut deps = DepSet::default();
    let mut bound = Vec::new();
    walk(expr, &mut deps, &mut bound);
    finalize(expr, &mut deps);
    deps
}

/// Analyze a command and additionally resolve sub-document references
/// through the given extractor, merging extracted identifiers into loads.
pub fn analyze_with_subdocs(
    expr: &Expr,
    extractor: &dyn SubdocExtractor,
) -> Result<DepSet, String> {
    let mut deps = analyze(expr);
    for path in deps.subdocs.clone() {
        for name in extractor.extract(&path)? {
            deps.loads.insert(name);
        }
    }
    Ok(deps)
}

/// Analyze an imported function.  Wrapper shapes are unwrapped first so the
/// wrapper's scaffolding contributes nothing; imports cannot declare
/// outputs, so writes and subdocs are dropped while file reads are kept.
pub fn analyze_function(func: &Func) -> DepSet {
    let func = unwrap_vectorized(func);
    let mut deps = DepSet::default();
    let mut bound = vec![func.params.clone()];
    walk(&func.body, &mut deps, &mut bound);
    finalize(&func.body, &mut deps);
    deps.writes.clear();
    deps.subdocs.clear();
    deps
}

/// A vectorized wrapper is a function whose body immediately hands an inner
/// function literal to the `vectorized` builtin; dependency analysis sees
/// through it to the inner function.
pub fn unwrap_vectorized(func: &Func) -> &Func {
    if let Expr::Call(call) = func.body.as_ref() {
        if call.ns.is_none() && call.head == "vectorized" {
            if let Some(Arg {
                value: Expr::Func(inner),
                ..
            }) = call.args.first()
            {
                return unwrap_vectorized(inner);
            }
        }
    }
    func
}

/// Remove a target's own name from its dependency set (recursive commands
/// must not introduce self-edges).
pub fn suppress_self(deps: &mut DepSet, name: &str) {
    deps.globals.remove(name);
    deps.loads.remove(name);
}

fn walk(expr: &Expr, deps: &mut DepSet, bound: &mut Vec<Vec<String>>) {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) => {}
        Expr::Ident(name) => {
            if !is_bound(bound, name) {
                deps.globals.insert(name.clone());
            }
        }
        Expr::List(items) | Expr::Block(items) => {
            for item in items {
                walk(item, deps, bound);
            }
        }
        Expr::Unary { operand, .. } => walk(operand, deps, bound),
        Expr::Binary { lhs, rhs, .. } => {
            walk(lhs, deps, bound);
            walk(rhs, deps, bound);
        }
        Expr::Func(func) => {
            bound.push(func.params.clone());
            walk(&func.body, deps, bound);
            bound.pop();
        }
        Expr::Call(call) => {
            if call.ns.is_some() {
                deps.namespaced.insert(call.qualified());
                for arg in &call.args {
                    walk(&arg.value, deps, bound);
                }
                return;
            }
            match call.head.as_str() {
                "load" | "read" => {
                    let mut names = Vec::new();
                    for arg in &call.args {
                        collect_names(arg, &mut names, deps, bound);
                    }
                    deps.loads.extend(names);
                }
                "file_in" => {
                    let mut paths = Vec::new();
                    for arg in &call.args {
                        collect_paths(arg, &mut paths, deps, bound);
                    }
                    deps.reads.extend(paths);
                }
                "file_out" => {
                    let mut paths = Vec::new();
                    for arg in &call.args {
                        collect_paths(arg, &mut paths, deps, bound);
                    }
                    deps.writes.extend(paths);
                }
                "subdoc_in" => {
                    let mut paths = Vec::new();
                    for arg in &call.args {
                        collect_paths(arg, &mut paths, deps, bound);
                    }
                    deps.subdocs.extend(paths);
                }
                "ignore" => {
                    for arg in &call.args {
                        deps.ignored.insert(crate::parse::deparse(&arg.value));
                    }
                }
                head => {
                    // A plain call depends on its head resolving, plus
                    // whatever the arguments reference.
                    if !is_bound(bound, head) {
                        deps.globals.insert(head.to_owned());
                    }
                    for arg in &call.args {
                        walk(&arg.value, deps, bound);
                    }
                }
            }
        }
    }
}

/// Gather literal names from a marker-call argument.  A named `list = [..]`
/// argument contributes the literal names it contains; non-literal
/// arguments fall back to being globals of the surrounding expression.
fn collect_names(
    arg: &Arg,
    into: &mut Vec<String>,
    deps: &mut DepSet,
    bound: &mut Vec<Vec<String>>,
) {
    if arg.name.as_deref() == Some("list") {
        if let Expr::List(items) = &arg.value {
            for item in items {
                match item.as_name_literal() {
                    Some(name) => into.push(name.to_owned()),
                    None => walk(item, deps, bound),
                }
            }
            return;
        }
    }
    match arg.value.as_name_literal() {
        Some(name) => into.push(name.to_owned()),
        None => walk(&arg.value, deps, bound),
    }
}

/// Like collect_names but only string literals count, and paths are
/// normalized.
fn collect_paths(
    arg: &Arg,
    into: &mut Vec<String>,
    deps: &mut DepSet,
    bound: &mut Vec<Vec<String>>,
) {
    match &arg.value {
        Expr::Str(path) => into.push(normalize_path(path)),
        other => walk(other, deps, bound),
    }
}

/// Paths are compared textually across the plan, so trim the common
/// spelling variations.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.to_owned()
}

fn is_bound(bound: &[Vec<String>], name: &str) -> bool {
    bound.iter().any(|scope| scope.iter().any(|p| p == name))
}

/// Final cleanup: keep only identifiers a generic free-variable pass agrees
/// are free, and drop marker/builtin names themselves.
fn finalize(expr: &Expr, deps: &mut DepSet) {
    let free = free_vars(expr);
    deps.globals.retain(|name| free.contains(name));
    for name in MARKERS.iter().chain(BUILTINS) {
        deps.globals.remove(*name);
    }
}

/// Generic free-variable pass: every identifier (including call heads) not
/// bound by an enclosing function's parameters.  Knows nothing about the
/// analyzer's marker calls.
pub fn free_vars(expr: &Expr) -> BTreeSet<String> {
    let mut free = BTreeSet::new();
    let mut bound = Vec::new();
    collect_free(expr, &mut free, &mut bound);
    free
}

fn collect_free(expr: &Expr, free: &mut BTreeSet<String>, bound: &mut Vec<Vec<String>>) {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) => {}
        Expr::Ident(name) => {
            if !is_bound(bound, name) {
                free.insert(name.clone());
            }
        }
        Expr::List(items) | Expr::Block(items) => {
            for item in items {
                collect_free(item, free, bound);
            }
        }
        Expr::Unary { operand, .. } => collect_free(operand, free, bound),
        Expr::Binary { lhs, rhs, .. } => {
            collect_free(lhs, free, bound);
            collect_free(rhs, free, bound);
        }
        Expr::Func(func) => {
            bound.push(func.params.clone());
            collect_free(&func.body, free, bound);
            bound.pop();
        }
        Expr::Call(call) => {
            if call.ns.is_none() && !is_bound(bound, &call.head) {
                free.insert(call.head.clone());
            }
            for arg in &call.args {
                collect_free(&arg.value, free, bound);
            }
        }
    }
}
