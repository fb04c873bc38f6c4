//! Command evaluation: runs an expression in a prepared scope and yields a
//! Value.  The scheduler builds the scope per target (dependency values,
//! imported functions, a deterministic seed) before dispatching.

use crate::parse::{Arg, BinaryOp, Expr, Func, UnaryOp};
use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

/// The result of evaluating a command.  Serialized with the stable
/// serializer (serde_json) both for the object store and for value hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Everything a command may see while evaluating: dependency values and
/// imported values under their names, imported functions, and a seeded
/// deterministic random stream.
pub struct Scope {
    pub vars: BTreeMap<String, Value>,
    pub funcs: BTreeMap<String, Func>,
    rng: Cell<u64>,
}

const MAX_CALL_DEPTH: usize = 128;

impl Scope {
    pub fn new(seed: u64) -> Self {
        Scope {
            vars: BTreeMap::new(),
            funcs: BTreeMap::new(),
            // A zero state would make the xorshift stream constant.
            rng: Cell::new(seed | 1),
        }
    }

    fn next_rand(&self) -> f64 {
        // xorshift64*; good enough for reproducible jitter in commands.
        let mut x = self.rng.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng.set(x);
        let bits = x.wrapping_mul(0x2545F4914F6CDD1D) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }
}

/// Evaluate a command expression in the given scope.
pub fn eval(expr: &Expr, scope: &Scope) -> anyhow::Result<Value> {
    let mut locals = Vec::new();
    eval_in(expr, scope, &mut locals)
}

type Frame = BTreeMap<String, Value>;

fn eval_in(expr: &Expr, scope: &Scope, locals: &mut Vec<Frame>) -> anyhow::Result<Value> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::List(items) => {
            let mut vals = Vec::with_capacity(items.len());
            for item in items {
                vals.push(eval_in(item, scope, locals)?);
            }
            Ok(Value::List(vals))
        }
        Expr::Ident(name) => lookup(name, scope, locals),
        Expr::Unary { op, operand } => {
            let v = eval_in(operand, scope, locals)?;
            match op {
                UnaryOp::Neg => match v {
                    Value::Int(n) => Ok(Value::Int(-n)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    v => bail!("cannot negate {}", v.type_name()),
                },
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    v => bail!("cannot apply ! to {}", v.type_name()),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope, locals),
        Expr::Block(exprs) => {
            let mut last = Value::Unit;
            for e in exprs {
                last = eval_in(e, scope, locals)?;
            }
            Ok(last)
        }
        Expr::Func(_) => bail!("function literal is not a value; pass it to vectorized()"),
        Expr::Call(call) => eval_call(call, scope, locals),
    }
}

fn lookup(name: &str, scope: &Scope, locals: &[Frame]) -> anyhow::Result<Value> {
    for frame in locals.iter().rev() {
        if let Some(v) = frame.get(name) {
            return Ok(v.clone());
        }
    }
    scope
        .vars
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("unknown identifier {:?}", name))
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &Scope,
    locals: &mut Vec<Frame>,
) -> anyhow::Result<Value> {
    // Short-circuit booleans before evaluating the right side.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = match eval_in(lhs, scope, locals)? {
            Value::Bool(b) => b,
            v => bail!("{} requires bools, got {}", op.token(), v.type_name()),
        };
        if (op == BinaryOp::And && !l) || (op == BinaryOp::Or && l) {
            return Ok(Value::Bool(l));
        }
        return match eval_in(rhs, scope, locals)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            v => bail!("{} requires bools, got {}", op.token(), v.type_name()),
        };
    }

    let l = eval_in(lhs, scope, locals)?;
    let r = eval_in(rhs, scope, locals)?;

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(l == r)),
        BinaryOp::Ne => return Ok(Value::Bool(l != r)),
        _ => {}
    }

    // String and list concatenation via +.
    if op == BinaryOp::Add {
        match (&l, &r) {
            (Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                return Ok(Value::List(out));
            }
            _ => {}
        }
    }

    // Comparison on strings.
    if let (Value::Str(a), Value::Str(b)) = (&l, &r) {
        let ord = match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => bail!("cannot {} strings", op.token()),
        };
        return Ok(Value::Bool(ord));
    }

    // Integer arithmetic stays integral; anything mixed promotes to float.
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        return Ok(match op {
            BinaryOp::Add => Value::Int(a.wrapping_add(b)),
            BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
            BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
            BinaryOp::Div => {
                if b == 0 {
                    bail!("division by zero");
                }
                Value::Int(a / b)
            }
            BinaryOp::Rem => {
                if b == 0 {
                    bail!("division by zero");
                }
                Value::Int(a % b)
            }
            BinaryOp::Lt => Value::Bool(a < b),
            BinaryOp::Le => Value::Bool(a <= b),
            BinaryOp::Gt => Value::Bool(a > b),
            BinaryOp::Ge => Value::Bool(a >= b),
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!(),
        });
    }

    let (a, b) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => bail!(
            "cannot {} {} and {}",
            op.token(),
            l.type_name(),
            r.type_name()
        ),
    };
    Ok(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Rem => Value::Float(a % b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!(),
    })
}

fn eval_call(
    call: &crate::parse::Call,
    scope: &Scope,
    locals: &mut Vec<Frame>,
) -> anyhow::Result<Value> {
    if call.ns.is_some() {
        // Namespaced functions come from host packages the engine does not
        // ship; the analyzer tracks them, the evaluator cannot run them.
        bail!("namespaced function {} is not available", call.qualified());
    }
    match call.head.as_str() {
        "load" | "read" => {
            let mut vals = Vec::new();
            for arg in &call.args {
                match arg.value.as_name_literal() {
                    Some(name) => vals.push(lookup(name, scope, locals)?),
                    None => {
                        let v = eval_in(&arg.value, scope, locals)?;
                        match v {
                            Value::Str(name) => vals.push(lookup(&name, scope, locals)?),
                            v => bail!("load() needs a name, got {}", v.type_name()),
                        }
                    }
                }
            }
            Ok(match vals.len() {
                1 => vals.pop().unwrap(),
                _ => Value::List(vals),
            })
        }
        // The file markers evaluate to their (last) path so commands can
        // wrap them: read_file(file_in("in.txt")).
        "file_in" | "file_out" | "subdoc_in" => {
            let mut path = Value::Unit;
            for arg in &call.args {
                path = eval_in(&arg.value, scope, locals)?;
            }
            Ok(path)
        }
        "ignore" => {
            let mut last = Value::Unit;
            for arg in &call.args {
                last = eval_in(&arg.value, scope, locals)?;
            }
            Ok(last)
        }
        "read_file" => {
            let path = str_arg(call, 0, scope, locals)?;
            let text = std::fs::read_to_string(&path)
                .map_err(|err| anyhow!("read_file({:?}): {}", path, err))?;
            Ok(Value::Str(text))
        }
        "write_file" => {
            let path = str_arg(call, 0, scope, locals)?;
            let content = match call.args.get(1) {
                Some(arg) => eval_in(&arg.value, scope, locals)?.to_string(),
                None => String::new(),
            };
            if let Some(parent) = std::path::Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&path, content)
                .map_err(|err| anyhow!("write_file({:?}): {}", path, err))?;
            Ok(Value::Str(path))
        }
        "vectorized" => {
            let func = match call.args.first() {
                Some(Arg {
                    value: Expr::Func(f),
                    ..
                }) => f.clone(),
                Some(Arg {
                    value: Expr::Ident(name),
                    ..
                }) => scope
                    .funcs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown function {:?}", name))?,
                _ => bail!("vectorized() needs a function as first argument"),
            };
            let list = match call.args.get(1) {
                Some(arg) => eval_in(&arg.value, scope, locals)?,
                None => bail!("vectorized() needs a list argument"),
            };
            let items = match list {
                Value::List(items) => items,
                v => bail!("vectorized() needs a list, got {}", v.type_name()),
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(apply(&func, vec![item], scope, locals)?);
            }
            Ok(Value::List(out))
        }
        "rand" => Ok(Value::Float(scope.next_rand())),
        "len" => {
            let v = eval_arg(call, 0, scope, locals)?;
            match v {
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                v => bail!("len() of {}", v.type_name()),
            }
        }
        "sum" => {
            let v = eval_arg(call, 0, scope, locals)?;
            let items = match v {
                Value::List(items) => items,
                v => bail!("sum() of {}", v.type_name()),
            };
            let mut acc = 0f64;
            let mut all_int = true;
            for item in &items {
                match item {
                    Value::Int(n) => acc += *n as f64,
                    Value::Float(f) => {
                        all_int = false;
                        acc += f;
                    }
                    v => bail!("sum() over {}", v.type_name()),
                }
            }
            Ok(if all_int {
                Value::Int(acc as i64)
            } else {
                Value::Float(acc)
            })
        }
        "cat" => {
            let mut out = String::new();
            for arg in &call.args {
                out.push_str(&eval_in(&arg.value, scope, locals)?.to_string());
            }
            Ok(Value::Str(out))
        }
        name => {
            let func = scope
                .funcs
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown function {:?}", name))?;
            let mut args = Vec::new();
            for arg in &call.args {
                args.push(eval_in(&arg.value, scope, locals)?);
            }
            apply(&func, args, scope, locals)
        }
    }
}

fn apply(
    func: &Func,
    args: Vec<Value>,
    scope: &Scope,
    locals: &mut Vec<Frame>,
) -> anyhow::Result<Value> {
    if locals.len() >= MAX_CALL_DEPTH {
        bail!("call depth exceeded");
    }
    if args.len() != func.params.len() {
        bail!(
            "expected {} arguments, got {}",
            func.params.len(),
            args.len()
        );
    }
    let frame: Frame = func.params.iter().cloned().zip(args).collect();
    locals.push(frame);
    let result = eval_in(&func.body, scope, locals);
    locals.pop();
    result
}

fn eval_arg(
    call: &crate::parse::Call,
    idx: usize,
    scope: &Scope,
    locals: &mut Vec<Frame>,
) -> anyhow::Result<Value> {
    let arg = call
        .args
        .get(idx)
        .ok_or_else(|| anyhow!("{}() missing argument {}", call.head, idx))?;
    eval_in(&arg.value, scope, locals)
}

fn str_arg(
    call: &crate::parse::Call,
    idx: usize,
    scope: &Scope,
    locals: &mut Vec<Frame>,
) -> anyhow::Result<String> {
    match eval_arg(call, idx, scope, locals)? {
        Value::Str(s) => Ok(s),
        v => bail!("{}() needs a string, got {}", call.head, v.type_name()),
    }
}
