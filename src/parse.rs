//! Parser for plan files and command expressions.
//!
//! A plan file is a sequence of statements:
//!
//! ```text
//! let k = 10
//! fn f(x) = x + k
//! file raw = "data.csv"
//! target b = f(a) + 1
//!   trigger = command
//!   evaluator = local
//! ```
//!
//! Two grammars share one cursor: the line-oriented statement grammar
//! (keyword rows, with indentation marking a target's option block) and the
//! expression grammar for commands, which never crosses a line break.
//! Commands are expressions in a small host language: literals, identifiers,
//! calls (with optional named arguments), namespaced calls `pkg::fn(..)`,
//! binary/unary operators, lists, blocks and function literals.  The engine
//! itself only cares about the syntax tree; see analyze.rs for how the tree
//! is turned into dependencies and eval.rs for how it is run.

use crate::smallmap::SmallMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    pub msg: String,
    /// 1-based source position, captured when the error is raised.
    pub line: usize,
    pub col: usize,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Render a parse error with the offending source line and a caret.
pub fn format_parse_error(filename: &Path, text: &str, err: &ParseError) -> String {
    let mut msg = format!("parse error: {}\n", err.msg);
    let prefix = format!("{}:{}: ", filename.display(), err.line);
    msg.push_str(&prefix);

    let line = text.lines().nth(err.line.saturating_sub(1)).unwrap_or("");
    let mut col = err.col.saturating_sub(1);
    let mut context = line;
    if col > 40 {
        // Trim the front of the line so the caret stays on screen.
        context = tail_from(line, col - 20);
        msg.push_str("...");
        col = 3 + 20;
    }
    if context.len() > 40 {
        msg.push_str(clip(context, 40));
        msg.push_str("...");
    } else {
        msg.push_str(context);
    }
    msg.push('\n');
    msg.push_str(&" ".repeat(prefix.len() + col));
    msg.push_str("^\n");
    msg
}

/// Byte-clip a prefix, backing up to a char boundary.
fn clip(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn tail_from(s: &str, start: usize) -> &str {
    let mut start = start.min(s.len());
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Byte cursor over plan text.  Tracks the current line and its starting
/// offset so errors carry line/column directly, and so the statement
/// grammar can ask "how much indentation did this line open with".
/// Cheap to copy, which is how the argument parser backtracks.
#[derive(Clone, Copy)]
struct Cursor<'t> {
    buf: &'t [u8],
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'t> Cursor<'t> {
    fn new(text: &'t str) -> Cursor<'t> {
        Cursor {
            buf: text.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Option<char> {
        self.buf.get(self.pos).map(|&b| b as char)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.buf.get(self.pos + n).map(|&b| b as char)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(c)
    }

    fn eat(&mut self, want: char) -> bool {
        if self.peek() == Some(want) {
            self.bump();
            return true;
        }
        false
    }

    /// Consume horizontal whitespace; the returned count is the line's
    /// indentation when called at a line start.
    fn eat_hspace(&mut self) -> usize {
        let start = self.pos;
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
        self.pos - start
    }

    fn at_line_end(&self) -> bool {
        match self.peek() {
            None | Some('\n') => true,
            Some('\r') => self.peek_at(1) == Some('\n'),
            _ => false,
        }
    }

    fn eat_line_break(&mut self) -> bool {
        if self.eat('\n') {
            return true;
        }
        if self.peek() == Some('\r') && self.peek_at(1) == Some('\n') {
            self.bump();
            self.bump();
            return true;
        }
        self.at_eof()
    }

    /// Longest run of bytes satisfying `pred`, consumed and returned.
    /// Token characters are ASCII, so the slice is valid UTF-8.
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'t str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
        std::str::from_utf8(&self.buf[start..self.pos]).expect("token is ascii")
    }

    /// The rest of the current line, consumed; the line break is left.
    fn take_line(&mut self) -> &'t str {
        let start = self.pos;
        while !self.at_line_end() {
            self.bump();
        }
        std::str::from_utf8(&self.buf[start..self.pos]).unwrap_or("")
    }

    fn error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            line: self.line,
            col: self.pos - self.line_start + 1,
        })
    }

    fn expect(&mut self, want: char) -> ParseResult<()> {
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => self.error(format!("expected {:?}, got {:?}", want, c)),
            None => self.error(format!("expected {:?}, got end of input", want)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// One argument in a call, optionally named (`f(x, list = [a, b])`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

/// A call expression.  `ns` carries the package qualifier for namespaced
/// calls; `internal` distinguishes `pkg:::fn` from `pkg::fn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub ns: Option<String>,
    pub internal: bool,
    pub head: String,
    pub args: Vec<Arg>,
}

impl Call {
    /// The fully qualified name, e.g. "pkg::fn".
    pub fn qualified(&self) -> String {
        match &self.ns {
            Some(ns) => format!(
                "{}{}{}",
                ns,
                if self.internal { ":::" } else { "::" },
                self.head
            ),
            None => self.head.clone(),
        }
    }
}

/// A function literal: `fn(x, y) x + y`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<Expr>),
    Ident(String),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call(Call),
    Func(Func),
    Block(Vec<Expr>),
}

impl Expr {
    /// Literal name content: either an identifier or a string literal.
    /// The marker calls (`load`, `file_in`, ...) accept both spellings.
    pub fn as_name_literal(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            Expr::Ident(s) => Some(s),
            _ => None,
        }
    }
}

/// Render an expression as canonical source text: single spaces, double
/// quoted strings, no trailing semicolons.  Command hashes are taken over
/// this text, so it must be deterministic for a given syntax tree.
pub fn deparse(expr: &Expr) -> String {
    let mut out = String::new();
    deparse_into(expr, &mut out);
    out
}

fn deparse_into(expr: &Expr, out: &mut String) {
    match expr {
        Expr::Int(n) => out.push_str(&n.to_string()),
        Expr::Float(f) => {
            // Keep a trailing ".0" so floats reparse as floats.
            let s = f.to_string();
            out.push_str(&s);
            if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("NaN") {
                out.push_str(".0");
            }
        }
        Expr::Str(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        Expr::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Expr::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                deparse_into(item, out);
            }
            out.push(']');
        }
        Expr::Ident(name) => out.push_str(name),
        Expr::Unary { op, operand } => {
            out.push(match op {
                UnaryOp::Neg => '-',
                UnaryOp::Not => '!',
            });
            deparse_operand(operand, out);
        }
        Expr::Binary { op, lhs, rhs } => {
            deparse_operand(lhs, out);
            out.push(' ');
            out.push_str(op.token());
            out.push(' ');
            deparse_operand(rhs, out);
        }
        Expr::Call(call) => {
            out.push_str(&call.qualified());
            out.push('(');
            for (i, arg) in call.args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some(name) = &arg.name {
                    out.push_str(name);
                    out.push_str(" = ");
                }
                deparse_into(&arg.value, out);
            }
            out.push(')');
        }
        Expr::Func(f) => {
            out.push_str("fn(");
            out.push_str(&f.params.join(", "));
            out.push_str(") ");
            deparse_into(&f.body, out);
        }
        Expr::Block(exprs) => {
            out.push('{');
            for (i, e) in exprs.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push(' ');
                deparse_into(e, out);
            }
            out.push_str(" }");
        }
    }
}

/// Nested operator expressions are always parenthesized, which keeps the
/// output reparsable without tracking precedence while printing.
fn deparse_operand(expr: &Expr, out: &mut String) {
    match expr {
        Expr::Binary { .. } | Expr::Unary { .. } => {
            out.push('(');
            deparse_into(expr, out);
            out.push(')');
        }
        _ => deparse_into(expr, out),
    }
}

/// One row of a plan: a named target and its command, plus per-target
/// options.  Columns the engine doesn't recognize are preserved in `extra`
/// and handed through to dispatch backends.
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub name: String,
    pub command: Expr,
    pub trigger: Option<String>,
    pub evaluator: Option<String>,
    pub extra: SmallMap<String, String>,
    pub line: usize,
}

/// An environment binding declared in a plan file.
#[derive(Debug, Clone)]
pub enum ImportDecl {
    Value { name: String, expr: Expr },
    Function { name: String, func: Func },
    File { name: String, path: String },
}

#[derive(Debug)]
pub enum Statement {
    Target(PlanRow),
    Import(ImportDecl),
}

pub struct Parser<'t> {
    cur: Cursor<'t>,
}

impl<'t> Parser<'t> {
    pub fn new(text: &'t str) -> Parser<'t> {
        Parser {
            cur: Cursor::new(text),
        }
    }

    /// Read the next statement, or None at end of input.  Statements start
    /// in column zero; indented lines only ever belong to the preceding
    /// target's option block.
    pub fn read(&mut self) -> ParseResult<Option<Statement>> {
        loop {
            if self.cur.at_eof() {
                return Ok(None);
            }
            let indent = self.cur.eat_hspace();
            if self.cur.at_line_end() {
                self.cur.eat_line_break();
                continue;
            }
            if self.cur.eat('#') {
                self.skip_comment();
                continue;
            }
            if indent > 0 {
                return self.cur.error("indented line outside a target block");
            }
            let keyword = self.read_ident()?;
            self.cur.eat_hspace();
            return match keyword {
                "target" => Ok(Some(Statement::Target(self.read_target()?))),
                "let" => Ok(Some(Statement::Import(self.read_let()?))),
                "fn" => Ok(Some(Statement::Import(self.read_fn()?))),
                "file" => Ok(Some(Statement::Import(self.read_file_import()?))),
                other => self.cur.error(format!("unknown statement {:?}", other)),
            };
        }
    }

    fn read_target(&mut self) -> ParseResult<PlanRow> {
        let line = self.cur.line;
        let name = self.read_ident()?.to_owned();
        self.cur.eat_hspace();
        self.cur.expect('=')?;
        self.cur.eat_hspace();
        let command = self.read_expr()?;
        self.end_of_line()?;

        let mut trigger = None;
        let mut evaluator = None;
        let mut extra = SmallMap::default();
        for (key, val) in self.read_option_lines()? {
            match key.as_str() {
                "trigger" => trigger = Some(val),
                "evaluator" => evaluator = Some(val),
                _ => {
                    extra.insert(key, val);
                }
            }
        }

        Ok(PlanRow {
            name,
            command,
            trigger,
            evaluator,
            extra,
            line,
        })
    }

    fn read_let(&mut self) -> ParseResult<ImportDecl> {
        let name = self.read_ident()?.to_owned();
        self.cur.eat_hspace();
        self.cur.expect('=')?;
        self.cur.eat_hspace();
        let expr = self.read_expr()?;
        self.end_of_line()?;
        Ok(ImportDecl::Value { name, expr })
    }

    fn read_fn(&mut self) -> ParseResult<ImportDecl> {
        let name = self.read_ident()?.to_owned();
        self.cur.expect('(')?;
        let params = self.read_params()?;
        self.cur.eat_hspace();
        self.cur.expect('=')?;
        self.cur.eat_hspace();
        let body = self.read_expr()?;
        self.end_of_line()?;
        Ok(ImportDecl::Function {
            name,
            func: Func {
                params,
                body: Box::new(body),
            },
        })
    }

    fn read_file_import(&mut self) -> ParseResult<ImportDecl> {
        let name = self.read_ident()?.to_owned();
        self.cur.eat_hspace();
        self.cur.expect('=')?;
        self.cur.eat_hspace();
        let path = match self.read_expr()? {
            Expr::Str(path) => path,
            _ => return self.cur.error("file import path must be a string literal"),
        };
        self.end_of_line()?;
        Ok(ImportDecl::File { name, path })
    }

    /// The option block: indented `key = value` lines directly under a
    /// target row.  Values are raw text to end of line.
    fn read_option_lines(&mut self) -> ParseResult<Vec<(String, String)>> {
        let mut vars = Vec::new();
        while matches!(self.cur.peek(), Some(' ' | '\t')) {
            self.cur.eat_hspace();
            if self.cur.at_line_end() {
                self.cur.eat_line_break();
                continue;
            }
            if self.cur.eat('#') {
                self.skip_comment();
                continue;
            }
            let key = self.read_ident()?.to_owned();
            self.cur.eat_hspace();
            self.cur.expect('=')?;
            self.cur.eat_hspace();
            let val = self.cur.take_line().trim_end().to_owned();
            self.cur.eat_line_break();
            vars.push((key, val));
        }
        Ok(vars)
    }

    /// Trailing semicolons and a trailing comment are tolerated before the
    /// line break.
    fn end_of_line(&mut self) -> ParseResult<()> {
        self.cur.eat_hspace();
        while self.cur.eat(';') {
            self.cur.eat_hspace();
        }
        if self.cur.eat('#') {
            self.skip_comment();
            return Ok(());
        }
        if self.cur.at_line_end() {
            self.cur.eat_line_break();
            return Ok(());
        }
        self.cur.error("expected end of line")
    }

    fn skip_comment(&mut self) {
        self.cur.take_line();
        self.cur.eat_line_break();
    }

    fn read_ident(&mut self) -> ParseResult<&'t str> {
        match self.cur.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return self.cur.error("expected identifier"),
        }
        Ok(self
            .cur
            .take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'))
    }

    fn read_params(&mut self) -> ParseResult<Vec<String>> {
        let mut params = Vec::new();
        loop {
            self.cur.eat_hspace();
            if self.cur.eat(')') {
                return Ok(params);
            }
            params.push(self.read_ident()?.to_owned());
            self.cur.eat_hspace();
            if !self.cur.eat(',') && self.cur.peek() != Some(')') {
                return self.cur.error("expected ',' or ')' in parameter list");
            }
        }
    }

    // Expression grammar: precedence climbing, single line only.

    pub fn read_expr(&mut self) -> ParseResult<Expr> {
        self.read_binary(0)
    }

    fn read_binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut lhs = self.read_unary()?;
        loop {
            self.cur.eat_hspace();
            let op = match self.peek_binary_op() {
                Some(op) if op.precedence() >= min_prec => op,
                _ => return Ok(lhs),
            };
            for _ in 0..op.token().len() {
                self.cur.bump();
            }
            self.cur.eat_hspace();
            let rhs = self.read_binary(op.precedence() + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn peek_binary_op(&self) -> Option<BinaryOp> {
        match (self.cur.peek()?, self.cur.peek_at(1)) {
            ('&', Some('&')) => Some(BinaryOp::And),
            ('|', Some('|')) => Some(BinaryOp::Or),
            ('=', Some('=')) => Some(BinaryOp::Eq),
            ('!', Some('=')) => Some(BinaryOp::Ne),
            ('<', Some('=')) => Some(BinaryOp::Le),
            ('>', Some('=')) => Some(BinaryOp::Ge),
            ('<', _) => Some(BinaryOp::Lt),
            ('>', _) => Some(BinaryOp::Gt),
            ('+', _) => Some(BinaryOp::Add),
            ('-', _) => Some(BinaryOp::Sub),
            ('*', _) => Some(BinaryOp::Mul),
            ('/', _) => Some(BinaryOp::Div),
            ('%', _) => Some(BinaryOp::Rem),
            _ => None,
        }
    }

    fn read_unary(&mut self) -> ParseResult<Expr> {
        self.cur.eat_hspace();
        if self.cur.eat('-') {
            let operand = self.read_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.cur.peek() == Some('!') && self.cur.peek_at(1) != Some('=') {
            self.cur.bump();
            let operand = self.read_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.read_primary()
    }

    fn read_primary(&mut self) -> ParseResult<Expr> {
        self.cur.eat_hspace();
        match self.cur.peek() {
            Some('0'..='9') => self.read_number(),
            Some('"' | '\'') => self.read_string(),
            Some('(') => {
                self.cur.bump();
                let expr = self.read_expr()?;
                self.cur.eat_hspace();
                self.cur.expect(')')?;
                Ok(expr)
            }
            Some('[') => self.read_list(),
            Some('{') => self.read_block(),
            Some('a'..='z' | 'A'..='Z' | '_') => self.read_ident_expr(),
            Some(c) => self.cur.error(format!("unexpected {:?} in expression", c)),
            None => self.cur.error("unexpected end of input in expression"),
        }
    }

    fn read_number(&mut self) -> ParseResult<Expr> {
        let whole = self.cur.take_while(|c| c.is_ascii_digit());
        if self.cur.peek() == Some('.')
            && self.cur.peek_at(1).is_some_and(|c| c.is_ascii_digit())
        {
            self.cur.bump();
            let frac = self.cur.take_while(|c| c.is_ascii_digit());
            let text = format!("{}.{}", whole, frac);
            return match text.parse::<f64>() {
                Ok(f) => Ok(Expr::Float(f)),
                Err(err) => self.cur.error(format!("bad float {:?}: {}", text, err)),
            };
        }
        match whole.parse::<i64>() {
            Ok(n) => Ok(Expr::Int(n)),
            Err(err) => self.cur.error(format!("bad integer {:?}: {}", whole, err)),
        }
    }

    /// Strings accept single or double quotes; both parse to the same node,
    /// so the canonical (double quoted) form hashes identically.
    fn read_string(&mut self) -> ParseResult<Expr> {
        let quote = self.cur.bump().expect("caller saw a quote");
        let mut s = String::new();
        loop {
            match self.cur.bump() {
                None | Some('\n') => return self.cur.error("unterminated string"),
                Some('\\') => match self.cur.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c @ ('\\' | '"' | '\'')) => s.push(c),
                    c => return self.cur.error(format!("bad escape {:?}", c)),
                },
                Some(c) if c == quote => return Ok(Expr::Str(s)),
                Some(c) => s.push(c),
            }
        }
    }

    fn read_list(&mut self) -> ParseResult<Expr> {
        self.cur.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.cur.eat_hspace();
            if self.cur.eat(']') {
                return Ok(Expr::List(items));
            }
            items.push(self.read_expr()?);
            self.cur.eat_hspace();
            if !self.cur.eat(',') && self.cur.peek() != Some(']') {
                return self.cur.error("expected ',' or ']' in list");
            }
        }
    }

    fn read_block(&mut self) -> ParseResult<Expr> {
        self.cur.expect('{')?;
        let mut exprs = Vec::new();
        loop {
            self.cur.eat_hspace();
            while self.cur.eat(';') {
                self.cur.eat_hspace();
            }
            if self.cur.eat('}') {
                return Ok(Expr::Block(exprs));
            }
            exprs.push(self.read_expr()?);
        }
    }

    fn read_ident_expr(&mut self) -> ParseResult<Expr> {
        let ident = self.read_ident()?.to_owned();
        match ident.as_str() {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            "fn" => {
                self.cur.eat_hspace();
                self.cur.expect('(')?;
                let params = self.read_params()?;
                self.cur.eat_hspace();
                let body = self.read_expr()?;
                return Ok(Expr::Func(Func {
                    params,
                    body: Box::new(body),
                }));
            }
            _ => {}
        }

        // Namespace qualifier: pkg::fn or pkg:::fn.
        let mut ns = None;
        let mut internal = false;
        let mut head = ident;
        if self.cur.peek() == Some(':') && self.cur.peek_at(1) == Some(':') {
            self.cur.bump();
            self.cur.bump();
            if self.cur.eat(':') {
                internal = true;
            }
            ns = Some(head);
            head = self.read_ident()?.to_owned();
        }

        if self.cur.eat('(') {
            let args = self.read_args()?;
            return Ok(Expr::Call(Call {
                ns,
                internal,
                head,
                args,
            }));
        }

        if ns.is_some() {
            return self.cur.error("namespaced reference must be a call");
        }
        Ok(Expr::Ident(head))
    }

    fn read_args(&mut self) -> ParseResult<Vec<Arg>> {
        let mut args = Vec::new();
        loop {
            self.cur.eat_hspace();
            if self.cur.eat(')') {
                return Ok(args);
            }
            args.push(self.read_arg()?);
            self.cur.eat_hspace();
            if !self.cur.eat(',') && self.cur.peek() != Some(')') {
                return self.cur.error("expected ',' or ')' in arguments");
            }
        }
    }

    fn read_arg(&mut self) -> ParseResult<Arg> {
        // A named argument is `ident = expr` where the '=' is not '==';
        // anything else rewinds and parses as a positional expression.
        let saved = self.cur;
        if matches!(self.cur.peek(), Some('a'..='z' | 'A'..='Z' | '_')) {
            let ident = self.read_ident()?.to_owned();
            self.cur.eat_hspace();
            if self.cur.peek() == Some('=') && self.cur.peek_at(1) != Some('=') {
                self.cur.bump();
                self.cur.eat_hspace();
                let value = self.read_expr()?;
                return Ok(Arg {
                    name: Some(ident),
                    value,
                });
            }
            self.cur = saved;
        }
        let value = self.read_expr()?;
        Ok(Arg { name: None, value })
    }
}

/// Parse a standalone command expression, e.g. from a worker wire message.
pub fn parse_expr_text(text: &str) -> Result<Expr, String> {
    let mut parser = Parser::new(text);
    let expr = parser
        .read_expr()
        .map_err(|err| format!("in {:?}: {}", text, err.msg))?;
    // Trailing semicolons and trivia are tolerated and stripped.
    parser.cur.eat_hspace();
    while parser.cur.eat(';') {
        parser.cur.eat_hspace();
    }
    if !parser.cur.at_eof() && !parser.cur.at_line_end() {
        return Err(format!(
            "trailing garbage after expression at line {}",
            parser.cur.line
        ));
    }
    Ok(expr)
}

/// A loaded plan: target rows plus the imports declared alongside them.
#[derive(Debug, Default)]
pub struct Plan {
    pub rows: Vec<PlanRow>,
    pub imports: Vec<ImportDecl>,
}

/// Parse a whole plan file.
pub fn parse_plan(filename: &Path, text: &str) -> Result<Plan, String> {
    let mut parser = Parser::new(text);
    let mut plan = Plan::default();
    loop {
        match parser.read() {
            Ok(None) => return Ok(plan),
            Ok(Some(Statement::Target(row))) => plan.rows.push(row),
            Ok(Some(Statement::Import(decl))) => plan.imports.push(decl),
            Err(err) => return Err(format_parse_error(filename, text, &err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Expr {
        parse_expr_text(text).unwrap()
    }

    #[test]
    fn parse_literals() {
        assert_eq!(parse("1"), Expr::Int(1));
        assert_eq!(parse("2.5"), Expr::Float(2.5));
        assert_eq!(parse("\"hi\""), Expr::Str("hi".into()));
        assert_eq!(parse("'hi'"), Expr::Str("hi".into()));
        assert_eq!(parse("true"), Expr::Bool(true));
    }

    #[test]
    fn parse_precedence() {
        let e = parse("a + b * 2");
        assert_eq!(deparse(&e), "a + (b * 2)");
        let e = parse("(a + b) * 2");
        assert_eq!(deparse(&e), "(a + b) * 2");
    }

    #[test]
    fn parse_call_with_named_args() {
        let e = parse("load(a, list = [b, \"c\"])");
        let call = match &e {
            Expr::Call(c) => c,
            other => panic!("expected call, got {:?}", other),
        };
        assert_eq!(call.head, "load");
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.args[1].name.as_deref(), Some("list"));
    }

    #[test]
    fn parse_namespaced_call() {
        let e = parse("stats::median([1, 2, 3])");
        match &e {
            Expr::Call(c) => {
                assert_eq!(c.ns.as_deref(), Some("stats"));
                assert!(!c.internal);
                assert_eq!(c.qualified(), "stats::median");
            }
            other => panic!("expected call, got {:?}", other),
        }
        let e = parse("pkg:::hidden(1)");
        match &e {
            Expr::Call(c) => assert_eq!(c.qualified(), "pkg:::hidden"),
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn single_quotes_standardize_to_double() {
        let a = parse("file_in('in.txt')");
        let b = parse("file_in(\"in.txt\")");
        assert_eq!(deparse(&a), deparse(&b));
        assert_eq!(deparse(&a), "file_in(\"in.txt\")");
    }

    #[test]
    fn trailing_semicolon_stripped() {
        let a = parse("a + 1;");
        let b = parse("a + 1");
        assert_eq!(deparse(&a), deparse(&b));
    }

    #[test]
    fn deparse_reparses() {
        for text in [
            "a + (b * 2)",
            "f(x, y = [1, 2.5, \"s\"])",
            "{ load(a); a + 1 }",
            "fn(x, y) (x + y) % 2",
            "!(a == b) && (c < -d)",
            "pkg::go(file_in(\"data.csv\"))",
        ] {
            let e = parse(text);
            let again = parse(&deparse(&e));
            assert_eq!(e, again, "deparse of {:?} did not reparse", text);
        }
    }

    #[test]
    fn parse_plan_file() {
        let plan = parse_plan(
            Path::new("test.plan"),
            "\
# demo plan
let k = 10
fn f(x) = x + k
file raw = \"data.csv\"

target a = 1
target b = f(a)
  trigger = command
  evaluator = local
  note = passthrough
",
        )
        .unwrap();
        assert_eq!(plan.rows.len(), 2);
        assert_eq!(plan.imports.len(), 3);
        let b = &plan.rows[1];
        assert_eq!(b.name, "b");
        assert_eq!(b.trigger.as_deref(), Some("command"));
        assert_eq!(b.evaluator.as_deref(), Some("local"));
        assert_eq!(b.extra.get("note").map(|s| s.as_str()), Some("passthrough"));
    }

    #[test]
    fn option_blocks_tolerate_blanks_and_comments() {
        let plan = parse_plan(
            Path::new("test.plan"),
            "target a = 1\n  \n  # a comment\n  trigger = always\n   \ntarget b = 2\n",
        )
        .unwrap();
        assert_eq!(plan.rows.len(), 2);
        assert_eq!(plan.rows[0].trigger.as_deref(), Some("always"));
    }

    #[test]
    fn plan_parse_error_has_location_and_caret() {
        let err = parse_plan(Path::new("bad.plan"), "target a = 1\ntarget = 1\n").unwrap_err();
        assert!(err.contains("bad.plan:2"), "unexpected error: {}", err);
        assert!(err.contains('^'), "missing caret: {}", err);
    }
}
