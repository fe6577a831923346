// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! In-process engine for tests
//!
//! Understands a tiny line-oriented subset of JavaScript, one statement per line:
//!
//! ```text
//! let name = expr          name = expr          target.prop = expr
//! return expr              throw expr           expr
//! function name(a, b) {    try {                } catch (e) {
//! }
//! ```
//!
//! Expressions are string/number/boolean literals, `undefined`, `{}`, `[a, b]`,
//! identifiers, member access, calls, `+` and `===`. Objects have reference
//! identity, so exports identity can be asserted directly.

use crate::engine::{Engine, NativeFunction, ScriptError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;

/// Plugin entry signature understood by [`TestEngine::init_plugin`]
pub type TestPluginInit = fn(&mut TestEngine, &Value, &Value) -> Result<(), ScriptError>;

/// A test engine value
#[derive(Clone)]
pub enum Value {
    Undefined,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(Rc<Object>),
}

impl Value {
    /// Reference identity for objects, value equality otherwise
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn as_object(&self) -> Option<&Rc<Object>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    fn display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Object(obj) => match obj.kind {
                ObjectKind::Plain => "[object Object]".to_string(),
                ObjectKind::Array(_) => "[object Array]".to_string(),
                _ => "[function]".to_string(),
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            other => f.write_str(&other.display()),
        }
    }
}

/// A heap object
pub struct Object {
    props: RefCell<Vec<(String, Value)>>,
    kind: ObjectKind,
}

enum ObjectKind {
    Plain,
    Array(RefCell<Vec<Value>>),
    Native(NativeFunction<TestEngine>),
    Script(Rc<FunctionDef>, Rc<Scope>),
}

impl Object {
    fn new(kind: ObjectKind) -> Rc<Self> {
        Rc::new(Self {
            props: RefCell::new(Vec::new()),
            kind,
        })
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.props
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn set(&self, key: &str, value: Value) {
        let mut props = self.props.borrow_mut();
        match props.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => props.push((key.to_string(), value)),
        }
    }

    fn delete(&self, key: &str) {
        self.props.borrow_mut().retain(|(k, _)| k != key);
    }
}

/// Lexical scope
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    fn child(parent: Option<Rc<Scope>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent,
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), Value> {
        if let Some(slot) = self.vars.borrow_mut().get_mut(name) {
            *slot = value;
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(value),
        }
    }
}

/// Compiled test script
pub struct TestScript {
    resource: Rc<str>,
    body: Vec<Stmt>,
}

impl fmt::Debug for TestScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScript")
            .field("resource", &self.resource)
            .field("statements", &self.body.len())
            .finish()
    }
}

pub struct FunctionDef {
    params: Vec<String>,
    body: Vec<Stmt>,
    resource: Rc<str>,
}

struct Stmt {
    line: u32,
    kind: StmtKind,
}

enum StmtKind {
    Let(String, Expr),
    Assign(Target, Expr),
    Expr(Expr),
    Return(Option<Expr>),
    Throw(Expr),
    Function(String, Rc<FunctionDef>),
    Try {
        body: Vec<Stmt>,
        binding: String,
        handler: Vec<Stmt>,
    },
}

enum Target {
    Ident(String),
    Member(Expr, String),
}

#[derive(Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
    StrictEq(Box<Expr>, Box<Expr>),
    ObjectLit,
    ArrayLit(Vec<Expr>),
    Function(Rc<FunctionDef>),
}

enum Flow {
    Normal(Value),
    Return(Value),
}

/// Engine used by the test suites
pub struct TestEngine {
    global: Rc<Object>,
    terminating: bool,
    depth: usize,
    next_handle: u64,
    tracked: Vec<(u64, Value)>,
    unreachable: Vec<(u64, Value)>,
    compiles: usize,
}

impl TestEngine {
    /// Create an engine with an empty global object
    pub fn new() -> Self {
        Self {
            global: Object::new(ObjectKind::Plain),
            terminating: false,
            depth: 0,
            next_handle: 1,
            tracked: Vec::new(),
            unreachable: Vec::new(),
            compiles: 0,
        }
    }

    /// Number of successful compilations so far
    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    /// Read a global binding
    pub fn global_value(&self, name: &str) -> Option<Value> {
        self.global.get(name)
    }

    /// Read a global binding as a string
    pub fn global_string(&self, name: &str) -> Option<String> {
        match self.global.get(name) {
            Some(Value::Str(s)) => Some(s.to_string()),
            Some(Value::Number(n)) => Some(Value::Number(n).display()),
            _ => None,
        }
    }

    /// Read a property as a string
    pub fn property_string(&self, object: &Value, key: &str) -> Option<String> {
        object
            .as_object()
            .and_then(|obj| obj.get(key))
            .map(|v| v.display())
    }

    /// Move tracked objects that nothing else references to the
    /// unreachable queue.
    pub fn collect_garbage(&mut self) {
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tracked)
            .into_iter()
            .partition(|(_, value)| match value {
                Value::Object(obj) => Rc::strong_count(obj) == 1,
                _ => false,
            });
        self.tracked = live;
        self.unreachable.extend(dead);
    }

    /// Number of handles still tracked
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        if self.terminating {
            if self.depth == 0 {
                self.terminating = false;
            }
            return Err(ScriptError::terminated());
        }
        self.depth += 1;
        Ok(())
    }

    fn leave<T>(&mut self, result: Result<T, ScriptError>) -> Result<T, ScriptError> {
        self.depth -= 1;
        if self.depth == 0 && self.terminating {
            self.terminating = false;
            return Err(ScriptError::terminated());
        }
        result
    }

    fn exec_block(
        &mut self,
        stmts: &[Stmt],
        scope: &Rc<Scope>,
        resource: &Rc<str>,
    ) -> Result<Flow, ScriptError> {
        let mut last = Value::Undefined;
        for stmt in stmts {
            if self.terminating {
                return Err(ScriptError::terminated());
            }
            let located = |err: ScriptError| {
                if err.resource.is_none() && !err.is_termination() {
                    err.at(resource.to_string(), stmt.line)
                } else {
                    err
                }
            };
            match &stmt.kind {
                StmtKind::Let(name, expr) => {
                    let value = self.eval(expr, scope).map_err(located)?;
                    scope.vars.borrow_mut().insert(name.clone(), value);
                }
                StmtKind::Assign(Target::Ident(name), expr) => {
                    let value = self.eval(expr, scope).map_err(located)?;
                    if let Err(value) = scope.assign(name, value) {
                        self.global.set(name, value);
                    }
                }
                StmtKind::Assign(Target::Member(object, key), expr) => {
                    let target = self.eval(object, scope).map_err(located)?;
                    let value = self.eval(expr, scope).map_err(located)?;
                    let obj = target.as_object().ok_or_else(|| {
                        located(ScriptError::runtime(format!(
                            "TypeError: Cannot set property '{}' of {}",
                            key,
                            target.display()
                        )))
                    })?;
                    obj.set(key, value);
                }
                StmtKind::Expr(expr) => {
                    last = self.eval(expr, scope).map_err(located)?;
                }
                StmtKind::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, scope).map_err(located)?,
                        None => Value::Undefined,
                    };
                    return Ok(Flow::Return(value));
                }
                StmtKind::Throw(expr) => {
                    let value = self.eval(expr, scope).map_err(located)?;
                    return Err(ScriptError::runtime(value.display()).at(resource.to_string(), stmt.line));
                }
                StmtKind::Function(name, def) => {
                    let function = Object::new(ObjectKind::Script(def.clone(), scope.clone()));
                    scope
                        .vars
                        .borrow_mut()
                        .insert(name.clone(), Value::Object(function));
                }
                StmtKind::Try {
                    body,
                    binding,
                    handler,
                } => match self.exec_block(body, scope, resource) {
                    Ok(Flow::Return(value)) => return Ok(Flow::Return(value)),
                    Ok(Flow::Normal(_)) => {}
                    Err(err) if err.is_termination() => return Err(err),
                    Err(err) => {
                        let inner = Scope::child(Some(scope.clone()));
                        inner
                            .vars
                            .borrow_mut()
                            .insert(binding.clone(), Value::Str(Rc::from(err.message.as_str())));
                        if let Flow::Return(value) = self.exec_block(handler, &inner, resource)? {
                            return Ok(Flow::Return(value));
                        }
                    }
                },
            }
        }
        Ok(Flow::Normal(last))
    }

    fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Value, ScriptError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => scope
                .lookup(name)
                .or_else(|| self.global.get(name))
                .ok_or_else(|| ScriptError::runtime(format!("ReferenceError: {} is not defined", name))),
            Expr::Member(object, key) => {
                let target = self.eval(object, scope)?;
                let obj = target.as_object().ok_or_else(|| {
                    ScriptError::runtime(format!(
                        "TypeError: Cannot read property '{}' of {}",
                        key,
                        target.display()
                    ))
                })?;
                Ok(obj.get(key).unwrap_or(Value::Undefined))
            }
            Expr::Call(callee, args) => {
                let (function, receiver) = match callee.as_ref() {
                    Expr::Member(object, key) => {
                        let receiver = self.eval(object, scope)?;
                        let function = receiver
                            .as_object()
                            .and_then(|obj| obj.get(key))
                            .unwrap_or(Value::Undefined);
                        (function, receiver)
                    }
                    other => (self.eval(other, scope)?, Value::Undefined),
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                self.invoke(&function, &receiver, &values)
            }
            Expr::Add(left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Ok(match (&left, &right) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    _ => Value::Str(Rc::from(format!("{}{}", left.display(), right.display()))),
                })
            }
            Expr::StrictEq(left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Ok(Value::Bool(left.same(&right)))
            }
            Expr::ObjectLit => Ok(Value::Object(Object::new(ObjectKind::Plain))),
            Expr::ArrayLit(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(self.new_array(values))
            }
            Expr::Function(def) => Ok(Value::Object(Object::new(ObjectKind::Script(
                def.clone(),
                scope.clone(),
            )))),
        }
    }

    fn invoke(&mut self, function: &Value, _receiver: &Value, args: &[Value]) -> Result<Value, ScriptError> {
        let obj = function
            .as_object()
            .ok_or_else(|| ScriptError::runtime(format!("TypeError: {} is not a function", function.display())))?;
        match &obj.kind {
            ObjectKind::Native(native) => {
                let native = native.clone();
                native(self, args)
            }
            ObjectKind::Script(def, closure) => {
                let scope = Scope::child(Some(closure.clone()));
                for (index, param) in def.params.iter().enumerate() {
                    let value = args.get(index).cloned().unwrap_or(Value::Undefined);
                    scope.vars.borrow_mut().insert(param.clone(), value);
                }
                match self.exec_block(&def.body, &scope, &def.resource)? {
                    Flow::Return(value) => Ok(value),
                    Flow::Normal(_) => Ok(Value::Undefined),
                }
            }
            _ => Err(ScriptError::runtime("TypeError: object is not a function")),
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for TestEngine {
    type Value = Value;
    type Script = TestScript;
    type Weak = u64;

    fn compile(&mut self, source: &str, name: &str) -> Result<TestScript, ScriptError> {
        let resource: Rc<str> = Rc::from(name);
        let body = parse_program(source, &resource)?;
        self.compiles += 1;
        Ok(TestScript { resource, body })
    }

    fn run(&mut self, script: &TestScript) -> Result<Value, ScriptError> {
        self.enter()?;
        let scope = Scope::child(None);
        let result = self
            .exec_block(&script.body, &scope, &script.resource)
            .map(|flow| match flow {
                Flow::Normal(value) | Flow::Return(value) => value,
            });
        self.leave(result)
    }

    fn call(&mut self, function: &Value, receiver: &Value, args: &[Value]) -> Result<Value, ScriptError> {
        self.enter()?;
        let result = self.invoke(function, receiver, args);
        self.leave(result)
    }

    fn global(&mut self) -> Value {
        Value::Object(self.global.clone())
    }

    fn undefined(&mut self) -> Value {
        Value::Undefined
    }

    fn new_object(&mut self) -> Value {
        Value::Object(Object::new(ObjectKind::Plain))
    }

    fn new_array(&mut self, items: Vec<Value>) -> Value {
        Value::Object(Object::new(ObjectKind::Array(RefCell::new(items))))
    }

    fn new_string(&mut self, value: &str) -> Value {
        Value::Str(Rc::from(value))
    }

    fn new_function(&mut self, _name: &str, function: NativeFunction<Self>) -> Value {
        Value::Object(Object::new(ObjectKind::Native(function)))
    }

    fn get(&mut self, object: &Value, key: &str) -> Result<Option<Value>, ScriptError> {
        let obj = object
            .as_object()
            .ok_or_else(|| ScriptError::runtime(format!("TypeError: Cannot read property '{}'", key)))?;
        Ok(obj.get(key))
    }

    fn set(&mut self, object: &Value, key: &str, value: Value) -> Result<(), ScriptError> {
        let obj = object
            .as_object()
            .ok_or_else(|| ScriptError::runtime(format!("TypeError: Cannot set property '{}'", key)))?;
        obj.set(key, value);
        Ok(())
    }

    fn delete(&mut self, object: &Value, key: &str) -> Result<(), ScriptError> {
        if let Some(obj) = object.as_object() {
            obj.delete(key);
        }
        Ok(())
    }

    fn keys(&mut self, object: &Value) -> Result<Vec<String>, ScriptError> {
        Ok(object
            .as_object()
            .map(|obj| obj.props.borrow().iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default())
    }

    fn as_string(&self, value: &Value) -> Option<String> {
        match value {
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        }
    }

    fn array_elements(&mut self, value: &Value) -> Option<Vec<Value>> {
        match &value.as_object()?.kind {
            ObjectKind::Array(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    fn is_callable(&self, value: &Value) -> bool {
        matches!(
            value.as_object().map(|obj| &obj.kind),
            Some(ObjectKind::Native(_)) | Some(ObjectKind::Script(..))
        )
    }

    fn is_undefined(&self, value: &Value) -> bool {
        matches!(value, Value::Undefined)
    }

    fn track_for_finalization(&mut self, object: &Value) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.tracked.push((handle, object.clone()));
        handle
    }

    fn materialize(&mut self, handle: &u64) -> Option<Value> {
        self.tracked
            .iter()
            .chain(self.unreachable.iter())
            .find(|(h, _)| h == handle)
            .map(|(_, v)| v.clone())
    }

    fn untrack(&mut self, handle: &u64) {
        self.tracked.retain(|(h, _)| h != handle);
        self.unreachable.retain(|(h, _)| h != handle);
    }

    fn take_unreachable(&mut self) -> Vec<(u64, Value)> {
        std::mem::take(&mut self.unreachable)
    }

    fn terminate_execution(&mut self) {
        self.terminating = true;
    }

    unsafe fn init_plugin(
        &mut self,
        entry: *const c_void,
        exports: &Value,
        module: &Value,
    ) -> Result<(), ScriptError> {
        // SAFETY: test libraries only ever hand out `TestPluginInit` addresses.
        let init = unsafe { std::mem::transmute::<*const c_void, TestPluginInit>(entry) };
        init(self, exports, module)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

const WRAPPER_PREFIX: &str = "(function (";

fn parse_program(source: &str, resource: &Rc<str>) -> Result<Vec<Stmt>, ScriptError> {
    if let Some(rest) = source.strip_prefix(WRAPPER_PREFIX) {
        let header_end = rest
            .find(") {")
            .ok_or_else(|| ScriptError::compile("SyntaxError: malformed function header").at(resource.to_string(), 1))?;
        let params = parse_params(&rest[..header_end]);
        let body_text = rest[header_end + 3..]
            .trim_end()
            .strip_suffix("})")
            .ok_or_else(|| ScriptError::compile("SyntaxError: unterminated function").at(resource.to_string(), 1))?;
        let body = parse_lines(body_text, resource)?;
        let def = Rc::new(FunctionDef {
            params,
            body,
            resource: resource.clone(),
        });
        return Ok(vec![Stmt {
            line: 1,
            kind: StmtKind::Expr(Expr::Function(def)),
        }]);
    }
    parse_lines(source, resource)
}

fn parse_params(text: &str) -> Vec<String> {
    text.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_lines(source: &str, resource: &Rc<str>) -> Result<Vec<Stmt>, ScriptError> {
    let lines: Vec<(u32, &str)> = source
        .lines()
        .enumerate()
        .map(|(i, text)| (i as u32 + 1, text))
        .collect();
    let mut pos = 0;
    let (stmts, closing) = parse_block(&lines, &mut pos, resource)?;
    if let Some((line, _)) = closing {
        return Err(ScriptError::compile("SyntaxError: Unexpected token '}'").at(resource.to_string(), line));
    }
    Ok(stmts)
}

type Closing<'a> = Option<(u32, &'a str)>;

fn parse_block<'a>(
    lines: &[(u32, &'a str)],
    pos: &mut usize,
    resource: &Rc<str>,
) -> Result<(Vec<Stmt>, Closing<'a>), ScriptError> {
    let mut stmts = Vec::new();
    while *pos < lines.len() {
        let (line, raw) = lines[*pos];
        *pos += 1;
        let text = raw.trim().trim_end_matches(';').trim_end();
        if text.is_empty() || text.starts_with("//") || text.starts_with("#!") {
            continue;
        }
        if text.starts_with('}') {
            return Ok((stmts, Some((line, text))));
        }
        let compile_err = |msg: String| ScriptError::compile(format!("SyntaxError: {}", msg)).at(resource.to_string(), line);

        let kind = if let Some(header) = text.strip_prefix("function ") {
            let open = header.find('(').ok_or_else(|| compile_err("expected '('".into()))?;
            let close = header.find(") {").ok_or_else(|| compile_err("expected ') {'".into()))?;
            let name = header[..open].trim().to_string();
            let params = parse_params(&header[open + 1..close]);
            let (body, closing) = parse_block(lines, pos, resource)?;
            expect_closing(closing, "}", resource)?;
            StmtKind::Function(
                name,
                Rc::new(FunctionDef {
                    params,
                    body,
                    resource: resource.clone(),
                }),
            )
        } else if text == "try {" {
            let (body, closing) = parse_block(lines, pos, resource)?;
            let (close_line, close_text) =
                closing.ok_or_else(|| compile_err("unterminated try block".into()))?;
            let binding = close_text
                .strip_prefix("} catch (")
                .and_then(|rest| rest.strip_suffix(") {"))
                .ok_or_else(|| {
                    ScriptError::compile("SyntaxError: expected catch clause").at(resource.to_string(), close_line)
                })?
                .trim()
                .to_string();
            let (handler, closing) = parse_block(lines, pos, resource)?;
            expect_closing(closing, "}", resource)?;
            StmtKind::Try {
                body,
                binding,
                handler,
            }
        } else if let Some(rest) = text
            .strip_prefix("let ")
            .or_else(|| text.strip_prefix("var "))
            .or_else(|| text.strip_prefix("const "))
        {
            let (name, value) = rest.split_once('=').ok_or_else(|| compile_err("expected '='".into()))?;
            StmtKind::Let(name.trim().to_string(), parse_expr(value).map_err(compile_err)?)
        } else if text == "return" {
            StmtKind::Return(None)
        } else if let Some(rest) = text.strip_prefix("return ") {
            StmtKind::Return(Some(parse_expr(rest).map_err(compile_err)?))
        } else if let Some(rest) = text.strip_prefix("throw ") {
            StmtKind::Throw(parse_expr(rest).map_err(compile_err)?)
        } else {
            parse_assignment_or_expr(text).map_err(compile_err)?
        };
        stmts.push(Stmt { line, kind });
    }
    Ok((stmts, None))
}

fn expect_closing(closing: Closing<'_>, expected: &str, resource: &Rc<str>) -> Result<(), ScriptError> {
    match closing {
        Some((_, text)) if text == expected => Ok(()),
        Some((line, text)) => Err(ScriptError::compile(format!("SyntaxError: Unexpected '{}'", text))
            .at(resource.to_string(), line)),
        None => Err(ScriptError::compile("SyntaxError: Unexpected end of input")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
    StrictEq,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '"' || c == '\'' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == c)
                .map(|offset| start + offset)
                .ok_or_else(|| "Unterminated string literal".to_string())?;
            tokens.push(Token::Str(chars[start..end].iter().collect()));
            i = end + 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Num(text.parse().map_err(|_| format!("Invalid number '{}'", text))?));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '=' {
            if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') {
                tokens.push(Token::StrictEq);
                i += 3;
            } else {
                tokens.push(Token::Punct('='));
                i += 1;
            }
        } else if "(){}[].,+".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(format!("Unexpected character '{}'", c));
        }
    }
    Ok(tokens)
}

fn parse_assignment_or_expr(text: &str) -> Result<StmtKind, String> {
    let tokens = tokenize(text)?;
    let mut depth = 0i32;
    let split = tokens.iter().position(|token| {
        match token {
            Token::Punct('(') | Token::Punct('[') | Token::Punct('{') => depth += 1,
            Token::Punct(')') | Token::Punct(']') | Token::Punct('}') => depth -= 1,
            Token::Punct('=') if depth == 0 => return true,
            _ => {}
        }
        false
    });

    match split {
        Some(index) => {
            let target = ExprParser::new(tokens[..index].to_vec()).parse_all()?;
            let value = ExprParser::new(tokens[index + 1..].to_vec()).parse_all()?;
            let target = match target {
                Expr::Ident(name) => Target::Ident(name),
                Expr::Member(object, key) => Target::Member(*object, key),
                _ => return Err("Invalid assignment target".to_string()),
            };
            Ok(StmtKind::Assign(target, value))
        }
        None => Ok(StmtKind::Expr(ExprParser::new(tokens).parse_all()?)),
    }
}

fn parse_expr(text: &str) -> Result<Expr, String> {
    ExprParser::new(tokenize(text)?).parse_all()
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse_all(mut self) -> Result<Expr, String> {
        let expr = self.equality()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(token) => Err(format!("Unexpected token {:?}", token)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        match self.next() {
            Some(Token::Punct(p)) if p == c => Ok(()),
            other => Err(format!("Expected '{}', found {:?}", c, other)),
        }
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        while self.peek() == Some(&Token::StrictEq) {
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::StrictEq(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.postfix()?;
        while self.peek() == Some(&Token::Punct('+')) {
            self.pos += 1;
            let right = self.postfix()?;
            left = Expr::Add(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Punct('.')) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        other => return Err(format!("Expected property name, found {:?}", other)),
                    }
                }
                Some(Token::Punct('(')) => {
                    self.pos += 1;
                    let args = self.list(')')?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn list(&mut self, close: char) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::Punct(close)) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.equality()?);
            match self.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct(c)) if c == close => return Ok(items),
                other => return Err(format!("Expected ',' or '{}', found {:?}", close, other)),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "undefined" => Expr::Literal(Value::Undefined),
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                _ => Expr::Ident(name),
            }),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(Rc::from(s.as_str())))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Punct('{')) => {
                self.expect('}')?;
                Ok(Expr::ObjectLit)
            }
            Some(Token::Punct('[')) => Ok(Expr::ArrayLit(self.list(']')?)),
            Some(Token::Punct('(')) => {
                let inner = self.equality()?;
                self.expect(')')?;
                Ok(inner)
            }
            other => Err(format!("Unexpected token {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(engine: &mut TestEngine, source: &str) -> Result<Value, ScriptError> {
        let script = engine.compile(source, "test.script")?;
        engine.run(&script)
    }

    #[test]
    fn test_assignments_and_calls() {
        let mut engine = TestEngine::new();
        run(
            &mut engine,
            "function add(a, b) {\n  return a + b\n}\nresult = add(2, 3)\nlabel = 'n=' + result",
        )
        .unwrap();
        assert_eq!(engine.global_string("result").as_deref(), Some("5"));
        assert_eq!(engine.global_string("label").as_deref(), Some("n=5"));
    }

    #[test]
    fn test_throw_reports_location() {
        let mut engine = TestEngine::new();
        let err = run(&mut engine, "let a = 1\nthrow 'boom'").unwrap_err();
        assert_eq!(err.to_string(), "test.script:2: boom");
    }

    #[test]
    fn test_try_catch() {
        let mut engine = TestEngine::new();
        run(
            &mut engine,
            "try {\n  throw 'inner'\n} catch (e) {\n  caught = e\n}",
        )
        .unwrap();
        assert_eq!(engine.global_string("caught").as_deref(), Some("inner"));
    }

    #[test]
    fn test_wrapped_module_yields_function() {
        let mut engine = TestEngine::new();
        let source = engine.wrap_module("exports.answer = 42");
        let function = run(&mut engine, &source).unwrap();
        assert!(engine.is_callable(&function));

        let exports = engine.new_object();
        let module = engine.new_object();
        let undefined = engine.undefined();
        let result = engine.call(&function, &undefined, &[exports.clone(), module]).unwrap();
        assert!(result.same(&exports));
        assert_eq!(engine.property_string(&exports, "answer").as_deref(), Some("42"));
    }

    #[test]
    fn test_compile_error() {
        let mut engine = TestEngine::new();
        let err = engine.compile("let = ", "bad.script").unwrap_err();
        assert_eq!(err.kind, crate::engine::ScriptErrorKind::Compile);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_garbage_collection_notifies_unreferenced_objects() {
        let mut engine = TestEngine::new();
        let kept = engine.new_object();
        let dropped = engine.new_object();
        let kept_handle = engine.track_for_finalization(&kept);
        let dropped_handle = engine.track_for_finalization(&dropped);
        drop(dropped);

        engine.collect_garbage();
        let notified: Vec<u64> = engine.take_unreachable().into_iter().map(|(h, _)| h).collect();
        assert_eq!(notified, vec![dropped_handle]);
        assert!(engine.materialize(&kept_handle).is_some());
    }
}
