//! Tree-walking evaluator for programs that passed the static gates.
//!
//! The namespace gate lives here: a name resolves to a program variable, a
//! [`Builtin`] or a [`Helper`] and nothing else. Every evaluation step is
//! counted, and the deadline and cancellation flag are polled on a fixed
//! cadence so an in-process run stops cooperatively.

pub(crate) mod builtins;
pub(crate) mod format;
pub(crate) mod helpers;
pub(crate) mod methods;
pub(crate) mod ops;
pub(crate) mod render;

use crate::ast::{
    BoolOp, Comprehension, Const, Expr, ExprKind, Program, Stmt, StmtKind, Target, UnaryOp,
};
use crate::config::EvalLimits;
use crate::error::{Result, RuntimeKind, SandboxError};
use crate::guard::check_attribute;
use crate::value::{BoundMethod, Closure, Table, Value};
use builtins::Builtin;
use chunkwise_chunker::ContextSection;
use helpers::Helper;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const POLL_EVERY: u64 = 1024;

/// Data the helpers read. Built inside the worker from the request.
pub struct ScoutData {
    pub context: Rc<str>,
    pub sections: Vec<ContextSection>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ScoutData {
    pub fn new(context: &str, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            sections: chunkwise_chunker::parse_sections(context),
            context: Rc::from(context),
            chunk_size,
            chunk_overlap,
        }
    }
}

/// Successful evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvalOutcome {
    /// Final expression value as plain JSON data
    pub value: serde_json::Value,
    /// Python-style repr of the final value
    pub repr: String,
    /// Captured `print` output
    pub output: String,
    pub output_truncated: bool,
    pub steps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

#[derive(Debug, Default)]
struct Frame {
    vars: HashMap<String, Value>,
    /// Lambda frames hide the caller's frames
    barrier: bool,
}

/// Bounded `print` capture.
#[derive(Debug, Default)]
pub(crate) struct Output {
    text: String,
    cap: usize,
    omitted: usize,
}

impl Output {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            omitted: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &str) {
        if self.omitted > 0 {
            self.omitted += chunk.len();
            return;
        }
        let room = self.cap.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.omitted = chunk.len() - cut;
    }

    fn finish(mut self) -> (String, bool) {
        if self.omitted == 0 {
            return (self.text, false);
        }
        self.text.push_str(&format!(
            "\n...[output truncated: {} bytes omitted]",
            self.omitted
        ));
        (self.text, true)
    }
}

/// Positional and keyword arguments of a builtin, helper or method call.
pub(crate) struct Args {
    name: &'static str,
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
}

impl Args {
    pub(crate) fn new(name: &'static str, positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Self {
        Self {
            name,
            positional,
            keywords,
        }
    }

    pub(crate) fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub(crate) fn check(&self, min: usize, max: usize) -> Result<()> {
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else if max == usize::MAX {
                format!("at least {min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(SandboxError::type_error(format!(
                "{}() takes {expected} positional arguments but {n} were given",
                self.name
            )));
        }
        Ok(())
    }

    /// Positional argument `index`, or the keyword `name`.
    pub(crate) fn arg(&mut self, index: usize, name: &str) -> Option<Value> {
        if let Some(value) = self.positional.get(index) {
            return Some(value.clone());
        }
        self.keyword(name)
    }

    pub(crate) fn required(&mut self, index: usize, name: &str) -> Result<Value> {
        let fn_name = self.name;
        self.arg(index, name).ok_or_else(|| {
            SandboxError::type_error(format!("{fn_name}() missing required argument '{name}'"))
        })
    }

    pub(crate) fn keyword(&mut self, name: &str) -> Option<Value> {
        let position = self.keywords.iter().position(|(k, _)| k == name)?;
        Some(self.keywords.remove(position).1)
    }

    /// Reject leftover keyword arguments.
    pub(crate) fn finish(self) -> Result<()> {
        match self.keywords.first() {
            Some((key, _)) => Err(SandboxError::type_error(format!(
                "{}() got an unexpected keyword argument '{key}'",
                self.name
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn into_positional(self) -> Result<Vec<Value>> {
        let name = self.name;
        if let Some((key, _)) = self.keywords.first() {
            return Err(SandboxError::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
        Ok(self.positional)
    }
}

/// Lazily walks an iterable without materializing ranges or strings.
pub(crate) enum Cursor {
    Range { next: i64, remaining: usize, step: i64 },
    Items { items: Vec<Value>, pos: usize },
    Chars { text: Rc<str>, pos: usize },
}

impl Cursor {
    pub(crate) fn next_value(&mut self) -> Option<Value> {
        match self {
            Cursor::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining == 0 {
                    return None;
                }
                let value = *next;
                *remaining -= 1;
                *next = next.saturating_add(*step);
                Some(Value::Int(value))
            }
            Cursor::Items { items, pos } => {
                let value = items.get(*pos).cloned();
                *pos += 1;
                value
            }
            Cursor::Chars { text, pos } => {
                let c = text[*pos..].chars().next()?;
                *pos += c.len_utf8();
                Some(Value::str(c.to_string()))
            }
        }
    }
}

pub(crate) struct Interp<'a> {
    globals: HashMap<String, Value>,
    frames: Vec<Frame>,
    pub(crate) data: &'a ScoutData,
    pub(crate) limits: EvalLimits,
    deadline: Instant,
    timeout_ms: u64,
    cancel: Option<&'a AtomicBool>,
    steps: u64,
    depth: usize,
    pub(crate) output: Output,
}

/// Evaluate a vetted program. The result is the value of the final
/// expression statement, or `None`.
pub fn evaluate(
    program: &Program,
    data: &ScoutData,
    limits: EvalLimits,
    deadline: Instant,
    timeout_ms: u64,
    cancel: Option<&AtomicBool>,
) -> Result<EvalOutcome> {
    let mut interp = Interp::new(data, limits, deadline, timeout_ms, cancel);
    let value = interp.run(program)?;
    let repr = render::repr(&value);
    let json = render::to_json(&value);
    let steps = interp.steps;
    let (output, output_truncated) = interp.output.finish();
    Ok(EvalOutcome {
        value: json,
        repr,
        output,
        output_truncated,
        steps,
    })
}

impl<'a> Interp<'a> {
    fn new(
        data: &'a ScoutData,
        limits: EvalLimits,
        deadline: Instant,
        timeout_ms: u64,
        cancel: Option<&'a AtomicBool>,
    ) -> Self {
        let mut globals = HashMap::new();
        globals.insert("context".to_string(), Value::Str(data.context.clone()));
        globals.insert("files".to_string(), helpers::files_value(data));
        Self {
            globals,
            frames: Vec::new(),
            data,
            limits,
            deadline,
            timeout_ms,
            cancel,
            steps: 0,
            depth: 0,
            output: Output::new(limits.max_output_bytes),
        }
    }

    /// Count one step and poll the deadline periodically.
    pub(crate) fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::resource(format!(
                "step budget of {} exhausted",
                self.limits.max_steps
            )));
        }
        if self.steps % POLL_EVERY == 0 {
            let cancelled = self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed));
            if cancelled || Instant::now() >= self.deadline {
                return Err(SandboxError::Timeout {
                    limit_ms: self.timeout_ms,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn check_len(&self, len: usize) -> Result<()> {
        if len > self.limits.max_container_len {
            return Err(SandboxError::resource(format!(
                "container length {len} exceeds {}",
                self.limits.max_container_len
            )));
        }
        Ok(())
    }

    pub(crate) fn check_str_len(&self, len: usize) -> Result<()> {
        if len > self.limits.max_string_bytes {
            return Err(SandboxError::resource(format!(
                "string of {len} bytes exceeds {}",
                self.limits.max_string_bytes
            )));
        }
        Ok(())
    }

    fn run(&mut self, program: &Program) -> Result<Value> {
        let mut result = Value::None;
        let last = program.body.len().saturating_sub(1);
        for (index, stmt) in program.body.iter().enumerate() {
            if index == last {
                if let StmtKind::Expr(expr) = &stmt.kind {
                    result = self.eval(expr).map_err(|e| e.at_line(stmt.line))?;
                    break;
                }
            }
            match self.exec(stmt)? {
                Flow::Normal => {}
                Flow::Break | Flow::Continue => {
                    return Err(SandboxError::ParseError {
                        line: stmt.line,
                        column: 0,
                        message: "'break' or 'continue' outside loop".to_string(),
                    })
                }
            }
        }
        Ok(result)
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick()?;
        self.exec_kind(stmt).map_err(|e| e.at_line(stmt.line))
    }

    fn exec_kind(&mut self, stmt: &Stmt) -> Result<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone(), false)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value)?;
                match target {
                    Target::Name(name) => {
                        let current = self.lookup(name)?;
                        let updated = self.augment(*op, current, rhs)?;
                        self.bind(name, updated, false);
                    }
                    Target::Subscript { value, index } => {
                        let container = self.eval(value)?;
                        let key = self.eval(index)?;
                        let current = ops::get_item(&container, &key)?;
                        let updated = self.augment(*op, current, rhs)?;
                        ops::set_item(&container, key, updated)?;
                    }
                    other => return Err(forbidden(other.node_kind().name(), stmt.line)),
                }
            }
            StmtKind::If { test, body, orelse } => {
                return if self.eval(test)?.truthy() {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                };
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    if !self.eval(test)?.truthy() {
                        self.exec_block(orelse)?;
                        break;
                    }
                    if self.exec_block(body)? == Flow::Break {
                        break;
                    }
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                let mut cursor = self.iterate(iterable)?;
                let mut broke = false;
                while let Some(item) = cursor.next_value() {
                    self.tick()?;
                    self.assign(target, item, false)?;
                    if self.exec_block(body)? == Flow::Break {
                        broke = true;
                        break;
                    }
                }
                if !broke {
                    self.exec_block(orelse)?;
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            denied => return Err(forbidden(denied.node_kind().name(), stmt.line)),
        }
        Ok(Flow::Normal)
    }

    /// `+=` on a list extends it in place, like Python.
    fn augment(&mut self, op: crate::ast::BinOp, current: Value, rhs: Value) -> Result<Value> {
        if let (crate::ast::BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.collect(rhs)?;
            let new_len = items.borrow().len() + extra.len();
            self.check_len(new_len)?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        ops::binary(&self.limits, op, &current, &rhs)
    }

    fn bind(&mut self, name: &str, value: Value, local: bool) {
        match self.frames.last_mut() {
            Some(frame) if local => {
                frame.vars.insert(name.to_string(), value);
            }
            _ => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value, local: bool) -> Result<()> {
        match target {
            Target::Name(name) => {
                self.bind(name, value, local);
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let key = self.eval(index)?;
                ops::set_item(&container, key, value)
            }
            Target::Tuple(targets) => {
                let items = self.collect(value)?;
                if items.len() != targets.len() {
                    return Err(SandboxError::value_error(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, local)?;
                }
                Ok(())
            }
            Target::Attribute { .. } | Target::Starred(_) => {
                Err(forbidden(target.node_kind().name(), 0))
            }
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.vars.get(name) {
                return Ok(value.clone());
            }
            if frame.barrier {
                break;
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        if let Some(helper) = Helper::from_name(name) {
            return Ok(Value::Helper(helper));
        }
        Err(SandboxError::runtime(
            RuntimeKind::NameError,
            format!("name '{name}' is not defined"),
        ))
    }

    /// Variables visible from the current frame, outermost first.
    fn capture(&self) -> Vec<(String, Value)> {
        let start = self
            .frames
            .iter()
            .rposition(|frame| frame.barrier)
            .unwrap_or(0);
        self.frames[start..]
            .iter()
            .flat_map(|frame| frame.vars.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.tick()?;
        self.eval_kind(expr).map_err(|e| e.at_line(expr.line))
    }

    fn eval_kind(&mut self, expr: &Expr) -> Result<Value> {
        match &expr.kind {
            ExprKind::Const(constant) => Ok(match constant {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(i) => Value::Int(*i),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
            }),
            ExprKind::JoinedStr(parts) => {
                let text = format::joined(self, parts)?;
                Ok(Value::str(text))
            }
            ExprKind::Name(name) => self.lookup(name),
            ExprKind::List(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::list(values))
            }
            ExprKind::Tuple(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::tuple(values))
            }
            ExprKind::Set(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::set(Table::from_keys(values)?))
            }
            ExprKind::Dict(pairs) => {
                self.check_len(pairs.len())?;
                let mut table = Table::default();
                for (key, value) in pairs {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    table.insert(key, value)?;
                }
                Ok(Value::dict(table))
            }
            ExprKind::BinOp { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary(&self.limits, *op, &left, &right)
            }
            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    other => ops::unary(*other, &value),
                }
            }
            ExprKind::BoolOp { op, values } => {
                let mut last = Value::None;
                for value in values {
                    last = self.eval(value)?;
                    let decided = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if decided {
                        break;
                    }
                }
                Ok(last)
            }
            ExprKind::Compare { left, ops: chain } => {
                let mut left = self.eval(left)?;
                for (op, right) in chain {
                    let right = self.eval(right)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::Lambda(lambda) => Ok(Value::Lambda(Rc::new(Closure {
                lambda: lambda.clone(),
                captured: self.capture(),
            }))),
            ExprKind::Attribute { value, attr } => {
                let receiver = self.eval(value)?;
                self.attribute(receiver, attr)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let lower = self.eval_optional(lower.as_deref())?;
                    let upper = self.eval_optional(upper.as_deref())?;
                    let step = self.eval_optional(step.as_deref())?;
                    return ops::get_slice(&container, lower, upper, step);
                }
                let key = self.eval(index)?;
                ops::get_item(&container, &key)
            }
            ExprKind::Slice { .. } => Err(SandboxError::type_error("slice outside of a subscript")),
            ExprKind::Call { func, args, kwargs } => {
                let func = self.eval(func)?;
                let args = self.eval_all(args)?;
                let mut keywords = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    keywords.push((name.clone(), self.eval(value)?));
                }
                self.call(func, args, keywords)
            }
            ExprKind::ListComp { elt, generators } | ExprKind::GeneratorExp { elt, generators } => {
                let mut out = Vec::new();
                self.comprehension(generators, &mut |interp| {
                    let value = interp.eval(elt)?;
                    out.push(value);
                    interp.check_len(out.len())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::SetComp { elt, generators } => {
                let mut table = Table::default();
                self.comprehension(generators, &mut |interp| {
                    let value = interp.eval(elt)?;
                    table.insert(value, Value::None)?;
                    interp.check_len(table.len())
                })?;
                Ok(Value::set(table))
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                let mut table = Table::default();
                self.comprehension(generators, &mut |interp| {
                    let k = interp.eval(key)?;
                    let v = interp.eval(value)?;
                    table.insert(k, v)?;
                    interp.check_len(table.len())
                })?;
                Ok(Value::dict(table))
            }
            denied => Err(forbidden(denied.node_kind().name(), expr.line)),
        }
    }

    fn eval_optional(&mut self, expr: Option<&Expr>) -> Result<Option<Value>> {
        match expr {
            Some(expr) => Ok(Some(self.eval(expr)?)),
            None => Ok(None),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>> {
        self.check_len(exprs.len())?;
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    /// Attribute gate (run-time half) followed by method resolution. Plain
    /// values expose methods only.
    pub(crate) fn attribute(&mut self, receiver: Value, attr: &str) -> Result<Value> {
        check_attribute(attr)?;
        match methods::Method::resolve(&receiver, attr) {
            Some(method) => Ok(Value::Method(Rc::new(BoundMethod { receiver, method }))),
            None => Err(SandboxError::runtime(
                RuntimeKind::AttributeError,
                format!("'{}' object has no attribute '{attr}'", receiver.type_name()),
            )),
        }
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.frames.push(Frame::default());
        let result = self.comprehension_level(generators, emit);
        self.frames.pop();
        result
    }

    fn comprehension_level(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self);
        };
        let iterable = self.eval(&first.iter)?;
        let mut cursor = self.iterate(iterable)?;
        'items: while let Some(item) = cursor.next_value() {
            self.tick()?;
            self.assign(&first.target, item, true)?;
            for condition in &first.ifs {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension_level(rest, emit)?;
        }
        Ok(())
    }

    pub(crate) fn iterate(&self, value: Value) -> Result<Cursor> {
        Ok(match value {
            Value::Range(range) => Cursor::Range {
                next: range.start,
                remaining: range.len(),
                step: range.step,
            },
            Value::List(items) => Cursor::Items {
                items: items.borrow().clone(),
                pos: 0,
            },
            Value::Tuple(items) => Cursor::Items {
                items: (*items).clone(),
                pos: 0,
            },
            Value::Dict(table) | Value::Set(table) => Cursor::Items {
                items: table.borrow().keys(),
                pos: 0,
            },
            Value::Str(text) => Cursor::Chars { text, pos: 0 },
            other => {
                return Err(SandboxError::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        })
    }

    /// Materialize an iterable, respecting the container cap and step budget.
    pub(crate) fn collect(&mut self, value: Value) -> Result<Vec<Value>> {
        if let Value::Range(range) = &value {
            self.check_len(range.len())?;
        }
        let mut cursor = self.iterate(value)?;
        let mut out = Vec::new();
        while let Some(item) = cursor.next_value() {
            self.tick()?;
            out.push(item);
            self.check_len(out.len())?;
        }
        Ok(out)
    }

    pub(crate) fn call(&mut self, func: Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value> {
        match func {
            Value::Lambda(closure) => self.call_lambda(&closure, args, kwargs),
            Value::Builtin(builtin) => {
                builtins::call(self, builtin, Args::new(builtin.name(), args, kwargs))
            }
            Value::Helper(helper) => helpers::call(self, helper, Args::new(helper.name(), args, kwargs)),
            Value::Method(bound) => methods::call(
                self,
                &bound.receiver,
                bound.method,
                Args::new(bound.method.name(), args, kwargs),
            ),
            other => Err(SandboxError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_lambda(&mut self, closure: &Closure, args: Vec<Value>, mut kwargs: Vec<(String, Value)>) -> Result<Value> {
        let params = &closure.lambda.params;
        if args.len() > params.len() {
            return Err(SandboxError::type_error(format!(
                "<lambda>() takes {} positional arguments but {} were given",
                params.len(),
                args.len()
            )));
        }
        if self.depth >= self.limits.max_call_depth {
            return Err(SandboxError::resource(format!(
                "call depth of {} exceeded",
                self.limits.max_call_depth
            )));
        }

        let mut frame = Frame {
            vars: closure.captured.iter().cloned().collect(),
            barrier: true,
        };
        let mut positional = args.into_iter();
        for param in params {
            let value = match positional.next() {
                Some(value) => value,
                None => match kwargs.iter().position(|(k, _)| k == param) {
                    Some(i) => kwargs.remove(i).1,
                    None => {
                        return Err(SandboxError::type_error(format!(
                            "<lambda>() missing required argument '{param}'"
                        )))
                    }
                },
            };
            frame.vars.insert(param.clone(), value);
        }
        if let Some((key, _)) = kwargs.first() {
            return Err(SandboxError::type_error(format!(
                "<lambda>() got an unexpected keyword argument '{key}'"
            )));
        }

        self.frames.push(frame);
        self.depth += 1;
        let result = self.eval(&closure.lambda.body);
        self.depth -= 1;
        self.frames.pop();
        result
    }

    /// Call a user-supplied key/predicate function with one argument.
    pub(crate) fn call1(&mut self, func: &Value, arg: Value) -> Result<Value> {
        self.call(func.clone(), vec![arg], Vec::new())
    }
}

fn forbidden(node: &str, line: usize) -> SandboxError {
    SandboxError::ForbiddenNode {
        node: node.to_string(),
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::vet;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    pub(crate) fn run_with(source: &str, context: &str, limits: EvalLimits) -> Result<EvalOutcome> {
        let program = vet(source)?;
        let data = ScoutData::new(context, 16, 4);
        let deadline = Instant::now() + Duration::from_secs(10);
        evaluate(&program, &data, limits, deadline, 10_000, None)
    }

    pub(crate) fn run(source: &str) -> Result<EvalOutcome> {
        run_with(source, "", EvalLimits::default())
    }

    fn repr(source: &str) -> String {
        run(source).unwrap().repr
    }

    #[test]
    fn final_expression_is_the_result() {
        assert_eq!(repr("x = 2\nx * 21"), "42");
        assert_eq!(repr("x = 2"), "None");
        assert_eq!(repr(""), "None");
    }

    #[test]
    fn loops_and_conditionals() {
        let source = "total = 0\nfor i in range(10):\n    if i % 2:\n        continue\n    total += i\nelse:\n    total += 100\ntotal";
        assert_eq!(repr(source), "120");
        let source = "n = 0\nwhile True:\n    n += 1\n    if n == 5:\n        break\nn";
        assert_eq!(repr(source), "5");
    }

    #[test]
    fn comprehensions_and_lambdas() {
        assert_eq!(repr("[x * x for x in range(5) if x % 2 == 0]"), "[0, 4, 16]");
        assert_eq!(repr("{k: v for k, v in zip('ab', [1, 2])}"), "{'a': 1, 'b': 2}");
        assert_eq!(repr("sorted(['bb', 'a', 'ccc'], key=lambda s: -len(s))"), "['ccc', 'bb', 'a']");
        assert_eq!(repr("adders = [lambda v: v + i for i in range(3)]\n[f(10) for f in adders]"), "[10, 11, 12]");
        assert_eq!(repr("sum(x for x in range(4))"), "6");
    }

    #[test]
    fn lambdas_do_not_see_caller_locals() {
        let err = run("f = lambda: secret\n[f() for secret in [1]]").unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { error: RuntimeKind::NameError, .. }));
    }

    #[test]
    fn list_plus_equals_mutates_in_place() {
        assert_eq!(repr("a = [1]\nb = a\na += [2]\nb"), "[1, 2]");
    }

    #[test]
    fn unpacking_and_subscript_assignment() {
        assert_eq!(repr("a, (b, c) = 1, (2, 3)\nd = {}\nd['k'] = a + b + c\nd"), "{'k': 6}");
        assert!(run("a, b = [1, 2, 3]").is_err());
    }

    #[test]
    fn print_is_captured_and_truncated() {
        let out = run("print('hi', 1)\n7").unwrap();
        assert_eq!(out.output, "hi 1\n");
        assert_eq!(out.repr, "7");

        let limits = EvalLimits {
            max_output_bytes: 10,
            ..EvalLimits::default()
        };
        let out = run_with("for i in range(100):\n    print('line', i)", "", limits).unwrap();
        assert!(out.output_truncated);
        assert!(out.output.contains("[output truncated:"));
        assert!(out.output.starts_with("line 0\nlin"));
    }

    #[test]
    fn runtime_errors_carry_lines() {
        let err = run("x = 1\ny = x / 0").unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Runtime {
                error: RuntimeKind::ZeroDivisionError,
                line: 2,
                ..
            }
        ));
        assert!(matches!(
            run("missing + 1").unwrap_err(),
            SandboxError::Runtime { error: RuntimeKind::NameError, .. }
        ));
    }

    #[test]
    fn step_budget_stops_runaway_loops() {
        let limits = EvalLimits {
            max_steps: 10_000,
            ..EvalLimits::default()
        };
        let err = run_with("while True:\n    pass", "", limits).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded { .. }));
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let program = vet("while True:\n    pass").unwrap();
        let data = ScoutData::new("", 16, 4);
        let err = evaluate(&program, &data, EvalLimits::default(), Instant::now(), 1, None).unwrap_err();
        assert_eq!(err, SandboxError::Timeout { limit_ms: 1 });
    }

    #[test]
    fn cancellation_flag_stops_evaluation() {
        let program = vet("while True:\n    pass").unwrap();
        let data = ScoutData::new("", 16, 4);
        let flag = AtomicBool::new(true);
        let deadline = Instant::now() + Duration::from_secs(60);
        let err = evaluate(&program, &data, EvalLimits::default(), deadline, 60_000, Some(&flag)).unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
    }

    #[test]
    fn container_caps_apply() {
        let limits = EvalLimits {
            max_container_len: 100,
            ..EvalLimits::default()
        };
        assert!(matches!(
            run_with("list(range(1000))", "", limits).unwrap_err(),
            SandboxError::ResourceExceeded { .. }
        ));
        let limits = EvalLimits {
            max_string_bytes: 100,
            ..EvalLimits::default()
        };
        assert!(matches!(
            run_with("'x' * 1000", "", limits).unwrap_err(),
            SandboxError::ResourceExceeded { .. }
        ));
    }

    #[test]
    fn lambda_recursion_is_bounded() {
        let limits = EvalLimits {
            max_call_depth: 8,
            ..EvalLimits::default()
        };
        let err = run_with("f = lambda n: f(n + 1)\nf(0)", "", limits).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded { .. }));
    }

    #[test]
    fn values_become_plain_json() {
        let out = run("{'a': [1, 2.5, None, True], 'b': (1, 'x')}").unwrap();
        assert_eq!(
            out.value,
            serde_json::json!({"a": [1, 2.5, null, true], "b": [1, "x"]})
        );
    }
}
