//! Tree-walking evaluator.
//!
//! Every unit of interpreted work is charged to the execution's [`GasMeter`]
//! and every charge checks the wall-clock deadline, so a script can neither
//! run past its budget nor past its time cap.

use super::ast::{AssignOp, BinaryOp, DeclKind, Expr, FunctionDecl, LogicalOp, Program, Stmt, UnaryOp};
use super::builtins::install_globals;
use super::value::{Function, Value};
use crate::error::{ExecutionError, ExecutionResult};
use crate::gas::{GasCost, GasMeter};
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Longest string a script may build.
pub const MAX_STRING_BYTES: usize = 4 * 1024 * 1024;

/// Largest gap allowed when writing past the end of an array.
const MAX_ARRAY_GAP: usize = 1024;

/// Per-execution interpreter limits.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_call_depth: usize,
    pub max_log_lines: usize,
    pub timeout: Duration,
}

struct Binding {
    value: Value,
    mutable: bool,
}

/// Lexical scope.
pub struct Environment {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Rc<Environment>>,
}

impl Environment {
    pub fn new(parent: Option<Rc<Environment>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent,
        })
    }

    /// Declare `name` in this scope. A `var` may be redeclared; `None`
    /// leaves an existing `var` untouched.
    pub fn declare(&self, name: &str, value: Option<Value>, kind: DeclKind) -> Result<(), String> {
        let mut vars = self.vars.borrow_mut();
        if let Some(existing) = vars.get_mut(name) {
            if kind != DeclKind::Var || !existing.mutable {
                return Err(format!("Identifier '{}' has already been declared", name));
            }
            if let Some(value) = value {
                existing.value = value;
            }
            return Ok(());
        }
        vars.insert(
            name.to_string(),
            Binding {
                value: value.unwrap_or(Value::Undefined),
                mutable: kind != DeclKind::Const,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(binding) = self.vars.borrow().get(name) {
            return Some(binding.value.clone());
        }
        let mut scope = self.parent.clone();
        while let Some(env) = scope {
            if let Some(binding) = env.vars.borrow().get(name) {
                return Some(binding.value.clone());
            }
            scope = env.parent.clone();
        }
        None
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<(), String> {
        if let Some(binding) = self.vars.borrow_mut().get_mut(name) {
            if !binding.mutable {
                return Err("Assignment to constant variable.".to_string());
            }
            binding.value = value;
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(format!("{} is not defined", name)),
        }
    }

    fn clear(&self) {
        let drained: Vec<Binding> = self.vars.borrow_mut().drain().map(|(_, b)| b).collect();
        drop(drained);
    }
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

enum Place {
    Variable(String),
    Property(Value, String),
    Element(Value, Value),
}

/// One isolated script instance. Dropping it tears down every scope it created.
pub struct Interpreter {
    pub(super) gas: GasMeter,
    pub(super) logs: Vec<String>,
    pub(super) limits: Limits,
    deadline: Instant,
    call_depth: usize,
    globals: Rc<Environment>,
    closures: Vec<Weak<Environment>>,
}

impl Interpreter {
    pub fn new(gas_limit: u64, limits: Limits) -> Self {
        let globals = Environment::new(None);
        install_globals(&globals);
        Self {
            gas: GasMeter::new(gas_limit),
            logs: Vec::new(),
            deadline: Instant::now() + limits.timeout,
            limits,
            call_depth: 0,
            globals,
            closures: Vec::new(),
        }
    }

    pub fn gas_used(&self) -> u64 {
        self.gas.used()
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }

    /// Charge gas, failing first if the deadline has passed.
    pub(super) fn charge(&mut self, amount: u64) -> ExecutionResult<()> {
        if Instant::now() >= self.deadline {
            return Err(ExecutionError::Timeout {
                limit_ms: self.limits.timeout.as_millis() as u64,
            });
        }
        self.gas.charge(amount)?;
        Ok(())
    }

    /// Run `program`, then call its `main` with `input`.
    pub fn run_main(
        &mut self,
        program: &Program,
        code_len: usize,
        input: &Json,
        secrets: &Json,
    ) -> ExecutionResult<Json> {
        self.charge(GasCost::execution_base(code_len))?;

        let globals = self.globals.clone();
        globals
            .declare("INPUT", Some(Value::from_json(input, true)), DeclKind::Const)
            .map_err(ExecutionError::runtime)?;
        globals
            .declare("SECRETS", Some(Value::from_json(secrets, true)), DeclKind::Const)
            .map_err(ExecutionError::runtime)?;

        self.exec_block(&program.body, &globals)?;

        let Some(Value::Function(main)) = globals.lookup("main") else {
            return Err(ExecutionError::runtime("script must define a main function"));
        };
        let result = self.call_function(&main, vec![Value::from_json(input, true)])?;
        Ok(result
            .to_json()
            .map_err(ExecutionError::runtime)?
            .unwrap_or(Json::Null))
    }

    fn child_scope(&self, env: &Rc<Environment>) -> Rc<Environment> {
        Environment::new(Some(env.clone()))
    }

    fn make_function(&mut self, decl: &Rc<FunctionDecl>, env: &Rc<Environment>) -> Value {
        self.closures.push(Rc::downgrade(env));
        Value::Function(Function::User {
            decl: decl.clone(),
            closure: env.clone(),
        })
    }

    fn hoist(&mut self, stmts: &[Stmt], env: &Rc<Environment>) -> ExecutionResult<()> {
        for stmt in stmts {
            if let Stmt::Function(decl) = stmt {
                if let Some(name) = &decl.name {
                    let function = self.make_function(decl, env);
                    env.declare(name, Some(function), DeclKind::Let)
                        .map_err(ExecutionError::runtime)?;
                }
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &Rc<Environment>) -> ExecutionResult<Flow> {
        self.hoist(stmts, env)?;
        for stmt in stmts {
            match self.exec(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, env: &Rc<Environment>) -> ExecutionResult<Flow> {
        self.charge(GasCost::STATEMENT)?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Declare { kind, declarations } => {
                for (name, init) in declarations {
                    let value = match init {
                        Some(expr) => Some(self.eval(expr, env)?),
                        None => None,
                    };
                    env.declare(name, value, *kind)
                        .map_err(ExecutionError::runtime)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, env)?.truthy() {
                    self.exec(consequent, env)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { test, body } => {
                loop {
                    self.charge(GasCost::LOOP_ITERATION)?;
                    if !self.eval(test, env)?.truthy() {
                        break;
                    }
                    match self.exec(body, env)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                let scope = self.child_scope(env);
                if let Some(init) = init {
                    self.exec(init, &scope)?;
                }
                loop {
                    self.charge(GasCost::LOOP_ITERATION)?;
                    if let Some(test) = test {
                        if !self.eval(test, &scope)?.truthy() {
                            break;
                        }
                    }
                    match self.exec(body, &scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForOf {
                kind,
                binding,
                iterable,
                body,
            } => {
                let items = match self.eval(iterable, env)? {
                    Value::Array(array) => {
                        let items = array.borrow().items.clone();
                        items
                    }
                    Value::String(s) => s.chars().map(|c| Value::string(c.to_string())).collect(),
                    other => {
                        return Err(ExecutionError::runtime(format!(
                            "{} is not iterable",
                            other.type_of()
                        )))
                    }
                };
                for item in items {
                    self.charge(GasCost::LOOP_ITERATION)?;
                    let scope = self.child_scope(env);
                    scope
                        .declare(binding, Some(item), *kind)
                        .map_err(ExecutionError::runtime)?;
                    match self.exec(body, &scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let thrown = self.eval(expr, env)?;
                Err(ExecutionError::runtime(format!("Uncaught {}", thrown_message(&thrown))))
            }
            Stmt::Block(stmts) => {
                let scope = self.child_scope(env);
                self.exec_block(stmts, &scope)
            }
        }
    }

    fn eval(&mut self, expr: &Expr, env: &Rc<Environment>) -> ExecutionResult<Value> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => {
                self.charge(GasCost::string_operation(s.len()))?;
                Ok(Value::string(s.as_str()))
            }
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Identifier(name) => env
                .lookup(name)
                .ok_or_else(|| ExecutionError::runtime(format!("{} is not defined", name))),
            Expr::Array(elements) => {
                self.charge(GasCost::array_creation(elements.len()))?;
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.eval(element, env)?);
                }
                Ok(Value::new_array(items))
            }
            Expr::Object(properties) => {
                self.charge(GasCost::object_creation(properties.len()))?;
                let mut items = IndexMap::with_capacity(properties.len());
                for (key, value) in properties {
                    let value = self.eval(value, env)?;
                    items.insert(key.clone(), value);
                }
                Ok(Value::new_object(items))
            }
            Expr::Function(decl) => Ok(self.make_function(decl, env)),
            Expr::Member { object, property } => {
                let target = self.eval(object, env)?;
                self.get_property(&target, property)
            }
            Expr::Index { object, index } => {
                let target = self.eval(object, env)?;
                let key = self.eval(index, env)?;
                self.get_element(&target, &key)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, env),
            Expr::Unary { op, operand } => self.eval_unary(*op, operand, env),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                self.binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, env)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, env)
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, env)?.truthy() {
                    self.eval(consequent, env)
                } else {
                    self.eval(alternate, env)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.resolve_place(target, env)?;
                let value = match op {
                    AssignOp::Assign => self.eval(value, env)?,
                    AssignOp::Compound(op) => {
                        let current = self.read_place(&place, env)?;
                        let rhs = self.eval(value, env)?;
                        self.binary(*op, &current, &rhs)?
                    }
                };
                self.write_place(place, value.clone(), env)?;
                Ok(value)
            }
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, env)?;
                let old = self.read_place(&place, env)?.to_number();
                self.charge(GasCost::MATH)?;
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(place, Value::Number(new), env)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, env: &Rc<Environment>) -> ExecutionResult<Value> {
        if op == UnaryOp::TypeOf {
            if let Expr::Identifier(name) = operand {
                return Ok(Value::string(
                    env.lookup(name).map(|v| v.type_of()).unwrap_or("undefined"),
                ));
            }
            return Ok(Value::string(self.eval(operand, env)?.type_of()));
        }
        let value = self.eval(operand, env)?;
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
            UnaryOp::Negate => {
                self.charge(GasCost::MATH)?;
                Ok(Value::Number(-value.to_number()))
            }
            UnaryOp::Plus | UnaryOp::TypeOf => Ok(Value::Number(value.to_number())),
        }
    }

    pub(super) fn binary(&mut self, op: BinaryOp, left: &Value, right: &Value) -> ExecutionResult<Value> {
        match op {
            BinaryOp::Add => {
                let concat = |v: &Value| matches!(v, Value::String(_) | Value::Array(_) | Value::Object(_));
                if concat(left) || concat(right) {
                    let mut s = left.to_display();
                    s.push_str(&right.to_display());
                    self.charge(GasCost::string_operation(s.len()))?;
                    return self.make_string(s);
                }
                self.charge(GasCost::MATH)?;
                Ok(Value::Number(left.to_number() + right.to_number()))
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                self.charge(GasCost::MATH)?;
                let (a, b) = (left.to_number(), right.to_number());
                Ok(Value::Number(match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    _ => a % b,
                }))
            }
            BinaryOp::Eq => {
                self.charge(GasCost::COMPARISON)?;
                Ok(Value::Bool(left.strict_equals(right)))
            }
            BinaryOp::NotEq => {
                self.charge(GasCost::COMPARISON)?;
                Ok(Value::Bool(!left.strict_equals(right)))
            }
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                self.charge(GasCost::COMPARISON)?;
                let ordering = match (left, right) {
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => left.to_number().partial_cmp(&right.to_number()),
                };
                let Some(ordering) = ordering else {
                    return Ok(Value::Bool(false));
                };
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::LtEq => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
        }
    }

    /// Wrap a freshly built string, enforcing the length cap.
    pub(super) fn make_string(&self, s: String) -> ExecutionResult<Value> {
        if s.len() > MAX_STRING_BYTES {
            return Err(ExecutionError::runtime("Invalid string length"));
        }
        Ok(Value::string(s))
    }

    pub(super) fn get_property(&mut self, target: &Value, name: &str) -> ExecutionResult<Value> {
        self.charge(GasCost::PROPERTY_ACCESS)?;
        match target {
            Value::Object(object) => Ok(object
                .borrow()
                .items
                .get(name)
                .cloned()
                .unwrap_or(Value::Undefined)),
            Value::Array(array) if name == "length" => {
                Ok(Value::Number(array.borrow().items.len() as f64))
            }
            Value::String(s) if name == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::Undefined | Value::Null => Err(ExecutionError::runtime(format!(
                "Cannot read properties of {} (reading '{}')",
                target.to_display(),
                name
            ))),
            _ => Ok(Value::Undefined),
        }
    }

    fn get_element(&mut self, target: &Value, key: &Value) -> ExecutionResult<Value> {
        match (target, array_index(key)) {
            (Value::Array(array), Some(index)) => {
                self.charge(GasCost::ARRAY_ACCESS)?;
                Ok(array
                    .borrow()
                    .items
                    .get(index)
                    .cloned()
                    .unwrap_or(Value::Undefined))
            }
            (Value::String(s), Some(index)) => {
                self.charge(GasCost::ARRAY_ACCESS)?;
                Ok(s.chars()
                    .nth(index)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or(Value::Undefined))
            }
            _ => self.get_property(target, &key.to_display()),
        }
    }

    fn resolve_place(&mut self, target: &Expr, env: &Rc<Environment>) -> ExecutionResult<Place> {
        match target {
            Expr::Identifier(name) => Ok(Place::Variable(name.clone())),
            Expr::Member { object, property } => {
                Ok(Place::Property(self.eval(object, env)?, property.clone()))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                Ok(Place::Element(object, index))
            }
            _ => Err(ExecutionError::runtime("Invalid assignment target")),
        }
    }

    fn read_place(&mut self, place: &Place, env: &Rc<Environment>) -> ExecutionResult<Value> {
        match place {
            Place::Variable(name) => env
                .lookup(name)
                .ok_or_else(|| ExecutionError::runtime(format!("{} is not defined", name))),
            Place::Property(object, name) => self.get_property(object, name),
            Place::Element(object, key) => self.get_element(object, key),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, env: &Rc<Environment>) -> ExecutionResult<()> {
        match place {
            Place::Variable(name) => env.assign(&name, value).map_err(ExecutionError::runtime),
            Place::Property(object, name) => self.set_property(&object, &name, value),
            Place::Element(object, key) => match (&object, array_index(&key)) {
                (Value::Array(array), Some(index)) => {
                    self.charge(GasCost::ARRAY_ACCESS)?;
                    let mut array = array.borrow_mut();
                    if array.frozen {
                        return Err(read_only(&index.to_string()));
                    }
                    let len = array.items.len();
                    if index < len {
                        array.items[index] = value;
                    } else if index - len <= MAX_ARRAY_GAP {
                        array.items.resize(index, Value::Undefined);
                        array.items.push(value);
                    } else {
                        return Err(ExecutionError::runtime("Array index out of range"));
                    }
                    Ok(())
                }
                _ => self.set_property(&object, &key.to_display(), value),
            },
        }
    }

    fn set_property(&mut self, target: &Value, name: &str, value: Value) -> ExecutionResult<()> {
        self.charge(GasCost::PROPERTY_ACCESS)?;
        match target {
            Value::Object(object) => {
                let mut object = object.borrow_mut();
                if object.frozen {
                    return Err(read_only(name));
                }
                object.items.insert(name.to_string(), value);
                Ok(())
            }
            Value::Undefined | Value::Null => Err(ExecutionError::runtime(format!(
                "Cannot set properties of {} (setting '{}')",
                target.to_display(),
                name
            ))),
            other => Err(ExecutionError::runtime(format!(
                "Cannot create property '{}' on {}",
                name,
                other.type_of()
            ))),
        }
    }

    fn eval_args(&mut self, args: &[Expr], env: &Rc<Environment>) -> ExecutionResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, env)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr], env: &Rc<Environment>) -> ExecutionResult<Value> {
        if let Expr::Member { object, property } = callee {
            let receiver = self.eval(object, env)?;
            let args = self.eval_args(args, env)?;
            if matches!(receiver, Value::String(_) | Value::Array(_) | Value::Number(_)) {
                return self.call_method(&receiver, property, args);
            }
            let function = self.get_property(&receiver, property)?;
            return self.call_value(function, args, property);
        }

        let function = self.eval(callee, env)?;
        let args = self.eval_args(args, env)?;
        let name = match callee {
            Expr::Identifier(name) => name.as_str(),
            _ => "expression",
        };
        self.call_value(function, args, name)
    }

    fn call_value(&mut self, function: Value, args: Vec<Value>, name: &str) -> ExecutionResult<Value> {
        match function {
            Value::Function(function) => self.call_function(&function, args),
            _ => Err(ExecutionError::runtime(format!("{} is not a function", name))),
        }
    }

    pub(super) fn call_function(&mut self, function: &Function, args: Vec<Value>) -> ExecutionResult<Value> {
        self.charge(GasCost::FUNCTION_CALL)?;
        match function {
            Function::Builtin(builtin) => self.call_builtin(*builtin, args),
            Function::User { decl, closure } => {
                if self.call_depth >= self.limits.max_call_depth {
                    return Err(ExecutionError::runtime("Maximum call stack size exceeded"));
                }
                let scope = self.child_scope(closure);
                let mut args = args.into_iter();
                for param in &decl.params {
                    scope
                        .declare(param, Some(args.next().unwrap_or(Value::Undefined)), DeclKind::Let)
                        .map_err(ExecutionError::runtime)?;
                }

                self.call_depth += 1;
                let flow = self.exec_block(&decl.body, &scope);
                self.call_depth -= 1;

                match flow? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Closures and the scopes holding them form reference cycles.
        for scope in self.closures.drain(..) {
            if let Some(scope) = scope.upgrade() {
                scope.clear();
            }
        }
        self.globals.clear();
    }
}

/// Non-negative integral index, if `key` is one.
pub(super) fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < usize::MAX as f64 => {
            Some(*n as usize)
        }
        _ => None,
    }
}

pub(super) fn read_only(name: &str) -> ExecutionError {
    ExecutionError::runtime(format!("Cannot assign to read only property '{}'", name))
}

fn thrown_message(value: &Value) -> String {
    if let Value::Object(object) = value {
        if let Some(Value::String(message)) = object.borrow().items.get("message") {
            return message.to_string();
        }
    }
    value.to_display()
}
