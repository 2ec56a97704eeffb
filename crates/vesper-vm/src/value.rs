//! Runtime values.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use vesper_bytecode::Code;
use vesper_error::ErrorKind;

use crate::error::VmError;

/// String-keyed map with sorted-key iteration order.
pub type MapValue = BTreeMap<Rc<str>, Value>;

/// A Vesper runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<MapValue>>),
    Error(Rc<ErrorValue>),
    Closure(Rc<Closure>),
    Partial(Rc<Partial>),
    Cell(Rc<RefCell<Value>>),
    Builtin(Rc<Builtin>),
    Host(Rc<dyn HostObject>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: MapValue) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn string(text: impl Into<Rc<str>>) -> Value {
        Value::String(text.into())
    }

    pub fn error(message: impl Into<Rc<str>>) -> Value {
        Value::Error(Rc::new(ErrorValue {
            kind: ErrorKind::Runtime,
            message: message.into(),
            context: None,
        }))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Error(_) => "error",
            Value::Closure(_) => "function",
            Value::Partial(_) => "partial",
            Value::Cell(_) => "cell",
            Value::Builtin(_) => "builtin",
            Value::Host(host) => host.type_name(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Map(map) => !map.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|bv| v.equals(bv)).unwrap_or(false))
            }
            (Value::Error(a), Value::Error(b)) => a.message == b.message,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Partial(a), Value::Partial(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// The inspection form: like `Display`, except strings are quoted.
    /// Used by string templates and `throw` coercion for non-strings.
    pub fn inspect(&self) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s),
            Value::Error(e) => format!("error(\"{}\")", e.message),
            other => format!("{}", other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                let items = items.borrow();
                let parts: Vec<String> = items.iter().map(Value::inspect).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Map(map) => {
                let map = map.borrow();
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", k, v.inspect()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Error(e) => write!(f, "{}", e.message),
            Value::Closure(c) => {
                if c.code.name.is_empty() {
                    write!(f, "<function>")
                } else {
                    write!(f, "<function {}>", c.code.name)
                }
            }
            Value::Partial(p) => write!(f, "<partial {}>", p.callable),
            Value::Cell(c) => write!(f, "<cell {}>", c.borrow()),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Value::Host(host) => write!(f, "{}", host.inspect()),
        }
    }
}

/// A first-class error value.
#[derive(Debug)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: Rc<str>,
    pub context: Option<Value>,
}

/// A function with its captured cells.
#[derive(Debug)]
pub struct Closure {
    pub code: Rc<Code>,
    pub captures: Vec<Rc<RefCell<Value>>>,
}

impl Closure {
    pub fn new(code: Rc<Code>, captures: Vec<Rc<RefCell<Value>>>) -> Self {
        Self { code, captures }
    }
}

/// A callable with a pre-bound prefix of positional arguments.
#[derive(Debug)]
pub struct Partial {
    pub callable: Value,
    pub bound: Vec<Value>,
}

/// Host-provided objects exposed to scripts as opaque proxies.
pub trait HostObject: fmt::Debug {
    fn type_name(&self) -> &str;

    fn get_attr(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }

    fn inspect(&self) -> String {
        format!("<{}>", self.type_name())
    }
}

/// Context handed to builtin functions; lets them call back into the VM.
pub trait HostContext {
    fn call_value(&mut self, func: &Value, args: &[Value]) -> Result<Value, VmError>;
}

/// Plain-function builtin.
pub type BuiltinFn = fn(&mut dyn HostContext, &[Value]) -> Result<Value, VmError>;

/// Capturing builtin (bound methods).
pub type BuiltinClosureFn = Box<dyn Fn(&mut dyn HostContext, &[Value]) -> Result<Value, VmError>>;

enum BuiltinImpl {
    Fn(BuiltinFn),
    Closure(BuiltinClosureFn),
}

/// A named host function callable from scripts.
pub struct Builtin {
    pub name: String,
    imp: BuiltinImpl,
}

impl Builtin {
    pub fn new(name: impl Into<String>, func: BuiltinFn) -> Self {
        Self {
            name: name.into(),
            imp: BuiltinImpl::Fn(func),
        }
    }

    pub fn bound(
        name: impl Into<String>,
        func: impl Fn(&mut dyn HostContext, &[Value]) -> Result<Value, VmError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            imp: BuiltinImpl::Closure(Box::new(func)),
        }
    }

    pub fn call(&self, ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, VmError> {
        match &self.imp {
            BuiltinImpl::Fn(func) => func(ctx, args),
            BuiltinImpl::Closure(func) => func(ctx, args),
        }
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

/// Host-to-VM value conversion table, keyed by Rust type.
#[derive(Default)]
pub struct TypeRegistry {
    converters: AHashMap<TypeId, Box<dyn Fn(&dyn Any) -> Option<Value>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any>(&mut self, convert: impl Fn(&T) -> Value + 'static) {
        self.converters.insert(
            TypeId::of::<T>(),
            Box::new(move |any| any.downcast_ref::<T>().map(&convert)),
        );
    }

    pub fn convert(&self, value: &dyn Any) -> Option<Value> {
        self.converters
            .get(&value.type_id())
            .and_then(|f| f(value))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRegistry({} converters)", self.converters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
    }

    #[test]
    fn test_numeric_equality_promotes() {
        assert!(Value::Int(2).equals(&Value::Float(2.0)));
        assert!(!Value::Int(2).equals(&Value::Float(2.5)));
    }

    #[test]
    fn test_list_equality_is_deep() {
        let a = Value::list(vec![Value::Int(1), Value::string("x")]);
        let b = Value::list(vec![Value::Int(1), Value::string("x")]);
        assert!(a.equals(&b));
    }

    #[test]
    fn test_map_iteration_is_sorted() {
        let mut entries = MapValue::new();
        entries.insert("zebra".into(), Value::Int(1));
        entries.insert("apple".into(), Value::Int(2));
        entries.insert("mango".into(), Value::Int(3));
        let keys: Vec<Rc<str>> = entries.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![Rc::from("apple"), Rc::from("mango"), Rc::from("zebra")]
        );
    }

    #[test]
    fn test_display_and_inspect() {
        assert_eq!(Value::string("hi").to_string(), "hi");
        assert_eq!(Value::string("hi").inspect(), "\"hi\"");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::string("a")]).to_string(),
            "[1, \"a\"]"
        );
        assert_eq!(Value::error("boom").to_string(), "boom");
    }

    #[test]
    fn test_type_registry() {
        struct Point {
            x: i64,
            y: i64,
        }
        let mut registry = TypeRegistry::new();
        registry.register(|p: &Point| Value::list(vec![Value::Int(p.x), Value::Int(p.y)]));

        let point = Point { x: 1, y: 2 };
        let converted = registry.convert(&point).unwrap();
        assert!(converted.equals(&Value::list(vec![Value::Int(1), Value::Int(2)])));
        assert!(registry.convert(&"unregistered").is_none());
    }
}
