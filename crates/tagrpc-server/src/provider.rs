use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tagrpc_common::{coerce, RemoteError, RpcError, Value, ValueType};

/// Outcome of a provider method.
pub type MethodResult = std::result::Result<Value, RemoteError>;

/// Provider method body. Receives arguments already coerced to the declared
/// parameter types.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> MethodResult + Send + Sync>;

/// One method exposed by a provider.
pub struct Method {
    name: String,
    params: Vec<ValueType>,
    on_disconnect: bool,
    handler: Handler,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Whether calls are queued until the caller's connection closes
    /// instead of running immediately.
    pub fn is_disconnect_hook(&self) -> bool {
        self.on_disconnect
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("on_disconnect", &self.on_disconnect)
            .finish_non_exhaustive()
    }
}

/// A call resolved against a [`MethodTable`], with coerced arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub index: usize,
    pub args: Vec<Value>,
}

impl Resolved {
    /// Whether both target the same method with bit-identical arguments.
    pub fn same_call(&self, other: &Resolved) -> bool {
        self.index == other.index
            && self.args.len() == other.args.len()
            && self.args.iter().zip(&other.args).all(|(a, b)| a.identical(b))
    }
}

/// The methods a server exposes.
///
/// Calls resolve by name and argument count, first match in registration
/// order. Argument types take no part in resolution; each argument is
/// coerced to the declared parameter type afterwards.
///
/// # Example
///
/// ```
/// use tagrpc_common::{Value, ValueType};
/// use tagrpc_server::MethodTable;
///
/// let table = MethodTable::new("Calculator").method(
///     "add",
///     &[ValueType::Int, ValueType::Int],
///     |args| {
///         let a = args[0].as_i64().unwrap_or_default();
///         let b = args[1].as_i64().unwrap_or_default();
///         Ok(Value::Int((a + b) as i32))
///     },
/// );
///
/// let resolved = table.resolve("add", vec![Value::Int(2), Value::from("3")]).unwrap();
/// assert_eq!(table.invoke(&resolved), Ok(Value::Int(5)));
/// ```
#[derive(Debug)]
pub struct MethodTable {
    name: String,
    methods: Vec<Method>,
}

impl MethodTable {
    /// Creates an empty table. `name` prefixes the stack frames of relayed
    /// errors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a method.
    pub fn method<F>(self, name: impl Into<String>, params: &[ValueType], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        self.add(name.into(), params, false, Arc::new(handler))
    }

    /// Adds a method that runs when the calling connection closes.
    ///
    /// A call to it replies `null` at once. Each distinct (method,
    /// arguments) pair queued on a connection runs once, in the order first
    /// seen.
    pub fn disconnect_hook<F>(self, name: impl Into<String>, params: &[ValueType], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        self.add(name.into(), params, true, Arc::new(handler))
    }

    fn add(mut self, name: String, params: &[ValueType], on_disconnect: bool, handler: Handler) -> Self {
        self.methods.push(Method {
            name,
            params: params.to_vec(),
            on_disconnect,
            handler,
        });
        self
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn get(&self, index: usize) -> Option<&Method> {
        self.methods.get(index)
    }

    /// Finds the method for a call and coerces its arguments.
    ///
    /// # Errors
    ///
    /// - `MethodNotFound` when no method has this name and arity
    /// - `Coercion` when an argument does not convert
    pub fn resolve(&self, name: &str, args: Vec<Value>) -> Result<Resolved, RpcError> {
        let index = self
            .methods
            .iter()
            .position(|m| m.name == name && m.arity() == args.len())
            .ok_or_else(|| RpcError::MethodNotFound(format!("{name}/{}", args.len())))?;
        let args = args
            .into_iter()
            .zip(&self.methods[index].params)
            .map(|(arg, &target)| coerce(arg, target))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Resolved { index, args })
    }

    /// Runs a resolved call. Failures, panics included, come back as a
    /// [`RemoteError`] with a frame naming the method.
    pub fn invoke(&self, call: &Resolved) -> MethodResult {
        let Some(method) = self.methods.get(call.index) else {
            return Err(RemoteError::new(
                RemoteError::METHOD_NOT_FOUND,
                format!("#{}", call.index),
            ));
        };
        let args = call.args.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| (method.handler)(args)))
            .unwrap_or_else(|payload| Err(RemoteError::new(RemoteError::PANIC, panic_message(&*payload))));
        outcome.map_err(|e| e.with_frame(format!("{}.{}", self.name, method.name)))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "provider panicked".to_string()
    }
}
