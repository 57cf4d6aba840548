//! Method table for dispatching calls by member name.
//!
//! A table is what the framework consults when a call arrives, and what the
//! piper's worker consults after the call was forwarded. Redirecting a table
//! keeps the original handlers for the worker and swaps every entry the
//! framework sees for the forwarding stub.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CallContext, Deferral};
use crate::capability::MethodLookup;
use crate::protocol::{CallMessage, Message, MethodError, ReturnMessage};

/// What a handler did with a call.
#[derive(Debug)]
pub enum Outcome {
    /// Answer right away.
    Complete(Message),
    /// The answer will come later, through the deferral's tag.
    Defer(Deferral),
}

/// Result type for handler functions.
pub type MethodResult = Result<Outcome, MethodError>;

/// Trait for method handlers.
pub trait Method: Send + Sync + 'static {
    /// Handle one call.
    fn call(&self, call: &CallMessage, ctx: &CallContext) -> MethodResult;
}

impl<F> Method for F
where
    F: Fn(&CallMessage, &CallContext) -> MethodResult + Send + Sync + 'static,
{
    fn call(&self, call: &CallMessage, ctx: &CallContext) -> MethodResult {
        self(call, ctx)
    }
}

/// Wrapper that decodes arguments and encodes the return value.
pub struct TypedMethod<F, T, R>
where
    F: Fn(T, &CallContext) -> Result<R, MethodError> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> R>,
}

impl<F, T, R> TypedMethod<F, T, R>
where
    F: Fn(T, &CallContext) -> Result<R, MethodError> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    /// Create a new typed method.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R> Method for TypedMethod<F, T, R>
where
    F: Fn(T, &CallContext) -> Result<R, MethodError> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn call(&self, call: &CallMessage, ctx: &CallContext) -> MethodResult {
        let args: T = call
            .args()
            .map_err(|e| MethodError::invalid_args(e.to_string()))?;

        let value = (self.handler)(args, ctx)?;
        let ret = ReturnMessage::with_value(call, &value)
            .map_err(|e| MethodError::failed(e.to_string()))?;
        Ok(Outcome::Complete(ret.into()))
    }
}

/// Table mapping member names to handlers.
///
/// Cloning is cheap: handlers are shared.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Arc<dyn Method>>,
}

impl MethodTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler.
    ///
    /// Arguments are decoded from the call body, the returned value becomes
    /// the reply body. Decode failures answer with `InvalidArgs`.
    pub fn register<F, T, R>(&mut self, name: &str, handler: F)
    where
        F: Fn(T, &CallContext) -> Result<R, MethodError> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        self.insert(name, Arc::new(TypedMethod::new(handler)));
    }

    /// Register a handler that sees the raw call and may defer.
    pub fn register_raw<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&CallMessage, &CallContext) -> MethodResult + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(handler));
    }

    /// Insert a handler, replacing any previous one under the same name.
    pub fn insert(&mut self, name: &str, method: Arc<dyn Method>) -> Option<Arc<dyn Method>> {
        self.methods.insert(name.to_string(), method)
    }

    /// Get a handler by member name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    /// Registered member names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl MethodLookup for MethodTable {
    fn lookup(&self, member: &str) -> Option<Arc<dyn Method>> {
        self.get(member)
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error_names;

    fn call(table: &MethodTable, msg: &CallMessage) -> MethodResult {
        let ctx = CallContext::detached(msg);
        table.get(msg.member()).expect("registered").call(msg, &ctx)
    }

    fn completed(result: MethodResult) -> Message {
        match result {
            Ok(Outcome::Complete(msg)) => msg,
            Ok(Outcome::Defer(d)) => panic!("unexpected deferral {:?}", d.id()),
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_register_typed() {
        let mut table = MethodTable::new();
        table.register("Hello", |(name,): (String,), _ctx| Ok(format!("Hello {}!", name)));

        let msg = CallMessage::with_args("Hello", &("world",))
            .unwrap()
            .with_serial(4);
        let reply = completed(call(&table, &msg));

        assert_eq!(reply.reply_serial(), Some(4));
        assert_eq!(reply.into_result::<String>().unwrap(), "Hello world!");
    }

    #[test]
    fn test_typed_bad_args() {
        let mut table = MethodTable::new();
        table.register("Sum", |(ints,): (Vec<i32>,), _ctx| Ok(ints.iter().sum::<i32>()));

        let msg = CallMessage::with_args("Sum", &("not a list",)).unwrap();
        let err = call(&table, &msg).unwrap_err();
        assert_eq!(err.name, error_names::INVALID_ARGS);
    }

    #[test]
    fn test_typed_application_error() {
        let mut table = MethodTable::new();
        table.register("Cat", |(_path,): (String,), _ctx| -> Result<Vec<u8>, MethodError> {
            Err(MethodError::new("org.example.NotFound", "file not found"))
        });

        let msg = CallMessage::with_args("Cat", &("/missing",)).unwrap();
        let err = call(&table, &msg).unwrap_err();
        assert_eq!(err, MethodError::new("org.example.NotFound", "file not found"));
    }

    #[test]
    fn test_register_raw() {
        let mut table = MethodTable::new();
        table.register_raw("Ping", |call, _ctx| {
            Ok(Outcome::Complete(
                ReturnMessage::new(call, call.body().clone()).into(),
            ))
        });

        let msg = CallMessage::with_args("Ping", &42u8).unwrap();
        assert_eq!(completed(call(&table, &msg)).into_result::<u8>(), Ok(42));
    }

    #[test]
    fn test_insert_replaces() {
        let mut table = MethodTable::new();
        table.register("A", |(): (), _ctx| Ok(1u8));
        let previous = table.insert("A", Arc::new(TypedMethod::new(|(): (), _ctx: &CallContext| Ok(2u8))));
        assert!(previous.is_some());
        assert_eq!(table.len(), 1);

        let msg = CallMessage::with_args("A", &()).unwrap();
        assert_eq!(completed(call(&table, &msg)).into_result::<u8>(), Ok(2));
    }

    #[test]
    fn test_lookup_unknown() {
        let table = MethodTable::new();
        assert!(table.lookup("Missing").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_debug_lists_names() {
        let mut table = MethodTable::new();
        table.register("B", |(): (), _ctx| Ok(()));
        table.register("A", |(): (), _ctx| Ok(()));
        assert_eq!(format!("{:?}", table), r#"MethodTable { methods: ["A", "B"] }"#);
    }
}
