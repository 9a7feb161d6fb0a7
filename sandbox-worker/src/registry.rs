//! The table of functions a worker can invoke, addressed by [`FunctionId`].
//!
//! A handler takes already-decoded argument bytes and returns a future
//! resolving to either postcard-encoded result bytes or a [`RemoteError`].
//! Futures (rather than plain sync closures) let a handler such as a
//! [`crate::channels`] `take` suspend the call-handling task without
//! blocking the executor. The embedding application populates this table
//! before [`crate::dispatch::run`] starts — there is no way to register a
//! function after the dispatch loop is reading frames.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use sandbox_protocol::{FunctionId, RemoteError};

pub type HandlerFuture = BoxFuture<'static, Result<Vec<u8>, RemoteError>>;
pub type Handler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<FunctionId, Handler>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.functions
            .insert(FunctionId::for_name(name), Arc::new(handler));
    }

    /// Register a synchronous handler, for the common case where it never
    /// needs to suspend.
    pub fn register_sync<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Result<Vec<u8>, RemoteError> + Send + Sync + 'static,
    {
        self.register(name, move |args| {
            let result = handler(args);
            Box::pin(async move { result }) as HandlerFuture
        });
    }

    pub fn get(&self, id: FunctionId) -> Option<Handler> {
        self.functions.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_resolves_by_name() {
        let mut table = FunctionTable::new();
        table.register_sync("demo.add", |args: Vec<u8>| {
            let (a, b): (i32, i32) = postcard::from_bytes(&args).unwrap();
            Ok(postcard::to_stdvec(&(a + b)).unwrap())
        });

        let id = FunctionId::for_name("demo.add");
        let handler = table.get(id).expect("registered");
        let args = postcard::to_stdvec(&(2i32, 3i32)).unwrap();
        let result = handler(args).await.unwrap();
        let sum: i32 = postcard::from_bytes(&result).unwrap();
        assert_eq!(sum, 5);
    }

    #[test]
    fn unregistered_id_resolves_to_none() {
        let table = FunctionTable::new();
        assert!(table.get(FunctionId::for_name("nope")).is_none());
    }
}
