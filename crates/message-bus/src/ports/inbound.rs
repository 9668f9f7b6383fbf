//! # Driving Ports (Inbound API)
//!
//! Callbacks the application registers with a subscriber.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;

use crate::codec::SerializerRegistry;
use crate::domain::{HandlerError, Message};

/// Handler for one action.
///
/// A `Value::Null` result is "void": no reply is sent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        serializers: &SerializerRegistry,
    ) -> Result<Value, HandlerError>;
}

/// Adapts a typed async closure to [`MessageHandler`].
///
/// The body is decoded into `T`; the returned `R` becomes the reply body.
/// Returning `()` or `None` sends no reply.
pub struct FnHandler<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R, F> FnHandler<T, R, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, R, F, Fut> MessageHandler for FnHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: &Message,
        serializers: &SerializerRegistry,
    ) -> Result<Value, HandlerError> {
        let input: T = serializers.from_body(message)?;
        let output = (self.f)(input).await?;
        serde_json::to_value(output)
            .map_err(|e| HandlerError::Failed(format!("could not serialize reply: {e}")))
    }
}
