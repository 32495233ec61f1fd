//! Handler seam invoked by the dispatcher

use crate::dispatch::HandlerArgs;
use crate::error::DispatchError;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Receives decoded messages for one subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, args: HandlerArgs) -> Result<(), DispatchError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(HandlerArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn handle(&self, args: HandlerArgs) -> Result<(), DispatchError> {
        (self.f)(args).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```rust
/// use topic_dispatch::registry::handler_fn;
/// use topic_dispatch::{DispatchError, HandlerArgs};
///
/// let handler = handler_fn(|args: HandlerArgs| async move {
///     tracing::info!(topic = ?args.topic(), "status update");
///     Ok::<(), DispatchError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}
