use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::errors::SqsWorkerError;
use crate::transport::Message;

/// Business logic run for every received message.
///
/// Returning `Ok(())` deletes the message from the source queue; returning an
/// error routes its body to the dead-letter queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message. The consumer passes its own copy.
    async fn handle(&self, message: Message) -> Result<(), SqsWorkerError>;
}

/// Adapts an async function plus shared resources into a [`MessageHandler`].
///
/// # Type Parameters
///
/// * `RFn` - The message handler function type
/// * `Fut` - The future returned by the handler function
/// * `TShared` - Resources cloned into every handler call
pub struct MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SqsWorkerError>> + Send,
    TShared: Clone + Send + Sync,
{
    rv_fn: RFn,
    shared_resources: TShared,
    _future: PhantomData<fn() -> Fut>,
}

impl<RFn, Fut, TShared> MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SqsWorkerError>> + Send,
    TShared: Clone + Send + Sync,
{
    /// # Arguments
    ///
    /// * `rv_fn` - The message handler function
    /// * `shared_resources` - Resources shared between message processing calls
    pub fn new(rv_fn: RFn, shared_resources: TShared) -> Self {
        MessageHandlerFn {
            rv_fn,
            shared_resources,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<RFn, Fut, TShared> MessageHandler for MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SqsWorkerError>> + Send,
    TShared: Clone + Send + Sync,
{
    async fn handle(&self, message: Message) -> Result<(), SqsWorkerError> {
        (self.rv_fn)(message, self.shared_resources.clone()).await
    }
}

/// Wraps a closure taking only the message.
///
/// ```rust
/// use rs_sqs_worker::consumer::handler_fn;
/// use rs_sqs_worker::errors::GenericError;
///
/// let handler = handler_fn(|message| async move {
///     if message.body.is_empty() {
///         return Err(GenericError::from("empty body").into());
///     }
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(
    f: F,
) -> MessageHandlerFn<impl Fn(Message, ()) -> Fut + Send + Sync, Fut, ()>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SqsWorkerError>> + Send,
{
    MessageHandlerFn::new(move |message, ()| f(message), ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GenericError;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(body: &str) -> Message {
        Message {
            id: "id".into(),
            receipt_handle: "rh".into(),
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn shared_resources_reach_every_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = MessageHandlerFn::new(
            |_message: Message, shared: Arc<AtomicUsize>| async move {
                shared.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            counter.clone(),
        );

        handler.handle(message("a")).await.unwrap();
        handler.handle(message("b")).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_fn_propagates_errors() {
        let handler = handler_fn(|message: Message| async move {
            if message.body == "bad" {
                Err(GenericError::from("rejected").into())
            } else {
                Ok(())
            }
        });

        assert!(handler.handle(message("good")).await.is_ok());
        let err = handler.handle(message("bad")).await.unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
