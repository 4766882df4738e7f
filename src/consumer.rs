use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::binding::Callback;
use crate::error::DeliveryError;
use crate::message::TestMessage;

/// Box an async function into a [`Callback`]
pub fn handler<F, Fut>(f: F) -> Callback
where
    F: Fn(TestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    Arc::new(move |message: TestMessage| f(message).boxed())
}

/// Default consumer: logs `Received: {message}` for every delivery
pub fn log_received() -> Callback {
    handler(|message: TestMessage| async move {
        info!("Received: {}", message.message());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_log_received_always_succeeds() {
        let callback = log_received();
        assert!(callback(TestMessage::new("hello")).await.is_ok());
        assert!(callback(TestMessage::new("")).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_invokes_wrapped_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback = handler(move |_message: TestMessage| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DeliveryError::Handler("nope".to_string()))
            }
        });

        let result = callback(TestMessage::new("x")).await;
        assert!(matches!(result, Err(DeliveryError::Handler(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
