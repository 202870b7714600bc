//! Single-assignment result cells for client operations

use std::time::Duration;

use tokio::sync::watch;

use super::ClientError;

type Slot<T> = Option<Result<T, ClientError>>;

/// Pending result of a client operation
///
/// Clones observe the same result, so several tasks can wait on one
/// operation.
pub struct MqttFuture<T> {
    rx: watch::Receiver<Slot<T>>,
}

/// Write side of an [`MqttFuture`]
///
/// Consumed by [`resolve`](Self::resolve), so a result is set at most once.
/// Dropping it unresolved cancels the future.
pub struct Resolver<T> {
    tx: watch::Sender<Slot<T>>,
}

/// Create a connected resolver / future pair
pub fn pair<T>() -> (Resolver<T>, MqttFuture<T>) {
    let (tx, rx) = watch::channel(None);
    (Resolver { tx }, MqttFuture { rx })
}

impl<T> Resolver<T> {
    pub fn resolve(self, result: Result<T, ClientError>) {
        let _ = self.tx.send(Some(result));
    }
}

impl<T: Clone> MqttFuture<T> {
    /// Wait for the result
    pub async fn wait(&self) -> Result<T, ClientError> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(result) => result.clone(),
                None => Err(ClientError::Canceled),
            },
            Err(_) => Err(ClientError::Canceled),
        };
        result
    }

    /// Wait for the result, giving up with [`ClientError::Timeout`]
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, ClientError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// The result, if already resolved
    pub fn result(&self) -> Option<Result<T, ClientError>> {
        self.rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T> Clone for MqttFuture<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_every_waiter() {
        let (resolver, future) = pair::<u8>();
        let other = future.clone();

        let waiter = tokio::spawn(async move { other.wait().await });
        resolver.resolve(Ok(7));

        assert_eq!(future.wait().await, Ok(7));
        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert_eq!(future.result(), Some(Ok(7)));
    }

    #[tokio::test]
    async fn test_dropped_resolver_cancels() {
        let (resolver, future) = pair::<()>();
        drop(resolver);
        assert_eq!(future.wait().await, Err(ClientError::Canceled));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let (_resolver, future) = pair::<()>();
        assert!(!future.is_resolved());
        assert_eq!(
            future.wait_timeout(Duration::from_millis(10)).await,
            Err(ClientError::Timeout)
        );
    }
}
