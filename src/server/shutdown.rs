use tokio::sync::oneshot;

/// Pair that stops the gRPC server. The server stops on `stop()` or when the handle is dropped,
/// whichever comes first.
pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { tx: Some(tx) }, RpcServerShutdownSignal { rx })
}

pub(crate) struct RpcServerShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl RpcServerShutdownHandle {
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl RpcServerShutdownSignal {
    /// Resolves once the handle asked to stop or went away.
    pub(crate) async fn wait(self) {
        let _ = self.rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_releases_the_signal() {
        let (mut handle, signal) = shutdown_signal();
        let waiter = tokio::spawn(signal.wait());

        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_signal() {
        let (handle, signal) = shutdown_signal();
        let waiter = tokio::spawn(signal.wait());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    }
}
