use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::error::RefreshError;
use crate::types::Session;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, RefreshError>>>;

/// Keeps at most one token refresh in flight.
///
/// Callers that arrive while a refresh is pending await the same future and
/// receive a clone of its outcome. Once it has completed, the next caller
/// starts a fresh one.
#[derive(Default)]
pub(crate) struct RefreshCoordinator {
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl RefreshCoordinator {
    pub(crate) async fn run<F>(&self, start: F) -> Result<Session, RefreshError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Session, RefreshError>>,
    {
        let refresh = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(pending) if pending.peek().is_none() => {
                    tracing::debug!("joining in-flight token refresh");
                    pending.clone()
                }
                _ => {
                    let refresh = start().shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }
}
