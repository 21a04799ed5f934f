//! Engine services.
//!
//! The split mirrors the data flow: [`resolver`] settles conversation
//! identity, [`outbound`] drains the durable mutation queue toward the
//! remote store, [`reconciler`] folds remote snapshots and live events into
//! the replica, and [`listener`] owns the lifecycle of the subscription
//! tasks.

use std::future::Future;
use std::time::Duration;

use beacon_remote::RemoteError;

pub mod listener;
pub mod outbound;
pub mod reconciler;
pub mod resolver;

/// Bound a remote-store call so one stuck request cannot stall a service
/// loop. Elapsing counts as a transient [`RemoteError::Timeout`].
pub(crate) async fn remote_call<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}
