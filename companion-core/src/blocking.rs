//! Bridge from the blocking worker pool back onto the async HTTP client.

use std::future::Future;

use crate::error::{Stage, StageError};

/// Drive `fut` to completion from a blocking worker thread.
///
/// Must be called from `tokio::task::spawn_blocking` (or any thread that
/// carries a runtime handle but is not itself running a task).
pub(crate) fn run_on_runtime<F, T>(stage: Stage, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| StageError::failed(stage, "no async runtime available"))?;
    handle.block_on(fut)
}
