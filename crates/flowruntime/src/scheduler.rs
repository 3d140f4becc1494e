use flowcore::{Node, NodeError, NodeId, NodeOutput};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A queued node: everything a worker needs without touching the graph.
pub(crate) struct Job {
    pub node_id: NodeId,
    pub body: Arc<dyn Node>,
    pub token: CancellationToken,
}

/// Bounded pool of workers on the runtime the manager was created on.
///
/// At most `max_parallel` node bodies run at the same time; queued jobs
/// wait for a permit in submission order.
pub(crate) struct Scheduler {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_parallel: usize,
}

impl Scheduler {
    /// Must be called from within a Tokio runtime.
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            handle: Handle::current(),
            permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Wait for a worker slot, or `None` if `token` fires first.
    pub async fn acquire(&self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = token.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Run a node body on its own task so a cancelled or stuck body can be
    /// abandoned. Panics surface as execution failures.
    pub async fn run_body(
        &self,
        body: Arc<dyn Node>,
        ctx: flowcore::NodeContext,
        token: &CancellationToken,
    ) -> Result<NodeOutput, NodeError> {
        let mut task = self.handle.spawn(async move { body.execute(ctx).await });
        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    Err(NodeError::ExecutionFailed("node body panicked".to_string()))
                }
                Err(_) => Err(NodeError::Cancelled),
            },
            _ = token.cancelled() => {
                task.abort();
                Err(NodeError::Cancelled)
            }
        }
    }
}
