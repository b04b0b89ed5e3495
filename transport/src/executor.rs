use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A single serialized execution context: jobs run one at a time, in submission order, each to
///  completion before the next one starts.
///
/// NB: A job must never wait for the result of another job submitted to the same executor, that
///  would deadlock.
#[derive(Clone)]
pub struct SerialExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Starts the executor's task. It terminates when all handles are dropped.
    pub fn start() -> SerialExecutor {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                // a panicking job must not take down the executor
                if let Err(e) = tokio::spawn(job).await {
                    error!("job on serial executor failed: {}", e);
                }
            }
            trace!("serial executor terminated");
        });

        SerialExecutor { sender }
    }

    pub fn execute(&self, job: impl Future<Output = ()> + Send + 'static) {
        if self.sender.send(Box::pin(job)).is_err() {
            debug!("serial executor is terminated - dropping job");
        }
    }

    /// Completes when all jobs submitted before this call have run
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.execute(async move {
            let _ = sender.send(());
        });
        let _ = receiver.await;
    }
}
