use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;
use tracing::warn;

/// Runs the shutdown futures concurrently and waits for all of them, but no longer than
///  `timeout`. Futures that did not complete by then keep running in the background, but are
///  not waited for. Returns the number of futures that completed in time.
pub async fn await_all_or_timeout<F>(futures: Vec<F>, timeout: Duration) -> usize
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for f in futures {
        tasks.spawn(f);
    }
    let total = tasks.len();

    let mut completed = 0;
    let all_completed = time::timeout(timeout, async {
        while tasks.join_next().await.is_some() {
            completed += 1;
        }
    }).await.is_ok();

    if !all_completed {
        warn!("{} of {} shutdown tasks did not complete within {:?}", total - completed, total, timeout);
        tasks.detach_all();
    }
    completed
}
