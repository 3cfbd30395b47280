use std::{future::Future, time::Duration};

pub(crate) type Interval = tokio::time::Interval;

pub(crate) fn new_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

pub(crate) fn spawn_task<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut);
}

pub(crate) async fn tick(interval: &mut Interval) {
    interval.tick().await;
}

/// Run `fut`, failing with `on_timeout` if it does not finish within `limit`.
#[cfg_attr(not(feature = "redis-tokio"), allow(dead_code))]
pub(crate) async fn with_timeout<F, T, E>(
    limit: Option<Duration>,
    fut: F,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match limit {
        None => fut.await,
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        },
    }
}
