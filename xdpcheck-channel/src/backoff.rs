use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, Stream};
use tokio::time::sleep;

use crate::ChannelOptions;

/// A stream that yields exponentially increasing, capped, backoff durations.
#[derive(Debug)]
pub struct ExponentialBackoff {
    /// Current number of retries.
    retry_count: usize,
    /// Maximum number of retries before closing the stream.
    /// If `None`, the stream will retry indefinitely.
    max_retries: Option<usize>,
    /// The current backoff duration.
    backoff: Duration,
    max_backoff: Duration,
    /// `Sleep` is not `Unpin`, so it is boxed.
    timeout: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_backoff: Duration, max_retries: Option<usize>) -> Self {
        Self { retry_count: 0, max_retries, backoff: initial, max_backoff, timeout: None }
    }

    #[inline]
    pub fn retry_count(&self) -> usize {
        self.retry_count
    }
}

impl From<&ChannelOptions> for ExponentialBackoff {
    fn from(options: &ChannelOptions) -> Self {
        Self::new(options.backoff_duration, options.max_backoff, None)
    }
}

impl Stream for ExponentialBackoff {
    type Item = Duration;

    /// Yields the next backoff duration once the current one has elapsed.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(max_retries) = this.max_retries {
            if this.retry_count >= max_retries {
                return Poll::Ready(None);
            }
        }

        let backoff = this.backoff;
        let timeout = this.timeout.get_or_insert_with(|| Box::pin(sleep(backoff)));

        if timeout.poll_unpin(cx).is_pending() {
            return Poll::Pending;
        }

        let elapsed = this.backoff;
        this.backoff = (this.backoff * 2).min(this.max_backoff);
        this.retry_count += 1;
        this.timeout = None;

        Poll::Ready(Some(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn durations_double_up_to_the_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(35), Some(4));

        let durations = (&mut backoff).collect::<Vec<_>>().await;
        assert_eq!(durations, [10, 20, 35, 35].map(Duration::from_millis).to_vec());
        assert_eq!(backoff.retry_count(), 4);
    }
}
