use futures::{future::poll_fn, Future};
use std::{
    collections::HashSet,
    task::{ready, Context, Poll},
};
use tokio::task::{JoinError, JoinSet};

/// A collection of keyed tasks spawned on a Tokio runtime.
///
/// Each task returns a `(key, value)` tuple so the key can be recovered on completion. At most
/// one task per key can be in flight: spawning a second task for a key that is still running is
/// rejected, which is what keeps an observation point from being armed twice in the same round.
#[derive(Debug)]
pub struct JoinMap<K, V> {
    keys: HashSet<K>,
    joinset: JoinSet<(K, V)>,
}

impl<K, V> Default for JoinMap<K, V> {
    fn default() -> Self {
        Self { keys: HashSet::new(), joinset: JoinSet::new() }
    }
}

impl<K, V> JoinMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks currently in the map.
    pub fn len(&self) -> usize {
        self.joinset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joinset.is_empty()
    }

    /// Keys of the tasks that have not completed successfully yet. A task that panicked or was
    /// cancelled keeps its key.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }
}

impl<K, V> JoinMap<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: 'static,
{
    /// Spawns `future` ONLY IF there is no task in flight for `key`. Returns whether the task was
    /// spawned.
    pub fn spawn<F>(&mut self, key: K, future: F) -> bool
    where
        F: Future<Output = (K, V)> + Send + 'static,
        V: Send,
    {
        if !self.keys.insert(key) {
            return false;
        }

        self.joinset.spawn(future);
        true
    }

    /// Aborts every task still in flight. Their keys are forgotten.
    pub fn abort_all(&mut self) {
        self.joinset.abort_all();
        self.keys.clear();
    }

    /// Returns `true` if the map contains a task for the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    /// Waits until one of the tasks completes and returns its output, `None` if the map is empty.
    ///
    /// # Cancel Safety
    ///
    /// This method is cancel safe: if it loses a `tokio::select!` race no task is removed.
    pub async fn join_next(&mut self) -> Option<Result<(K, V), JoinError>> {
        poll_fn(|cx| self.poll_join_next(cx)).await
    }

    /// Polls for one of the tasks to complete, removing its key on success.
    pub fn poll_join_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(K, V), JoinError>>> {
        match ready!(self.joinset.poll_join_next(cx)) {
            Some(Ok((key, value))) => {
                self.keys.remove(&key);
                Poll::Ready(Some(Ok((key, value))))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}
