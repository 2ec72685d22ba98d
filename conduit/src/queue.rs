//! # Shared Queue
//!
//! Multi-producer, multi-consumer FIFO connecting pipeline stages, backed by a
//! flume channel owned by the orchestrating process. Every clone of a
//! [`SharedQueue`] is a handle to the same channel, so any stage (or the
//! orchestrator) holding one may push or pop.
//!
//! Worker instances run in child processes and reach the channel through
//! their instance link: the queues in a
//! [`WorkerContext`](crate::spec::WorkerContext) are remote handles that
//! forward each operation to the parent. The API is the same for both. A
//! queue smuggled into a worker some other way (inside its arguments, say) is
//! only a private copy in the child, so always wire queues as inputs or
//! outputs of the spec.
//!
//! ## Delivery
//! - FIFO across the queue as a whole, regardless of how many producers push
//! - Each item goes to exactly one consumer: whichever claims it first
//! - No ordering guarantee between peer consumers
//!
//! ## Shutdown
//! [`SharedQueue::drain_and_discard`] empties a queue with non-blocking reads.
//! It does not stop a still-running producer from pushing afterwards, so drains
//! must run after exit has been requested and in sink-to-source order.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::QueueError;
use crate::link::{Link, Request, Response, Side, Wait};

/// Anything that can travel between worker processes.
///
/// Implemented for every owned serde type.
pub trait QueueItem: Serialize + DeserializeOwned + Send + 'static {}

impl<T> QueueItem for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Sleep between sweeps when waiting on queues that share no channel.
const MIXED_POLL: Duration = Duration::from_millis(2);

enum Backend<T> {
    Local { sender: Sender<T>, receiver: Receiver<T> },
    Remote(Remote),
}

#[derive(Clone)]
struct Remote {
    link: Arc<Link>,
    side: Side,
    index: usize,
}

/// A named FIFO channel shared between worker instances.
pub struct SharedQueue<T> {
    name: Arc<str>,
    capacity: Option<usize>,
    backend: Backend<T>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        let backend = match &self.backend {
            Backend::Local { sender, receiver } => Backend::Local {
                sender: sender.clone(),
                receiver: receiver.clone(),
            },
            Backend::Remote(remote) => Backend::Remote(remote.clone()),
        };
        Self {
            name: Arc::clone(&self.name),
            capacity: self.capacity,
            backend,
        }
    }
}

impl<T> fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SharedQueue");
        debug.field("name", &self.name).field("capacity", &self.capacity);
        match &self.backend {
            Backend::Local { receiver, .. } => debug.field("len", &receiver.len()),
            Backend::Remote(remote) => debug.field("remote", &(remote.side, remote.index)),
        };
        debug.finish()
    }
}

impl<T> SharedQueue<T> {
    /// Create a queue holding at most `max_size` items; `0` means unbounded.
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        let (sender, receiver) = if max_size == 0 {
            flume::unbounded()
        } else {
            flume::bounded(max_size)
        };
        let name: String = name.into();

        Self {
            name: Arc::from(name),
            capacity: (max_size > 0).then_some(max_size),
            backend: Backend::Local { sender, receiver },
        }
    }

    /// Create an unbounded queue.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of buffered items, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether this handle forwards through an instance link.
    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    /// A handle for an instance process that reaches this queue through `link`.
    pub(crate) fn remote(&self, link: Arc<Link>, side: Side, index: usize) -> Self {
        Self {
            name: Arc::clone(&self.name),
            capacity: self.capacity,
            backend: Backend::Remote(Remote { link, side, index }),
        }
    }

    fn receiver(&self) -> Option<&Receiver<T>> {
        match &self.backend {
            Backend::Local { receiver, .. } => Some(receiver),
            Backend::Remote(_) => None,
        }
    }
}

impl<T: QueueItem> SharedQueue<T> {
    /// Number of buffered items (snapshot in time). A remote handle whose
    /// link is gone reports 0.
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Local { receiver, .. } => receiver.len(),
            Backend::Remote(remote) => {
                let request = Request::Len {
                    side: remote.side,
                    index: remote.index,
                };
                match remote.link.call(&request) {
                    Ok(Response::Len { len }) => len,
                    _ => 0,
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue, blocking while the queue is full.
    pub fn put(&self, item: T) -> Result<(), QueueError<T>> {
        match &self.backend {
            Backend::Local { sender, .. } => sender.send(item).map_err(|_| QueueError::Disconnected),
            Backend::Remote(remote) => remote.put(item, Wait::Forever),
        }
    }

    /// Enqueue, giving up with [`QueueError::Full`] after `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError<T>> {
        match &self.backend {
            Backend::Local { sender, .. } => sender.send_timeout(item, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(item) => QueueError::Full(item),
                SendTimeoutError::Disconnected(_) => QueueError::Disconnected,
            }),
            Backend::Remote(remote) => remote.put(item, Wait::up_to(timeout)),
        }
    }

    /// Enqueue without blocking.
    pub fn try_put(&self, item: T) -> Result<(), QueueError<T>> {
        match &self.backend {
            Backend::Local { sender, .. } => sender.try_send(item).map_err(|e| match e {
                TrySendError::Full(item) => QueueError::Full(item),
                TrySendError::Disconnected(_) => QueueError::Disconnected,
            }),
            Backend::Remote(remote) => remote.put(item, Wait::No),
        }
    }

    /// Dequeue, giving up with [`QueueError::Empty`] after `timeout`.
    ///
    /// The timeout bounds how long a worker goes without re-checking the
    /// exit signal.
    pub fn get(&self, timeout: Duration) -> Result<T, QueueError<T>> {
        match &self.backend {
            Backend::Local { receiver, .. } => receiver.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => QueueError::Empty,
                RecvTimeoutError::Disconnected => QueueError::Disconnected,
            }),
            Backend::Remote(remote) => remote
                .get(vec![remote.index], Wait::up_to(timeout))
                .map(|(_, item)| item),
        }
    }

    /// Dequeue without blocking.
    pub fn try_get(&self) -> Result<T, QueueError<T>> {
        match &self.backend {
            Backend::Local { receiver, .. } => receiver.try_recv().map_err(|e| match e {
                TryRecvError::Empty => QueueError::Empty,
                TryRecvError::Disconnected => QueueError::Disconnected,
            }),
            Backend::Remote(remote) => remote.get(vec![remote.index], Wait::No).map(|(_, item)| item),
        }
    }

    /// Remove and drop every buffered item, returning how many were dropped.
    pub fn drain_and_discard(&self) -> usize {
        let mut discarded = 0;
        while self.try_get().is_ok() {
            discarded += 1;
        }
        crate::log_queue!(self.name(), "drained", discarded = discarded);
        discarded
    }

    /// Dequeue from whichever of `queues` has an item first.
    ///
    /// Returns the index of the queue the item came from. An empty slice
    /// yields [`QueueError::Empty`] immediately.
    pub fn get_any(queues: &[SharedQueue<T>], timeout: Duration) -> Result<(usize, T), QueueError<T>> {
        match queues {
            [] => Err(QueueError::Empty),
            [single] => single.get(timeout).map(|item| (0, item)),
            _ => {
                if let Some(receivers) = queues.iter().map(SharedQueue::receiver).collect::<Option<Vec<_>>>() {
                    return select_local(&receivers, timeout);
                }
                if let Some(remote) = common_remote(queues) {
                    let indices = queues.iter().filter_map(|q| q.remote_index()).collect();
                    let (index, item) = remote.get(indices, Wait::up_to(timeout))?;
                    let position = queues
                        .iter()
                        .position(|q| q.remote_index() == Some(index))
                        .ok_or(QueueError::Disconnected)?;
                    return Ok((position, item));
                }
                poll_mixed(queues, timeout)
            }
        }
    }

    /// Async dequeue for callers running inside a tokio runtime.
    pub async fn get_async(&self, timeout: Duration) -> Result<T, QueueError<T>> {
        match &self.backend {
            Backend::Local { receiver, .. } => match tokio::time::timeout(timeout, receiver.recv_async()).await {
                Ok(Ok(item)) => Ok(item),
                Ok(Err(_)) => Err(QueueError::Disconnected),
                Err(_) => Err(QueueError::Empty),
            },
            Backend::Remote(_) => {
                let queue = self.clone();
                tokio::task::spawn_blocking(move || queue.get(timeout))
                    .await
                    .unwrap_or(Err(QueueError::Disconnected))
            }
        }
    }

    /// Async enqueue, waiting for space when the queue is full.
    pub async fn put_async(&self, item: T) -> Result<(), QueueError<T>> {
        match &self.backend {
            Backend::Local { sender, .. } => sender
                .send_async(item)
                .await
                .map_err(|_| QueueError::Disconnected),
            Backend::Remote(_) => {
                let queue = self.clone();
                tokio::task::spawn_blocking(move || queue.put(item))
                    .await
                    .unwrap_or(Err(QueueError::Disconnected))
            }
        }
    }

    fn remote_index(&self) -> Option<usize> {
        match &self.backend {
            Backend::Remote(remote) => Some(remote.index),
            Backend::Local { .. } => None,
        }
    }
}

impl Remote {
    fn put<T: QueueItem>(&self, item: T, wait: Wait) -> Result<(), QueueError<T>> {
        let value = serde_json::to_value(&item).map_err(|e| QueueError::Codec(e.to_string()))?;
        let request = Request::Put {
            side: self.side,
            index: self.index,
            item: value,
            wait,
        };
        match self.link.call(&request) {
            Ok(Response::Done) => Ok(()),
            Ok(Response::Full) => Err(QueueError::Full(item)),
            Ok(Response::Invalid { message }) => Err(QueueError::Codec(message)),
            Ok(_) | Err(_) => Err(QueueError::Disconnected),
        }
    }

    fn get<T: QueueItem>(&self, indices: Vec<usize>, wait: Wait) -> Result<(usize, T), QueueError<T>> {
        let request = Request::Get {
            side: self.side,
            indices,
            wait,
        };
        match self.link.call(&request) {
            Ok(Response::Item { index, item }) => serde_json::from_value(item)
                .map(|item| (index, item))
                .map_err(|e| QueueError::Codec(e.to_string())),
            Ok(Response::Empty) => Err(QueueError::Empty),
            Ok(Response::Invalid { message }) => Err(QueueError::Codec(message)),
            Ok(_) | Err(_) => Err(QueueError::Disconnected),
        }
    }
}

fn select_local<T>(receivers: &[&Receiver<T>], timeout: Duration) -> Result<(usize, T), QueueError<T>> {
    let mut selector = flume::Selector::new();
    for (index, receiver) in receivers.iter().enumerate() {
        selector = selector.recv(*receiver, move |result| result.map(|item| (index, item)));
    }
    match selector.wait_timeout(timeout) {
        Ok(Ok(received)) => Ok(received),
        Ok(Err(_)) => Err(QueueError::Disconnected),
        Err(_) => Err(QueueError::Empty),
    }
}

/// The remote endpoint all of `queues` share, if they are remote handles on
/// one link and one side.
fn common_remote<T>(queues: &[SharedQueue<T>]) -> Option<&Remote> {
    let mut remotes = queues.iter().map(|q| match &q.backend {
        Backend::Remote(remote) => Some(remote),
        Backend::Local { .. } => None,
    });
    let first = remotes.next()??;
    for remote in remotes {
        let remote = remote?;
        if !Arc::ptr_eq(&remote.link, &first.link) || remote.side != first.side {
            return None;
        }
    }
    Some(first)
}

fn poll_mixed<T: QueueItem>(queues: &[SharedQueue<T>], timeout: Duration) -> Result<(usize, T), QueueError<T>> {
    let deadline = Instant::now() + timeout;
    loop {
        for (index, queue) in queues.iter().enumerate() {
            match queue.try_get() {
                Ok(item) => return Ok((index, item)),
                Err(QueueError::Empty) => {}
                Err(err) => return Err(err),
            }
        }
        if Instant::now() >= deadline {
            return Err(QueueError::Empty);
        }
        thread::sleep(MIXED_POLL);
    }
}

/// Type-erased view of a queue for shutdown sequencing.
///
/// Lets the orchestrator hold queues of different item types in one
/// ordered drain list.
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;

    fn drain_and_discard(&self) -> usize;
}

impl<T: QueueItem> Drain for SharedQueue<T> {
    fn name(&self) -> &str {
        SharedQueue::name(self)
    }

    fn drain_and_discard(&self) -> usize {
        SharedQueue::drain_and_discard(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Bridge, Broker};
    use std::collections::HashSet;
    use std::os::unix::net::UnixStream;

    /// Remote handles for `inputs`, served by a broker on this thread's process.
    fn remote_inputs(inputs: &[SharedQueue<u32>]) -> (Vec<SharedQueue<u32>>, Broker) {
        let (near, far) = UnixStream::pair().unwrap();
        let bridge = Bridge {
            inputs: Box::new(inputs.to_vec()),
            outputs: Box::new(Vec::<SharedQueue<u32>>::new()),
        };
        let broker = Broker::spawn("queue-test".to_string(), far, bridge).unwrap();
        let link = Arc::new(Link::new(near).unwrap());
        let remotes = inputs
            .iter()
            .enumerate()
            .map(|(index, queue)| queue.remote(Arc::clone(&link), Side::Input, index))
            .collect();
        (remotes, broker)
    }

    #[test]
    fn test_fifo_order() {
        let queue = SharedQueue::unbounded("fifo");
        for i in 0..10 {
            queue.put(i).unwrap();
        }
        let received: Vec<i32> = (0..10).map(|_| queue.try_get().unwrap()).collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_means_unbounded() {
        let queue = SharedQueue::new("unbounded", 0);
        assert_eq!(queue.capacity(), None);
        for i in 0..1000 {
            queue.try_put(i).unwrap();
        }
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_try_put_full_returns_item() {
        let queue = SharedQueue::new("bounded", 2);
        queue.try_put('a').unwrap();
        queue.try_put('b').unwrap();

        let err = queue.try_put('c').unwrap_err();
        assert_eq!(err, QueueError::Full('c'));
        assert_eq!(err.into_inner(), Some('c'));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_put_timeout_on_full_queue() {
        let queue = SharedQueue::new("bounded", 1);
        queue.put(1).unwrap();

        let start = Instant::now();
        let err = queue.put_timeout(2, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.into_inner(), Some(2));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_try_get_empty() {
        let queue: SharedQueue<u8> = SharedQueue::unbounded("empty");
        assert_eq!(queue.try_get().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let queue: SharedQueue<u8> = SharedQueue::unbounded("empty");
        let start = Instant::now();
        assert_eq!(queue.get(Duration::from_millis(50)).unwrap_err(), QueueError::Empty);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_get_receives_item_from_other_thread() {
        let queue = SharedQueue::unbounded("cross");
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(42).unwrap();
        });

        assert_eq!(queue.get(Duration::from_secs(5)).unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_and_discard_empties_queue() {
        let queue = SharedQueue::unbounded("drain");
        for i in 0..25 {
            queue.put(i).unwrap();
        }

        assert_eq!(queue.drain_and_discard(), 25);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.try_get().unwrap_err(), QueueError::Empty);
        assert_eq!(queue.try_get().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn test_drain_through_trait_object() {
        let numbers = SharedQueue::unbounded("numbers");
        let words = SharedQueue::unbounded("words");
        numbers.put(1u32).unwrap();
        words.put("x".to_string()).unwrap();
        words.put("y".to_string()).unwrap();

        let order: Vec<Box<dyn Drain>> = vec![Box::new(words.clone()), Box::new(numbers.clone())];
        let drained: Vec<(String, usize)> = order
            .iter()
            .map(|q| (q.name().to_string(), q.drain_and_discard()))
            .collect();

        assert_eq!(drained, vec![("words".to_string(), 2), ("numbers".to_string(), 1)]);
    }

    #[test]
    fn test_get_any_reports_source_index() {
        let first: SharedQueue<u32> = SharedQueue::unbounded("first");
        let second = SharedQueue::unbounded("second");
        second.put(9).unwrap();

        let queues = vec![first, second];
        assert_eq!(SharedQueue::get_any(&queues, Duration::from_secs(1)).unwrap(), (1, 9));
        assert_eq!(
            SharedQueue::get_any(&queues, Duration::from_millis(20)).unwrap_err(),
            QueueError::Empty
        );
        assert_eq!(SharedQueue::<u32>::get_any(&[], Duration::from_secs(1)).unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn test_concurrent_consumers_receive_each_item_once() {
        let queue = SharedQueue::unbounded("shared");
        for i in 0..1000u32 {
            queue.put(i).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let consumer = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(item) = consumer.try_get() {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }

    #[tokio::test]
    async fn test_async_get_and_put() {
        let queue = SharedQueue::new("async", 4);
        queue.put_async(5).await.unwrap();
        assert_eq!(queue.get_async(Duration::from_secs(1)).await.unwrap(), 5);
        assert_eq!(
            queue.get_async(Duration::from_millis(20)).await.unwrap_err(),
            QueueError::Empty
        );
    }

    #[test]
    fn test_remote_handle_reaches_parent_queue() {
        let queue = SharedQueue::new("parent", 2);
        let (remotes, broker) = remote_inputs(&[queue.clone()]);
        let remote = &remotes[0];
        assert!(remote.is_remote());
        assert_eq!(remote.capacity(), Some(2));

        remote.put(1).unwrap();
        remote.try_put(2).unwrap();
        assert_eq!(remote.try_put(3).unwrap_err(), QueueError::Full(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(remote.len(), 2);

        assert_eq!(queue.try_get().unwrap(), 1);
        assert_eq!(remote.get(Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(remote.try_get().unwrap_err(), QueueError::Empty);
        broker.finish();
    }

    #[test]
    fn test_get_any_over_remote_handles_maps_source() {
        let first = SharedQueue::unbounded("first");
        let second = SharedQueue::unbounded("second");
        let (remotes, broker) = remote_inputs(&[first, second.clone()]);

        second.put(5).unwrap();
        assert_eq!(SharedQueue::get_any(&remotes, Duration::from_secs(1)).unwrap(), (1, 5));
        assert_eq!(
            SharedQueue::get_any(&remotes, Duration::from_millis(20)).unwrap_err(),
            QueueError::Empty
        );
        broker.finish();
    }

    #[test]
    fn test_remote_handle_after_broker_gone_is_disconnected() {
        let queue = SharedQueue::unbounded("parent");
        let (remotes, broker) = remote_inputs(&[queue]);
        broker.finish();

        assert_eq!(remotes[0].put(1).unwrap_err(), QueueError::Disconnected);
        assert_eq!(remotes[0].len(), 0);
    }

    #[test]
    fn test_get_any_mixed_local_and_remote() {
        let parent = SharedQueue::unbounded("parent");
        let (mut queues, broker) = remote_inputs(&[parent.clone()]);
        let local = SharedQueue::unbounded("local");
        queues.insert(0, local.clone());

        parent.put(8).unwrap();
        assert_eq!(SharedQueue::get_any(&queues, Duration::from_secs(1)).unwrap(), (1, 8));
        local.put(4).unwrap();
        assert_eq!(SharedQueue::get_any(&queues, Duration::from_secs(1)).unwrap(), (0, 4));
        broker.finish();
    }
}
