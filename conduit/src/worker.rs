//! # Worker Loop Drivers
//!
//! The standard instance state machine, packaged for entry computations:
//!
//! - [`consume_loop`]: take one item from the inputs (bounded by the poll
//!   timeout), run the computation, push every result to every output. Leave
//!   only when a poll comes back empty *and* exit has been requested, so
//!   buffered input is processed before the instance terminates.
//! - [`produce_loop`]: for source-only roles. Run the computation, push its
//!   results, then sleep for the period, waking early on exit.
//!
//! Computation errors are logged and the loop continues; one bad item never
//! terminates an instance. A disconnected queue (the instance link is gone)
//! ends the loop.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{QueueError, WorkerError};
use crate::queue::{QueueItem, SharedQueue};
use crate::spec::WorkerContext;

/// Counters reported when a loop driver returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Loop iterations, including empty polls
    pub iterations: u64,
    /// Items taken from input queues
    pub received: u64,
    /// Results enqueued on output queues (one per output queue)
    pub sent: u64,
    /// Results that could not be enqueued before exit
    pub dropped: u64,
    /// Computation errors logged and skipped
    pub errors: u64,
}

/// Run the consumer state machine until exit is requested and input is idle.
///
/// `work` receives the index of the input queue the item came from. With no
/// input queues the loop only waits on the exit signal.
pub fn consume_loop<I, O, F>(ctx: &WorkerContext<I, O>, mut work: F) -> LoopStats
where
    I: QueueItem,
    O: QueueItem + Clone,
    F: FnMut(usize, I) -> Result<Vec<O>, WorkerError>,
{
    let poll_timeout = ctx.poll_timeout();
    let mut stats = LoopStats::default();

    loop {
        stats.iterations += 1;

        if ctx.inputs().is_empty() {
            if ctx.exit_signal().wait_timeout(poll_timeout) {
                break;
            }
            continue;
        }

        match SharedQueue::get_any(ctx.inputs(), poll_timeout) {
            Ok((source, item)) => {
                stats.received += 1;
                match work(source, item) {
                    Ok(results) => publish(ctx, results, &mut stats),
                    Err(err) => {
                        stats.errors += 1;
                        warn!(error = %err, role = ctx.role(), instance = ctx.index(), "Item failed, continuing");
                    }
                }
            }
            Err(QueueError::Disconnected) => {
                warn!(role = ctx.role(), instance = ctx.index(), "Input disconnected, leaving loop");
                break;
            }
            Err(QueueError::Codec(message)) => {
                stats.errors += 1;
                warn!(error = %message, role = ctx.role(), instance = ctx.index(), "Unreadable item skipped");
            }
            Err(_) => {
                if ctx.is_exit_requested() {
                    break;
                }
                trace!(role = ctx.role(), instance = ctx.index(), "Input idle");
            }
        }
    }

    info!(role = ctx.role(), instance = ctx.index(), ?stats, "Consumer loop finished");
    stats
}

/// Run the source state machine: produce, publish, sleep `period`, repeat.
pub fn produce_loop<I, O, F>(ctx: &WorkerContext<I, O>, period: Duration, mut work: F) -> LoopStats
where
    O: QueueItem + Clone,
    F: FnMut() -> Result<Vec<O>, WorkerError>,
{
    let mut stats = LoopStats::default();

    while !ctx.is_exit_requested() {
        stats.iterations += 1;

        match work() {
            Ok(results) => publish(ctx, results, &mut stats),
            Err(err) => {
                stats.errors += 1;
                warn!(error = %err, role = ctx.role(), instance = ctx.index(), "Production failed, continuing");
            }
        }

        if ctx.exit_signal().wait_timeout(period) {
            break;
        }
    }

    info!(role = ctx.role(), instance = ctx.index(), ?stats, "Producer loop finished");
    stats
}

/// Push each result to every output queue.
fn publish<I, O: QueueItem + Clone>(ctx: &WorkerContext<I, O>, results: Vec<O>, stats: &mut LoopStats) {
    let Some((last, rest)) = ctx.outputs().split_last() else {
        if !results.is_empty() {
            debug!(role = ctx.role(), discarded = results.len(), "No output queues, results discarded");
        }
        return;
    };

    for result in results {
        for queue in rest {
            push_one(ctx, queue, result.clone(), stats);
        }
        push_one(ctx, last, result, stats);
    }
}

// Retries a full queue until exit is requested; after that the item is
// dropped because downstream is being drained.
fn push_one<I, O: QueueItem>(ctx: &WorkerContext<I, O>, queue: &SharedQueue<O>, item: O, stats: &mut LoopStats) {
    let mut pending = item;
    loop {
        match queue.put_timeout(pending, ctx.poll_timeout()) {
            Ok(()) => {
                stats.sent += 1;
                return;
            }
            Err(QueueError::Full(item)) if !ctx.is_exit_requested() => {
                trace!(queue = queue.name(), "Output full, retrying");
                pending = item;
            }
            Err(err) => {
                stats.dropped += 1;
                warn!(queue = queue.name(), error = %err, role = ctx.role(), "Result dropped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExitSignal;
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    #[test]
    fn test_consume_loop_processes_buffered_input_before_exit() {
        let input = SharedQueue::unbounded("in");
        let output = SharedQueue::unbounded("out");
        for i in 0..5u32 {
            input.put(i).unwrap();
        }
        let exit = ExitSignal::new().unwrap();
        exit.request();

        let ctx = WorkerContext::new("square", 0, vec![input.clone()], vec![output.clone()], exit)
            .with_poll_timeout(POLL);
        let stats = consume_loop(&ctx, |_, n: u32| Ok(vec![n * n]));

        assert_eq!(stats.received, 5);
        assert_eq!(stats.sent, 5);
        assert!(input.is_empty());
        let squares: Vec<u32> = (0..5).map(|_| output.try_get().unwrap()).collect();
        assert_eq!(squares, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn test_consume_loop_continues_after_error() {
        let input = SharedQueue::unbounded("in");
        let output = SharedQueue::unbounded("out");
        for word in ["1", "x", "3"] {
            input.put(word.to_string()).unwrap();
        }
        let exit = ExitSignal::new().unwrap();
        exit.request();

        let ctx = WorkerContext::new("parse", 0, vec![input], vec![output.clone()], exit)
            .with_poll_timeout(POLL);
        let stats = consume_loop(&ctx, |_, s: String| {
            s.parse::<u32>()
                .map(|n| vec![n])
                .map_err(|e| WorkerError::MalformedData(e.to_string()))
        });

        assert_eq!(stats.errors, 1);
        assert_eq!(output.try_get().unwrap(), 1);
        assert_eq!(output.try_get().unwrap(), 3);
    }

    #[test]
    fn test_consume_loop_fans_out_to_every_output() {
        let input = SharedQueue::unbounded("in");
        let left = SharedQueue::unbounded("left");
        let right = SharedQueue::unbounded("right");
        input.put(7u8).unwrap();
        let exit = ExitSignal::new().unwrap();
        exit.request();

        let ctx = WorkerContext::new("fan", 0, vec![input], vec![left.clone(), right.clone()], exit)
            .with_poll_timeout(POLL);
        let stats = consume_loop(&ctx, |_, n| Ok(vec![n]));

        assert_eq!(stats.sent, 2);
        assert_eq!(left.try_get().unwrap(), 7);
        assert_eq!(right.try_get().unwrap(), 7);
    }

    #[test]
    fn test_consume_loop_exits_on_request_while_idle() {
        let input: SharedQueue<u8> = SharedQueue::unbounded("in");
        let exit = ExitSignal::new().unwrap();
        let ctx: WorkerContext<u8, u8> = WorkerContext::new("idle", 0, vec![input], vec![], exit.clone())
            .with_poll_timeout(POLL);

        let handle = thread::spawn(move || consume_loop(&ctx, |_, n| Ok(vec![n])));
        thread::sleep(Duration::from_millis(50));
        exit.request();

        let stats = handle.join().unwrap();
        assert_eq!(stats.received, 0);
        assert!(stats.iterations >= 1);
    }

    #[test]
    fn test_push_to_full_output_dropped_after_exit() {
        let input = SharedQueue::unbounded("in");
        let output = SharedQueue::new("tiny", 1);
        input.put(1u8).unwrap();
        input.put(2u8).unwrap();
        let exit = ExitSignal::new().unwrap();
        exit.request();

        let ctx = WorkerContext::new("stuck", 0, vec![input], vec![output.clone()], exit)
            .with_poll_timeout(POLL);
        let stats = consume_loop(&ctx, |_, n| Ok(vec![n]));

        assert_eq!(stats.sent, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(output.try_get().unwrap(), 1);
    }

    #[test]
    fn test_produce_loop_runs_until_exit() {
        let output = SharedQueue::unbounded("ticks");
        let exit = ExitSignal::new().unwrap();
        let ctx: WorkerContext<(), u32> = WorkerContext::new("ticker", 0, vec![], vec![output.clone()], exit.clone())
            .with_poll_timeout(POLL);

        let handle = thread::spawn(move || {
            let mut tick = 0;
            produce_loop(&ctx, Duration::from_millis(10), || {
                tick += 1;
                Ok(vec![tick])
            })
        });

        assert_eq!(output.get(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(output.get(Duration::from_secs(5)).unwrap(), 2);
        exit.request();

        let stats = handle.join().unwrap();
        assert!(stats.iterations >= 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_produce_loop_does_not_run_when_already_requested() {
        let exit = ExitSignal::new().unwrap();
        exit.request();
        let ctx: WorkerContext<(), u32> = WorkerContext::new("never", 0, vec![], vec![], exit)
            .with_poll_timeout(POLL);

        let stats = produce_loop(&ctx, Duration::from_secs(10), || Ok(vec![1]));
        assert_eq!(stats.iterations, 0);
    }
}
