use crate::aggregate::{SharedAggregationStrategy, UseLatest};
use crate::error::ProcessingError;
use crate::exchange::{Exchange, names};
use crate::pool::TaskExecutor;
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One unit of fan-out work: an independent exchange bound for a destination.
pub(crate) struct Branch {
    pub index: usize,
    pub exchange: Exchange,
    pub destination: SharedProcessor,
}

pub(crate) struct FanOutConfig {
    pub parallel: bool,
    pub stop_on_exception: bool,
    pub timeout: Option<Duration>,
    pub executor: Option<Arc<TaskExecutor>>,
    pub strategy: SharedAggregationStrategy,
}

pub(crate) struct FanOutResult {
    pub aggregated: Option<Exchange>,
    /// First user-code failure observed across branches.
    pub first_failure: Option<ProcessingError>,
    /// First pool rejection; always propagated, never silently dropped.
    pub rejection: Option<ProcessingError>,
    pub timed_out: bool,
}

enum Outcome {
    Done(usize, Exchange),
    Skipped(usize),
}

/// Dispatches branches sequentially or in parallel and folds arriving
/// results through the aggregation strategy.
///
/// Aggregation calls happen only inside this coordinator loop, which is what
/// serializes `aggregate`/`timeout` even when branches complete concurrently.
/// On fan-out timeout the strategy's `timeout` hook runs once per missing
/// branch in index order, and the result channel is dropped so late arrivals
/// fail their send and are discarded without touching the aggregate.
pub(crate) async fn run_branches(branches: Vec<Branch>, cfg: &FanOutConfig) -> FanOutResult {
    let total = branches.len();
    let mut result = FanOutResult {
        aggregated: None,
        first_failure: None,
        rejection: None,
        timed_out: false,
    };
    if total == 0 {
        return result;
    }
    if cfg.parallel {
        run_parallel(branches, cfg, &mut result).await;
    } else {
        run_sequential(branches, cfg, &mut result).await;
    }
    result
}

async fn run_sequential(branches: Vec<Branch>, cfg: &FanOutConfig, result: &mut FanOutResult) {
    let total = branches.len();
    let deadline = cfg.timeout.map(|t| Instant::now() + t);
    for branch in branches {
        if cfg.stop_on_exception && result.first_failure.is_some() {
            break;
        }
        let Branch {
            index,
            mut exchange,
            destination,
        } = branch;
        match deadline {
            None => {
                dispatch(destination.as_ref(), &mut exchange).await;
                fold(cfg, result, exchange);
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    result.aggregated = cfg.strategy.timeout(
                        result.aggregated.take(),
                        index,
                        total,
                        cfg.timeout.unwrap_or_default(),
                    );
                    result.timed_out = true;
                    continue;
                }
                // Spawned so an overrunning branch keeps executing while the
                // fan-out stops waiting for it.
                let handle = tokio::spawn(async move {
                    dispatch(destination.as_ref(), &mut exchange).await;
                    exchange
                });
                match tokio::time::timeout(remaining, handle).await {
                    Ok(Ok(exchange)) => fold(cfg, result, exchange),
                    Ok(Err(join)) => {
                        if result.first_failure.is_none() {
                            result.first_failure =
                                Some(ProcessingError::processing(format!("branch {} task failed: {}", index, join)));
                        }
                    }
                    Err(_) => {
                        result.aggregated = cfg.strategy.timeout(
                            result.aggregated.take(),
                            index,
                            total,
                            cfg.timeout.unwrap_or_default(),
                        );
                        result.timed_out = true;
                    }
                }
            }
        }
    }
}

async fn run_parallel(branches: Vec<Branch>, cfg: &FanOutConfig, result: &mut FanOutResult) {
    let total = branches.len();
    let (tx, mut rx) = mpsc::channel::<Outcome>(total);
    let stop = Arc::new(AtomicBool::new(false));
    let deadline = cfg.timeout.map(|t| Instant::now() + t);

    for branch in branches {
        let Branch {
            index,
            exchange,
            destination,
        } = branch;
        let tx = tx.clone();
        let stop_flag = stop.clone();
        let task = async move {
            // A branch submitted before the short-circuit but not yet started
            // is skipped; already-running branches complete normally.
            if stop_flag.load(Ordering::Acquire) {
                let _ = tx.send(Outcome::Skipped(index)).await;
                return;
            }
            let mut exchange = exchange;
            dispatch(destination.as_ref(), &mut exchange).await;
            let _ = tx.send(Outcome::Done(index, exchange)).await;
        };
        match &cfg.executor {
            None => {
                tokio::spawn(task);
            }
            Some(pool) => {
                if let Err(rejected) = pool.submit(task).await {
                    log::warn!("fan-out branch {} rejected: {}", index, rejected);
                    if result.rejection.is_none() {
                        result.rejection = Some(rejected);
                    }
                    if cfg.stop_on_exception {
                        stop.store(true, Ordering::Release);
                    }
                }
            }
        }
    }
    drop(tx);

    let mut arrived = vec![false; total];
    loop {
        let outcome = match deadline {
            None => rx.recv().await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break_on_timeout(cfg, result, &arrived, total);
                    return;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        break_on_timeout(cfg, result, &arrived, total);
                        return;
                    }
                }
            }
        };
        match outcome {
            Some(Outcome::Done(index, exchange)) => {
                arrived[index] = true;
                if cfg.stop_on_exception && exchange.is_failed() {
                    stop.store(true, Ordering::Release);
                }
                fold(cfg, result, exchange);
            }
            Some(Outcome::Skipped(index)) => {
                arrived[index] = true;
            }
            // All senders gone: every branch reported, was skipped, or was
            // dropped by a Discard-family pool policy.
            None => break,
        }
    }
}

fn fold(cfg: &FanOutConfig, result: &mut FanOutResult, exchange: Exchange) {
    // The strategy receives the branch exactly as it finished, exception
    // included: without a stop/share flag, whether a failure survives
    // aggregation is the strategy's call.
    if let Some(error) = exchange.exception() {
        if result.first_failure.is_none() {
            result.first_failure = Some(error.clone());
        }
    }
    result.aggregated = Some(cfg.strategy.aggregate(result.aggregated.take(), exchange));
}

fn break_on_timeout(cfg: &FanOutConfig, result: &mut FanOutResult, arrived: &[bool], total: usize) {
    let timeout = cfg.timeout.unwrap_or_default();
    for (index, arrived) in arrived.iter().enumerate() {
        if !arrived {
            result.aggregated =
                cfg.strategy
                    .timeout(result.aggregated.take(), index, total, timeout);
        }
    }
    result.timed_out = true;
}

/// Sends independent copies of one exchange to every destination, then folds
/// the branch results back into the original through an aggregation
/// strategy (use-latest when none is configured).
///
/// Sequential execution delivers and aggregates in declaration order;
/// parallel execution aggregates in arrival order. A configured fan-out
/// timeout bounds the wait for outstanding branches without interrupting
/// work that already started.
pub struct Multicast {
    destinations: Vec<SharedProcessor>,
    strategy: SharedAggregationStrategy,
    parallel: bool,
    executor: Option<Arc<TaskExecutor>>,
    stop_on_exception: bool,
    timeout: Option<Duration>,
    share_unit_of_work: bool,
    copy: bool,
}

impl Multicast {
    pub fn new(destinations: Vec<SharedProcessor>) -> Self {
        Self {
            destinations,
            strategy: Arc::new(UseLatest),
            parallel: false,
            executor: None,
            stop_on_exception: false,
            timeout: None,
            share_unit_of_work: false,
            copy: true,
        }
    }

    pub fn strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Bounded executor for parallel branches; unbounded spawning otherwise.
    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Abort dispatching remaining branches on the first failure.
    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    /// Upper bound on waiting for the whole fan-out.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Propagate any branch failure back onto the original exchange so an
    /// outer error handler operates on the whole unit of work.
    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.share_unit_of_work = share;
        self
    }

    /// Non-copy mode feeds the same exchange through each destination
    /// sequentially instead of fanning out independent copies.
    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    fn fan_out_config(&self) -> FanOutConfig {
        FanOutConfig {
            parallel: self.parallel,
            stop_on_exception: self.stop_on_exception,
            timeout: self.timeout,
            executor: self.executor.clone(),
            strategy: self.strategy.clone(),
        }
    }
}

#[async_trait]
impl Processor for Multicast {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        if self.destinations.is_empty() {
            return Ok(());
        }

        if !self.copy {
            for destination in &self.destinations {
                dispatch(destination.as_ref(), exchange).await;
                if exchange.is_failed() && self.stop_on_exception {
                    break;
                }
            }
            return Ok(());
        }

        let total = self.destinations.len();
        let branches = self
            .destinations
            .iter()
            .enumerate()
            .map(|(index, destination)| {
                let mut copy = exchange.copy();
                copy.set_property(names::MULTICAST_INDEX, index);
                copy.set_property(names::MULTICAST_COMPLETE, index == total - 1);
                Branch {
                    index,
                    exchange: copy,
                    destination: destination.clone(),
                }
            })
            .collect();

        let result = run_branches(branches, &self.fan_out_config()).await;
        if let Some(aggregated) = result.aggregated {
            exchange.absorb(aggregated);
        }
        if let Some(rejected) = result.rejection {
            if !exchange.is_failed() {
                exchange.set_exception(rejected);
            }
        }
        if self.stop_on_exception || self.share_unit_of_work {
            if let Some(failure) = result.first_failure {
                if !exchange.is_failed() {
                    exchange.set_exception(failure);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "multicast"
    }
}
