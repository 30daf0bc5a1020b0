use crate::error::{ErrorKind, ProcessingError};
use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use rand::Rng;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Pure destination-selection policy over an ordered target list, decoupled
/// from delivery mechanics.
pub trait BalanceStrategy: Send + Sync {
    fn choose(&mut self, exchange: &Exchange, total: usize) -> Option<usize>;
}

/// Cycles through the targets in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl BalanceStrategy for RoundRobin {
    fn choose(&mut self, _exchange: &Exchange, total: usize) -> Option<usize> {
        if total == 0 {
            return None;
        }
        let chosen = self.next % total;
        self.next = (self.next + 1) % total;
        Some(chosen)
    }
}

/// Uniformly random target selection.
#[derive(Debug, Default)]
pub struct Random;

impl BalanceStrategy for Random {
    fn choose(&mut self, _exchange: &Exchange, total: usize) -> Option<usize> {
        if total == 0 {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..total))
    }
}

/// Random selection biased by per-target weights.
#[derive(Debug)]
pub struct Weighted {
    weights: Vec<u32>,
}

impl Weighted {
    pub fn new(weights: Vec<u32>) -> Self {
        Self { weights }
    }
}

impl BalanceStrategy for Weighted {
    fn choose(&mut self, _exchange: &Exchange, total: usize) -> Option<usize> {
        if total == 0 || self.weights.len() != total {
            return None;
        }
        let sum: u64 = self.weights.iter().map(|w| *w as u64).sum();
        if sum == 0 {
            return None;
        }
        let mut roll = rand::thread_rng().gen_range(0..sum);
        for (index, weight) in self.weights.iter().enumerate() {
            let weight = *weight as u64;
            if roll < weight {
                return Some(index);
            }
            roll -= weight;
        }
        Some(total - 1)
    }
}

/// Consistent selection by a key derived from the exchange: the same key
/// always lands on the same target while the target list is unchanged.
pub struct Sticky {
    key: Arc<dyn Fn(&Exchange) -> Option<String> + Send + Sync>,
}

impl Sticky {
    pub fn new(key: impl Fn(&Exchange) -> Option<String> + Send + Sync + 'static) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Sticks by a header value read as text.
    pub fn by_header(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |exchange| {
            exchange
                .message()
                .header_text(&name)
                .map(|value| value.into_owned())
        })
    }
}

impl BalanceStrategy for Sticky {
    fn choose(&mut self, exchange: &Exchange, total: usize) -> Option<usize> {
        if total == 0 {
            return None;
        }
        let key = (self.key)(exchange)?;
        let mut hasher = fnv::FnvHasher::default();
        key.hash(&mut hasher);
        Some((hasher.finish() % total as u64) as usize)
    }
}

/// Delivers each exchange to the single target chosen by the strategy.
pub struct LoadBalancer {
    targets: Vec<SharedProcessor>,
    strategy: Mutex<Box<dyn BalanceStrategy>>,
}

impl LoadBalancer {
    pub fn new(targets: Vec<SharedProcessor>, strategy: impl BalanceStrategy + 'static) -> Self {
        Self {
            targets,
            strategy: Mutex::new(Box::new(strategy)),
        }
    }

    pub fn round_robin(targets: Vec<SharedProcessor>) -> Self {
        Self::new(targets, RoundRobin::default())
    }

    pub fn random(targets: Vec<SharedProcessor>) -> Self {
        Self::new(targets, Random)
    }

    pub fn weighted(targets: Vec<SharedProcessor>, weights: Vec<u32>) -> Self {
        Self::new(targets, Weighted::new(weights))
    }

    pub fn sticky(targets: Vec<SharedProcessor>, sticky: Sticky) -> Self {
        Self::new(targets, sticky)
    }
}

#[async_trait]
impl Processor for LoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let chosen = {
            let mut strategy = self.strategy.lock().expect("balancer strategy poisoned");
            strategy.choose(exchange, self.targets.len())
        };
        match chosen {
            Some(index) => {
                dispatch(self.targets[index].as_ref(), exchange).await;
                Ok(())
            }
            None => Err(ProcessingError::validation(
                "load balancer has no eligible target",
            )),
        }
    }

    fn name(&self) -> &str {
        "load-balancer"
    }
}

/// Tries targets in declaration order until one succeeds.
///
/// An empty `failover_on` set fails over on any error kind; otherwise a
/// failure outside the set stops the sequence and the exchange keeps that
/// failure. Each attempt starts from the exchange state as it entered the
/// balancer, so a failed attempt cannot leak partial mutations into the
/// next one.
pub struct Failover {
    targets: Vec<SharedProcessor>,
    failover_on: Vec<ErrorKind>,
}

impl Failover {
    pub fn new(targets: Vec<SharedProcessor>) -> Self {
        Self {
            targets,
            failover_on: Vec::new(),
        }
    }

    pub fn failover_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.failover_on = kinds;
        self
    }

    fn covers(&self, kind: ErrorKind) -> bool {
        self.failover_on.is_empty() || self.failover_on.contains(&kind)
    }
}

#[async_trait]
impl Processor for Failover {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let entry_state = exchange.clone();
        for (attempt, target) in self.targets.iter().enumerate() {
            if attempt > 0 {
                *exchange = entry_state.clone();
            }
            dispatch(target.as_ref(), exchange).await;
            match exchange.exception() {
                None => return Ok(()),
                Some(error) => {
                    if !self.covers(error.kind()) {
                        log::debug!(
                            "failover stopping at target {}: {} not in failover set",
                            attempt,
                            error.kind()
                        );
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "failover"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Stops dispatching after `threshold` consecutive tracked failures.
///
/// Closed: deliver and count tracked failures. Open: reject immediately
/// without attempting delivery. After `half_open_after` elapses the next
/// send closes the circuit again with a reset failure count and is delivered
/// normally. Failures of untracked kinds pass through without touching the
/// circuit; an empty tracked set tracks every kind.
pub struct CircuitBreaker {
    target: SharedProcessor,
    threshold: u32,
    half_open_after: Duration,
    tracked: Vec<ErrorKind>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: SharedProcessor, threshold: u32, half_open_after: Duration) -> Self {
        Self {
            target,
            threshold: threshold.max(1),
            half_open_after,
            tracked: Vec::new(),
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn track(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.tracked = kinds;
        self
    }

    fn tracks(&self, kind: ErrorKind) -> bool {
        self.tracked.is_empty() || self.tracked.contains(&kind)
    }
}

#[async_trait]
impl Processor for CircuitBreaker {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        {
            let mut state = self.state.lock().expect("breaker state poisoned");
            if state.phase == BreakerPhase::Open {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.half_open_after)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(ProcessingError::circuit_open(
                        "circuit open, delivery rejected",
                    ));
                }
                log::debug!("circuit half-open, attempting delivery again");
                state.phase = BreakerPhase::Closed;
                state.failures = 0;
                state.opened_at = None;
            }
        }

        dispatch(self.target.as_ref(), exchange).await;

        let mut state = self.state.lock().expect("breaker state poisoned");
        match exchange.exception() {
            None => state.failures = 0,
            Some(error) => {
                if self.tracks(error.kind()) {
                    state.failures += 1;
                    if state.failures >= self.threshold {
                        log::warn!(
                            "circuit opened after {} consecutive failures",
                            state.failures
                        );
                        state.phase = BreakerPhase::Open;
                        state.opened_at = Some(Instant::now());
                    }
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "circuit-breaker"
    }
}
