use crate::error::ProcessingError;
use crate::event::{ExchangeEvent, SharedEventNotifier, emit};
use crate::exchange::{Exchange, names};
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a saga-scoped processor joins the surrounding saga context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPropagation {
    /// Always start a new logical action.
    RequiresNew,
    /// Join the existing action; fail when there is none.
    Mandatory,
    /// Join the existing action when present, run plain otherwise.
    Supports,
    /// Run outside any saga context, restoring it afterwards.
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaCompletionMode {
    /// Complete when the saga-scoped work finishes without exception.
    Auto,
    /// Completion or compensation is signalled explicitly.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    Running,
    Completed,
    Compensated,
}

struct SagaAction {
    phase: SagaPhase,
    compensations: Vec<(SharedProcessor, Exchange)>,
}

/// Tracks compensating actions per logical business transaction.
///
/// Each action moves through exactly one terminal transition: completion and
/// compensation race (an explicit signal against a scheduled timeout, or
/// concurrent participants), and the phase change under the action's map
/// entry guarantees at most one of them fires. Compensations run in reverse
/// registration order, each against the exchange snapshot captured when it
/// was registered.
pub struct SagaCoordinator {
    actions: DashMap<Uuid, SagaAction, fnv::FnvBuildHasher>,
    notifier: Option<SharedEventNotifier>,
}

impl SagaCoordinator {
    pub fn new() -> Self {
        Self {
            actions: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            notifier: None,
        }
    }

    pub fn with_notifier(notifier: SharedEventNotifier) -> Self {
        Self {
            actions: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            notifier: Some(notifier),
        }
    }

    /// Starts a new logical action.
    pub fn begin(&self) -> Uuid {
        let action_id = Uuid::new_v4();
        self.actions.insert(action_id, SagaAction {
            phase: SagaPhase::Running,
            compensations: Vec::new(),
        });
        log::debug!("saga action {} started", action_id);
        action_id
    }

    pub fn phase(&self, action_id: &Uuid) -> Option<SagaPhase> {
        self.actions.get(action_id).map(|action| action.phase)
    }

    /// Registers a compensating processor with the exchange state it should
    /// be invoked with.
    pub fn register_compensation(
        &self,
        action_id: &Uuid,
        compensation: SharedProcessor,
        snapshot: Exchange,
    ) -> Result<(), ProcessingError> {
        match self.actions.get_mut(action_id) {
            Some(mut action) if action.phase == SagaPhase::Running => {
                action.compensations.push((compensation, snapshot));
                Ok(())
            }
            Some(_) => Err(ProcessingError::saga(format!(
                "saga action {} already finished",
                action_id
            ))),
            None => Err(ProcessingError::saga(format!(
                "unknown saga action {}",
                action_id
            ))),
        }
    }

    /// Marks the action completed. Returns false when the action already
    /// reached a terminal phase, in which case nothing happens.
    pub fn complete(&self, action_id: &Uuid) -> bool {
        let won = match self.actions.get_mut(action_id) {
            Some(mut action) if action.phase == SagaPhase::Running => {
                action.phase = SagaPhase::Completed;
                action.compensations.clear();
                true
            }
            _ => false,
        };
        if won {
            log::debug!("saga action {} completed", action_id);
            emit(&self.notifier, ExchangeEvent::SagaCompleted {
                action_id: *action_id,
            });
        }
        won
    }

    /// Runs the registered compensations in reverse registration order.
    /// Returns false when the action already reached a terminal phase.
    pub async fn compensate(&self, action_id: &Uuid) -> bool {
        // Claim the terminal phase first; the map guard must not be held
        // across the compensation dispatches.
        let compensations = match self.actions.get_mut(action_id) {
            Some(mut action) if action.phase == SagaPhase::Running => {
                action.phase = SagaPhase::Compensated;
                std::mem::take(&mut action.compensations)
            }
            _ => return false,
        };
        for (compensation, snapshot) in compensations.into_iter().rev() {
            let mut exchange = snapshot;
            dispatch(compensation.as_ref(), &mut exchange).await;
            if let Some(error) = exchange.exception() {
                log::warn!(
                    "compensation '{}' for saga action {} failed: {}",
                    compensation.name(),
                    action_id,
                    error
                );
            }
        }
        emit(&self.notifier, ExchangeEvent::SagaCompensated {
            action_id: *action_id,
        });
        true
    }

    /// Compensates the action when `timeout` elapses before an explicit
    /// completion; a no-op when the action finished in time.
    pub fn schedule_timeout(self: &Arc<Self>, action_id: Uuid, timeout: Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if coordinator.compensate(&action_id).await {
                log::warn!("saga action {} timed out and was compensated", action_id);
            }
        });
    }
}

impl Default for SagaCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scopes a processor to a saga: joins or starts the logical action per the
/// propagation mode, registers its compensation, and triggers completion or
/// compensation from the processing outcome.
pub struct SagaProcessor {
    coordinator: Arc<SagaCoordinator>,
    inner: SharedProcessor,
    compensation: Option<SharedProcessor>,
    propagation: SagaPropagation,
    completion: SagaCompletionMode,
    timeout: Option<Duration>,
}

impl SagaProcessor {
    pub fn new(coordinator: Arc<SagaCoordinator>, inner: SharedProcessor) -> Self {
        Self {
            coordinator,
            inner,
            compensation: None,
            propagation: SagaPropagation::RequiresNew,
            completion: SagaCompletionMode::Auto,
            timeout: None,
        }
    }

    pub fn compensation(mut self, compensation: SharedProcessor) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn propagation(mut self, propagation: SagaPropagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn completion(mut self, completion: SagaCompletionMode) -> Self {
        self.completion = completion;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Processor for SagaProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let existing = exchange.property::<Uuid>(names::SAGA_ACTION_ID).copied();

        let (action_id, owner) = match self.propagation {
            SagaPropagation::RequiresNew => (self.coordinator.begin(), true),
            SagaPropagation::Mandatory => match existing {
                Some(id) => (id, false),
                None => {
                    return Err(ProcessingError::saga(
                        "mandatory saga propagation requires an active saga",
                    ));
                }
            },
            SagaPropagation::Supports => match existing {
                Some(id) => (id, false),
                None => {
                    dispatch(self.inner.as_ref(), exchange).await;
                    return Ok(());
                }
            },
            SagaPropagation::NotSupported => {
                exchange.properties_mut().remove(names::SAGA_ACTION_ID);
                dispatch(self.inner.as_ref(), exchange).await;
                if let Some(id) = existing {
                    exchange.set_property(names::SAGA_ACTION_ID, id);
                }
                return Ok(());
            }
        };

        exchange.set_property(names::SAGA_ACTION_ID, action_id);
        if owner {
            if let Some(timeout) = self.timeout {
                self.coordinator.schedule_timeout(action_id, timeout);
            }
        }
        if let Some(compensation) = &self.compensation {
            self.coordinator
                .register_compensation(&action_id, compensation.clone(), exchange.copy())?;
        }

        dispatch(self.inner.as_ref(), exchange).await;

        if exchange.is_failed() {
            self.coordinator.compensate(&action_id).await;
        } else if owner && self.completion == SagaCompletionMode::Auto {
            self.coordinator.complete(&action_id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "saga"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::pipeline::Pipeline;
    use crate::processor::processor;
    use std::sync::Mutex;

    fn recording(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> SharedProcessor {
        processor(tag, move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[tokio::test]
    async fn auto_completion_discards_compensations() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Arc::new(SagaCoordinator::new());
        let saga = SagaProcessor::new(coordinator.clone(), processor("work", |_| Ok(())))
            .compensation(recording(ran.clone(), "undo"));
        let mut exchange = Exchange::with_body("order");
        dispatch(&saga, &mut exchange).await;

        assert!(!exchange.is_failed());
        assert!(ran.lock().unwrap().is_empty());
        let action_id = exchange.property::<Uuid>(names::SAGA_ACTION_ID).unwrap();
        assert_eq!(coordinator.phase(action_id), Some(SagaPhase::Completed));
    }

    #[tokio::test]
    async fn failure_compensates_in_reverse_registration_order() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Arc::new(SagaCoordinator::new());

        let participant: SharedProcessor = Arc::new(
            SagaProcessor::new(coordinator.clone(), processor("reserve", |_| Ok(())))
                .propagation(SagaPropagation::Supports)
                .compensation(recording(ran.clone(), "cancel-reservation")),
        );
        let failing = processor("charge", |_| {
            Err(ProcessingError::processing("card declined"))
        });
        let saga = SagaProcessor::new(
            coordinator.clone(),
            Arc::new(Pipeline::new(vec![participant, failing])),
        )
        .compensation(recording(ran.clone(), "cancel-order"));

        let mut exchange = Exchange::with_body("order");
        dispatch(&saga, &mut exchange).await;

        assert!(exchange.is_failed());
        assert_eq!(
            *ran.lock().unwrap(),
            vec!["cancel-reservation", "cancel-order"]
        );
        let action_id = exchange.property::<Uuid>(names::SAGA_ACTION_ID).unwrap();
        assert_eq!(coordinator.phase(action_id), Some(SagaPhase::Compensated));
    }

    #[tokio::test]
    async fn mandatory_requires_an_active_saga() {
        let coordinator = Arc::new(SagaCoordinator::new());
        let saga = SagaProcessor::new(coordinator, processor("work", |_| Ok(())))
            .propagation(SagaPropagation::Mandatory);
        let mut exchange = Exchange::with_body("order");
        dispatch(&saga, &mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(
            exchange.exception().unwrap().kind(),
            crate::error::ErrorKind::Saga
        );
    }

    #[tokio::test]
    async fn not_supported_runs_outside_the_saga_context() {
        let coordinator = Arc::new(SagaCoordinator::new());
        let action_id = coordinator.begin();
        let saga = SagaProcessor::new(
            coordinator,
            processor("outside", |exchange| {
                assert!(exchange.property::<Uuid>(names::SAGA_ACTION_ID).is_none());
                Ok(())
            }),
        )
        .propagation(SagaPropagation::NotSupported);

        let mut exchange = Exchange::with_body("order");
        exchange.set_property(names::SAGA_ACTION_ID, action_id);
        dispatch(&saga, &mut exchange).await;
        assert!(!exchange.is_failed());
        // Context restored after the scoped work.
        assert_eq!(
            exchange.property::<Uuid>(names::SAGA_ACTION_ID),
            Some(&action_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_compensates_unfinished_actions_once() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Arc::new(SagaCoordinator::new());
        let saga = SagaProcessor::new(coordinator.clone(), processor("work", |_| Ok(())))
            .completion(SagaCompletionMode::Manual)
            .compensation(recording(ran.clone(), "undo"))
            .timeout(Duration::from_millis(100));

        let mut exchange = Exchange::with_body("order");
        dispatch(&saga, &mut exchange).await;
        let action_id = *exchange.property::<Uuid>(names::SAGA_ACTION_ID).unwrap();
        assert_eq!(coordinator.phase(&action_id), Some(SagaPhase::Running));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coordinator.phase(&action_id), Some(SagaPhase::Compensated));
        assert_eq!(*ran.lock().unwrap(), vec!["undo"]);

        // The race is settled: a late completion signal loses and is a no-op.
        assert!(!coordinator.complete(&action_id));
        assert_eq!(*ran.lock().unwrap(), vec!["undo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_beats_the_timeout() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Arc::new(SagaCoordinator::new());
        let saga = SagaProcessor::new(coordinator.clone(), processor("work", |_| Ok(())))
            .completion(SagaCompletionMode::Manual)
            .compensation(recording(ran.clone(), "undo"))
            .timeout(Duration::from_millis(100));

        let mut exchange = Exchange::with_body("order");
        dispatch(&saga, &mut exchange).await;
        let action_id = *exchange.property::<Uuid>(names::SAGA_ACTION_ID).unwrap();
        assert!(coordinator.complete(&action_id));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coordinator.phase(&action_id), Some(SagaPhase::Completed));
        assert!(ran.lock().unwrap().is_empty());
    }
}
