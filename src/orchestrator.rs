//! Drives report instances forward and rebuilds them from history.
//!
//! Every live instance gets one driver task. A driver loops over
//! [`InstanceState::decide`]: it records scheduling and completion decisions
//! in the event log, runs activities through the [`ActivityExecutor`], and
//! parks on the instance's wake-up notifier while a decision is pending.
//!
//! All writes for an instance (driver, signals, cancellation) go through the
//! instance's state mutex and the store's sequence check, and in-memory state
//! is only advanced after the store has acknowledged the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::error::{ActivityError, EngineError, StateError};
use crate::executor::ActivityExecutor;
use crate::history::{Event, EventKind, EventLogStore};
use crate::types::{InstanceSnapshot, Outcome, Step, UserDecision};
use crate::workflow::{
    CANCELLED_REASON, Command, InstanceState, ScheduledActivity, WorkflowSettings, validate_output,
};

/// Pause before retrying a store operation that failed as unavailable.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Runtime handle for one instance.
struct InstanceHandle {
    id: String,
    state: Mutex<InstanceState>,
    snapshot: watch::Sender<InstanceSnapshot>,
    /// Woken on every signal delivery.
    wake: Notify,
    cancel: CancellationToken,
}

impl InstanceHandle {
    fn publish(&self, state: &InstanceState) {
        self.snapshot.send_replace(state.snapshot());
    }
}

/// Result of [`Orchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Unfinished instances whose drivers were restarted.
    pub resumed: usize,
    /// Instances whose history could not be rebuilt.
    pub skipped: Vec<(String, EngineError)>,
}

enum Next {
    Continue,
    Halt,
}

struct Inner {
    store: Arc<dyn EventLogStore>,
    executor: Arc<ActivityExecutor>,
    settings: WorkflowSettings,
    instances: Mutex<HashMap<String, Arc<InstanceHandle>>>,
    shutdown: CancellationToken,
    drivers: TaskTracker,
}

/// Owns live instances and their driver tasks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        executor: Arc<ActivityExecutor>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                settings,
                instances: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                drivers: TaskTracker::new(),
            }),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.inner.settings
    }

    /// Start a new instance under a generated id.
    pub async fn start_instance(&self, prompt: impl Into<String>) -> Result<String, EngineError> {
        let instance_id = format!("report-{}", uuid::Uuid::new_v4());
        self.start_instance_with_id(&instance_id, prompt).await?;
        Ok(instance_id)
    }

    /// Start a new instance under a caller-chosen id. Fails with
    /// `AlreadyExists` if the id has any history.
    pub async fn start_instance_with_id(
        &self,
        instance_id: &str,
        prompt: impl Into<String>,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let mut instances = inner.instances.lock().await;
        if instances.contains_key(instance_id) {
            return Err(StateError::AlreadyExists(instance_id.to_string()).into());
        }

        let kind = EventKind::InstanceStarted {
            prompt: prompt.into(),
            model: inner.settings.model.clone(),
            created_at: Utc::now(),
        };
        let event = match inner.store.append(instance_id, 0, kind).await {
            Ok(event) => event,
            Err(e) if e.is_conflict() => {
                return Err(StateError::AlreadyExists(instance_id.to_string()).into());
            }
            Err(e) => return Err(e),
        };

        let state = InstanceState::replay(instance_id, std::slice::from_ref(&event))?;
        tracing::info!(%instance_id, model = %state.model, "instance started");
        inner.install(&mut instances, state);
        Ok(())
    }

    /// Deliver an operator decision. Signals for terminal instances are
    /// ignored.
    pub async fn send_signal(
        &self,
        instance_id: &str,
        signal: UserDecision,
    ) -> Result<(), EngineError> {
        let handle = self.inner.touch(instance_id).await?;
        let mut state = handle.state.lock().await;
        if state.is_terminal() {
            tracing::warn!(
                %instance_id,
                decision = %signal.decision,
                "ignoring signal for finished instance"
            );
            return Ok(());
        }

        tracing::info!(%instance_id, decision = %signal.decision, "signal received");
        let recorded = self
            .inner
            .commit_with_retry(&handle, &mut state, EventKind::SignalReceived { signal }, |s| {
                !s.is_terminal()
            })
            .await?;
        drop(state);

        if recorded.is_some() {
            handle.wake.notify_one();
        }
        Ok(())
    }

    /// Latest snapshot of an instance. Never blocks on a running activity.
    pub async fn query_state(&self, instance_id: &str) -> Result<InstanceSnapshot, EngineError> {
        let handle = self.inner.touch(instance_id).await?;
        let snapshot = handle.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Full event history of an instance.
    pub async fn history(&self, instance_id: &str) -> Result<Vec<Event>, EngineError> {
        self.inner.touch(instance_id).await?;
        self.inner.store.read_all(instance_id).await
    }

    /// Wait until the instance reaches a terminal state.
    pub async fn await_result(&self, instance_id: &str) -> Result<Outcome, EngineError> {
        let handle = self.inner.touch(instance_id).await?;
        let mut rx = handle.snapshot.subscribe();
        loop {
            let result = rx.borrow_and_update().result.clone();
            if let Some(outcome) = result {
                return Ok(outcome);
            }
            tokio::select! {
                changed = rx.changed() => changed.map_err(|_| EngineError::ShuttingDown)?,
                _ = self.inner.shutdown.cancelled() => return Err(EngineError::ShuttingDown),
            }
        }
    }

    /// Wait until the instance holds research newer than round
    /// `seen_rounds` and is waiting for a decision, or until it finishes.
    pub async fn next_decision_point(
        &self,
        instance_id: &str,
        seen_rounds: u32,
    ) -> Result<InstanceSnapshot, EngineError> {
        let handle = self.inner.touch(instance_id).await?;
        let mut rx = handle.snapshot.subscribe();
        let ready = |s: &InstanceSnapshot| {
            s.is_terminal() || (s.step == Step::AwaitingDecision && s.research_rounds > seen_rounds)
        };
        tokio::select! {
            snapshot = rx.wait_for(ready) => snapshot
                .map(|s| InstanceSnapshot::clone(&s))
                .map_err(|_| EngineError::ShuttingDown),
            _ = self.inner.shutdown.cancelled() => Err(EngineError::ShuttingDown),
        }
    }

    /// Fail the instance with reason "cancelled". An activity already in
    /// flight runs to completion but its result is discarded.
    pub async fn cancel(&self, instance_id: &str) -> Result<(), EngineError> {
        let handle = self.inner.touch(instance_id).await?;
        let mut state = handle.state.lock().await;
        if !state.is_terminal() {
            let kind = EventKind::InstanceCompleted {
                outcome: Outcome::failed(CANCELLED_REASON),
            };
            self.inner
                .commit_with_retry(&handle, &mut state, kind, |s| !s.is_terminal())
                .await?;
            tracing::info!(%instance_id, "instance cancelled");
        }
        drop(state);

        handle.cancel.cancel();
        handle.wake.notify_one();
        Ok(())
    }

    /// Rebuild every instance found in the store and resume the unfinished
    /// ones. An instance whose history cannot be rebuilt is skipped and
    /// reported; the others still resume.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let ids = self.inner.store.list_instances().await?;
        let mut report = RecoveryReport::default();
        for id in ids {
            match self.inner.touch(&id).await {
                Ok(handle) => {
                    if !handle.snapshot.borrow().is_terminal() {
                        report.resumed += 1;
                    }
                }
                Err(EngineError::ShuttingDown) => return Err(EngineError::ShuttingDown),
                Err(e) => {
                    tracing::error!(
                        instance_id = %id,
                        error = %e,
                        "skipping instance that cannot be rebuilt"
                    );
                    report.skipped.push((id, e));
                }
            }
        }
        tracing::info!(
            resumed = report.resumed,
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Stop all drivers and activity tasks without recording anything,
    /// including activities left running by `cancel`. History is left
    /// exactly as a crash would leave it.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.drivers.close();
        self.inner.drivers.wait().await;
        tracing::info!("orchestrator stopped");
    }
}

impl Inner {
    /// Handle for `instance_id`, rebuilding it from history on first touch.
    async fn touch(
        self: &Arc<Self>,
        instance_id: &str,
    ) -> Result<Arc<InstanceHandle>, EngineError> {
        let mut instances = self.instances.lock().await;
        if let Some(handle) = instances.get(instance_id) {
            return Ok(Arc::clone(handle));
        }
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let events = self.store.read_all(instance_id).await?;
        if events.is_empty() {
            return Err(StateError::NotFound(instance_id.to_string()).into());
        }
        let state = InstanceState::replay(instance_id, &events)?;
        tracing::info!(
            %instance_id,
            events = events.len(),
            step = ?state.step,
            in_flight = state.in_flight.is_some(),
            "instance rebuilt from history"
        );
        Ok(self.install(&mut instances, state))
    }

    fn install(
        self: &Arc<Self>,
        instances: &mut HashMap<String, Arc<InstanceHandle>>,
        state: InstanceState,
    ) -> Arc<InstanceHandle> {
        let (snapshot, _) = watch::channel(state.snapshot());
        let terminal = state.is_terminal();
        let handle = Arc::new(InstanceHandle {
            id: state.instance_id.clone(),
            state: Mutex::new(state),
            snapshot,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });
        instances.insert(handle.id.clone(), Arc::clone(&handle));

        if !terminal {
            let span = tracing::info_span!("instance", instance_id = %handle.id);
            self.drivers
                .spawn(Arc::clone(self).drive(Arc::clone(&handle)).instrument(span));
        }
        handle
    }

    async fn drive(self: Arc<Self>, handle: Arc<InstanceHandle>) {
        tracing::debug!("driver started");
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.step(&handle).await {
                Ok(Next::Continue) => {}
                Ok(Next::Halt) => break,
                Err(EngineError::Store(e)) => {
                    tracing::warn!(error = %e, "store unavailable, retrying");
                    if !self.pause().await {
                        return;
                    }
                }
                Err(EngineError::State(e)) => {
                    tracing::error!(error = %e, "driver failed, recording instance failure");
                    self.fail_instance(&handle, format!("internal error: {e}")).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "driver stopped");
                    return;
                }
            }
        }
        tracing::debug!("driver finished");
    }

    /// Record a terminal failure so the instance does not hang unfinished.
    async fn fail_instance(&self, handle: &InstanceHandle, reason: String) {
        let kind = EventKind::InstanceCompleted {
            outcome: Outcome::failed(reason),
        };
        loop {
            let mut state = handle.state.lock().await;
            match self
                .commit_with_retry(handle, &mut state, kind.clone(), |s| !s.is_terminal())
                .await
            {
                Ok(_) => return,
                Err(EngineError::Store(e)) => {
                    drop(state);
                    tracing::warn!(error = %e, "failed to record instance failure, retrying");
                    if !self.pause().await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "could not record instance failure");
                    return;
                }
            }
        }
    }

    async fn step(&self, handle: &InstanceHandle) -> Result<Next, EngineError> {
        enum Action {
            Wait,
            Run(ScheduledActivity),
        }

        let action = {
            let mut state = handle.state.lock().await;
            match state.decide(&self.settings) {
                Command::Halt => return Ok(Next::Halt),
                Command::AwaitSignal => Action::Wait,
                Command::Dispatch(scheduled) => Action::Run(scheduled),
                Command::Schedule(invocation) => {
                    let name = invocation.name.clone();
                    let kind = EventKind::ActivityScheduled { invocation };
                    return match self.commit(handle, &mut state, kind).await {
                        Ok(event) => {
                            tracing::info!(activity = %name, seq = event.seq, "activity scheduled");
                            Ok(Next::Continue)
                        }
                        // State has caught up; decide again.
                        Err(e) if e.is_conflict() => Ok(Next::Continue),
                        Err(e) => Err(e),
                    };
                }
                Command::Complete(outcome) => {
                    let kind = EventKind::InstanceCompleted {
                        outcome: outcome.clone(),
                    };
                    return match self.commit(handle, &mut state, kind).await {
                        Ok(_) => {
                            match &outcome {
                                Outcome::Succeeded { artifact_id } => {
                                    tracing::info!(%artifact_id, "instance completed");
                                }
                                Outcome::Failed { reason } => {
                                    tracing::warn!(%reason, "instance failed");
                                }
                            }
                            Ok(Next::Continue)
                        }
                        Err(e) if e.is_conflict() => Ok(Next::Continue),
                        Err(e) => Err(e),
                    };
                }
            }
        };

        match action {
            Action::Wait => {
                tracing::debug!("waiting for a decision signal");
                tokio::select! {
                    _ = handle.wake.notified() => {}
                    _ = handle.cancel.cancelled() => {}
                    _ = self.shutdown.cancelled() => return Ok(Next::Halt),
                }
                Ok(Next::Continue)
            }
            Action::Run(scheduled) => self.dispatch(handle, scheduled).await,
        }
    }

    async fn dispatch(
        &self,
        handle: &InstanceHandle,
        scheduled: ScheduledActivity,
    ) -> Result<Next, EngineError> {
        let scheduled_seq = scheduled.scheduled_seq;
        let activity = scheduled.invocation.name.clone();
        tracing::info!(%activity, scheduled_seq, "dispatching activity");

        let executor = Arc::clone(&self.executor);
        let instance_id = handle.id.clone();
        let invocation = scheduled.invocation.clone();
        let shutdown = self.shutdown.clone();
        // Tracked so that shutdown also stops activities detached by cancel.
        let mut task = self.drivers.spawn(
            async move {
                tokio::select! {
                    result = executor.execute(&instance_id, &invocation) => Some(result),
                    _ = shutdown.cancelled() => None,
                }
            }
            .in_current_span(),
        );

        let result = tokio::select! {
            joined = &mut task => match joined {
                Ok(Some(result)) => result,
                Ok(None) => return Ok(Next::Halt),
                Err(e) => Err(ActivityError::Rejected(format!("activity task failed: {e}"))),
            },
            _ = handle.cancel.cancelled() => {
                tracing::info!(%activity, "instance cancelled, in-flight result will be discarded");
                return Ok(Next::Continue);
            }
            _ = self.shutdown.cancelled() => return Ok(Next::Halt),
        };

        let checked = result.and_then(|output| {
            validate_output(&scheduled.invocation, &output)?;
            Ok(output)
        });
        let kind = match checked {
            Ok(output) => EventKind::ActivityCompleted {
                scheduled_seq,
                output,
            },
            Err(error) => {
                tracing::warn!(%activity, %error, "activity failed");
                EventKind::ActivityFailed {
                    scheduled_seq,
                    error,
                }
            }
        };

        let still_in_flight = |s: &InstanceState| {
            s.in_flight.as_ref().map(|a| a.scheduled_seq) == Some(scheduled_seq)
        };
        loop {
            let mut state = handle.state.lock().await;
            match self
                .commit_with_retry(handle, &mut state, kind.clone(), &still_in_flight)
                .await
            {
                Ok(None) => {
                    tracing::debug!(%activity, "discarding result of activity no longer in flight");
                    return Ok(Next::Continue);
                }
                Ok(Some(_)) => return Ok(Next::Continue),
                // Keep the result rather than re-running the activity.
                Err(EngineError::Store(e)) => {
                    drop(state);
                    tracing::warn!(error = %e, "failed to record activity result, retrying");
                    if !self.pause().await {
                        return Ok(Next::Halt);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append `kind` at the state's sequence number and apply it. On a
    /// sequence conflict the state is caught up with the log tail and the
    /// conflict is returned so the caller can reconsider.
    async fn commit(
        &self,
        handle: &InstanceHandle,
        state: &mut InstanceState,
        kind: EventKind,
    ) -> Result<Event, EngineError> {
        match self.store.append(&handle.id, state.last_seq, kind).await {
            Ok(event) => {
                state.apply(&event)?;
                handle.publish(state);
                Ok(event)
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(error = %e, "append conflicted, catching up with the log");
                self.catch_up(handle, state).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Commit, retrying sequence conflicts for as long as `still_wanted`
    /// holds on the caught-up state. `Ok(None)` means the write was dropped.
    async fn commit_with_retry(
        &self,
        handle: &InstanceHandle,
        state: &mut InstanceState,
        kind: EventKind,
        still_wanted: impl Fn(&InstanceState) -> bool,
    ) -> Result<Option<Event>, EngineError> {
        loop {
            if !still_wanted(state) {
                return Ok(None);
            }
            match self.commit(handle, state, kind.clone()).await {
                Ok(event) => return Ok(Some(event)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn catch_up(
        &self,
        handle: &InstanceHandle,
        state: &mut InstanceState,
    ) -> Result<(), EngineError> {
        let tail = self.store.read_after(&handle.id, state.last_seq).await?;
        for event in &tail {
            state.apply(event)?;
        }
        handle.publish(state);
        if !tail.is_empty() {
            // Another writer may have delivered a signal the driver is
            // parked on.
            handle.wake.notify_one();
        }
        Ok(())
    }

    /// Sleep before retrying; `false` if shutdown started meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(STORE_RETRY_DELAY) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}
