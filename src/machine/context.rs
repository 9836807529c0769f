//! Per-instance context: state, timing, error budget, transition history

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::{Error, Result, Severity};
use crate::machine::StrategyState;
use crate::perf::PerformanceRecorder;

/// Cooperative cancellation flag shared with the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Identity and limits of one instance.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub strategy_id: String,
    pub max_execution_time: Duration,
    pub max_error_count: u32,
    pub transition_sla: Duration,
}

/// Mutable state of one running strategy instance.
///
/// Owned by its machine and written only from the machine's drive loop.
#[derive(Debug)]
pub struct StrategyContext<S: StrategyState> {
    strategy_id: String,
    strategy_type: &'static str,
    state: S,
    started_at: Instant,
    ended_at: Option<Instant>,
    handler_started: Instant,
    transition_count: u32,
    error_count: u32,
    max_error_count: u32,
    max_execution_time: Duration,
    last_error: Option<String>,
    last_severity: Option<Severity>,
    history: Vec<S>,
    result_emitted: bool,
    cancel: CancelHandle,
    recorder: PerformanceRecorder,
}

impl<S: StrategyState> StrategyContext<S> {
    pub fn new(strategy_type: &'static str, settings: ContextSettings) -> Self {
        let now = Instant::now();
        Self {
            strategy_id: settings.strategy_id,
            strategy_type,
            state: S::INITIAL,
            started_at: now,
            ended_at: None,
            handler_started: now,
            transition_count: 0,
            error_count: 0,
            max_error_count: settings.max_error_count,
            max_execution_time: settings.max_execution_time,
            last_error: None,
            last_severity: None,
            history: vec![S::INITIAL],
            result_emitted: false,
            cancel: CancelHandle::new(),
            recorder: PerformanceRecorder::new(settings.transition_sla),
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn strategy_type(&self) -> &'static str {
        self.strategy_type
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Visited states, initial state first.
    pub fn history(&self) -> &[S] {
        &self.history
    }

    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_severity(&self) -> Option<Severity> {
        self.last_severity
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut PerformanceRecorder {
        &mut self.recorder
    }

    pub fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    /// Elapsed run time, frozen once a terminal state is reached.
    pub fn execution_time(&self) -> Duration {
        match self.ended_at {
            Some(end) => end.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.execution_time() >= self.max_execution_time
    }

    /// Time left before the whole-instance deadline.
    pub fn remaining(&self) -> Duration {
        self.max_execution_time.saturating_sub(self.execution_time())
    }

    /// Wall-clock instant at which the instance times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.checked_add(self.max_execution_time)
    }

    /// `wanted`, cut down to what is left of the deadline.
    pub fn bounded(&self, wanted: Duration) -> Duration {
        wanted.min(self.remaining())
    }

    pub(crate) fn begin_handler(&mut self) {
        self.handler_started = Instant::now();
    }

    pub(crate) fn result_emitted(&self) -> bool {
        self.result_emitted
    }

    pub(crate) fn mark_result_emitted(&mut self) {
        self.result_emitted = true;
    }

    /// Move to `next` if the state table allows it.
    ///
    /// Past the deadline every transition other than to Error or Cancelled
    /// is redirected to Error and reported as a timeout.
    pub fn transition_to(&mut self, next: S, reason: &str) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: from.name(),
                to: next.name(),
            });
        }

        if self.is_timeout() && next != S::ERROR && next != S::CANCELLED {
            let elapsed = self.execution_time();
            self.commit(S::ERROR, "execution deadline exceeded");
            return Err(Error::Timeout(format!(
                "{} ran {}ms of {}ms before entering {}",
                self.strategy_id,
                elapsed.as_millis(),
                self.max_execution_time.as_millis(),
                next.name()
            )));
        }

        self.commit(next, reason);
        Ok(())
    }

    /// Enter a terminal failure state from anywhere non-terminal.
    pub(crate) fn force(&mut self, terminal: S, reason: &str) {
        if !self.state.is_terminal() {
            self.commit(terminal, reason);
        }
    }

    fn commit(&mut self, next: S, reason: &str) {
        let from = self.state;
        let handler_latency = self.handler_started.elapsed();
        self.recorder
            .record_transition(from.name(), next.name(), reason, handler_latency);

        self.state = next;
        self.transition_count += 1;
        self.history.push(next);
        if next.is_terminal() {
            self.ended_at = Some(Instant::now());
        }

        debug!(
            strategy_id = %self.strategy_id,
            from = from.name(),
            to = next.name(),
            "{}",
            reason
        );
    }

    /// Remember an error that ends the instance.
    pub fn record_error(&mut self, err: &Error) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
        self.last_severity = Some(err.severity());
    }

    /// Absorb a recoverable handler error, or hand it back when it is not
    /// recoverable or the error budget is spent.
    pub fn tolerate(&mut self, err: Error) -> Result<()> {
        if err.severity() != Severity::Recoverable {
            return Err(err);
        }
        self.error_count += 1;
        self.last_error = Some(err.to_string());
        if self.error_count > self.max_error_count {
            return Err(err);
        }
        warn!(
            strategy_id = %self.strategy_id,
            "recoverable error {}/{}: {}",
            self.error_count,
            self.max_error_count,
            err
        );
        Ok(())
    }
}
