//! Base state machine - state tables, drive loop, result emission
//!
//! Each strategy declares its states as an enum implementing
//! [`StrategyState`] and its behaviour as a [`StrategyMachine`]. The drive
//! loop dispatches on the current state until a terminal state is reached:
//!
//! ```text
//! loop {
//!     cancelled?         -> Cancelled
//!     handle(state)      -> Err => Error
//!     yield
//!     deadline passed?   -> Error
//! }
//! ```

pub mod context;
pub mod result;

use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{error, info, warn};

use crate::core::{Error, Result};

pub use context::{CancelHandle, ContextSettings, StrategyContext};
pub use result::{
    ArbitrageMetrics, Escalation, ExitReason, HedgeMetrics, MarketMakingMetrics, MetricExtension,
    SpreadDirection, SpreadMetrics, StrategyMetrics, StrategyOutcome, StrategyResult,
    UnwindOutcome, UnwindPolicy,
};

/// A strategy's finite state set and its transition table.
pub trait StrategyState: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    const INITIAL: Self;
    const COMPLETED: Self;
    const ERROR: Self;
    const CANCELLED: Self;

    fn name(self) -> &'static str;

    /// Declared successors. Error and Cancelled are reachable from every
    /// non-terminal state without being listed.
    fn successors(self) -> &'static [Self];

    fn all() -> &'static [Self];

    fn is_terminal(self) -> bool {
        self == Self::COMPLETED || self == Self::ERROR || self == Self::CANCELLED
    }

    fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::ERROR || next == Self::CANCELLED || self.successors().contains(&next)
    }
}

#[async_trait]
pub trait StrategyMachine: Send {
    type State: StrategyState;

    fn context(&self) -> &StrategyContext<Self::State>;

    fn context_mut(&mut self) -> &mut StrategyContext<Self::State>;

    /// Run the handler for `state`. Handlers move the machine on with
    /// `context_mut().transition_to(..)`.
    async fn handle(&mut self, state: Self::State) -> Result<()>;

    /// Figures reported in the final result.
    fn outcome(&self) -> StrategyOutcome;

    /// Cleanup once a terminal state is reached (resting orders etc).
    async fn on_terminal(&mut self) {}

    /// One drive-loop iteration. Returns whether the machine is still live.
    async fn step(&mut self) -> Result<bool> {
        if self.context().result_emitted() {
            return Err(Error::AlreadyFinished);
        }
        if self.context().is_terminal() {
            return Ok(false);
        }

        if self.context().cancel_handle().is_cancelled() {
            warn!(strategy_id = %self.context().strategy_id(), "🛑 cancel requested");
            self.context_mut()
                .force(Self::State::CANCELLED, "cancel requested");
            return Ok(false);
        }

        let state = self.context().state();
        self.context_mut().begin_handler();
        if let Err(err) = self.handle(state).await {
            if err.requires_escalation() {
                error!(strategy_id = %self.context().strategy_id(), "🚨 ESCALATION: {}", err);
            } else {
                warn!(strategy_id = %self.context().strategy_id(), "handler {} failed: {}", state.name(), err);
            }
            let ctx = self.context_mut();
            ctx.record_error(&err);
            ctx.force(Self::State::ERROR, "handler error");
        }

        tokio::task::yield_now().await;

        let ctx = self.context_mut();
        if !ctx.is_terminal() && ctx.is_timeout() {
            let err = Error::Timeout(format!(
                "{} exceeded {}ms in {}",
                ctx.strategy_id(),
                ctx.max_execution_time().as_millis(),
                ctx.state().name()
            ));
            warn!(strategy_id = %ctx.strategy_id(), "⏰ {}", err);
            ctx.record_error(&err);
            ctx.force(Self::State::ERROR, "execution deadline exceeded");
        }

        Ok(!self.context().is_terminal())
    }

    /// Drive to a terminal state and emit the result. A second call returns
    /// [`Error::AlreadyFinished`].
    async fn run_cycle(&mut self) -> Result<StrategyResult> {
        if self.context().result_emitted() {
            return Err(Error::AlreadyFinished);
        }
        info!(
            strategy_id = %self.context().strategy_id(),
            "▶️ {} starting in {}",
            self.context().strategy_type(),
            self.context().state().name()
        );

        while self.step().await? {}

        self.on_terminal().await;
        let result = self.build_result();
        self.context_mut().mark_result_emitted();

        if result.success {
            info!(
                strategy_id = %result.strategy_id,
                "✅ {} completed: net pnl {} in {}ms",
                result.strategy_type,
                result.net_pnl(),
                result.execution_time_ms
            );
        } else {
            warn!(
                strategy_id = %result.strategy_id,
                "❌ {} ended in {}: {}",
                result.strategy_type,
                result.final_state,
                result.error.as_deref().unwrap_or("-")
            );
        }
        Ok(result)
    }

    fn build_result(&self) -> StrategyResult {
        let ctx = self.context();
        let outcome = self.outcome();
        StrategyResult {
            strategy_id: ctx.strategy_id().to_string(),
            strategy_type: ctx.strategy_type().to_string(),
            success: ctx.state() == Self::State::COMPLETED && outcome.escalation.is_none(),
            final_state: ctx.state().name().to_string(),
            realized_pnl: outcome.realized_pnl,
            unrealized_pnl: outcome.unrealized_pnl,
            fees: outcome.fees,
            orders_executed: outcome.orders_executed,
            state_transitions: ctx.transition_count(),
            execution_time_ms: ctx.execution_time().as_millis() as u64,
            error: ctx.last_error().map(str::to_string),
            error_severity: ctx.last_severity(),
            escalation: outcome.escalation,
            metrics: outcome.metrics,
            extension: outcome.extension,
            performance: ctx.recorder().summary(),
        }
    }
}

/// Object-safe handle an orchestrator drives without knowing the state type.
#[async_trait]
pub trait StrategyRunner: Send {
    fn strategy_id(&self) -> &str;
    fn strategy_type(&self) -> &'static str;
    fn state_name(&self) -> &'static str;
    fn cancel_handle(&self) -> CancelHandle;
    async fn run(&mut self) -> Result<StrategyResult>;
}

#[async_trait]
impl<M: StrategyMachine> StrategyRunner for M {
    fn strategy_id(&self) -> &str {
        self.context().strategy_id()
    }

    fn strategy_type(&self) -> &'static str {
        self.context().strategy_type()
    }

    fn state_name(&self) -> &'static str {
        self.context().state().name()
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.context().cancel_handle()
    }

    async fn run(&mut self) -> Result<StrategyResult> {
        self.run_cycle().await
    }
}

/// Every state reachable from `S::INITIAL` through the declared table.
pub fn reachable_states<S: StrategyState>() -> Vec<S> {
    let mut seen = vec![S::INITIAL];
    let mut frontier = vec![S::INITIAL];
    while let Some(state) = frontier.pop() {
        if state.is_terminal() {
            continue;
        }
        let implicit = [S::ERROR, S::CANCELLED];
        for &next in state.successors().iter().chain(implicit.iter()) {
            if !seen.contains(&next) {
                seen.push(next);
                frontier.push(next);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Toy {
        Start,
        Work,
        Completed,
        Error,
        Cancelled,
    }

    impl StrategyState for Toy {
        const INITIAL: Self = Toy::Start;
        const COMPLETED: Self = Toy::Completed;
        const ERROR: Self = Toy::Error;
        const CANCELLED: Self = Toy::Cancelled;

        fn name(self) -> &'static str {
            match self {
                Toy::Start => "Start",
                Toy::Work => "Work",
                Toy::Completed => "Completed",
                Toy::Error => "Error",
                Toy::Cancelled => "Cancelled",
            }
        }

        fn successors(self) -> &'static [Self] {
            match self {
                Toy::Start => &[Toy::Work],
                Toy::Work => &[Toy::Work, Toy::Completed],
                _ => &[],
            }
        }

        fn all() -> &'static [Self] {
            &[Toy::Start, Toy::Work, Toy::Completed, Toy::Error, Toy::Cancelled]
        }
    }

    enum Behaviour {
        Finish,
        Stall(Duration),
        Fail,
        Illegal,
        Loop,
    }

    struct ToyMachine {
        ctx: StrategyContext<Toy>,
        behaviour: Behaviour,
    }

    impl ToyMachine {
        fn new(behaviour: Behaviour, max_ms: u64) -> Self {
            Self {
                ctx: StrategyContext::new(
                    "toy",
                    ContextSettings {
                        strategy_id: "toy-1".into(),
                        max_execution_time: Duration::from_millis(max_ms),
                        max_error_count: 2,
                        transition_sla: Duration::from_millis(1),
                    },
                ),
                behaviour,
            }
        }
    }

    #[async_trait]
    impl StrategyMachine for ToyMachine {
        type State = Toy;

        fn context(&self) -> &StrategyContext<Toy> {
            &self.ctx
        }

        fn context_mut(&mut self) -> &mut StrategyContext<Toy> {
            &mut self.ctx
        }

        async fn handle(&mut self, state: Toy) -> Result<()> {
            match (state, &self.behaviour) {
                (Toy::Start, Behaviour::Illegal) => self.ctx.transition_to(Toy::Completed, "skip"),
                (Toy::Start, _) => self.ctx.transition_to(Toy::Work, "go"),
                (Toy::Work, Behaviour::Finish) => self.ctx.transition_to(Toy::Completed, "done"),
                (Toy::Work, Behaviour::Stall(d)) => {
                    tokio::time::sleep(*d).await;
                    self.ctx.transition_to(Toy::Completed, "done late")
                }
                (Toy::Work, Behaviour::Fail) => Err(Error::Strategy("boom".into())),
                (Toy::Work, Behaviour::Loop) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn outcome(&self) -> StrategyOutcome {
            StrategyOutcome {
                realized_pnl: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                fees: Decimal::ZERO,
                orders_executed: 0,
                metrics: StrategyMetrics::Arbitrage(ArbitrageMetrics::default()),
                extension: None,
                escalation: None,
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        assert!(!Toy::Completed.can_transition_to(Toy::Error));
        assert!(Toy::Start.can_transition_to(Toy::Cancelled));
        assert!(!Toy::Start.can_transition_to(Toy::Completed));
        assert_eq!(reachable_states::<Toy>().len(), Toy::all().len());
    }

    #[tokio::test]
    async fn test_happy_path_emits_result_once() {
        let mut m = ToyMachine::new(Behaviour::Finish, 1_000);
        let result = m.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.final_state, "Completed");
        assert_eq!(result.state_transitions, 2);
        assert_eq!(m.ctx.history(), &[Toy::Start, Toy::Work, Toy::Completed]);

        assert!(matches!(m.run_cycle().await, Err(Error::AlreadyFinished)));
    }

    #[tokio::test]
    async fn test_stall_past_deadline_ends_in_error() {
        let mut m = ToyMachine::new(Behaviour::Stall(Duration::from_millis(60)), 30);
        let result = m.run_cycle().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.final_state, "Error");
        assert!(!m.ctx.history().contains(&Toy::Completed));
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_looping_handler_is_stopped_by_deadline() {
        let mut m = ToyMachine::new(Behaviour::Loop, 40);
        let result = m.run_cycle().await.unwrap();
        assert_eq!(result.final_state, "Error");
        assert!(result.execution_time_ms >= 40);
    }

    #[tokio::test]
    async fn test_handler_error_forces_error_state() {
        let mut m = ToyMachine::new(Behaviour::Fail, 1_000);
        let result = m.run_cycle().await.unwrap();
        assert_eq!(result.final_state, "Error");
        assert_eq!(result.error.as_deref(), Some("strategy error: boom"));
        assert_eq!(m.ctx.error_count(), 1);
    }

    #[tokio::test]
    async fn test_undeclared_transition_is_rejected() {
        let mut m = ToyMachine::new(Behaviour::Illegal, 1_000);
        let result = m.run_cycle().await.unwrap();
        assert_eq!(result.final_state, "Error");
        assert!(result.error.unwrap().contains("invalid transition Start -> Completed"));
    }

    #[tokio::test]
    async fn test_cancel_handle_stops_machine() {
        let mut m = ToyMachine::new(Behaviour::Loop, 5_000);
        let handle = m.cancel_handle();
        assert!(m.step().await.unwrap());
        handle.cancel();
        assert!(!m.step().await.unwrap());
        assert_eq!(m.ctx.state(), Toy::Cancelled);
    }

    #[test]
    fn test_tolerate_respects_error_budget() {
        let mut m = ToyMachine::new(Behaviour::Finish, 1_000);
        assert!(m.ctx.tolerate(Error::MarketData("stale".into())).is_ok());
        assert!(m.ctx.tolerate(Error::MarketData("stale".into())).is_ok());
        assert!(m.ctx.tolerate(Error::MarketData("stale".into())).is_err());
        assert!(m.ctx.tolerate(Error::Strategy("fatal".into())).is_err());
    }
}
