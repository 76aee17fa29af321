//! # Saga Orchestrator
//!
//! Drives a totally-ordered sequence of steps, each with a forward action
//! and a compensating action, by reacting to integration events correlated
//! by `correlation_id`. The `OrderCreation` saga (`ReserveInventory` ->
//! `ProcessPayment` -> `ConfirmOrder`) is the concrete instance this crate
//! ships; the state machine and persistence are generic enough to host a
//! second saga type without touching the repository.
//!
//! ## State machine
//!
//! ```text
//! Running --success--> Running (next step) ... --all done--> Completed
//! Running --failure--> Compensating
//! Compensating --run prior compensations in reverse--> Compensated
//! Compensating --compensation itself fails irrecoverably--> Failed
//! ```
//!
//! A saga instance is updated via optimistic concurrency on `version`.
//! Concurrent event deliveries for the same saga serialize by retrying on
//! [`SagaError::VersionConflict`]; idempotency of step advancement is
//! guaranteed by checking `current_step` against the event's referenced
//! step before applying a transition.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

mod error;

pub use error::{SagaError, SagaResult};

/// Steps of the `OrderCreation` saga, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCreationStep {
    ReserveInventory,
    ProcessPayment,
    ConfirmOrder,
}

impl OrderCreationStep {
    pub const ALL: [OrderCreationStep; 3] = [
        OrderCreationStep::ReserveInventory,
        OrderCreationStep::ProcessPayment,
        OrderCreationStep::ConfirmOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderCreationStep::ReserveInventory => "ReserveInventory",
            OrderCreationStep::ProcessPayment => "ProcessPayment",
            OrderCreationStep::ConfirmOrder => "ConfirmOrder",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ReserveInventory" => Some(OrderCreationStep::ReserveInventory),
            "ProcessPayment" => Some(OrderCreationStep::ProcessPayment),
            "ConfirmOrder" => Some(OrderCreationStep::ConfirmOrder),
            _ => None,
        }
    }

    /// The event this step waits for on success.
    pub fn success_event(self) -> &'static str {
        match self {
            OrderCreationStep::ReserveInventory => "InventoryReservationConfirmed",
            OrderCreationStep::ProcessPayment => "PaymentConfirmed",
            OrderCreationStep::ConfirmOrder => "OrderConfirmed",
        }
    }

    /// The event this step waits for on failure, if any (`ConfirmOrder`
    /// cannot itself fail — it is the terminal success transition).
    pub fn failure_event(self) -> Option<&'static str> {
        match self {
            OrderCreationStep::ReserveInventory => Some("InventoryReservationFailed"),
            OrderCreationStep::ProcessPayment => Some("PaymentFailed"),
            OrderCreationStep::ConfirmOrder => None,
        }
    }

    /// The command emitted to start this step's forward action.
    pub fn forward_command(self) -> &'static str {
        match self {
            OrderCreationStep::ReserveInventory => "InventoryReservationRequested",
            OrderCreationStep::ProcessPayment => "PaymentRequested",
            OrderCreationStep::ConfirmOrder => "ConfirmOrder",
        }
    }

    /// The compensating command for this step, if it has one.
    pub fn compensation_command(self) -> Option<&'static str> {
        match self {
            OrderCreationStep::ReserveInventory => Some("ReleaseReservation"),
            OrderCreationStep::ProcessPayment => Some("RefundPayment"),
            OrderCreationStep::ConfirmOrder => None,
        }
    }

    /// Step-level timeout: 5 min for inventory, 2 min for payment.
    pub fn timeout(self) -> ChronoDuration {
        match self {
            OrderCreationStep::ReserveInventory => ChronoDuration::minutes(5),
            OrderCreationStep::ProcessPayment => ChronoDuration::minutes(2),
            OrderCreationStep::ConfirmOrder => ChronoDuration::minutes(2),
        }
    }

    fn index(self) -> usize {
        OrderCreationStep::ALL.iter().position(|s| *s == self).unwrap()
    }

    /// The next step in forward order, or `None` if this is the last step.
    pub fn next(self) -> Option<Self> {
        OrderCreationStep::ALL.get(self.index() + 1).copied()
    }

    /// The previous step in forward order, or `None` if this is the first.
    pub fn previous(self) -> Option<Self> {
        if self.index() == 0 {
            None
        } else {
            OrderCreationStep::ALL.get(self.index() - 1).copied()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaState {
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl SagaState {
    fn as_db_str(self) -> &'static str {
        match self {
            SagaState::Running => "Running",
            SagaState::Completed => "Completed",
            SagaState::Compensating => "Compensating",
            SagaState::Compensated => "Compensated",
            SagaState::Failed => "Failed",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "Completed" => SagaState::Completed,
            "Compensating" => SagaState::Compensating,
            "Compensated" => SagaState::Compensated,
            "Failed" => SagaState::Failed,
            _ => SagaState::Running,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Compensated | SagaState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// A persisted saga instance. `data` accumulates whatever context steps
/// need to pass forward (e.g. the reservation id `ProcessPayment` needs to
/// refund against during compensation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: Uuid,
    pub saga_type: String,
    pub correlation_id: String,
    pub state: SagaState,
    pub current_step: String,
    pub step_history: Vec<StepRecord>,
    pub data: serde_json::Value,
    pub timeout_at: DateTime<Utc>,
    pub version: i32,
}

impl SagaInstance {
    pub fn new_order_creation(correlation_id: impl Into<String>, data: serde_json::Value) -> Self {
        let first = OrderCreationStep::ReserveInventory;
        Self {
            id: Uuid::new_v4(),
            saga_type: "OrderCreation".to_string(),
            correlation_id: correlation_id.into(),
            state: SagaState::Running,
            current_step: first.as_str().to_string(),
            step_history: Vec::new(),
            data,
            timeout_at: Utc::now() + first.timeout(),
            version: 0,
        }
    }
}

/// The decision produced by [`advance`]: what the orchestrator must do as a
/// result of an inbound event, decoupled from how it's persisted so pure
/// transition logic stays testable without a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaAction {
    /// Emit the forward command for the next step and keep running.
    EmitForward { command: &'static str },
    /// Saga is done; nothing further to emit.
    Complete,
    /// Begin compensating: emit the compensation for `step`.
    EmitCompensation { command: &'static str },
    /// Compensation chain exhausted successfully.
    Compensated,
    /// A compensation itself failed irrecoverably.
    Failed,
    /// Event didn't match the saga's current step or state; ignored for
    /// idempotency (duplicate delivery, late response after a timeout).
    Ignored,
}

/// Apply an inbound event to a saga instance, mutating it in place and
/// returning what the orchestrator should do next. Pure with respect to
/// I/O: callers persist the mutated instance with optimistic concurrency
/// and then act on the returned [`SagaAction`].
pub fn advance(saga: &mut SagaInstance, event_type: &str, referenced_step: &str) -> SagaAction {
    if saga.state.is_terminal() {
        return SagaAction::Ignored;
    }

    let Some(current) = OrderCreationStep::from_str(&saga.current_step) else {
        return SagaAction::Ignored;
    };

    // Idempotency: a duplicate or stale response naming a step we've
    // already moved past is a no-op rather than an error.
    if referenced_step != current.as_str() {
        return SagaAction::Ignored;
    }

    match saga.state {
        SagaState::Running => {
            if event_type == current.success_event() {
                record(saga, current, StepOutcome::Succeeded);
                match current.next() {
                    Some(next) => {
                        saga.current_step = next.as_str().to_string();
                        saga.timeout_at = Utc::now() + next.timeout();
                        SagaAction::EmitForward {
                            command: next.forward_command(),
                        }
                    }
                    None => {
                        saga.state = SagaState::Completed;
                        SagaAction::Complete
                    }
                }
            } else if current.failure_event() == Some(event_type) {
                // `current`'s own forward action never completed, so there's
                // nothing of its own to undo -- compensation starts at the
                // last step that actually succeeded.
                record(saga, current, StepOutcome::Failed);
                saga.state = SagaState::Compensating;
                retreat_and_compensate(saga, current)
            } else {
                SagaAction::Ignored
            }
        }
        SagaState::Compensating => {
            // Any response while compensating is treated as "the
            // compensation for the current step completed"; the orchestrator
            // only re-enters `advance` for compensation steps after emitting
            // the corresponding compensating command.
            record(saga, current, StepOutcome::Compensated);
            retreat_and_compensate(saga, current)
        }
        SagaState::Completed | SagaState::Compensated | SagaState::Failed => SagaAction::Ignored,
    }
}

/// Move compensation to `step`'s predecessor and emit its compensating
/// command, or finish compensating if there is no earlier step to undo.
fn retreat_and_compensate(saga: &mut SagaInstance, step: OrderCreationStep) -> SagaAction {
    match step.previous() {
        Some(prev) => {
            saga.current_step = prev.as_str().to_string();
            begin_compensation(saga, prev)
        }
        None => {
            saga.state = SagaState::Compensated;
            SagaAction::Compensated
        }
    }
}

fn begin_compensation(saga: &mut SagaInstance, step: OrderCreationStep) -> SagaAction {
    match step.compensation_command() {
        Some(command) => SagaAction::EmitCompensation { command },
        None => {
            saga.state = SagaState::Compensated;
            SagaAction::Compensated
        }
    }
}

fn record(saga: &mut SagaInstance, step: OrderCreationStep, outcome: StepOutcome) {
    saga.step_history.push(StepRecord {
        step: step.as_str().to_string(),
        outcome,
        recorded_at: Utc::now(),
    });
}

/// Inject a synthetic failure for a saga whose current step has timed out,
/// driving it into compensation the same way an explicit failure event
/// would. Called by the timeout scanner for rows `timeout_at <= now`.
pub fn expire(saga: &mut SagaInstance) -> SagaAction {
    if saga.state != SagaState::Running {
        return SagaAction::Ignored;
    }
    let Some(current) = OrderCreationStep::from_str(&saga.current_step) else {
        return SagaAction::Ignored;
    };
    warn!(saga_id = %saga.id, step = current.as_str(), "saga step timed out, compensating");
    record(saga, current, StepOutcome::Failed);
    saga.state = SagaState::Compensating;
    retreat_and_compensate(saga, current)
}

#[async_trait]
pub trait SagaRepository: Send + Sync {
    async fn create(&self, saga: &SagaInstance) -> SagaResult<()>;
    async fn get(&self, id: Uuid) -> SagaResult<SagaInstance>;
    async fn get_by_correlation_id(&self, correlation_id: &str) -> SagaResult<Option<SagaInstance>>;
    /// Same read as [`SagaRepository::get_by_correlation_id`], but locks the
    /// row (`SELECT ... FOR UPDATE`) inside the caller's transaction so a
    /// concurrent event for the same saga blocks instead of racing the
    /// `version` guard on [`SagaRepository::update_in_tx`].
    async fn get_by_correlation_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: &str,
    ) -> SagaResult<Option<SagaInstance>>;
    /// Persist `saga` if its `version` still matches the stored row,
    /// bumping the version by one; returns [`SagaError::VersionConflict`]
    /// otherwise so the caller can re-read and retry.
    async fn update(&self, saga: &SagaInstance) -> SagaResult<()>;
    /// Same guarded update as [`SagaRepository::update`], but scoped to a
    /// caller-owned transaction so it commits atomically with whatever
    /// outbox rows and inbox mark the caller writes alongside it.
    async fn update_in_tx(&self, tx: &mut Transaction<'_, Postgres>, saga: &SagaInstance) -> SagaResult<()>;
    async fn list_timed_out(&self, now: DateTime<Utc>) -> SagaResult<Vec<SagaInstance>>;
}

pub struct SqlxSagaRepository {
    pool: PgPool,
}

impl SqlxSagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_saga(row: &sqlx::postgres::PgRow) -> Result<SagaInstance, sqlx::Error> {
        let step_history: serde_json::Value = row.try_get("step_history")?;
        Ok(SagaInstance {
            id: row.try_get("id")?,
            saga_type: row.try_get("saga_type")?,
            correlation_id: row.try_get("correlation_id")?,
            state: SagaState::from_db_str(row.try_get::<String, _>("state")?.as_str()),
            current_step: row.try_get("current_step")?,
            step_history: serde_json::from_value(step_history).unwrap_or_default(),
            data: row.try_get("data")?,
            timeout_at: row.try_get("timeout_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl SagaRepository for SqlxSagaRepository {
    async fn create(&self, saga: &SagaInstance) -> SagaResult<()> {
        let step_history = serde_json::to_value(&saga.step_history)?;
        sqlx::query(
            r#"
            INSERT INTO saga_instances (
                id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(saga.id)
        .bind(&saga.saga_type)
        .bind(&saga.correlation_id)
        .bind(saga.state.as_db_str())
        .bind(&saga.current_step)
        .bind(&step_history)
        .bind(&saga.data)
        .bind(saga.timeout_at)
        .bind(saga.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SagaResult<SagaInstance> {
        let row = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
            FROM saga_instances WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SagaError::NotFound(id))?;
        Self::row_to_saga(&row).map_err(SagaError::from)
    }

    async fn get_by_correlation_id(&self, correlation_id: &str) -> SagaResult<Option<SagaInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
            FROM saga_instances WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_saga).transpose().map_err(SagaError::from)
    }

    async fn get_by_correlation_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: &str,
    ) -> SagaResult<Option<SagaInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
            FROM saga_instances WHERE correlation_id = $1
            FOR UPDATE
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(Self::row_to_saga).transpose().map_err(SagaError::from)
    }

    async fn update(&self, saga: &SagaInstance) -> SagaResult<()> {
        let step_history = serde_json::to_value(&saga.step_history)?;
        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET state = $1, current_step = $2, step_history = $3, data = $4,
                timeout_at = $5, version = version + 1
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(saga.state.as_db_str())
        .bind(&saga.current_step)
        .bind(&step_history)
        .bind(&saga.data)
        .bind(saga.timeout_at)
        .bind(saga.id)
        .bind(saga.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::VersionConflict(saga.id));
        }

        info!(saga_id = %saga.id, state = ?saga.state, step = %saga.current_step, "saga instance updated");
        Ok(())
    }

    async fn update_in_tx(&self, tx: &mut Transaction<'_, Postgres>, saga: &SagaInstance) -> SagaResult<()> {
        let step_history = serde_json::to_value(&saga.step_history)?;
        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET state = $1, current_step = $2, step_history = $3, data = $4,
                timeout_at = $5, version = version + 1
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(saga.state.as_db_str())
        .bind(&saga.current_step)
        .bind(&step_history)
        .bind(&saga.data)
        .bind(saga.timeout_at)
        .bind(saga.id)
        .bind(saga.version)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::VersionConflict(saga.id));
        }

        info!(saga_id = %saga.id, state = ?saga.state, step = %saga.current_step, "saga instance updated");
        Ok(())
    }

    async fn list_timed_out(&self, now: DateTime<Utc>) -> SagaResult<Vec<SagaInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, state, current_step, step_history, data, timeout_at, version
            FROM saga_instances
            WHERE state = 'Running' AND timeout_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_saga).collect::<Result<Vec<_>, _>>().map_err(SagaError::from)
    }
}

/// Scan for timed-out sagas and drive each into compensation, retrying the
/// optimistic-concurrency write once on a lost race with an in-flight event.
pub async fn scan_timeouts<R: SagaRepository>(repo: &R) -> SagaResult<usize> {
    let timed_out = repo.list_timed_out(Utc::now()).await?;
    let mut expired_count = 0;

    for mut saga in timed_out {
        let saga_id = saga.id;
        let action = expire(&mut saga);
        if action == SagaAction::Ignored {
            continue;
        }
        match repo.update(&saga).await {
            Ok(()) => expired_count += 1,
            Err(SagaError::VersionConflict(_)) => {
                warn!(saga_id = %saga_id, "saga changed concurrently during timeout scan, skipping this tick");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(expired_count)
}

/// Default poll interval for the timeout scanner, per the saga step
/// timeout budget this workspace uses.
pub fn default_scan_interval() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_saga() -> SagaInstance {
        SagaInstance::new_order_creation("corr-1", serde_json::json!({}))
    }

    #[test]
    fn successful_path_advances_through_all_three_steps() {
        let mut saga = fresh_saga();

        let action = advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");
        assert_eq!(action, SagaAction::EmitForward { command: "PaymentRequested" });
        assert_eq!(saga.current_step, "ProcessPayment");

        let action = advance(&mut saga, "PaymentConfirmed", "ProcessPayment");
        assert_eq!(action, SagaAction::EmitForward { command: "ConfirmOrder" });
        assert_eq!(saga.current_step, "ConfirmOrder");

        let action = advance(&mut saga, "OrderConfirmed", "ConfirmOrder");
        assert_eq!(action, SagaAction::Complete);
        assert_eq!(saga.state, SagaState::Completed);
        assert_eq!(saga.step_history.len(), 3);
    }

    #[test]
    fn payment_failure_compensates_only_the_prior_completed_step() {
        let mut saga = fresh_saga();
        advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");

        // ProcessPayment's own forward action never completed, so there's
        // nothing of its own to undo -- compensation starts directly at
        // ReserveInventory, the last step that actually succeeded.
        let action = advance(&mut saga, "PaymentFailed", "ProcessPayment");
        assert_eq!(action, SagaAction::EmitCompensation { command: "ReleaseReservation" });
        assert_eq!(saga.current_step, "ReserveInventory");
        assert_eq!(saga.state, SagaState::Compensating);

        // ReleaseReservation completes -> fully compensated.
        let action = advance(&mut saga, "ReleaseCompleted", "ReserveInventory");
        assert_eq!(action, SagaAction::Compensated);
        assert_eq!(saga.state, SagaState::Compensated);
    }

    #[test]
    fn first_step_failure_compensates_with_nothing_to_undo() {
        let mut saga = fresh_saga();
        let action = advance(&mut saga, "InventoryReservationFailed", "ReserveInventory");
        assert_eq!(action, SagaAction::Compensated);
        assert_eq!(saga.state, SagaState::Compensated);
    }

    #[test]
    fn stale_event_referencing_a_past_step_is_ignored() {
        let mut saga = fresh_saga();
        advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");

        // A duplicate/late InventoryReservationConfirmed now references a
        // step the saga has already moved past.
        let action = advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");
        assert_eq!(action, SagaAction::Ignored);
        assert_eq!(saga.current_step, "ProcessPayment");
    }

    #[test]
    fn terminal_saga_ignores_further_events() {
        let mut saga = fresh_saga();
        advance(&mut saga, "InventoryReservationConfirmed", "ReserveInventory");
        advance(&mut saga, "PaymentConfirmed", "ProcessPayment");
        advance(&mut saga, "OrderConfirmed", "ConfirmOrder");

        let action = advance(&mut saga, "OrderConfirmed", "ConfirmOrder");
        assert_eq!(action, SagaAction::Ignored);
    }

    #[test]
    fn expire_drives_running_saga_into_compensation() {
        let mut saga = fresh_saga();
        let action = expire(&mut saga);
        assert_eq!(action, SagaAction::Compensated);
        assert_eq!(saga.state, SagaState::Compensated);
    }

    #[test]
    fn expire_is_noop_for_non_running_saga() {
        let mut saga = fresh_saga();
        saga.state = SagaState::Completed;
        assert_eq!(expire(&mut saga), SagaAction::Ignored);
    }

    #[test]
    fn step_ordering_matches_order_creation_sequence() {
        assert_eq!(OrderCreationStep::ReserveInventory.next(), Some(OrderCreationStep::ProcessPayment));
        assert_eq!(OrderCreationStep::ProcessPayment.next(), Some(OrderCreationStep::ConfirmOrder));
        assert_eq!(OrderCreationStep::ConfirmOrder.next(), None);
        assert_eq!(OrderCreationStep::ReserveInventory.previous(), None);
        assert_eq!(OrderCreationStep::ConfirmOrder.previous(), Some(OrderCreationStep::ProcessPayment));
    }
}
