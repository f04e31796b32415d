//! Per-run bookkeeping for background tasks: the wall-clock budget and the
//! diagnostic counters each stage accumulates.

use std::collections::BTreeMap;
use std::time::Duration;

use snafu::Snafu;
use tokio::time::Instant;

use crate::store::StoreError;

/// Deadline used when the requested budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TaskError {
    /// The task ran past its budget. Work committed before the check is kept.
    #[snafu(display("Task {task_name} exceeded its time budget after {}ms", elapsed.as_millis()))]
    Timeout { task_name: String, elapsed: Duration },

    #[snafu(display("State store error: {source}"))]
    Store { source: StoreError },

    #[snafu(display("Volume query failed: {source}"))]
    VolumeQuery { source: crate::Error },
}

impl TaskError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

impl From<StoreError> for TaskError {
    fn from(source: StoreError) -> Self {
        TaskError::Store { source }
    }
}

/// Counters one stage of a task accumulates over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionState {
    pub num_iterations: u64,
    pub num_orgs: u64,
    pub num_rows_total: u64,
    pub num_db_calls: u64,
    pub execution_time: Duration,
}

/// State for one invocation of a task. Created when the run starts and dropped
/// when it ends; nothing in here is persisted.
#[derive(Clone, Debug)]
pub struct TaskContext {
    task_name: String,
    started_at: Instant,
    expiration_time: Instant,
    function_states: BTreeMap<String, FunctionState>,
}

impl TaskContext {
    /// Starts a context whose deadline is `budget` from now. Budgets too large to
    /// represent are capped at roughly thirty years.
    pub fn new(task_name: impl Into<String>, budget: Duration) -> Self {
        let started_at = Instant::now();
        let expiration_time = started_at
            .checked_add(budget)
            .or_else(|| started_at.checked_add(FAR_FUTURE))
            .unwrap_or(started_at);
        Self::with_expiration(task_name, started_at, expiration_time)
    }

    pub fn with_expiration(task_name: impl Into<String>, started_at: Instant, expiration_time: Instant) -> Self {
        Self {
            task_name: task_name.into(),
            started_at,
            expiration_time,
            function_states: BTreeMap::new(),
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn expiration_time(&self) -> Instant {
        self.expiration_time
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.expiration_time
    }

    /// Fails with [`TaskError::Timeout`] once the deadline has passed.
    ///
    /// Callers check this before starting a unit of work, never in the middle of one.
    pub fn check_deadline(&self) -> Result<(), TaskError> {
        if self.expired() {
            return Err(TaskError::Timeout {
                task_name: self.task_name.clone(),
                elapsed: self.elapsed(),
            });
        }
        Ok(())
    }

    pub fn get_function_state(&self, function: &str) -> FunctionState {
        self.function_states.get(function).copied().unwrap_or_default()
    }

    pub fn set_function_state(&mut self, function: &str, state: FunctionState) {
        self.function_states.insert(function.to_string(), state);
    }

    /// Read-modify-write of one function's counters.
    pub fn update_function_state(&mut self, function: &str, update: impl FnOnce(&mut FunctionState)) {
        let mut state = self.get_function_state(function);
        update(&mut state);
        self.set_function_state(function, state);
    }

    pub fn function_states(&self) -> impl Iterator<Item = (&str, &FunctionState)> {
        self.function_states.iter().map(|(name, state)| (name.as_str(), state))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn deadline_trips_only_after_budget() {
        time::pause();

        let context = TaskContext::new("task", Duration::from_secs(10));
        assert!(context.check_deadline().is_ok());

        time::advance(Duration::from_secs(10)).await;
        assert!(context.check_deadline().is_ok());

        time::advance(Duration::from_millis(1)).await;
        let err = context.check_deadline().unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("task"));
    }

    #[test]
    fn oversized_budget_does_not_overflow() {
        let context = TaskContext::new("task", Duration::from_secs(u64::MAX));

        assert!(context.check_deadline().is_ok());
        assert!(context.expiration_time() > Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn function_state_read_modify_write() {
        let mut context = TaskContext::new("task", Duration::from_secs(60));
        assert_eq!(context.get_function_state("fetch"), FunctionState::default());

        context.update_function_state("fetch", |state| {
            state.num_iterations += 1;
            state.num_rows_total += 40;
        });
        context.update_function_state("fetch", |state| state.num_iterations += 1);

        let state = context.get_function_state("fetch");
        assert_eq!(state.num_iterations, 2);
        assert_eq!(state.num_rows_total, 40);
        assert_eq!(context.function_states().count(), 1);
    }
}
