//! Telemetry emitted by the sampling tasks and the trend detector.
//!
//! Every event records `metrics` counters/histograms and logs through `tracing`.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};

use crate::sliding_window::{OrgId, RateError};
use crate::task_context::TaskContext;
use crate::trends::TrendType;

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[derive(Debug)]
pub struct TrendClassified {
    pub kind: &'static str,
    pub trend: TrendType,
}

impl InternalEvent for TrendClassified {
    fn emit(self) {
        counter!(
            "statistical_detector_trends_total",
            "kind" => self.kind,
            "trend" => self.trend.as_str()
        )
        .increment(1);
        trace!(target: "dynamic_sampling::trends", kind = self.kind, trend = %self.trend, "Trend classified");
    }
}

#[derive(Debug)]
pub struct TrendStateRejected<'a> {
    pub group: &'a str,
    pub stored: DateTime<Utc>,
    pub received: DateTime<Utc>,
}

impl InternalEvent for TrendStateRejected<'_> {
    fn emit(self) {
        counter!("statistical_detector_stale_payloads_total").increment(1);
        warn!(
            target: "dynamic_sampling::trends",
            group = self.group,
            stored = %self.stored,
            received = %self.received,
            "Skipping payload older than the stored trend state"
        );
    }
}

#[derive(Debug)]
pub struct SampleRateWritten {
    pub org_id: OrgId,
    pub sample_rate: f64,
}

impl InternalEvent for SampleRateWritten {
    fn emit(self) {
        counter!("dynamic_sampling_sample_rates_written_total").increment(1);
        histogram!("dynamic_sampling_org_sample_rate").record(self.sample_rate);
        debug!(target: "dynamic_sampling::sliding_window", org_id = self.org_id, sample_rate = self.sample_rate, "Sample rate stored");
    }
}

#[derive(Debug)]
pub struct SampleRateSkipped {
    pub org_id: OrgId,
    pub total_root_count: u64,
}

impl InternalEvent for SampleRateSkipped {
    fn emit(self) {
        counter!("dynamic_sampling_sample_rates_skipped_total").increment(1);
        debug!(
            target: "dynamic_sampling::sliding_window",
            org_id = self.org_id,
            total_root_count = self.total_root_count,
            "No sample rate computed; keeping the stored one"
        );
    }
}

#[derive(Debug)]
pub struct SampleRateComputationFailed<'a> {
    pub org_id: OrgId,
    pub error: &'a RateError,
}

impl InternalEvent for SampleRateComputationFailed<'_> {
    fn emit(self) {
        counter!("dynamic_sampling_sample_rate_errors_total").increment(1);
        error!(
            target: "dynamic_sampling::sliding_window",
            org_id = self.org_id,
            error = %self.error,
            "Sliding window sample rate computation failed"
        );
    }
}

fn record_function_states(context: &TaskContext) {
    for (function, state) in context.function_states() {
        let task = context.task_name().to_string();
        histogram!(
            "dynamic_sampling_function_iterations",
            "task" => task.clone(),
            "function" => function.to_string()
        )
        .record(state.num_iterations as f64);
        histogram!(
            "dynamic_sampling_function_seconds",
            "task" => task,
            "function" => function.to_string()
        )
        .record(state.execution_time);
        debug!(
            target: "dynamic_sampling::task",
            task = context.task_name(),
            function,
            num_iterations = state.num_iterations,
            num_orgs = state.num_orgs,
            num_rows_total = state.num_rows_total,
            num_db_calls = state.num_db_calls,
            execution_time_ms = state.execution_time.as_millis(),
            "Function statistics"
        );
    }
}

#[derive(Debug)]
pub struct TaskCompleted<'a> {
    pub context: &'a TaskContext,
}

impl InternalEvent for TaskCompleted<'_> {
    fn emit(self) {
        let task = self.context.task_name().to_string();
        counter!("dynamic_sampling_task_completed_total", "task" => task.clone()).increment(1);
        histogram!("dynamic_sampling_task_seconds", "task" => task).record(self.context.elapsed());
        record_function_states(self.context);
        info!(
            target: "dynamic_sampling::task",
            task = self.context.task_name(),
            elapsed_ms = self.context.elapsed().as_millis(),
            "Task completed"
        );
    }
}

#[derive(Debug)]
pub struct TaskTimedOut<'a> {
    pub context: &'a TaskContext,
}

impl InternalEvent for TaskTimedOut<'_> {
    fn emit(self) {
        counter!("dynamic_sampling_task_timeout_total", "task" => self.context.task_name().to_string()).increment(1);
        record_function_states(self.context);
        error!(
            target: "dynamic_sampling::task",
            task = self.context.task_name(),
            elapsed_ms = self.context.elapsed().as_millis(),
            "Task exceeded its time budget"
        );
    }
}
