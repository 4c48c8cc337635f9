// src/progress/merge.rs

//! Pure merge rules for Task Record updates.
//!
//! Both store backends and the cache synchronizer funnel every mutation
//! through these functions, so the two copies of a record evolve under the
//! same rules. Nothing here performs IO.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::task::{normalize_kpi, FieldSet, PartialResults, RecordPatch, TaskRecord, TaskStatus};

/// Set `status` and (optionally) `progress`.
///
/// Progress is clamped into `[0, 1]`. While a record stays `processing`, a
/// lower value than the stored one is ignored so that pollers never see
/// progress move backwards. Reaching a terminal status drops the lease.
pub fn apply_progress(record: &mut TaskRecord, status: TaskStatus, progress: Option<f64>) {
    if let Some(value) = progress {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { record.progress };
        let keep_monotonic =
            record.status == TaskStatus::Processing && status == TaskStatus::Processing;

        record.progress = if keep_monotonic && value < record.progress {
            debug!(
                task_id = %record.task_id,
                stored = record.progress,
                requested = value,
                "ignoring progress regression while processing"
            );
            record.progress
        } else {
            value
        };
    }
    record.status = status;
    if status.is_terminal() {
        record.lease_expires = None;
    }
}

/// Apply a single typed patch.
pub fn apply_patch(record: &mut TaskRecord, patch: RecordPatch) {
    match patch {
        RecordPatch::StartAttempt => start_attempt(record),
        RecordPatch::IdentifiedKpis(kpis) => {
            if record.identified_kpis.is_empty() {
                record.identified_kpis = kpis;
            } else if record.identified_kpis != kpis {
                warn!(
                    task_id = %record.task_id,
                    "identified_kpis already set; ignoring replacement"
                );
            }
        }
        RecordPatch::CurrentKpi(kpi) => record.current_kpi = kpi,
        RecordPatch::Summary(summary) => record.summary = Some(summary),
        RecordPatch::ReportRef(r) => record.report_ref = Some(r),
        RecordPatch::RawDataRef(r) => record.raw_data_ref = Some(r),
        RecordPatch::ErrorDetail(detail) => record.error_detail = Some(detail),
        RecordPatch::ErrorTrace(trace) => record.error_trace = Some(trace),
        RecordPatch::Kpi { kpi, field, value } => {
            let key = normalize_kpi(&kpi);
            if !is_identified(record, &key) {
                warn!(
                    task_id = %record.task_id,
                    kpi = %kpi,
                    "dropping partial result for a KPI that was not identified"
                );
                return;
            }
            record.partial_results.entry(key).or_default().set(field, value);
        }
    }
}

/// Reset the per-delivery fields of `record`.
///
/// A redelivered task runs its pipeline from scratch, so the write-once
/// `identified_kpis` only holds within one delivery.
pub fn start_attempt(record: &mut TaskRecord) {
    record.progress = 0.0;
    record.identified_kpis.clear();
    record.partial_results.clear();
    record.current_kpi = None;
    record.summary = None;
    record.report_ref = None;
    record.raw_data_ref = None;
    record.error_detail = None;
    record.error_trace = None;
}

fn is_identified(record: &TaskRecord, key: &str) -> bool {
    record.identified_kpis.is_empty()
        || record.identified_kpis.iter().any(|k| normalize_kpi(k) == key)
}

/// Remove KPI entries whose fields are all empty.
pub fn prune_empty(partial: &mut PartialResults) {
    partial.retain(|_, result| !result.is_empty());
}

/// Reorder `partial_results` to follow `identified_kpis`.
///
/// Before KPIs are identified the arrival order is kept. Afterwards, entries
/// for unidentified KPIs are dropped.
pub fn reorder(record: &mut TaskRecord) {
    if record.identified_kpis.is_empty() {
        return;
    }

    let mut seen = HashSet::new();
    let mut ordered = PartialResults::with_capacity(record.partial_results.len());
    for kpi in &record.identified_kpis {
        let key = normalize_kpi(kpi);
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(result) = record.partial_results.shift_remove(&key) {
            ordered.insert(key, result);
        }
    }

    if !record.partial_results.is_empty() {
        debug!(
            task_id = %record.task_id,
            dropped = record.partial_results.len(),
            "dropping partial results for unidentified KPIs"
        );
    }
    record.partial_results = ordered;
}

/// Prune and reorder; run after every batch of patches.
pub fn finalize(record: &mut TaskRecord) {
    prune_empty(&mut record.partial_results);
    reorder(record);
}

/// Apply a durable-store field set: only the listed fields change.
pub fn apply_fields(record: &mut TaskRecord, fields: &FieldSet, now: DateTime<Utc>) {
    let status = fields.status.unwrap_or(record.status);
    apply_progress(record, status, fields.progress);

    if let Some(message) = &fields.message {
        record.message = message.clone();
    }
    for patch in &fields.patches {
        apply_patch(record, patch.clone());
    }
    finalize(record);
    record.updated_at = now;
}
