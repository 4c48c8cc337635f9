// src/task/mod.rs

//! Task Record data model.
//!
//! - [`record`] holds the serialized shape shared by the durable store and
//!   the cache mirror.
//! - [`patch`] holds the typed field updates applied to a record, replacing
//!   dotted-path addressing of nested partial results.

pub mod patch;
pub mod record;

pub use patch::{FieldSet, RecordPatch};
pub use record::{
    normalize_kpi, KpiField, KpiResult, PartialResults, TaskRecord, TaskStatus,
};
