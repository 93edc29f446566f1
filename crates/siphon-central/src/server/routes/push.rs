//! Push endpoint receiving collector batches.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use siphon_core::{PushBatch, PushResponse, SourceTypeTable, UploadTask};

use crate::queue::enqueue_task;
use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Check a pushed batch against the source-type table and size limit.
pub fn validate_batch(
    batch: &PushBatch,
    sources: &SourceTypeTable,
    max_records: usize,
) -> Result<(), String> {
    if !sources.contains(&batch.source_type) {
        return Err(format!("unknown source type '{}'", batch.source_type));
    }
    if batch.records.is_empty() {
        return Err("batch has no records".to_string());
    }
    if batch.records.len() > max_records {
        return Err(format!(
            "batch has {} records, at most {} are accepted",
            batch.records.len(),
            max_records
        ));
    }
    if let Some(stray) = batch
        .records
        .iter()
        .find(|r| r.source_type != batch.source_type)
    {
        return Err(format!(
            "record source type '{}' does not match batch source type '{}'",
            stray.source_type, batch.source_type
        ));
    }
    Ok(())
}

/// Validate, apply admission control, and queue one batch.
pub async fn push(
    State(state): State<AppState>,
    body: Result<Json<PushBatch>, JsonRejection>,
) -> Result<Json<PushResponse>, ApiError> {
    let result = accept(&state, body).await;
    if let Err(e) = &result {
        metrics::counter!("push_batches_rejected_total", "reason" => e.reason_label())
            .increment(1);
        tracing::debug!(error = %e, "push rejected");
    }
    result
}

async fn accept(
    state: &AppState,
    body: Result<Json<PushBatch>, JsonRejection>,
) -> Result<Json<PushResponse>, ApiError> {
    let Json(batch) = body.map_err(|e| ApiError::InvalidBatch(e.body_text()))?;
    validate_batch(&batch, &state.sources, state.max_push_records).map_err(ApiError::InvalidBatch)?;

    let tier = state.health.borrow().tier;
    if !tier.admits_work() {
        return Err(ApiError::Overloaded(tier));
    }

    let source = batch.source_type.clone();
    let records = batch.records.len();
    let submitter = batch.submitter_identity.clone();
    let task = UploadTask::from(batch);
    enqueue_task(&*state.queue, &state.queue_name, &task).await?;

    siphon_core::metrics::increment_for("push_batches_accepted_total", source.as_str(), 1);
    tracing::debug!(
        source = %source,
        records,
        submitter = %submitter,
        task_id = %task.task_id,
        "batch queued"
    );

    Ok(Json(PushResponse::accepted(task.task_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use siphon_core::{IngestRecord, SourceSpec, SourceType};

    fn st(name: &str) -> SourceType {
        SourceType::new(name).unwrap()
    }

    fn table() -> SourceTypeTable {
        SourceTypeTable::new(vec![SourceSpec::new(st("botnet_a")), SourceSpec::new(st("scanner_b"))])
            .unwrap()
    }

    fn batch(source: &str, record_sources: &[&str]) -> PushBatch {
        PushBatch {
            source_type: st(source),
            records: record_sources
                .iter()
                .map(|s| IngestRecord::new(st(s), "10.0.0.1", "beacon", Utc::now()))
                .collect(),
            submitter_identity: "edge-1".to_string(),
        }
    }

    #[test]
    fn test_validate_batch() {
        let table = table();
        assert!(validate_batch(&batch("botnet_a", &["botnet_a"]), &table, 10).is_ok());
        assert!(validate_batch(&batch("mystery_c", &["mystery_c"]), &table, 10).is_err());
        assert!(validate_batch(&batch("botnet_a", &[]), &table, 10).is_err());
        assert!(validate_batch(&batch("botnet_a", &["botnet_a"; 11]), &table, 10).is_err());

        let mixed = validate_batch(&batch("botnet_a", &["botnet_a", "scanner_b"]), &table, 10)
            .unwrap_err();
        assert!(mixed.contains("scanner_b"));
    }
}
