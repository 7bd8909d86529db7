//! Structured run logging shared by every puller.
//!
//! One `EtlRun` per invocation; clear start / batch_progress / finish markers
//! and a duration summary, with per-record error logs throttled after the
//! configured limit to keep a poisoned page from flooding the log.

use std::time::Instant;

use tracing::{error, info, warn};

pub struct EtlRun {
    script: &'static str,
    entity: &'static str,
    started: Instant,
    max_error_logs: usize,
    pub total_processed: u64,
    pub total_created: u64,
    pub total_updated: u64,
    pub total_errors: u64,
}

impl EtlRun {
    pub fn start(
        script: &'static str,
        entity: &'static str,
        max_error_logs: usize,
        config: &[(&str, String)],
    ) -> Self {
        info!(script, entity, "ETL run starting");
        for (key, value) in config {
            info!(script, "  {key}: {value}");
        }
        EtlRun {
            script,
            entity,
            started: Instant::now(),
            max_error_logs,
            total_processed: 0,
            total_created: 0,
            total_updated: 0,
            total_errors: 0,
        }
    }

    pub fn batch_progress(&mut self, batch_num: u64, size: usize, created: u64, updated: u64, errors: u64) {
        self.total_processed += size as u64;
        self.total_created += created;
        self.total_updated += updated;
        self.total_errors += errors;
        if errors > 0 {
            warn!(
                script = self.script,
                batch = batch_num,
                size,
                created,
                updated,
                errors,
                "batch processed with errors"
            );
        } else {
            info!(
                script = self.script,
                batch = batch_num,
                size,
                created,
                updated,
                "batch processed"
            );
        }
    }

    pub fn batch_error(&mut self, batch_num: u64, skip: i64, err: &dyn std::fmt::Display) {
        self.total_errors += 1;
        error!(
            script = self.script,
            batch = batch_num,
            skip,
            error = %err,
            "batch failed"
        );
    }

    /// Log one record-level error, suppressing after the configured limit.
    pub fn item_error(&mut self, item_id: &str, err: &dyn std::fmt::Display) {
        self.total_errors += 1;
        if (self.total_errors as usize) <= self.max_error_logs {
            error!(
                script = self.script,
                item = item_id,
                error = %err,
                "record skipped"
            );
        } else if self.total_errors as usize == self.max_error_logs + 1 {
            warn!(
                script = self.script,
                shown = self.max_error_logs,
                "further record errors suppressed"
            );
        }
    }

    pub fn checkpoint_saved(&self, cursor: &str, batch_num: Option<u64>) {
        info!(
            script = self.script,
            entity = self.entity,
            cursor,
            batch = batch_num,
            "checkpoint saved"
        );
    }

    pub fn finish(self, success: bool) {
        let duration = self.started.elapsed().as_secs_f64();
        if success {
            info!(
                script = self.script,
                entity = self.entity,
                processed = self.total_processed,
                created = self.total_created,
                updated = self.total_updated,
                errors = self.total_errors,
                duration_secs = format!("{duration:.1}"),
                "ETL run finished"
            );
        } else {
            error!(
                script = self.script,
                entity = self.entity,
                processed = self.total_processed,
                errors = self.total_errors,
                duration_secs = format!("{duration:.1}"),
                "ETL run failed"
            );
        }
    }
}
