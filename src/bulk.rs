//! Bulk orchestrator: supplier rows → parsed vehicles → the
//! single-vehicle pipeline, with bounded concurrency and per-row failure
//! isolation. One bad row never blocks its siblings; a started batch
//! always completes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use regex::Regex;
use tracing::{info, warn};

use crate::pipeline::{Services, ValuationRun};
use crate::types::{BulkProgress, BulkRow, BulkRowStatus, ParsedVehicle};

fn plate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[a-z0-9]{1,3}-[a-z0-9]{1,3}-[a-z0-9]{1,3}\b").expect("static pattern")
    })
}

/// A plate-shaped token in the raw row, if any. Rows with one run the
/// full pipeline (registry + pricing index); the rest run from parsed
/// attributes only.
pub fn extract_plate(description: &str) -> Option<String> {
    plate_re()
        .find(description)
        .map(|m| m.as_str().to_uppercase())
}

/// One ingested batch. Rows are mutated in place as they move through
/// pending → processing → completed/error; terminal states are never
/// revisited and rows are never auto-retried.
pub struct BulkBatch {
    rows: DashMap<usize, BulkRow>,
    total: usize,
    processed: AtomicUsize,
    current_label: Mutex<String>,
}

impl BulkBatch {
    fn new(descriptions: Vec<String>) -> Self {
        let rows = DashMap::new();
        let total = descriptions.len();
        for (index, raw) in descriptions.into_iter().enumerate() {
            rows.insert(index, BulkRow::pending(index, raw));
        }
        Self {
            rows,
            total,
            processed: AtomicUsize::new(0),
            current_label: Mutex::new(String::new()),
        }
    }

    pub fn progress(&self) -> BulkProgress {
        BulkProgress {
            processed: self.processed.load(Ordering::SeqCst),
            total: self.total,
            current_label: self
                .current_label
                .lock()
                .map(|l| l.clone())
                .unwrap_or_default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.processed.load(Ordering::SeqCst) >= self.total
    }

    /// Snapshot of all rows, input order.
    pub fn rows(&self) -> Vec<BulkRow> {
        let mut rows: Vec<BulkRow> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.index);
        rows
    }

    fn set_label(&self, label: &str) {
        if let Ok(mut current) = self.current_label.lock() {
            *current = label.to_string();
        }
    }

    fn update<F: FnOnce(&mut BulkRow)>(&self, index: usize, f: F) {
        if let Some(mut row) = self.rows.get_mut(&index) {
            f(row.value_mut());
        }
    }

    fn settle(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct BulkOrchestrator {
    services: Arc<Services>,
    concurrency: usize,
}

impl BulkOrchestrator {
    pub fn new(services: Arc<Services>, concurrency: usize) -> Self {
        Self {
            services,
            concurrency: concurrency.max(1),
        }
    }

    /// Attach a pending row per input line.
    pub fn ingest(&self, descriptions: Vec<String>) -> Arc<BulkBatch> {
        let batch = Arc::new(BulkBatch::new(descriptions));
        info!(rows = batch.total, "bulk batch ingested");
        batch
    }

    /// Drive every pending row to a terminal state. Concurrency is capped
    /// once here; each row's own fan-out nests inside the cap, it is not
    /// multiplied per row.
    pub async fn process(&self, batch: &Arc<BulkBatch>) {
        let pending: Vec<(usize, String)> = batch
            .rows()
            .into_iter()
            .filter(|r| r.status == BulkRowStatus::Pending)
            .map(|r| (r.index, r.raw_description.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        // Parse all descriptions up front (the parser chunks LLM calls
        // internally) so each worker below starts with attributes.
        let descriptions: Vec<String> = pending.iter().map(|(_, d)| d.clone()).collect();
        let parsed = crate::parser::parse_descriptions(
            self.services.llm.as_ref(),
            &descriptions,
        )
        .await;

        let work: Vec<(usize, String, ParsedVehicle)> = pending
            .into_iter()
            .zip(parsed)
            .map(|((index, raw), vehicle)| (index, raw, vehicle))
            .collect();

        stream::iter(work)
            .map(|(index, raw, vehicle)| {
                let services = Arc::clone(&self.services);
                let batch = Arc::clone(batch);
                async move {
                    process_row(services, &batch, index, raw, vehicle).await;
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<()>>()
            .await;

        batch.set_label("done");
        info!(
            total = batch.total,
            completed = batch
                .rows()
                .iter()
                .filter(|r| r.status == BulkRowStatus::Completed)
                .count(),
            "bulk batch complete"
        );
    }
}

async fn process_row(
    services: Arc<Services>,
    batch: &BulkBatch,
    index: usize,
    raw: String,
    vehicle: ParsedVehicle,
) {
    let plate = extract_plate(&raw);
    let label = if vehicle.attributes.brand.is_empty() {
        raw.chars().take(40).collect::<String>()
    } else {
        vehicle.attributes.label()
    };
    batch.set_label(&label);
    batch.update(index, |row| {
        row.status = BulkRowStatus::Processing;
        row.plate = plate.clone();
        row.parsed = Some(vehicle.clone());
    });

    let mut run = ValuationRun::new(services);
    let outcome = match &plate {
        Some(p) => run.run(p, vehicle.attributes.mileage_km).await,
        None if !vehicle.attributes.brand.is_empty() => {
            Ok(run.run_with_attributes(vehicle.attributes.clone()).await)
        }
        None => Err(crate::error::AppError::Parse(
            "could not determine the vehicle from the description".into(),
        )),
    };

    match outcome {
        Ok(report) => {
            batch.update(index, |row| {
                row.status = BulkRowStatus::Completed;
                row.report = Some(report);
            });
        }
        Err(e) => {
            warn!(row = index, "bulk row failed: {e}");
            batch.update(index, |row| {
                row.status = BulkRowStatus::Error;
                row.error = Some(e.to_string());
            });
        }
    }
    batch.settle();
}
