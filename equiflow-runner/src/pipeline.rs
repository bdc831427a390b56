//! Pipeline driver: normalize, compute returns, aggregate, reconcile.
//!
//! Fail-fast: the first stage that errors or produces nothing ends the run in
//! `Failed { stage, reason }` and no later stage runs. Artifacts of a stage
//! are written only after the stage succeeded. The run's manifest is
//! persisted once the run has produced its first file, and rewritten after
//! every stage from then on.

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use equiflow_core::analytics::{aggregate, compute_returns};
use equiflow_core::data::{NormalizeReport, Normalizer, SchemaError};
use equiflow_core::domain::{RawBatch, SymbolSummary};

use crate::artifacts::{ArtifactError, ArtifactStore, RunManifest};
use crate::config::QualityConfig;
use crate::run_id::RunId;
use crate::state::{PipelineStage, PipelineState, TransitionError};
use crate::warehouse::{to_warehouse_rows, MergeReport, UpsertStore, WarehouseError};

/// Why a stage failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{dropped} of {input} rows dropped ({fraction:.3}), above the {max:.3} limit")]
    DataQuality {
        dropped: usize,
        input: usize,
        fraction: f64,
        max: f64,
    },

    #[error("stage {stage} produced no output")]
    EmptyResult { stage: PipelineStage },

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("persistence error: {0}")]
    Persistence(#[from] WarehouseError),

    #[error("invalid state transition: {0}")]
    Transition(#[from] TransitionError),
}

/// A run that ended in `Failed`.
#[derive(Debug, Error)]
#[error("run {run_id} failed at {stage}: {source}")]
pub struct RunFailure {
    pub run_id: RunId,
    pub stage: PipelineStage,
    #[source]
    pub source: PipelineError,
    /// Manifest as it stood when the run failed.
    pub manifest: RunManifest,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: PipelineState,
    pub normalize: NormalizeReport,
    pub summaries: Vec<SymbolSummary>,
    /// Normalized records that could not be loaded for lack of a field.
    pub skipped_incomplete: usize,
    pub merge: MergeReport,
    pub manifest: RunManifest,
}

/// Drives one run at a time against an upsert store and an artifact store.
pub struct Pipeline<S: UpsertStore> {
    store: S,
    artifacts: ArtifactStore,
    quality: QualityConfig,
}

/// Mutable bookkeeping of the run in flight.
struct RunContext {
    state: PipelineState,
    manifest: RunManifest,
    persisted: bool,
}

impl RunContext {
    fn stage(&self) -> PipelineStage {
        self.state.stage().unwrap_or(PipelineStage::Normalizing)
    }

    fn advance(&mut self) -> Result<(), TransitionError> {
        self.state = self.state.advance()?;
        self.manifest.state = self.state.clone();
        if let PipelineState::Running { stage } = &self.state {
            info!(run_id = %self.manifest.run_id, stage = %stage, "stage started");
        }
        Ok(())
    }
}

impl<S: UpsertStore> Pipeline<S> {
    pub fn new(store: S, artifacts: ArtifactStore, quality: QualityConfig) -> Self {
        Self {
            store,
            artifacts,
            quality,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run the pipeline over `batches`.
    pub fn run(&mut self, batches: &[RawBatch]) -> Result<RunReport, Box<RunFailure>> {
        self.execute(batches, false)
    }

    /// Same as [`run`](Self::run), but first writes `batches` as the run's raw artifact.
    pub fn run_persisting_raw(&mut self, batches: &[RawBatch]) -> Result<RunReport, Box<RunFailure>> {
        self.execute(batches, true)
    }

    fn execute(&mut self, batches: &[RawBatch], persist_raw: bool) -> Result<RunReport, Box<RunFailure>> {
        let started_at = Utc::now();
        let run_id = RunId::generate(started_at, &fingerprint(batches));
        let mut ctx = RunContext {
            state: PipelineState::Idle,
            manifest: RunManifest::new(run_id.clone(), started_at),
            persisted: false,
        };
        info!(run_id = %run_id, batches = batches.len(), "pipeline run started");

        match self.stages(&mut ctx, batches, persist_raw) {
            Ok(report) => Ok(report),
            Err(e) => Err(Box::new(self.fail(ctx, e))),
        }
    }

    fn stages(
        &mut self,
        ctx: &mut RunContext,
        batches: &[RawBatch],
        persist_raw: bool,
    ) -> Result<RunReport, PipelineError> {
        // ── Normalizing ──
        ctx.advance()?;
        if persist_raw {
            // A batch the normalizer would reject is not worth keeping.
            Normalizer::resolve_schemas(batches)?;
            self.artifacts.write_raw(&mut ctx.manifest, batches)?;
            self.checkpoint(ctx)?;
        }
        let normalized = Normalizer::normalize(batches)?;
        let report = normalized.report;
        info!(
            run_id = %ctx.manifest.run_id,
            input_rows = report.input_rows,
            output_rows = report.output_rows,
            dropped = report.dropped_rows(),
            duplicates = report.duplicates_collapsed,
            "normalized"
        );
        ctx.manifest.normalize_report = Some(report.clone());
        let fraction = report.dropped_fraction();
        if fraction > self.quality.max_dropped_fraction {
            return Err(PipelineError::DataQuality {
                dropped: report.dropped_rows(),
                input: report.input_rows,
                fraction,
                max: self.quality.max_dropped_fraction,
            });
        }
        non_empty(normalized.records.len(), PipelineStage::Normalizing)?;

        // ── ReturnComputing ──
        ctx.advance()?;
        let records = compute_returns(normalized.records);
        non_empty(records.len(), PipelineStage::ReturnComputing)?;
        self.artifacts.write_normalized(&mut ctx.manifest, &records)?;
        self.checkpoint(ctx)?;

        // ── Aggregating ──
        ctx.advance()?;
        let summaries = aggregate(&records);
        non_empty(summaries.len(), PipelineStage::Aggregating)?;
        self.artifacts.write_summaries(&mut ctx.manifest, &summaries)?;
        self.checkpoint(ctx)?;

        // ── Reconciling ──
        ctx.advance()?;
        let normalized: Vec<_> = records.into_iter().map(|r| r.record).collect();
        let (rows, skipped_incomplete) = to_warehouse_rows(&normalized);
        if skipped_incomplete > 0 {
            warn!(
                run_id = %ctx.manifest.run_id,
                skipped = skipped_incomplete,
                "records with missing fields are not loaded"
            );
        }
        non_empty(rows.len(), PipelineStage::Reconciling)?;
        let run_id = ctx.manifest.run_id.clone();
        self.store.stage(&run_id, &rows)?;
        let merge = self.store.merge(&run_id)?;
        ctx.manifest.merge_report = Some(merge);

        ctx.advance()?;
        if let Err(e) = self.checkpoint(ctx) {
            // The merge is committed; the run stands even if its manifest lags.
            error!(run_id = %run_id, error = %e, "failed to finalize run manifest");
        }
        info!(
            run_id = %run_id,
            symbols = summaries.len(),
            inserted = merge.inserted,
            updated = merge.updated,
            "pipeline run done"
        );

        Ok(RunReport {
            run_id,
            state: ctx.state.clone(),
            normalize: report,
            summaries,
            skipped_incomplete,
            merge,
            manifest: ctx.manifest.clone(),
        })
    }

    fn checkpoint(&self, ctx: &mut RunContext) -> Result<(), ArtifactError> {
        ctx.manifest.updated_at = Utc::now();
        self.artifacts.save_manifest(&ctx.manifest)?;
        ctx.persisted = true;
        Ok(())
    }

    fn fail(&self, mut ctx: RunContext, source: PipelineError) -> RunFailure {
        let stage = ctx.stage();
        let reason = source.to_string();
        ctx.state = ctx.state.fail(reason.clone()).unwrap_or(PipelineState::Failed {
            stage,
            reason: reason.clone(),
        });
        ctx.manifest.state = ctx.state.clone();
        ctx.manifest.updated_at = Utc::now();

        error!(run_id = %ctx.manifest.run_id, stage = %stage, error = %reason, "pipeline run failed");

        if ctx.persisted {
            if let Err(e) = self.artifacts.save_manifest(&ctx.manifest) {
                warn!(run_id = %ctx.manifest.run_id, error = %e, "failed to record failure in manifest");
            }
        }

        RunFailure {
            run_id: ctx.manifest.run_id.clone(),
            stage,
            source,
            manifest: ctx.manifest,
        }
    }
}

fn non_empty(len: usize, stage: PipelineStage) -> Result<(), PipelineError> {
    if len == 0 {
        return Err(PipelineError::EmptyResult { stage });
    }
    Ok(())
}

/// Cheap digest input describing the batches of a run.
fn fingerprint(batches: &[RawBatch]) -> Vec<u8> {
    let mut out = Vec::new();
    for batch in batches {
        out.extend_from_slice(batch.label.as_bytes());
        out.extend_from_slice(&(batch.rows.len() as u64).to_le_bytes());
    }
    out
}
