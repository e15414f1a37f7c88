//! Run orchestration
//!
//! [`Engine::execute_run`] is the single entry point the scheduler calls. It
//! runs the stages strictly in sequence (validate, extract, transform,
//! reconcile, load) against one run record, and any error moves the run to
//! `failed` before being returned to the caller. The engine never retries.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::batch::TabularBatch;
use crate::destination::{Destination, DestinationConnector};
use crate::error::{EngineError, Result};
use crate::loader::{LoadSummary, Loader};
use crate::models::{JobDefinition, RunRecord, RunStage};
use crate::schema::{coerce_to_native, ExpectedColumn, SchemaReconciler, TypeRegistry};
use crate::source::SourceReader;
use crate::store::RunStore;
use crate::tracker::RunTracker;
use crate::transform::{TransformEngine, TransformRegistry};

/// An error together with the stage it was raised in
struct StageError {
    stage: RunStage,
    error: EngineError,
}

trait AtStage<T> {
    fn at(self, stage: RunStage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: RunStage) -> std::result::Result<T, StageError> {
        self.map_err(|error| StageError { stage, error })
    }
}

pub struct Engine {
    runs: Arc<dyn RunStore>,
    sources: SourceReader,
    destinations: Arc<dyn DestinationConnector>,
    transforms: TransformEngine,
    reconciler: SchemaReconciler,
    types: Arc<TypeRegistry>,
    lock_destination: bool,
}

impl Engine {
    pub fn new(
        runs: Arc<dyn RunStore>,
        sources: SourceReader,
        destinations: Arc<dyn DestinationConnector>,
        transforms: Arc<TransformRegistry>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            runs,
            sources,
            destinations,
            transforms: TransformEngine::new(transforms),
            reconciler: SchemaReconciler::new(Arc::clone(&types)),
            types,
            lock_destination: false,
        }
    }

    /// Hold an advisory lock on the destination table for the whole run.
    pub fn with_destination_lock(mut self, enabled: bool) -> Self {
        self.lock_destination = enabled;
        self
    }

    /// Execute one pending run of `job_id` and return its final record.
    ///
    /// On failure the run is left `failed` with the error message recorded,
    /// and the error is returned unchanged.
    #[instrument(skip(self), fields(job_id = job_id, run_id = run_id))]
    pub async fn execute_run(&self, job_id: i64, run_id: i64) -> Result<RunRecord> {
        let mut tracker = RunTracker::load(Arc::clone(&self.runs), run_id).await?;
        if tracker.record().job_id != job_id {
            return Err(EngineError::InvalidJob(format!(
                "run {} belongs to job {}, not job {}",
                run_id,
                tracker.record().job_id,
                job_id
            )));
        }

        tracker.start().await?;

        match self.run_stages(job_id, &mut tracker).await {
            Ok((job, summary)) => {
                let summary = format!(
                    "Loaded {} rows into {} ({}) in {} batches",
                    summary.rows_processed,
                    job.destination.qualified_table(),
                    job.load_strategy,
                    summary.slices
                );
                tracker.complete(&summary).await?;
                Ok(tracker.record().clone())
            },
            Err(StageError { stage, error }) => {
                error!(stage = %stage, kind = ?error.kind(), error = %error, "Run failed");
                if let Err(persist) = tracker.fail(stage, &error).await {
                    error!(error = %persist, "Could not record the run failure");
                }
                Err(error)
            },
        }
    }

    async fn run_stages(
        &self,
        job_id: i64,
        tracker: &mut RunTracker,
    ) -> std::result::Result<(JobDefinition, LoadSummary), StageError> {
        tracker.enter_stage(RunStage::Validate).await.at(RunStage::Validate)?;
        let job = self.load_job(job_id).await.at(RunStage::Validate)?;

        tracker.enter_stage(RunStage::Extract).await.at(RunStage::Extract)?;
        let source = self.sources.read(&job.source).await.at(RunStage::Extract)?;
        info!(
            rows = source.row_count(),
            columns = source.column_count(),
            "Extracted source"
        );

        tracker.enter_stage(RunStage::Transform).await.at(RunStage::Transform)?;
        let batch = self
            .transforms
            .transform(&source, &job.column_mappings)
            .at(RunStage::Transform)?;
        drop(source);
        tracker
            .set_total(batch.row_count() as u64)
            .await
            .at(RunStage::Transform)?;

        tracker.enter_stage(RunStage::Reconcile).await.at(RunStage::Reconcile)?;
        let mut destination = self
            .destinations
            .connect(&job.destination)
            .await
            .at(RunStage::Reconcile)?;

        let outcome = self
            .reconcile_and_load(&job, destination.as_mut(), batch, tracker)
            .await;

        if let Err(e) = destination.close().await {
            warn!(error = %e, "Closing the destination connection failed");
        }

        outcome.map(|summary| (job, summary))
    }

    async fn load_job(&self, job_id: i64) -> Result<JobDefinition> {
        let job = self.runs.load_job_definition(job_id).await?;
        job.validate()?;
        self.transforms.validate_mappings(&job.column_mappings)?;
        info!(
            job = %job.name,
            strategy = %job.load_strategy,
            table = %job.destination.qualified_table(),
            "Job definition validated"
        );
        Ok(job)
    }

    async fn reconcile_and_load(
        &self,
        job: &JobDefinition,
        destination: &mut dyn Destination,
        batch: TabularBatch,
        tracker: &mut RunTracker,
    ) -> std::result::Result<LoadSummary, StageError> {
        if self.lock_destination {
            destination.lock_table().await.at(RunStage::Reconcile)?;
        } else {
            debug!(
                table = %destination.table(),
                "No destination lock; concurrent runs on this table are not coordinated"
            );
        }

        let expected = ExpectedColumn::from_job(job);
        let reconciliation = self
            .reconciler
            .reconcile(
                destination,
                &expected,
                job.load_strategy,
                &job.upsert_keys,
                job.create_ddl(),
            )
            .await
            .at(RunStage::Reconcile)?;

        tracker.enter_stage(RunStage::Load).await.at(RunStage::Load)?;
        let batch = coerce_to_native(batch, &reconciliation, &self.types).at(RunStage::Load)?;
        Loader::new(job.batch_size, Arc::clone(&self.types))
            .load(
                destination,
                batch,
                &reconciliation.snapshot,
                job.load_strategy,
                &job.upsert_keys,
                tracker,
            )
            .await
            .at(RunStage::Load)
    }
}
