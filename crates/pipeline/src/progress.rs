//! Validated, persisted and published progress updates for one run.

use threatlens_core::analysis::AnalysisResult;
use threatlens_core::progress::{JobStatus, ProgressMachine, ProgressSnapshot, ProgressView};
use threatlens_core::types::AnalysisId;
use threatlens_db::AnalysisStore;
use threatlens_events::ProgressBus;

use crate::error::PipelineError;

/// Writes every progress change of one analysis run.
///
/// Each update is checked against the [`ProgressMachine`], persisted, and
/// only then committed and published, so the store, the bus and the
/// machine never disagree about the last accepted snapshot.
pub struct ProgressReporter<'a> {
    store: &'a dyn AnalysisStore,
    bus: Option<&'a ProgressBus>,
    id: AnalysisId,
    machine: ProgressMachine,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(
        store: &'a dyn AnalysisStore,
        bus: Option<&'a ProgressBus>,
        id: AnalysisId,
        machine: ProgressMachine,
    ) -> Self {
        Self {
            store,
            bus,
            id,
            machine,
        }
    }

    pub fn current(&self) -> &ProgressSnapshot {
        self.machine.current()
    }

    /// Persist an intermediate snapshot.
    pub async fn report(&mut self, snapshot: ProgressSnapshot) -> Result<(), PipelineError> {
        self.machine.check(&snapshot)?;
        self.store.update_progress(self.id, &snapshot).await?;
        self.accept(snapshot, JobStatus::Processing, None);
        Ok(())
    }

    /// Persist the result together with the `completed` snapshot.
    pub async fn complete(
        &mut self,
        snapshot: ProgressSnapshot,
        result: &AnalysisResult,
    ) -> Result<(), PipelineError> {
        self.machine.check(&snapshot)?;
        self.store.complete(self.id, &snapshot, result).await?;
        self.accept(snapshot, JobStatus::Completed, None);
        Ok(())
    }

    /// Persist the `failed` snapshot with `message`.
    ///
    /// Failure is reachable from every non-terminal stage, so the write is
    /// attempted even if the machine objects; the objection is logged.
    pub async fn fail(&mut self, message: &str) -> Result<(), PipelineError> {
        let snapshot = ProgressSnapshot::failed(message);
        if let Err(e) = self.machine.check(&snapshot) {
            tracing::warn!(analysis_id = %self.id, error = %e, "Recording failure from unexpected stage");
        }
        self.store.fail(self.id, &snapshot, message).await?;
        self.accept(snapshot, JobStatus::Failed, Some(message.to_string()));
        Ok(())
    }

    fn accept(&mut self, snapshot: ProgressSnapshot, status: JobStatus, error: Option<String>) {
        tracing::debug!(
            analysis_id = %self.id,
            stage = %snapshot.stage,
            percentage = snapshot.percentage,
            message = %snapshot.message,
            "Progress",
        );
        if let Some(bus) = self.bus {
            bus.publish(ProgressView {
                id: self.id,
                status,
                progress: snapshot.clone(),
                error,
            });
        }
        self.machine.commit(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use threatlens_core::analysis::{DiagramImage, Locale};
    use threatlens_core::progress::{PipelineStage, ProgressError};
    use threatlens_db::{InMemoryAnalysisStore, NewAnalysis};

    async fn seeded() -> (InMemoryAnalysisStore, AnalysisId) {
        let store = InMemoryAnalysisStore::new();
        let job = store
            .create(NewAnalysis {
                image: DiagramImage::new("a.png", "image/png", vec![1]),
                language: Locale::EnUs,
            })
            .await
            .unwrap();
        (store, job.id)
    }

    #[tokio::test]
    async fn report_persists_and_publishes() {
        let (store, id) = seeded().await;
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe();
        let mut reporter = ProgressReporter::new(&store, Some(&bus), id, ProgressMachine::new());

        reporter
            .report(ProgressSnapshot::detecting("Detecting components"))
            .await
            .unwrap();

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.progress.stage, PipelineStage::DetectingComponents);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.view.progress, stored.progress);
        assert_eq!(event.view.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn rejected_update_is_not_persisted() {
        let (store, id) = seeded().await;
        let mut reporter = ProgressReporter::new(&store, None, id, ProgressMachine::new());

        let err = reporter
            .report(ProgressSnapshot::generating(2))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            PipelineError::Transition(ProgressError::IllegalTransition { .. })
        );

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.progress.stage, PipelineStage::Waiting);
        assert_eq!(reporter.current().stage, PipelineStage::Waiting);
    }

    #[tokio::test]
    async fn fail_records_error_and_zero_percent() {
        let (store, id) = seeded().await;
        let mut reporter = ProgressReporter::new(&store, None, id, ProgressMachine::new());
        reporter
            .report(ProgressSnapshot::detecting("Detecting"))
            .await
            .unwrap();
        reporter.report(ProgressSnapshot::analyzing(1, 2, "db")).await.unwrap();

        reporter.fail("analyst rejected credentials").await.unwrap();

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.progress.percentage, 0);
        assert_eq!(stored.error.as_deref(), Some("analyst rejected credentials"));
    }
}
