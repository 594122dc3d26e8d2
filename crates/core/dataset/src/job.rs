//! Write job lifecycle.

use crate::keys::RunId;

/// The lifecycle state of a write job.
///
/// A job moves `Planned → Staged → CatalogSynced → Committed`. `Failed` is reachable from every
/// non-terminal state; `Committed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Keys are planned; nothing has been written yet.
    Planned,
    /// Every object of the job is stored.
    Staged,
    /// The catalog reflects the stored objects.
    CatalogSynced,
    /// The job completed.
    Committed,
    /// The job failed. Objects it stored may remain.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Committed | JobState::Failed)
    }

    fn can_advance_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Planned, JobState::Staged)
                | (JobState::Staged, JobState::CatalogSynced)
                | (JobState::CatalogSynced, JobState::Committed)
        ) || (next == JobState::Failed && !self.is_terminal())
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Planned => "planned",
            JobState::Staged => "staged",
            JobState::CatalogSynced => "catalog-synced",
            JobState::Committed => "committed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A write job and its current state.
#[derive(Debug, Clone)]
pub struct Job {
    run_id: RunId,
    state: JobState,
}

impl Job {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: JobState::Planned,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves the job to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError {
                run_id: self.run_id,
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "job transition");
        self.state = next;
        Ok(())
    }

    /// Marks the job as failed.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.advance(JobState::Failed)
    }
}

/// A job was asked to make a transition its lifecycle does not allow.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("job {run_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub run_id: RunId,
    pub from: JobState,
    pub to: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_follows_lifecycle_to_committed() {
        //* Given
        let mut job = Job::new(RunId::new());

        //* When
        for next in [JobState::Staged, JobState::CatalogSynced, JobState::Committed] {
            job.advance(next).expect("Failed to advance job");
        }

        //* Then
        assert_eq!(job.state(), JobState::Committed);
        assert!(job.state().is_terminal());
    }

    #[test]
    fn advance_rejects_skipped_and_backward_transitions() {
        //* Given
        let mut job = Job::new(RunId::new());

        //* When
        let skipped = job.advance(JobState::CatalogSynced);
        job.advance(JobState::Staged).expect("Failed to stage job");
        let backward = job.advance(JobState::Planned);

        //* Then
        let err = skipped.expect_err("skipping staged should fail");
        assert_eq!((err.from, err.to), (JobState::Planned, JobState::CatalogSynced));
        assert!(backward.is_err());
        assert_eq!(job.state(), JobState::Staged);
    }

    #[test]
    fn fail_is_absorbing() {
        //* Given
        let mut job = Job::new(RunId::new());
        job.advance(JobState::Staged).expect("Failed to stage job");

        //* When
        job.fail().expect("Failed to fail job");

        //* Then
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.fail().is_err());
        assert!(job.advance(JobState::CatalogSynced).is_err());
    }

    #[test]
    fn committed_job_cannot_fail() {
        let mut job = Job::new(RunId::new());
        for next in [JobState::Staged, JobState::CatalogSynced, JobState::Committed] {
            job.advance(next).expect("Failed to advance job");
        }
        assert!(job.fail().is_err());
    }
}
