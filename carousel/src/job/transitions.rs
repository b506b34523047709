//! The batch job state machine.
//!
//! ```text
//! validating -> queued | failed
//! queued      -> in_progress | failed | cancelled | expired
//! in_progress -> finalizing | cancelled | expired
//! finalizing  -> completed
//! ```
//!
//! Terminal states (`completed`, `failed`, `cancelled`, `expired`) have no outgoing edges.

use chrono::{DateTime, Utc};

use super::{Job, JobError, JobEvent, JobStatus};
use crate::error::{CarouselError, Result};

impl JobStatus {
    /// Whether `self -> to` is an edge of the state machine, ignoring guards.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Validating, Queued)
                | (Validating, Failed)
                | (Queued, InProgress)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Queued, Expired)
                | (InProgress, Finalizing)
                | (InProgress, Cancelled)
                | (InProgress, Expired)
                | (Finalizing, Completed)
        )
    }
}

impl Job {
    /// Check the edge and its guard without mutating the job.
    pub fn check_transition(&self, to: JobStatus) -> Result<()> {
        let guard_holds = match (self.status, to) {
            (JobStatus::Validating, JobStatus::Queued) => self.request_counts.total > 0,
            (JobStatus::InProgress, JobStatus::Finalizing) => self.request_counts.is_resolved(),
            _ => true,
        };

        if !self.status.can_transition_to(to) || !guard_holds {
            return Err(CarouselError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Move the job to `to`, stamping the matching timestamp and queueing a webhook notification.
    pub fn apply_transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<JobEvent> {
        self.check_transition(to)?;

        let from = self.status;
        self.status = to;
        match to {
            JobStatus::InProgress => self.started_at = Some(now),
            JobStatus::Finalizing => self.finalizing_at = Some(now),
            JobStatus::Completed => self.completed_at = Some(now),
            JobStatus::Failed => self.failed_at = Some(now),
            JobStatus::Cancelled => self.cancelled_at = Some(now),
            JobStatus::Expired => self.expired_at = Some(now),
            JobStatus::Validating | JobStatus::Queued => {}
        }
        self.webhook.notify(now);

        Ok(JobEvent {
            job_id: self.id,
            from,
            to,
            at: now,
        })
    }

    /// Cancel the job, or ask the worker to stop it if it is running.
    ///
    /// A `queued` job moves to `cancelled` and the event is returned. An `in_progress` job only
    /// gets `cancelling_at` set (idempotent); the worker drains in-flight requests and performs
    /// the transition. Any other status cannot be cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Option<JobEvent>> {
        match self.status {
            JobStatus::Queued => self.apply_transition(JobStatus::Cancelled, now).map(Some),
            JobStatus::InProgress => {
                self.cancelling_at.get_or_insert(now);
                Ok(None)
            }
            status => Err(CarouselError::AlreadyTerminal {
                job_id: self.id,
                status,
            }),
        }
    }

    /// Resume a job left mid-flight by a previous process.
    ///
    /// - `in_progress` goes back to `queued`, or to `cancelled` if a cancel was requested
    /// - `validating` goes to `queued` when its requests were persisted, otherwise to `failed`
    ///
    /// This is the only status change that bypasses the edge table. Returns `None` for any other
    /// status.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Option<JobEvent> {
        let from = self.status;
        let to = match from {
            JobStatus::InProgress if self.cancel_requested() => {
                self.cancelled_at = Some(now);
                JobStatus::Cancelled
            }
            JobStatus::InProgress => {
                self.started_at = None;
                JobStatus::Queued
            }
            JobStatus::Validating if self.request_counts.total > 0 => JobStatus::Queued,
            JobStatus::Validating => {
                if self.errors.is_empty() {
                    self.errors.push(JobError {
                        code: "interrupted".to_string(),
                        message: "Admission was interrupted before validation finished".to_string(),
                        line: None,
                    });
                }
                self.failed_at = Some(now);
                JobStatus::Failed
            }
            _ => return None,
        };
        self.status = to;
        self.webhook.notify(now);

        Some(JobEvent {
            job_id: self.id,
            from,
            to,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, WebhookStatus};
    use rstest::rstest;

    fn job_in(status: JobStatus, total: i64, completed: i64, failed: i64) -> Job {
        let mut job = Job::new(&JobInput::new("in.jsonl", "m"), "24h".to_string(), total);
        job.status = status;
        job.request_counts.completed = completed;
        job.request_counts.failed = failed;
        job
    }

    #[rstest]
    #[case(JobStatus::Validating, JobStatus::Queued, true)]
    #[case(JobStatus::Validating, JobStatus::Failed, true)]
    #[case(JobStatus::Validating, JobStatus::InProgress, false)]
    #[case(JobStatus::Queued, JobStatus::InProgress, true)]
    #[case(JobStatus::Queued, JobStatus::Failed, true)]
    #[case(JobStatus::Queued, JobStatus::Cancelled, true)]
    #[case(JobStatus::Queued, JobStatus::Expired, true)]
    #[case(JobStatus::Queued, JobStatus::Finalizing, false)]
    #[case(JobStatus::InProgress, JobStatus::Finalizing, true)]
    #[case(JobStatus::InProgress, JobStatus::Cancelled, true)]
    #[case(JobStatus::InProgress, JobStatus::Expired, true)]
    #[case(JobStatus::InProgress, JobStatus::Queued, false)]
    #[case(JobStatus::InProgress, JobStatus::Failed, false)]
    #[case(JobStatus::Finalizing, JobStatus::Completed, true)]
    #[case(JobStatus::Finalizing, JobStatus::Cancelled, false)]
    #[case(JobStatus::Completed, JobStatus::Queued, false)]
    #[case(JobStatus::Failed, JobStatus::Queued, false)]
    #[case(JobStatus::Cancelled, JobStatus::InProgress, false)]
    #[case(JobStatus::Expired, JobStatus::Completed, false)]
    fn test_edge_table(#[case] from: JobStatus, #[case] to: JobStatus, #[case] legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_empty_job_cannot_be_queued() {
        let job = job_in(JobStatus::Validating, 0, 0, 0);
        assert!(matches!(
            job.check_transition(JobStatus::Queued),
            Err(CarouselError::InvalidTransition { .. })
        ));
        assert!(job.check_transition(JobStatus::Failed).is_ok());
    }

    #[test]
    fn test_finalizing_requires_all_requests_resolved() {
        let job = job_in(JobStatus::InProgress, 3, 1, 1);
        assert!(job.check_transition(JobStatus::Finalizing).is_err());

        let job = job_in(JobStatus::InProgress, 3, 2, 1);
        assert!(job.check_transition(JobStatus::Finalizing).is_ok());
    }

    #[test]
    fn test_apply_transition_stamps_and_notifies() {
        let mut job = job_in(JobStatus::Queued, 2, 0, 0);
        job.webhook.url = Some("http://hook".to_string());
        let now = Utc::now();

        let event = job.apply_transition(JobStatus::InProgress, now).unwrap();
        assert_eq!(event.from, JobStatus::Queued);
        assert_eq!(event.to, JobStatus::InProgress);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.webhook.status, WebhookStatus::Pending);
        assert_eq!(job.webhook.sequence, 1);
    }

    #[test]
    fn test_illegal_transition_leaves_job_untouched() {
        let mut job = job_in(JobStatus::Completed, 1, 1, 0);
        let before = job.clone();
        assert!(job.apply_transition(JobStatus::Queued, Utc::now()).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn test_recover_requeues_or_cancels() {
        let now = Utc::now();

        let mut job = job_in(JobStatus::InProgress, 2, 1, 0);
        job.started_at = Some(now);
        let event = job.recover(now).unwrap();
        assert_eq!(event.to, JobStatus::Queued);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.request_counts.completed, 1);

        let mut job = job_in(JobStatus::InProgress, 2, 1, 0);
        job.cancelling_at = Some(now);
        assert_eq!(job.recover(now).unwrap().to, JobStatus::Cancelled);
        assert_eq!(job.cancelled_at, Some(now));

        let mut job = job_in(JobStatus::Queued, 2, 0, 0);
        assert!(job.recover(now).is_none());
    }

    #[test]
    fn test_recover_finishes_interrupted_admission() {
        let now = Utc::now();

        let mut job = job_in(JobStatus::Validating, 2, 0, 0);
        let event = job.recover(now).unwrap();
        assert_eq!(event.from, JobStatus::Validating);
        assert_eq!(job.status, JobStatus::Queued);

        // A rejected job that never reached `failed`
        let mut job = job_in(JobStatus::Validating, 0, 0, 0);
        assert_eq!(job.recover(now).unwrap().to, JobStatus::Failed);
        assert_eq!(job.failed_at, Some(now));
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].code, "interrupted");
    }

    #[rstest]
    #[case(JobStatus::Validating)]
    #[case(JobStatus::Finalizing)]
    #[case(JobStatus::Completed)]
    #[case(JobStatus::Failed)]
    #[case(JobStatus::Cancelled)]
    #[case(JobStatus::Expired)]
    fn test_cancel_rejected(#[case] status: JobStatus) {
        let mut job = job_in(status, 1, 1, 0);
        let before = job.clone();
        let err = job.cancel(Utc::now()).unwrap_err();
        assert!(matches!(err, CarouselError::AlreadyTerminal { status: s, .. } if s == status));
        assert_eq!(job, before);
    }

    #[test]
    fn test_cancel_queued_or_in_progress() {
        let now = Utc::now();

        let mut job = job_in(JobStatus::Queued, 2, 0, 0);
        let event = job.cancel(now).unwrap().unwrap();
        assert_eq!(event.to, JobStatus::Cancelled);
        assert_eq!(job.cancelled_at, Some(now));

        let mut job = job_in(JobStatus::InProgress, 2, 1, 0);
        assert!(job.cancel(now).unwrap().is_none());
        let later = now + chrono::Duration::seconds(5);
        assert!(job.cancel(later).unwrap().is_none());
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.cancelling_at, Some(now));
    }
}
