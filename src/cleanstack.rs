//! LIFO stack of teardown jobs.
//!
//! Install flows push an undo step right after each side effect (mount,
//! loop device, temp dir) and call [`CleanStack::cleanup`] once on the way
//! out with whatever error the flow ended with.

use anyhow::Result;

use crate::errors::MultiError;

/// When a job runs during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Always,
    ErrorOnly,
    SuccessOnly,
}

type Action = Box<dyn FnOnce() -> Result<()>>;

pub struct CleanJob {
    action: Action,
    kind: JobKind,
}

impl CleanJob {
    pub fn new<F>(kind: JobKind, action: F) -> Self
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        Self {
            action: Box::new(action),
            kind,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn run(self) -> Result<()> {
        (self.action)()
    }
}

impl std::fmt::Debug for CleanJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanJob").field("kind", &self.kind).finish()
    }
}

/// Stack of [`CleanJob`]s. `count` is the logical top; slots above it are
/// stale and reused by the next push.
#[derive(Debug, Default)]
pub struct CleanStack {
    jobs: Vec<Option<CleanJob>>,
    count: usize,
}

impl CleanStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Push a job that runs on every cleanup.
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.push_job(CleanJob::new(JobKind::Always, action));
    }

    /// Push a job that only runs if cleanup is reached with an error.
    pub fn push_error_only<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.push_job(CleanJob::new(JobKind::ErrorOnly, action));
    }

    /// Push a job that only runs while no error has been seen.
    pub fn push_success_only<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.push_job(CleanJob::new(JobKind::SuccessOnly, action));
    }

    pub fn push_job(&mut self, job: CleanJob) {
        if self.count < self.jobs.len() {
            self.jobs[self.count] = Some(job);
        } else {
            self.jobs.push(Some(job));
        }
        self.count += 1;
    }

    /// Remove and return the top job.
    pub fn pop(&mut self) -> Option<CleanJob> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        self.jobs[self.count].take()
    }

    /// Run every job, most recent first, starting from `err`.
    ///
    /// Job failures are collected and never stop the remaining jobs. The
    /// returned error holds `err` plus every job failure.
    pub fn cleanup(&mut self, err: Option<anyhow::Error>) -> Result<()> {
        let mut errors = MultiError::new();
        if let Some(err) = err {
            errors.push(err);
        }

        while let Some(job) = self.pop() {
            let run = match job.kind() {
                JobKind::Always => true,
                JobKind::ErrorOnly => !errors.is_empty(),
                JobKind::SuccessOnly => errors.is_empty(),
            };
            if !run {
                tracing::debug!(kind = ?job.kind(), "skipping cleanup job");
                continue;
            }
            if let Err(e) = job.run() {
                tracing::debug!("cleanup job failed: {:#}", e);
                errors.push(e);
            }
        }

        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<usize>>>;

    fn recorder(log: &Log, id: usize, fail: bool) -> impl FnOnce() -> Result<()> {
        let log = log.clone();
        move || {
            log.borrow_mut().push(id);
            if fail {
                Err(anyhow!("job {} failed", id))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_push_and_pop() {
        let mut stack = CleanStack::new();
        stack.push(|| Ok(()));
        stack.push_error_only(|| Ok(()));
        stack.push_success_only(|| Ok(()));
        assert_eq!(stack.len(), 3);

        assert_eq!(stack.pop().unwrap().kind(), JobKind::SuccessOnly);
        assert_eq!(stack.pop().unwrap().kind(), JobKind::ErrorOnly);
        assert_eq!(stack.pop().unwrap().kind(), JobKind::Always);
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_push_after_pop_reuses_slot() {
        let mut stack = CleanStack::new();
        stack.push(|| Ok(()));
        stack.push(|| Ok(()));
        stack.pop();
        stack.push_error_only(|| Ok(()));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap().kind(), JobKind::ErrorOnly);
        assert_eq!(stack.pop().unwrap().kind(), JobKind::Always);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_cleanup_runs_in_reverse_order() {
        let log: Log = Rc::default();
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, 1, false));
        stack.push(recorder(&log, 2, false));
        stack.push(recorder(&log, 3, false));

        stack.cleanup(None).unwrap();
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_cleanup_with_prior_error_runs_error_jobs() {
        let log: Log = Rc::default();
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, 1, false));
        stack.push_success_only(recorder(&log, 2, false));
        stack.push_error_only(recorder(&log, 3, false));

        let err = stack.cleanup(Some(anyhow!("install failed"))).unwrap_err();
        assert!(err.to_string().contains("install failed"));
        assert_eq!(*log.borrow(), vec![3, 1]);
    }

    #[test]
    fn test_job_failure_switches_to_error_mode() {
        let log: Log = Rc::default();
        let mut stack = CleanStack::new();
        stack.push_error_only(recorder(&log, 1, false));
        stack.push_success_only(recorder(&log, 2, false));
        stack.push(recorder(&log, 3, true));

        let err = stack.cleanup(None).unwrap_err();
        assert!(err.to_string().contains("job 3 failed"));
        assert_eq!(*log.borrow(), vec![3, 1]);
    }

    #[test]
    fn test_all_failures_are_reported() {
        let log: Log = Rc::default();
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, 1, true));
        stack.push(recorder(&log, 2, true));

        let err = stack.cleanup(Some(anyhow!("original"))).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("original"));
        assert!(msg.contains("job 1 failed"));
        assert!(msg.contains("job 2 failed"));
        assert_eq!(err.downcast_ref::<MultiError>().unwrap().len(), 3);
    }

    fn kind_strategy() -> impl Strategy<Value = JobKind> {
        prop_oneof![
            Just(JobKind::Always),
            Just(JobKind::ErrorOnly),
            Just(JobKind::SuccessOnly),
        ]
    }

    proptest! {
        #[test]
        fn prop_cleanup_visits_jobs_by_predicate(
            jobs in proptest::collection::vec((kind_strategy(), any::<bool>()), 0..16)
        ) {
            let log: Log = Rc::default();
            let mut stack = CleanStack::new();
            for (id, (kind, fail)) in jobs.iter().enumerate() {
                stack.push_job(CleanJob::new(*kind, recorder(&log, id, *fail)));
            }

            let result = stack.cleanup(None);

            let mut expected = Vec::new();
            let mut failures = Vec::new();
            for (id, (kind, fail)) in jobs.iter().enumerate().rev() {
                let run = match kind {
                    JobKind::Always => true,
                    JobKind::ErrorOnly => !failures.is_empty(),
                    JobKind::SuccessOnly => failures.is_empty(),
                };
                if run {
                    expected.push(id);
                    if *fail {
                        failures.push(format!("job {} failed", id));
                    }
                }
            }

            prop_assert_eq!(&*log.borrow(), &expected);
            match result {
                Ok(()) => prop_assert!(failures.is_empty()),
                Err(err) => {
                    let msg = err.to_string();
                    for failure in &failures {
                        prop_assert!(msg.contains(failure.as_str()));
                    }
                }
            }
        }
    }
}
