//! In-process job store and scheduling state.
//!
//! Plain data guarded by the orchestrator's mutex; nothing here awaits.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use basket_core::Timestamp;
use tokio::time::Instant;

use crate::job::{Job, JobId, JobPayload, JobState};

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    /// Max-heap order: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOutcome {
    Retrying { delay: Duration, attempts_made: u32 },
    Failed { attempts_made: u32 },
}

/// Counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueCounts {
    pub queued: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    jobs: HashMap<JobId, Job>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<(Instant, u64, JobId)>>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    /// Dedupe key -> job that is queued, active or retrying.
    in_flight: HashMap<String, JobId>,
    /// Dedupe key -> follow-up held out of `ready` until the running job
    /// for that key finishes, with its requested start.
    parked: HashMap<String, (JobId, Option<Instant>)>,
    /// Whether a job may start while another with its key is running.
    exclusive_keys: bool,
    next_seq: u64,
    active: usize,
}

impl JobQueue {
    /// Queue that runs at most one job per dedupe key at a time.
    pub fn exclusive() -> Self {
        Self {
            exclusive_keys: true,
            ..Self::default()
        }
    }

    /// Job not yet started doing the same work as `payload`, if any.
    ///
    /// A running job already holds its audience, so it never absorbs more;
    /// its parked follow-up does instead.
    pub fn find_waiting(&self, payload: &JobPayload) -> Option<JobId> {
        let key = payload.dedupe_key();
        let job = self.in_flight.get(&key).and_then(|id| self.jobs.get(id))?;
        match job.state {
            JobState::Queued | JobState::Retrying => Some(job.id),
            _ => self.parked.get(&key).map(|(id, _)| *id),
        }
    }

    /// Fold the audience of `payload` into waiting job `id`.
    pub fn merge_into(&mut self, id: JobId, payload: &JobPayload) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.payload.absorb_connections(payload);
        }
    }

    pub fn push(&mut self, mut job: Job, run_at: Option<Instant>, now: Instant) -> JobId {
        job.seq = self.next_seq;
        self.next_seq += 1;

        let id = job.id;
        let key = job.payload.dedupe_key();
        let running = self.exclusive_keys
            && self
                .in_flight
                .get(&key)
                .and_then(|holder| self.jobs.get(holder))
                .is_some_and(|holder| holder.state == JobState::Active);

        if running {
            self.parked.insert(key, (id, run_at));
        } else {
            self.in_flight.insert(key, id);
            self.schedule(id, job.priority, job.seq, run_at, now);
        }
        self.jobs.insert(id, job);
        id
    }

    fn schedule(&mut self, id: JobId, priority: i32, seq: u64, run_at: Option<Instant>, now: Instant) {
        match run_at {
            Some(at) if at > now => self.delayed.push(Reverse((at, seq, id))),
            _ => self.ready.push(ReadyEntry { priority, seq, id }),
        }
    }

    /// Move due delayed jobs onto the ready heap.
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, seq, id))) = self.delayed.pop() {
                let priority = self.jobs.get(&id).map_or(0, |j| j.priority);
                self.ready.push(ReadyEntry { priority, seq, id });
            }
        }
    }

    /// Claim the highest-priority ready job and mark it active.
    pub fn claim(&mut self, now: Instant, started_at: Timestamp) -> Option<Job> {
        self.promote(now);
        while let Some(entry) = self.ready.pop() {
            let Some(job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if !matches!(job.state, JobState::Queued | JobState::Retrying) {
                continue;
            }
            job.state = JobState::Active;
            job.started_at = Some(started_at);
            self.active += 1;
            return Some(job.clone());
        }
        None
    }

    /// When the earliest delayed job becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Give up `id`'s key, handing it to the parked follow-up if one waits.
    fn release(&mut self, id: JobId) {
        self.active = self.active.saturating_sub(1);
        let Some(key) = self.jobs.get(&id).map(|job| job.payload.dedupe_key()) else {
            return;
        };
        if self.in_flight.get(&key) != Some(&id) {
            return;
        }
        self.in_flight.remove(&key);

        let Some((next, run_at)) = self.parked.remove(&key) else {
            return;
        };
        let Some((priority, seq)) = self.jobs.get(&next).map(|job| (job.priority, job.seq)) else {
            return;
        };
        self.in_flight.insert(key, next);
        match run_at {
            Some(at) => self.delayed.push(Reverse((at, seq, next))),
            None => self.ready.push(ReadyEntry { priority, seq, id: next }),
        }
    }

    pub fn complete(&mut self, id: JobId, finished_at: Timestamp, cap: usize) {
        self.release(id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Completed;
            job.finished_at = Some(finished_at);
            self.completed.push_back(id);
        }
        while self.completed.len() > cap {
            if let Some(oldest) = self.completed.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    /// Record a failed attempt and either reschedule or retain as failed.
    pub fn fail(
        &mut self,
        id: JobId,
        error: String,
        retryable: bool,
        now: Instant,
        finished_at: Timestamp,
    ) -> Option<FailOutcome> {
        let job = self.jobs.get_mut(&id)?;
        let delay = job.backoff.delay_for(job.attempts_made);
        job.attempts_made += 1;
        job.last_error = Some(error);
        let attempts_made = job.attempts_made;

        if retryable && attempts_made < job.max_attempts {
            job.state = JobState::Retrying;
            let (priority, seq) = (job.priority, job.seq);
            self.active = self.active.saturating_sub(1);
            self.schedule(id, priority, seq, Some(now + delay), now);
            return Some(FailOutcome::Retrying {
                delay,
                attempts_made,
            });
        }

        job.state = JobState::Failed;
        job.finished_at = Some(finished_at);
        self.release(id);
        self.failed.push_back(id);
        Some(FailOutcome::Failed { attempts_made })
    }

    /// Drop finished jobs past their retention window. Returns how many went.
    pub fn prune(
        &mut self,
        now: Timestamp,
        completed_retention: Duration,
        failed_retention: Duration,
    ) -> usize {
        let before = self.jobs.len();
        let jobs = &mut self.jobs;
        prune_list(&mut self.completed, jobs, now, completed_retention);
        prune_list(&mut self.failed, jobs, now, failed_retention);
        before - self.jobs.len()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn failed_jobs(&self) -> Vec<Job> {
        self.failed
            .iter()
            .filter_map(|id| self.jobs.get(id).cloned())
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self.ready.len() + self.parked.len(),
            delayed: self.delayed.len(),
            active: self.active,
            completed: self.completed.len(),
            failed: self.failed.len(),
        }
    }
}

/// Finished lists are in finish order, so pruning stops at the first young entry.
fn prune_list(
    list: &mut VecDeque<JobId>,
    jobs: &mut HashMap<JobId, Job>,
    now: Timestamp,
    retention: Duration,
) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    while let Some(id) = list.front() {
        let expired = jobs
            .get(id)
            .and_then(|job| job.finished_at)
            .map_or(true, |at| now.signed_duration_since(at) >= retention);
        if !expired {
            break;
        }
        if let Some(id) = list.pop_front() {
            jobs.remove(&id);
        }
    }
}
