//! The collection loop.
//!
//! Each sweep polls every target once. A target's samples are parsed and
//! appended to the store under one store handle; a failing target is logged
//! and skipped without affecting the others.

mod payload;
mod source;

pub use payload::{parse_payload, ParsedPayload, HEADER_LINES};
pub use source::{HttpSource, ProfileSource};

use crate::config::CollectorConfig;
use crate::error::CollectError;
use crate::store::{StackStore, StoreConfig};
use crate::types::{Observation, SampleCount, StackSignature, Target, Timestamp};
use std::convert::Infallible;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to one target during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Payload fetched and saved.
    Collected {
        /// Lines in the payload past the header.
        num_stacks: usize,
        /// Observations appended to the store.
        saved: usize,
    },
    /// The target could not be reached or answered with an error.
    FetchFailed,
    /// The payload could not be saved.
    SaveFailed,
}

/// Tally of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub collected: usize,
    pub fetch_failed: usize,
    pub save_failed: usize,
    pub observations_saved: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: CollectOutcome) {
        self.attempted += 1;
        match outcome {
            CollectOutcome::Collected { saved, .. } => {
                self.collected += 1;
                self.observations_saved += saved;
            }
            CollectOutcome::FetchFailed => self.fetch_failed += 1,
            CollectOutcome::SaveFailed => self.save_failed += 1,
        }
    }
}

/// Polls a fixed set of targets into the store.
pub struct Collector<S = HttpSource> {
    store: StoreConfig,
    targets: Vec<Target>,
    source: S,
    interval: Duration,
    fetch_workers: usize,
    clock: fn() -> Timestamp,
}

impl Collector<HttpSource> {
    /// Build a collector polling over HTTP as configured.
    pub fn from_config(config: &CollectorConfig) -> Result<Self, CollectError> {
        let source = HttpSource::new(config.request_timeout())?;
        Ok(Collector::new(config.store_config(), config.targets().collect(), source)
            .with_interval(config.interval())
            .with_fetch_workers(config.fetch_workers))
    }
}

impl<S: ProfileSource> Collector<S> {
    pub fn new(store: StoreConfig, targets: Vec<Target>, source: S) -> Self {
        Self {
            store,
            targets,
            source,
            interval: Duration::from_secs(600),
            fetch_workers: 1,
            clock: Timestamp::now,
        }
    }

    /// Pause between sweeps.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fetch on up to `workers` threads. Saving stays on the sweeping thread.
    pub fn with_fetch_workers(mut self, workers: usize) -> Self {
        self.fetch_workers = workers.max(1);
        self
    }

    /// Replace the clock that stamps observations.
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Poll one target and save what it returns. Never fails; problems are
    /// logged and reported in the outcome.
    pub fn collect(&self, target: &Target) -> CollectOutcome {
        let fetched = self.source.fetch(target);
        self.process(target, fetched)
    }

    /// Append one observation per stack, all stamped `now`, under a single
    /// store handle. Returns the number appended.
    ///
    /// Appends made before a failure stay in the store.
    pub fn save(
        &self,
        target: &Target,
        stacks: &[(StackSignature, SampleCount)],
        now: Timestamp,
    ) -> Result<usize, CollectError> {
        let store = StackStore::open(self.store.clone()).map_err(CollectError::Open)?;

        for (signature, count) in stacks {
            let observation = Observation::new(target, now, count.clone());
            store.append(signature, &observation)?;
        }

        store.close()?;
        Ok(stacks.len())
    }

    /// Poll every target once.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        debug!(targets = self.targets.len(), "Sweep started");

        if self.fetch_workers > 1 && self.targets.len() > 1 {
            self.sweep_concurrent(&mut report);
        } else {
            for target in &self.targets {
                report.record(self.collect(target));
            }
        }

        debug!(
            collected = report.collected,
            fetch_failed = report.fetch_failed,
            save_failed = report.save_failed,
            observations = report.observations_saved,
            "Sweep finished"
        );
        report
    }

    /// One sweep, summarized in the log.
    pub fn run_once(&self) -> SweepReport {
        let report = self.sweep();
        info!(
            collected = report.collected,
            failed = report.fetch_failed + report.save_failed,
            observations = report.observations_saved,
            "Sweep complete"
        );
        report
    }

    /// Sweep and sleep, forever.
    pub fn run(&self) -> Infallible {
        loop {
            self.run_once();
            debug!(seconds = self.interval.as_secs(), "Sleeping until next sweep");
            thread::sleep(self.interval);
        }
    }

    fn process(
        &self,
        target: &Target,
        fetched: Result<Vec<u8>, CollectError>,
    ) -> CollectOutcome {
        let body = match fetched {
            Ok(body) => body,
            Err(e) => {
                warn!(host = %target.host, port = target.port, error = %e, "Error collecting data");
                return CollectOutcome::FetchFailed;
            }
        };

        let parsed = parse_payload(&body);
        let saved = match self.save(target, &parsed.stacks, (self.clock)()) {
            Ok(saved) => saved,
            Err(e) => {
                let kind = if e.is_infrastructure() {
                    "infrastructure"
                } else {
                    "persistence"
                };
                warn!(host = %target.host, port = target.port, error = %e, kind, "Error saving data");
                return CollectOutcome::SaveFailed;
            }
        };

        let num_stacks = parsed.num_stacks();
        info!(host = %target.host, port = target.port, num_stacks, "Data collected");
        CollectOutcome::Collected { num_stacks, saved }
    }

    /// Fetch on worker threads; results come back over a channel and are
    /// saved here, one target at a time.
    fn sweep_concurrent(&self, report: &mut SweepReport) {
        let workers = self.fetch_workers.min(self.targets.len());
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::bounded(workers);

        for target in &self.targets {
            // Receiver is alive until the scope below ends.
            let _ = job_tx.send(target);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for target in job_rx.iter() {
                        let fetched = self.source.fetch(target);
                        if result_tx.send((target, fetched)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (target, fetched) in result_rx.iter() {
                report.record(self.process(target, fetched));
            }
        });
    }
}

/// Collect forever as configured. Only returns if the HTTP client cannot be
/// built.
pub fn run(config: &CollectorConfig) -> Result<Infallible, CollectError> {
    let collector = Collector::from_config(config)?;
    info!(
        targets = collector.targets().len(),
        interval_secs = config.interval_secs,
        db_path = %config.db_path.display(),
        "Collector started"
    );
    Ok(collector.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::TempDir;

    const T: i64 = 1_700_000_000;

    fn fixed_clock() -> Timestamp {
        Timestamp(T)
    }

    fn payload(_: &Target) -> Result<Vec<u8>, CollectError> {
        Ok(b"HEADER1\nHEADER2\nabc123 5\nxyz789 2\n".to_vec())
    }

    fn collector<S: ProfileSource>(dir: &TempDir, targets: Vec<Target>, source: S) -> Collector<S> {
        Collector::new(StoreConfig::new(dir.path().join("db")), targets, source)
            .with_clock(fixed_clock)
    }

    fn read(dir: &TempDir, key: &str) -> Option<String> {
        let store = StackStore::open_path(dir.path().join("db")).unwrap();
        store
            .get(key.as_bytes())
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    #[test]
    fn test_collect_saves_every_stack() {
        let dir = TempDir::new().unwrap();
        let target = Target::new("localhost", 16384);
        let collector = collector(&dir, vec![target.clone()], payload);

        let outcome = collector.collect(&target);
        assert_eq!(outcome, CollectOutcome::Collected { num_stacks: 2, saved: 2 });

        assert_eq!(read(&dir, "abc123").unwrap(), format!("localhost:16384:{}:5 ", T));
        assert_eq!(read(&dir, "xyz789").unwrap(), format!("localhost:16384:{}:2 ", T));
    }

    #[test]
    fn test_fetch_failure_is_contained() {
        let dir = TempDir::new().unwrap();
        let target = Target::new("localhost", 16384);
        let collector = collector(&dir, vec![target.clone()], |_: &Target| -> Result<Vec<u8>, CollectError> {
            Err(CollectError::Status(500))
        });

        assert_eq!(collector.collect(&target), CollectOutcome::FetchFailed);
        assert!(!dir.path().join("db").exists());
    }

    #[test]
    fn test_busy_store_waited_out() {
        let dir = TempDir::new().unwrap();
        let target = Target::new("localhost", 16384);
        let collector = collector(&dir, vec![target.clone()], payload);

        let held = StackStore::open_path(dir.path().join("db")).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            held.close().unwrap();
        });

        let outcome = collector.collect(&target);
        releaser.join().unwrap();

        assert_eq!(outcome, CollectOutcome::Collected { num_stacks: 2, saved: 2 });
        assert!(read(&dir, "abc123").is_some());
    }

    #[test]
    fn test_open_failure_is_infrastructure() {
        let dir = TempDir::new().unwrap();
        let target = Target::new("localhost", 16384);
        // The store path is a directory, so opening it fails outright.
        let collector = Collector::new(StoreConfig::new(dir.path()), vec![target.clone()], payload);

        let err = collector.save(&target, &[], Timestamp(T)).unwrap_err();
        assert!(err.is_infrastructure());
        assert!(matches!(err, CollectError::Open(StoreError::Io(_))));
        assert_eq!(collector.collect(&target), CollectOutcome::SaveFailed);
    }

    #[test]
    fn test_run_once_sweeps_every_target() {
        let dir = TempDir::new().unwrap();
        let targets = vec![Target::new("a", 16384), Target::new("b", 16384)];
        let collector = collector(&dir, targets, payload);

        let report = collector.run_once();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.observations_saved, 4);
        assert_eq!(
            read(&dir, "abc123").unwrap(),
            format!("a:16384:{}:5 b:16384:{}:5 ", T, T)
        );
    }

    #[test]
    fn test_concurrent_sweep_saves_all_targets() {
        let dir = TempDir::new().unwrap();
        let targets: Vec<_> = (0..6).map(|i| Target::new("localhost", 16384 + i)).collect();
        let collector = collector(&dir, targets, payload).with_fetch_workers(3);

        let report = collector.sweep();
        assert_eq!(report.attempted, 6);
        assert_eq!(report.collected, 6);
        assert_eq!(report.observations_saved, 12);

        let log = read(&dir, "abc123").unwrap();
        for i in 0..6 {
            assert!(log.contains(&format!("localhost:{}:{}:5 ", 16384 + i, T)));
        }
        assert_eq!(log.matches(' ').count(), 6);
    }
}
