use crate::arbitration::{Arbiter, ArbitrationState, IterationOutcome};
use crate::cloud::CloudSource;
use crate::emitter::{render_exposition, MetricSink};
use crate::local::LocalSource;
use chrono::Utc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, info_span, Instrument};

/// Epoch seconds derived from the tokio clock, anchored once at startup.
#[derive(Debug, Clone, Copy)]
pub struct EpochClock {
    wall_start: i64,
    started: Instant,
}

impl EpochClock {
    pub fn start() -> Self {
        Self::starting_at(Utc::now().timestamp())
    }

    pub fn starting_at(epoch_secs: i64) -> Self {
        Self {
            wall_start: epoch_secs,
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> i64 {
        self.wall_start + self.started.elapsed().as_secs() as i64
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunShape {
    pub duration: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub pushes: u64,
    pub push_failures: u64,
    pub no_data: u64,
}

pub struct PushLabels<'a> {
    pub job: &'a str,
    pub instance: &'a str,
}

/// Run iterations on a fixed phase until the run duration is spent.
///
/// Iteration `k` is due at `start + k * interval`. An iteration that overruns
/// its slot is followed immediately by the next one, and the schedule
/// catches back up to the original phase instead of drifting.
pub async fn run<C, L, S>(
    arbiter: &mut Arbiter<C, L>,
    sink: &S,
    clock: EpochClock,
    shape: RunShape,
    labels: PushLabels<'_>,
) -> RunSummary
where
    C: CloudSource,
    L: LocalSource,
    S: MetricSink,
{
    let mut ticker = tokio::time::interval_at(clock.started(), shape.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let mut state = ArbitrationState::new(clock.now());
    let mut summary = RunSummary::default();

    loop {
        ticker.tick().await;
        if clock.elapsed() >= shape.duration {
            break;
        }
        summary.iterations += 1;
        let iteration = summary.iterations;

        let (next, outcome) = arbiter
            .step(state, clock.now(), iteration)
            .instrument(info_span!("iteration", iteration))
            .await;
        state = next;

        match outcome {
            IterationOutcome::Publish(sample) => {
                let body = render_exposition(&sample, labels.job, labels.instance);
                match sink.push(body).await {
                    Ok(()) => {
                        summary.pushes += 1;
                        info!(iteration, source = sample.source.label(), "pushed metrics");
                    }
                    Err(err) => {
                        summary.push_failures += 1;
                        error!(iteration, "push failed: {err:#}");
                    }
                }
            }
            IterationOutcome::NoData => summary.no_data += 1,
        }
    }

    info!(
        iterations = summary.iterations,
        pushes = summary.pushes,
        push_failures = summary.push_failures,
        no_data = summary.no_data,
        elapsed_secs = clock.elapsed().as_secs(),
        "run complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::testing::{cloud_reading, FakeCloud, FakeLocal};
    use crate::arbitration::ArbitrationPolicy;
    use crate::emitter::testing::RecordingSink;
    use crate::metrics::MetricsRecord;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const T0: i64 = 1_700_000_000;

    const LABELS: PushLabels<'static> = PushLabels {
        job: "torus_power_monitor",
        instance: "torus_primary",
    };

    fn shape(duration_secs: u64, interval_secs: u64) -> RunShape {
        RunShape {
            duration: Duration::from_secs(duration_secs),
            interval: Duration::from_secs(interval_secs),
        }
    }

    fn no_backoff() -> ArbitrationPolicy {
        ArbitrationPolicy {
            backoff_enabled: false,
            ..ArbitrationPolicy::default()
        }
    }

    /// Records when each fetch started and then spends `work` on it.
    struct TimedCloud {
        origin: Instant,
        work: Duration,
        starts: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl CloudSource for TimedCloud {
        async fn fetch_live(&mut self) -> Result<MetricsRecord> {
            self.starts
                .lock()
                .unwrap()
                .push(self.origin.elapsed().as_secs());
            tokio::time::sleep(self.work).await;
            Ok(cloud_reading(None))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_second_run_at_fifteen_seconds_makes_four_iterations() {
        let clock = EpochClock::starting_at(T0);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let cloud = TimedCloud {
            origin: clock.started(),
            work: Duration::from_millis(300),
            starts: starts.clone(),
        };
        let mut arbiter: Arbiter<_, FakeLocal> = Arbiter::new(cloud, None, no_backoff());
        let sink = RecordingSink::default();

        let summary = run(&mut arbiter, &sink, clock, shape(60, 15), LABELS).await;

        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.pushes, 4);
        assert_eq!(*starts.lock().unwrap(), vec![0, 15, 30, 45]);
    }

    #[tokio::test(start_paused = true)]
    async fn default_run_shape_fits_nineteen_iterations() {
        let clock = EpochClock::starting_at(T0);
        let mut arbiter: Arbiter<_, FakeLocal> = Arbiter::new(
            FakeCloud::always(Ok(cloud_reading(Some(T0)))),
            None,
            ArbitrationPolicy::default(),
        );
        let sink = RecordingSink::default();

        let summary = run(&mut arbiter, &sink, clock, shape(280, 15), LABELS).await;
        assert_eq!(summary.iterations, 19);
        assert!(clock.elapsed() >= Duration::from_secs(280));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_iterations_catch_up_without_drift() {
        let clock = EpochClock::starting_at(T0);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let cloud = TimedCloud {
            origin: clock.started(),
            work: Duration::from_secs(20),
            starts: starts.clone(),
        };
        let mut arbiter: Arbiter<_, FakeLocal> = Arbiter::new(cloud, None, no_backoff());
        let sink = RecordingSink::default();

        let summary = run(&mut arbiter, &sink, clock, shape(90, 15), LABELS).await;

        // Every slot is overrun, so each iteration starts as soon as the last one ends.
        assert_eq!(*starts.lock().unwrap(), vec![0, 20, 40, 60, 80]);
        assert_eq!(summary.iterations, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn push_failures_do_not_stop_the_loop() {
        let clock = EpochClock::starting_at(T0);
        let mut arbiter: Arbiter<_, FakeLocal> = Arbiter::new(
            FakeCloud::always(Ok(cloud_reading(Some(T0)))),
            None,
            ArbitrationPolicy::default(),
        );
        let sink = RecordingSink::failing();

        let summary = run(&mut arbiter, &sink, clock, shape(45, 15), LABELS).await;
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.pushes, 0);
        assert_eq!(summary.push_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn iterations_without_data_are_counted_not_pushed() {
        let clock = EpochClock::starting_at(T0);
        let mut arbiter = Arbiter::new(
            FakeCloud::always(Err("portal down".to_string())),
            Some(FakeLocal::returning(None)),
            ArbitrationPolicy::default(),
        );
        let sink = RecordingSink::default();

        let summary = run(&mut arbiter, &sink, clock, shape(30, 15), LABELS).await;
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.no_data, 2);
        assert!(sink.bodies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_bodies_carry_the_source_tier() {
        let clock = EpochClock::starting_at(T0);
        let mut arbiter = Arbiter::new(
            FakeCloud::always(Ok(cloud_reading(Some(T0 - 600)))),
            Some(FakeLocal::returning(Some(MetricsRecord {
                input_voltage: Some(121.0),
                ..MetricsRecord::default()
            }))),
            ArbitrationPolicy::default(),
        );
        let sink = RecordingSink::default();

        run(&mut arbiter, &sink, clock, shape(30, 15), LABELS).await;
        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains(
            "torus_data_source{instance=\"torus_primary\", job=\"torus_power_monitor\"} 1\n"
        ));
        assert!(bodies[1].contains(
            "torus_data_source{instance=\"torus_primary\", job=\"torus_power_monitor\"} 3\n"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_clock_follows_tokio_time() {
        let clock = EpochClock::starting_at(T0);
        tokio::time::sleep(Duration::from_secs(42)).await;
        assert_eq!(clock.now(), T0 + 42);
    }

    /// Notes the name of the span each scrape runs in.
    struct SpanRecordingLocal {
        spans: Arc<Mutex<Vec<Option<&'static str>>>>,
    }

    #[async_trait]
    impl LocalSource for SpanRecordingLocal {
        async fn scrape(&self) -> Option<MetricsRecord> {
            let name = tracing::Span::current().metadata().map(|meta| meta.name());
            self.spans.lock().unwrap().push(name);
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn local_scrapes_run_inside_the_iteration_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let clock = EpochClock::starting_at(T0);
        let spans = Arc::new(Mutex::new(Vec::new()));
        let mut arbiter = Arbiter::new(
            FakeCloud::always(Err("portal down".to_string())),
            Some(SpanRecordingLocal {
                spans: spans.clone(),
            }),
            ArbitrationPolicy::default(),
        );
        let sink = RecordingSink::default();

        run(&mut arbiter, &sink, clock, shape(15, 15), LABELS).await;
        assert_eq!(*spans.lock().unwrap(), vec![Some("iteration")]);
    }
}
