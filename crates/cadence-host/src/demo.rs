//! Demonstration workload.
//!
//! A periodic task submits a batch of jobs to a task queue on every firing.
//! Jobs take a few ticks each and cycle through three priorities, so a
//! bounded queue shows its eviction policy at work in the logs.

use std::cell::Cell;
use std::rc::Rc;

use cadence_core::config::DemoConfig;
use cadence_core::interval::{IntervalSpec, PeriodicTask};
use cadence_core::phase::PhaseRegistry;
use cadence_core::queue::{QueueSpec, TaskHandle, TaskQueue};
use cadence_core::{CancellationToken, next_tick};
use tracing::{debug, info, warn};

use crate::error::HostError;

/// Counters shared by the feeder and the jobs it submits.
#[derive(Debug, Default)]
pub struct DemoStats {
    firings: Cell<u64>,
    submitted: Cell<u64>,
    completed: Cell<u64>,
    cancelled: Cell<u64>,
}

impl DemoStats {
    fn bump(counter: &Cell<u64>) {
        counter.set(counter.get().saturating_add(1));
    }

    /// Number of times the feeder fired.
    pub fn firings(&self) -> u64 {
        self.firings.get()
    }

    /// Jobs handed to the queue.
    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }

    /// Jobs that ran to completion.
    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    /// Jobs that observed cancellation while running.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.get()
    }
}

/// The installed workload. Dropping it disposes both schedulers.
#[derive(Debug)]
pub struct Demo {
    feeder: PeriodicTask,
    queue: Rc<TaskQueue>,
    stats: Rc<DemoStats>,
}

/// Create the queue and feeder and start both under `shutdown`.
///
/// # Errors
///
/// Returns [`HostError::Queue`] or [`HostError::Interval`] if either
/// scheduler cannot be created or registered.
pub fn install(
    registry: &Rc<PhaseRegistry>,
    config: &DemoConfig,
    shutdown: &CancellationToken,
) -> Result<Demo, HostError> {
    let stats = Rc::new(DemoStats::default());
    let queue = Rc::new(TaskQueue::new(registry, QueueSpec::from(&config.queue))?);
    queue.start(Some(shutdown.clone()))?;

    let feeder = {
        let queue = Rc::clone(&queue);
        let stats = Rc::clone(&stats);
        let jobs = config.jobs;
        PeriodicTask::new(registry, IntervalSpec::from(&config.interval), move || {
            DemoStats::bump(&stats.firings);
            for index in 0..jobs {
                submit_job(&queue, &stats, index)?;
            }
            Ok(())
        })?
        .on_exception(|error| warn!(error = %error, "feeder failed"))
    };
    feeder.start(Some(shutdown.clone()))?;

    info!(
        interval_ms = config.interval.interval_ms,
        jobs = config.jobs,
        policy = ?config.queue.policy,
        capacity = config.queue.capacity,
        "Demo workload installed"
    );
    Ok(Demo {
        feeder,
        queue,
        stats,
    })
}

/// Jobs cycle through priorities 0, -1, 1 and take 2 to 4 ticks.
const fn job_shape(index: u32) -> (i32, u32) {
    match index % 3 {
        0 => (0, 2),
        1 => (-1, 3),
        _ => (1, 4),
    }
}

fn submit_job(queue: &TaskQueue, stats: &Rc<DemoStats>, index: u32) -> anyhow::Result<TaskHandle> {
    let (priority, ticks) = job_shape(index);
    let job_stats = Rc::clone(stats);
    let handle = queue
        .enqueue(priority, move |token| async move {
            for _ in 0..ticks {
                if token.is_cancelled() {
                    DemoStats::bump(&job_stats.cancelled);
                    return Ok(());
                }
                next_tick().await;
            }
            DemoStats::bump(&job_stats.completed);
            Ok(())
        })?
        .on_exception(|error| warn!(error = %error, "demo job failed"));
    DemoStats::bump(&stats.submitted);
    debug!(task = %handle.id(), priority, ticks, pending = queue.pending_len(), "demo job submitted");
    Ok(handle)
}

impl Demo {
    /// Shared counters.
    pub fn stats(&self) -> &DemoStats {
        &self.stats
    }

    /// Dispose both schedulers and log the counters.
    pub fn finish(self) {
        self.feeder.dispose();
        let left_over = self.queue.count();
        self.queue.dispose();
        info!(
            firings = self.stats.firings(),
            submitted = self.stats.submitted(),
            completed = self.stats.completed(),
            cancelled = self.stats.cancelled(),
            left_over,
            "Demo workload finished"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use cadence_core::config::CadenceConfig;
    use cadence_core::driver::TickDriver;

    use super::*;

    #[test]
    fn job_shapes_cycle() {
        assert_eq!(job_shape(0), (0, 2));
        assert_eq!(job_shape(1), (-1, 3));
        assert_eq!(job_shape(2), (1, 4));
        assert_eq!(job_shape(3), (0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn demo_runs_under_the_driver() {
        let config = CadenceConfig::parse(
            "demo:\n  interval:\n    interval_ms: 50\n  queue:\n    policy: swap_last\n    capacity: 4\n  jobs: 3\n",
        )
        .unwrap();
        let registry = Rc::new(PhaseRegistry::with_standard_phases());
        let shutdown = CancellationToken::new();
        let demo = install(&registry, &config.demo, &shutdown).unwrap();

        TickDriver::new(Duration::from_millis(10))
            .with_max_ticks(60)
            .run(&registry, &shutdown)
            .await
            .unwrap();

        let stats = demo.stats();
        assert!(stats.firings() >= 10);
        assert_eq!(stats.submitted(), stats.firings().saturating_mul(3));
        assert!(stats.completed() > 0);
        demo.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disposes_the_workload() {
        let registry = Rc::new(PhaseRegistry::with_standard_phases());
        let shutdown = CancellationToken::new();
        let demo = install(&registry, &DemoConfig::default(), &shutdown).unwrap();
        shutdown.cancel();
        registry.dispatch_default().unwrap();
        assert!(demo.queue.is_disposed());
        assert_eq!(registry.callback_count(&registry.default_phase().unwrap()).unwrap(), 0);
    }
}
