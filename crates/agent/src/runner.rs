//! Poll and report loops.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    tokio::{
        sync::Semaphore,
        task::JoinSet,
        time::{Instant, MissedTickBehavior, interval, interval_at},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use tally_config::AgentConfig;

use crate::{
    Result,
    collector::{GaugeSource, PollState, SystemCollector},
    sender::Sender,
};

fn seconds(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// A configured agent, ready to [`run`](Agent::run).
pub struct Agent {
    sender: Arc<Sender>,
    source: Box<dyn GaugeSource>,
    state: Arc<Mutex<PollState>>,
    poll_interval: Duration,
    report_interval: Duration,
    limiter: Arc<Semaphore>,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            sender: Arc::new(Sender::new(config)?),
            source: Box::new(SystemCollector::new()),
            state: Arc::new(Mutex::new(PollState::default())),
            poll_interval: seconds(config.poll_interval),
            report_interval: seconds(config.report_interval),
            limiter: Arc::new(Semaphore::new(config.rate_limit.max(1))),
        })
    }

    #[must_use]
    pub fn with_source(mut self, source: impl GaugeSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Arc::new(sender);
        self
    }

    #[must_use]
    pub fn with_intervals(mut self, poll: Duration, report: Duration) -> Self {
        self.poll_interval = poll;
        self.report_interval = report;
        self
    }

    /// Handle on the poll state, for inspection.
    pub fn state(&self) -> Arc<Mutex<PollState>> {
        Arc::clone(&self.state)
    }

    /// Run until `cancel` fires. In-flight reports are abandoned on cancel.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            url = %self.sender.url(),
            poll_ms = self.poll_interval.as_millis() as u64,
            report_ms = self.report_interval.as_millis() as u64,
            rate_limit = self.limiter.available_permits(),
            "agent started"
        );

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = interval_at(Instant::now() + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = poll.tick() => {
                    let readings = self.source.collect();
                    self.state.lock().unwrap_or_else(|e| e.into_inner()).record(readings);
                },
                _ = report.tick() => self.spawn_report(&mut in_flight, &cancel),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "report task failed");
                    }
                },
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "report task failed");
            }
        }
        info!("agent stopped");
    }

    fn spawn_report(&self, in_flight: &mut JoinSet<()>, cancel: &CancellationToken) {
        let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
            debug!("report skipped, too many in flight");
            return;
        };

        let (batch, polls) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.batch(), state.poll_count())
        };
        let sender = Arc::clone(&self.sender);
        let state = Arc::clone(&self.state);
        let cancel = cancel.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            tokio::select! {
                () = cancel.cancelled() => debug!("report abandoned on shutdown"),
                sent = sender.send(&batch) => match sent {
                    Ok(()) => {
                        state.lock().unwrap_or_else(|e| e.into_inner()).acknowledge(polls);
                        debug!(count = batch.len(), polls, "report delivered");
                    },
                    Err(e) => warn!(error = %e, "report failed"),
                },
            }
        });
    }
}
