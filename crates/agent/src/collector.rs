//! Host sampling and the state shared between the poll and report loops.

use std::collections::BTreeMap;

use {sysinfo::System, tally_storage::Metric};

pub const POLL_COUNT: &str = "PollCount";
pub const RANDOM_VALUE: &str = "RandomValue";

/// Something that produces a fresh set of gauge readings.
pub trait GaugeSource: Send {
    fn collect(&mut self) -> Vec<(String, f64)>;
}

/// Memory and per-CPU utilization from `sysinfo`, plus a random gauge.
pub struct SystemCollector {
    system: System,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl GaugeSource for SystemCollector {
    fn collect(&mut self) -> Vec<(String, f64)> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let mut gauges = vec![
            ("TotalMemory".to_string(), self.system.total_memory() as f64),
            ("FreeMemory".to_string(), self.system.free_memory() as f64),
            ("UsedMemory".to_string(), self.system.used_memory() as f64),
            (RANDOM_VALUE.to_string(), rand::random::<f64>()),
        ];
        gauges.extend(
            self.system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, cpu)| (format!("CPUutilization{}", i + 1), f64::from(cpu.cpu_usage()))),
        );
        gauges
    }
}

/// Latest gauge readings and the polls not yet acknowledged by the server.
#[derive(Debug, Default)]
pub struct PollState {
    gauges: BTreeMap<String, f64>,
    poll_count: i64,
}

impl PollState {
    /// Store one poll's readings. Non-finite readings are dropped; the server
    /// would reject them.
    pub fn record(&mut self, readings: impl IntoIterator<Item = (String, f64)>) {
        for (name, value) in readings {
            if value.is_finite() {
                self.gauges.insert(name, value);
            }
        }
        self.poll_count += 1;
    }

    pub fn poll_count(&self) -> i64 {
        self.poll_count
    }

    /// Everything to report right now: all gauges and the pending poll count.
    pub fn batch(&self) -> Vec<Metric> {
        let mut batch: Vec<Metric> = self
            .gauges
            .iter()
            .map(|(name, value)| Metric::gauge(name.clone(), *value))
            .collect();
        batch.push(Metric::counter(POLL_COUNT, self.poll_count));
        batch
    }

    /// The server accepted a batch carrying `reported` polls.
    pub fn acknowledge(&mut self, reported: i64) {
        self.poll_count = (self.poll_count - reported).max(0);
    }
}
