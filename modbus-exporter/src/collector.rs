//! Poll cycle orchestration.
//!
//! Each scrape runs one cycle: connect if needed, then read every configured
//! register in order and turn the decoded values into gauges.
//!
//! Failures are scoped by kind:
//! - a connection failure ends the cycle (every further read would fail too),
//! - a device error for one register only drops that register.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use modbus_exporter_common::Metric;

use crate::reader::RegisterReader;
use crate::register_map::{ModbusSettings, RegisterMap, RegisterSpec};
use crate::transport::{Transport, TransportError};

/// How a poll cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every register was attempted.
    Complete,
    /// The device could not be connected; nothing was read.
    ConnectFailed,
    /// The connection broke while reading the register at `address`.
    Aborted { address: u16 },
}

/// Result of one poll cycle.
#[derive(Debug, Clone)]
pub struct PollCycle {
    /// Metrics for every register read successfully, in configuration order.
    pub metrics: Vec<Metric>,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Registers skipped because the device answered with an error.
    pub read_errors: u64,
}

/// Collector statistics.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// Poll cycles started.
    pub polls_total: u64,
    /// Cycles that could not connect.
    pub connect_failures: u64,
    /// Cycles cut short by a connection failure.
    pub cycles_aborted: u64,
    /// Registers skipped because of a device error.
    pub read_errors: u64,
    /// Registers read and decoded.
    pub registers_read: u64,
}

/// Reads the configured registers on demand and turns them into metrics.
pub struct MetricCollector {
    registers: RegisterMap,
    reader: RegisterReader,
    device_label: String,
    /// One request at a time on the physical channel.
    transport: Mutex<Box<dyn Transport>>,
    stats: RwLock<CollectorStats>,
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<MetricCollector>;

impl MetricCollector {
    /// Create a collector polling `settings.registers` over `transport`.
    pub fn new(settings: ModbusSettings, transport: Box<dyn Transport>) -> Self {
        Self {
            reader: RegisterReader::new(settings.device_id, settings.word_order),
            registers: settings.registers,
            device_label: settings.device_label,
            transport: Mutex::new(transport),
            stats: RwLock::new(CollectorStats::default()),
        }
    }

    /// The registers polled each cycle.
    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    /// Run a poll cycle and append its metrics to `metric_list`.
    ///
    /// `metric_list` holds whatever other sources already produced for this
    /// scrape; it is returned untouched if the device is unreachable.
    pub async fn get_metrics(&self, mut metric_list: Vec<Metric>) -> Vec<Metric> {
        let cycle = self.poll().await;
        metric_list.extend(cycle.metrics);

        debug!("Got {} metrics", metric_list.len());
        metric_list
    }

    /// Run one poll cycle.
    pub async fn poll(&self) -> PollCycle {
        let mut transport = self.transport.lock().await;
        let mut cycle = PollCycle {
            metrics: Vec::with_capacity(self.registers.len()),
            outcome: CycleOutcome::Complete,
            read_errors: 0,
        };

        if !transport.is_connected() {
            if let Err(e) = transport.ensure_connected().await {
                error!(severity = "critical", "Cannot connect to Modbus device: {}", e);
                cycle.outcome = CycleOutcome::ConnectFailed;
                self.record(&cycle);
                return cycle;
            }
        }

        for (group, spec) in self.registers.iter() {
            match self.reader.read(transport.as_mut(), spec).await {
                Ok(value) => {
                    info!(
                        "[{}] {} @ {}: {}",
                        self.reader.device_id(),
                        spec.help,
                        spec.address,
                        value
                    );
                    cycle.metrics.push(self.to_metric(group, spec, value));
                }
                Err(e @ TransportError::Connection(_)) => {
                    error!(
                        severity = "critical",
                        address = spec.address,
                        "Aborting poll cycle: {}",
                        e
                    );
                    cycle.outcome = CycleOutcome::Aborted {
                        address: spec.address,
                    };
                    break;
                }
                Err(e) => {
                    error!(
                        address = spec.address,
                        "Error reading register {}: {}", spec.address, e
                    );
                    cycle.read_errors += 1;
                }
            }
        }

        self.record(&cycle);
        cycle
    }

    fn to_metric(&self, group: &str, spec: &RegisterSpec, value: f64) -> Metric {
        Metric::gauge(group, value, spec.help.as_str())
            .with_label(
                self.device_label.as_str(),
                self.reader.device_id().to_string(),
            )
            .with_label("address", spec.address.to_string())
    }

    fn record(&self, cycle: &PollCycle) {
        let mut stats = self.stats.write();
        stats.polls_total += 1;
        stats.read_errors += cycle.read_errors;
        stats.registers_read += cycle.metrics.len() as u64;

        match cycle.outcome {
            CycleOutcome::Complete => {}
            CycleOutcome::ConnectFailed => stats.connect_failures += 1,
            CycleOutcome::Aborted { .. } => stats.cycles_aborted += 1,
        }
    }

    /// Get collector statistics.
    pub fn stats(&self) -> CollectorStats {
        self.stats.read().clone()
    }

    /// Collector statistics as counter metrics.
    pub fn stats_metrics(&self) -> Vec<Metric> {
        let stats = self.stats();
        vec![
            Metric::counter(
                "modbus_exporter_polls_total",
                stats.polls_total,
                "Poll cycles started",
            ),
            Metric::counter(
                "modbus_exporter_connect_failures_total",
                stats.connect_failures,
                "Poll cycles that could not connect to the device",
            ),
            Metric::counter(
                "modbus_exporter_cycles_aborted_total",
                stats.cycles_aborted,
                "Poll cycles cut short by a connection failure",
            ),
            Metric::counter(
                "modbus_exporter_read_errors_total",
                stats.read_errors,
                "Register reads rejected by the device",
            ),
            Metric::counter(
                "modbus_exporter_registers_read_total",
                stats.registers_read,
                "Registers read and decoded",
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExporterConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    /// What the fake device answers for an address.
    #[derive(Clone)]
    enum Reply {
        Words(Vec<u16>),
        Exception,
        Disconnect,
    }

    #[derive(Default)]
    struct Log {
        connects: usize,
        reads: Vec<(u16, u16, u8)>,
    }

    struct FakeTransport {
        connected: bool,
        connect_failures: usize,
        replies: HashMap<u16, Reply>,
        log: Arc<parking_lot::Mutex<Log>>,
    }

    impl FakeTransport {
        fn new(replies: &[(u16, Reply)]) -> (Self, Arc<parking_lot::Mutex<Log>>) {
            let log = Arc::new(parking_lot::Mutex::new(Log::default()));
            let transport = Self {
                connected: false,
                connect_failures: 0,
                replies: replies.iter().cloned().collect(),
                log: log.clone(),
            };
            (transport, log)
        }

        fn failing_connects(mut self, count: usize) -> Self {
            self.connect_failures = count;
            self
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn ensure_connected(&mut self) -> Result<(), TransportError> {
            self.log.lock().connects += 1;
            if self.connect_failures > 0 {
                self.connect_failures -= 1;
                return Err(TransportError::Connection("refused".to_string()));
            }
            self.connected = true;
            Ok(())
        }

        async fn read_holding_registers(
            &mut self,
            address: u16,
            count: u16,
            device_id: u8,
        ) -> Result<Vec<u16>, TransportError> {
            self.log.lock().reads.push((address, count, device_id));
            match self.replies.get(&address) {
                Some(Reply::Words(words)) => Ok(words.clone()),
                Some(Reply::Exception) => Err(TransportError::Protocol(
                    "Exception: IllegalDataAddress".to_string(),
                )),
                Some(Reply::Disconnect) | None => {
                    self.connected = false;
                    Err(TransportError::Connection("broken pipe".to_string()))
                }
            }
        }
    }

    fn collector(json: &str, transport: FakeTransport) -> MetricCollector {
        let config = ExporterConfig::parse(json).unwrap();
        let settings = ModbusSettings::from_config(&config).unwrap();
        MetricCollector::new(settings, Box::new(transport))
    }

    const FIVE_REGISTERS: &str = r#"{
        modbus: {
            registers: {
                level: { "r1": 1, "r2": 2, "r3": 3, "r4": 4, "r5": 5 }
            }
        }
    }"#;

    const THREE_REGISTERS: &str = r#"{
        modbus: {
            registers: {
                level: { "r1": 1, "r2": 2, "r3": 3 }
            }
        }
    }"#;

    #[tokio::test]
    async fn test_rtu_example_scenario() {
        let (transport, log) = FakeTransport::new(&[
            (100, Reply::Words(vec![250])),
            (101, Reply::Words(vec![300])),
        ]);
        let collector = collector(
            r#"{
                modbus: {
                    mode: "rtu",
                    registers: { temp: { "boiler:int16": 100, "tank:int16": 101 } }
                }
            }"#,
            transport,
        );

        let metrics = collector.get_metrics(Vec::new()).await;

        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.name == "temp"));
        assert_eq!(metrics[0].value, 250.0);
        assert_eq!(metrics[0].help, "boiler");
        assert_eq!(
            metrics[0].labels,
            vec![
                ("device_id".to_string(), "1".to_string()),
                ("address".to_string(), "100".to_string()),
            ]
        );
        assert_eq!(metrics[1].value, 300.0);
        assert_eq!(metrics[1].help, "tank");
        assert_eq!(metrics[1].label("address"), Some("101"));

        let log = log.lock();
        assert_eq!(log.connects, 1);
        assert_eq!(log.reads, vec![(100, 1, 1), (101, 1, 1)]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_each_reading_is_logged() {
        let (transport, _log) = FakeTransport::new(&[
            (100, Reply::Words(vec![250])),
            (101, Reply::Words(vec![300])),
        ]);
        let collector = collector(
            r#"{ modbus: { registers: { temp: { "boiler": 100, "tank": 101 } } } }"#,
            transport,
        );

        collector.poll().await;

        assert!(logs_contain("[1] boiler @ 100: 250"));
        assert!(logs_contain("[1] tank @ 101: 300"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains(" INFO ") && line.contains(" @ "))
                .count()
            {
                2 => Ok(()),
                n => Err(format!("expected 2 info readings, got {}", n)),
            }
        });
    }

    #[tokio::test]
    async fn test_float32_register() {
        let (transport, log) = FakeTransport::new(&[(200, Reply::Words(vec![0x4248, 0x0000]))]);
        let collector = collector(
            r#"{ modbus: { registers: { flow: { "flow:float32": 200 } } } }"#,
            transport,
        );

        let cycle = collector.poll().await;

        assert_eq!(cycle.outcome, CycleOutcome::Complete);
        assert_eq!(cycle.metrics.len(), 1);
        assert_eq!(cycle.metrics[0].value, 50.0);
        assert_eq!(log.lock().reads, vec![(200, 2, 1)]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connection_error_aborts_cycle() {
        let (transport, log) = FakeTransport::new(&[
            (1, Reply::Words(vec![10])),
            (2, Reply::Words(vec![20])),
            (3, Reply::Disconnect),
            (4, Reply::Words(vec![40])),
            (5, Reply::Words(vec![50])),
        ]);
        let collector = collector(FIVE_REGISTERS, transport);

        let cycle = collector.poll().await;

        assert_eq!(cycle.outcome, CycleOutcome::Aborted { address: 3 });
        let values: Vec<f64> = cycle.metrics.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![10.0, 20.0]);

        let addresses: Vec<u16> = log.lock().reads.iter().map(|r| r.0).collect();
        assert_eq!(addresses, vec![1, 2, 3]);

        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("critical")).count() {
                1 => Ok(()),
                n => Err(format!("expected 1 critical event, got {}", n)),
            }
        });

        let stats = collector.stats();
        assert_eq!(stats.cycles_aborted, 1);
        assert_eq!(stats.registers_read, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_protocol_error_skips_register() {
        let (transport, log) = FakeTransport::new(&[
            (1, Reply::Words(vec![10])),
            (2, Reply::Exception),
            (3, Reply::Words(vec![30])),
        ]);
        let collector = collector(THREE_REGISTERS, transport);

        let cycle = collector.poll().await;

        assert_eq!(cycle.outcome, CycleOutcome::Complete);
        assert_eq!(cycle.read_errors, 1);
        let addresses: Vec<Option<&str>> =
            cycle.metrics.iter().map(|m| m.label("address")).collect();
        assert_eq!(addresses, vec![Some("1"), Some("3")]);
        assert_eq!(log.lock().reads.len(), 3);

        logs_assert(|lines: &[&str]| {
            let errors = lines.iter().filter(|line| line.contains("ERROR")).count();
            let critical = lines.iter().filter(|line| line.contains("critical")).count();
            if errors == 1 && critical == 0 {
                Ok(())
            } else {
                Err(format!("got {} error and {} critical lines", errors, critical))
            }
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_failure_returns_existing_metrics() {
        let (transport, log) = FakeTransport::new(&[(1, Reply::Words(vec![10]))]);
        let collector = collector(THREE_REGISTERS, transport.failing_connects(1));

        let base = vec![Metric::gauge("modbus_exporter_build_info", 1.0, "Build")];
        let metrics = collector.get_metrics(base.clone()).await;

        assert_eq!(metrics, base);
        assert!(log.lock().reads.is_empty());
        assert!(logs_contain("Cannot connect to Modbus device"));
        assert_eq!(collector.stats().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_next_cycle_reconnects() {
        let (transport, log) = FakeTransport::new(&[
            (1, Reply::Words(vec![10])),
            (2, Reply::Words(vec![20])),
            (3, Reply::Words(vec![30])),
        ]);
        let collector = collector(THREE_REGISTERS, transport.failing_connects(1));

        assert_eq!(collector.poll().await.outcome, CycleOutcome::ConnectFailed);

        let cycle = collector.poll().await;
        assert_eq!(cycle.outcome, CycleOutcome::Complete);
        assert_eq!(cycle.metrics.len(), 3);
        assert_eq!(log.lock().connects, 2);
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (transport, log) = FakeTransport::new(&[
            (1, Reply::Words(vec![10])),
            (2, Reply::Words(vec![20])),
            (3, Reply::Words(vec![30])),
        ]);
        let collector = collector(THREE_REGISTERS, transport);

        collector.poll().await;
        collector.poll().await;

        let log = log.lock();
        assert_eq!(log.connects, 1);
        assert_eq!(log.reads.len(), 6);
    }

    #[tokio::test]
    async fn test_short_reply_is_protocol_error() {
        let (transport, _log) = FakeTransport::new(&[
            (10, Reply::Words(vec![0x4248])),
            (12, Reply::Words(vec![7])),
        ]);
        let collector = collector(
            r#"{ modbus: { registers: { v: { "a:float32": 10, "b:uint16": 12 } } } }"#,
            transport,
        );

        let cycle = collector.poll().await;

        assert_eq!(cycle.outcome, CycleOutcome::Complete);
        assert_eq!(cycle.read_errors, 1);
        assert_eq!(cycle.metrics.len(), 1);
        assert_eq!(cycle.metrics[0].value, 7.0);
    }

    #[tokio::test]
    async fn test_device_label_and_id() {
        let (transport, log) = FakeTransport::new(&[(5, Reply::Words(vec![0xFFFF]))]);
        let collector = collector(
            r#"{
                modbus: {
                    mode: "rtu",
                    device_id: 17,
                    device_label: "slave",
                    registers: { status: { "status word:uint16": 5 } }
                }
            }"#,
            transport,
        );

        let metrics = collector.get_metrics(Vec::new()).await;

        assert_eq!(metrics[0].value, 65535.0);
        assert_eq!(metrics[0].label("slave"), Some("17"));
        assert_eq!(metrics[0].label("device_id"), None);
        assert_eq!(log.lock().reads, vec![(5, 1, 17)]);
    }

    #[tokio::test]
    async fn test_groups_keep_config_order() {
        let (transport, _log) = FakeTransport::new(&[
            (1, Reply::Words(vec![1])),
            (2, Reply::Words(vec![2])),
            (3, Reply::Words(vec![3])),
        ]);
        let collector = collector(
            r#"{ modbus: { registers: { b: { "x": 3 }, a: { "y": 1, "z": 2 } } } }"#,
            transport,
        );

        let names: Vec<(String, f64)> = collector
            .get_metrics(Vec::new())
            .await
            .into_iter()
            .map(|m| (m.name, m.value))
            .collect();

        assert_eq!(
            names,
            vec![
                ("b".to_string(), 3.0),
                ("a".to_string(), 1.0),
                ("a".to_string(), 2.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_stats_metrics() {
        let (transport, _log) = FakeTransport::new(&[
            (1, Reply::Words(vec![10])),
            (2, Reply::Exception),
            (3, Reply::Words(vec![30])),
        ]);
        let collector = collector(THREE_REGISTERS, transport);

        collector.poll().await;
        collector.poll().await;

        let stats: HashMap<String, f64> = collector
            .stats_metrics()
            .into_iter()
            .map(|m| (m.name, m.value))
            .collect();

        assert_eq!(stats["modbus_exporter_polls_total"], 2.0);
        assert_eq!(stats["modbus_exporter_read_errors_total"], 2.0);
        assert_eq!(stats["modbus_exporter_registers_read_total"], 4.0);
        assert_eq!(stats["modbus_exporter_connect_failures_total"], 0.0);
        assert_eq!(stats["modbus_exporter_cycles_aborted_total"], 0.0);
    }
}
