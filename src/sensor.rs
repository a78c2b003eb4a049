use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use log::{error, info, warn};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{CaptureOptions, RawPacket, open_capture, start_capture};
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::output::ConnectionLog;
use crate::parser::parse_frame;
use crate::registry::AnalyzerRegistry;
use crate::state::ConnectionTracker;

/// How often each worker sweeps the tracker for timed out flows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("capture failed: {0}")]
    Capture(#[from] pcap::Error),

    #[error("could not open log file '{path}': {source}")]
    LogFile {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub struct SensorOptions {
    pub capture: CaptureOptions,
    pub log_file: String,
    pub worker_threads: usize,
    pub flow_timeout: Duration,
    pub max_flow_bytes: usize,
    pub slow_analysis: Duration,
}

pub struct Sensor {
    options: SensorOptions,
    dispatcher: Dispatcher,
}

impl Sensor {
    pub fn new(options: SensorOptions, registry: AnalyzerRegistry) -> Self {
        let dispatcher =
            Dispatcher::new(Arc::new(registry)).with_slow_threshold(options.slow_analysis);
        Sensor {
            options,
            dispatcher,
        }
    }

    /// Captures until the interface goes away, analyzing every connection and
    /// writing it to the log file.
    pub fn run(self) -> Result<(), SensorError> {
        let log = ConnectionLog::open(&self.options.log_file).map_err(|source| {
            SensorError::LogFile {
                path: self.options.log_file.clone(),
                source,
            }
        })?;
        let cap = open_capture(&self.options.capture)?;
        info!(
            "Starting capture on {} with analyzers {:?}",
            self.options.capture.interface,
            self.dispatcher.registry().names()
        );

        let (packet_tx, packet_rx) = unbounded::<RawPacket>();
        let (record_tx, record_rx) = unbounded::<Connection>();
        let tracker = Arc::new(Mutex::new(ConnectionTracker::new(
            self.options.flow_timeout,
            self.options.max_flow_bytes,
        )));

        let writer = thread::spawn(move || write_records(log, record_rx));

        let workers: Vec<_> = (0..self.options.worker_threads.max(1))
            .map(|i| {
                let rx = packet_rx.clone();
                let tx = record_tx.clone();
                let tracker = Arc::clone(&tracker);
                let dispatcher = self.dispatcher.clone();
                thread::spawn(move || {
                    run_worker(i + 1, rx, tracker, dispatcher, tx, SWEEP_INTERVAL)
                })
            })
            .collect();
        drop(packet_rx);

        let captured = start_capture(cap, packet_tx);

        for handle in workers {
            if handle.join().is_err() {
                error!("A worker thread panicked");
            }
        }

        // Whatever is still open at shutdown is analyzed as well.
        let remaining = match tracker.lock() {
            Ok(mut t) => t.drain(),
            Err(poisoned) => poisoned.into_inner().drain(),
        };
        for conn in remaining {
            if let Some(conn) = analyze(&self.dispatcher, conn) {
                let _ = record_tx.send(conn);
            }
        }
        drop(record_tx);
        if writer.join().is_err() {
            error!("The writer thread panicked");
        }

        captured.map_err(SensorError::from)
    }
}

// Sweeps run on a timer rather than on receive timeouts, so flows still
// expire while packets keep arriving.
fn run_worker(
    id: usize,
    rx: Receiver<RawPacket>,
    tracker: Arc<Mutex<ConnectionTracker>>,
    dispatcher: Dispatcher,
    tx: Sender<Connection>,
    sweep_interval: Duration,
) {
    info!("Worker {} started.", id);
    let ticker = tick(sweep_interval);
    loop {
        let completed: Option<Vec<Connection>> = select! {
            recv(rx) -> msg => msg.ok().map(|raw| match parse_frame(&raw.data) {
                Some(packet) => lock(&tracker).observe(raw.timestamp, packet).into_iter().collect(),
                None => Vec::new(),
            }),
            recv(ticker) -> _ => Some(lock(&tracker).expire(Utc::now())),
        };
        // A closed packet channel means capture has stopped.
        let Some(completed) = completed else {
            break;
        };

        // The tracker lock is released here; dispatch runs in parallel.
        for conn in completed {
            if let Some(conn) = analyze(&dispatcher, conn) {
                if tx.send(conn).is_err() {
                    return;
                }
            }
        }
    }
    info!("Worker {} stopped.", id);
}

fn lock(tracker: &Mutex<ConnectionTracker>) -> std::sync::MutexGuard<'_, ConnectionTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dispatches one record. Records whose analysis failed are logged and
/// dropped so a half-analyzed record never reaches the log.
pub fn analyze(dispatcher: &Dispatcher, mut conn: Connection) -> Option<Connection> {
    match dispatcher.dispatch(&mut conn) {
        Ok(()) => Some(conn),
        Err(e) => {
            warn!("Dropping connection {}: {}", conn.uid(), e);
            None
        }
    }
}

fn write_records(mut log: ConnectionLog, rx: Receiver<Connection>) {
    for conn in rx {
        if let Err(e) = log.write(&conn) {
            error!("Failed to write connection {}: {}", conn.uid(), e);
        }
    }
    info!("Wrote {} connection records.", log.written());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, AnalyzerError, AnalyzerResult};
    use crate::connection::{ConnectionState, Transport};
    use crate::parser::testing::tcp_frame;
    use crate::registry::RegistryBuilder;
    use pnet_packet::tcp::TcpFlags;

    struct RejectUdp;

    impl Analyzer for RejectUdp {
        fn name(&self) -> &str {
            "reject-udp"
        }
        fn filter(&self, _conn: &Connection) -> bool {
            true
        }
        fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
            match conn.transport_type {
                Transport::Udp => Err(AnalyzerError::new("udp not supported")),
                Transport::Tcp => Ok(AnalyzerResult::idle("tcp")),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut builder = RegistryBuilder::new();
        builder.push(Box::new(RejectUdp));
        Dispatcher::new(Arc::new(builder.finish()))
    }

    fn conn(transport: Transport) -> Connection {
        Connection::new(
            3,
            Utc::now(),
            transport,
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            Vec::new(),
        )
    }

    #[test]
    fn test_failed_analysis_drops_record() {
        assert!(analyze(&dispatcher(), conn(Transport::Udp)).is_none());
    }

    #[test]
    fn test_successful_analysis_keeps_record() {
        let conn = analyze(&dispatcher(), conn(Transport::Tcp)).unwrap();
        assert!(conn.analyzers.contains_key("tcp"));
    }

    #[test]
    fn test_writer_drains_channel() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        let log = ConnectionLog::open(&path).unwrap();
        let (tx, rx) = unbounded();
        tx.send(conn(Transport::Tcp)).unwrap();
        tx.send(conn(Transport::Udp)).unwrap();
        drop(tx);

        write_records(log, rx);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_worker_expires_flows_under_steady_traffic() {
        let tracker = Arc::new(Mutex::new(ConnectionTracker::new(
            Duration::from_millis(200),
            1 << 20,
        )));
        let (packet_tx, packet_rx) = unbounded();
        let (record_tx, record_rx) = unbounded();
        let worker = {
            let tracker = Arc::clone(&tracker);
            let dispatcher = Dispatcher::new(Arc::new(RegistryBuilder::new().finish()));
            thread::spawn(move || {
                run_worker(
                    1,
                    packet_rx,
                    tracker,
                    dispatcher,
                    record_tx,
                    Duration::from_millis(50),
                )
            })
        };

        packet_tx
            .send(RawPacket {
                timestamp: Utc::now(),
                data: tcp_frame("10.0.0.1:40000", "10.0.0.2:80", TcpFlags::SYN, b""),
            })
            .unwrap();
        // Unparseable frames keep the packet channel busy the whole time.
        for _ in 0..50 {
            packet_tx
                .send(RawPacket {
                    timestamp: Utc::now(),
                    data: vec![0u8; 4],
                })
                .unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        drop(packet_tx);
        worker.join().unwrap();

        let records: Vec<Connection> = record_rx.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, Some(ConnectionState::TimedOut));
        assert_eq!(lock(&tracker).active_flows(), 0);
    }
}
