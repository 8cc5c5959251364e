//! Top-level client driver
//!
//! Owns configuration, the worker pool and the shared run state. `start`
//! resolves the target once, spawns one worker per processor and deals the
//! connection quota out round-robin; `wait` blocks until the scenario
//! completes or the runtime expires, then stops and joins the workers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::RequestBuffer;
use crate::config::{AddressFamily, PerfConfig};
use crate::error::{PerfError, Result};
use crate::latency::LatencyRing;
use crate::stream::StreamMachine;
use crate::worker::{self, Worker, WorkerCounters};
use crate::PERF_ALPN;

/// Final counters for a run. A second `wait` returns the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub connections_connected: u64,
    pub connections_completed: u64,
    pub streams_started: u64,
    pub streams_completed: u64,
    pub latency_samples: u64,
}

/// One-shot manual-reset event the workers use to signal completion.
struct CompletionEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl CompletionEvent {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Wait for the event; `None` waits forever. Returns whether the event
    /// fired before the deadline.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.state.lock();
        match timeout {
            None => {
                while !*signaled {
                    self.cond.wait(&mut signaled);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                *signaled
            }
        }
    }
}

/// State shared between the driver thread and every worker.
pub struct ClientShared {
    running: AtomicBool,
    completion: CompletionEvent,
    completed_connections: AtomicU64,
    connection_count: u64,
    repeat_connections: bool,
    epoch: Instant,
    /// Latency ring, absent when latency tracking is off.
    pub latency: Option<LatencyRing>,
    pub request: RequestBuffer,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub quic_config: quinn::ClientConfig,
}

impl ClientShared {
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Microseconds since the client epoch, never zero so a reading can
    /// always be told apart from an unset stamp.
    pub fn now_us(&self) -> u64 {
        (self.epoch.elapsed().as_micros() as u64).max(1)
    }

    pub(crate) fn note_connection_completed(&self) {
        self.completed_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// A worker drained its queue. Signals completion once every queued
    /// connection across all workers has finished (non-repeat mode only).
    pub(crate) fn on_worker_connections_complete(&self) {
        if !self.repeat_connections
            && self.completed_connections.load(Ordering::Acquire) >= self.connection_count
        {
            self.completion.set();
        }
    }

    pub fn record_latency(&self, micros: u64) {
        if let Some(ring) = &self.latency {
            ring.record(micros);
        }
    }
}

pub struct PerfClient {
    config: Arc<PerfConfig>,
    shared: Arc<ClientShared>,
    workers: Vec<Arc<Worker>>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
    finished: bool,
}

impl PerfClient {
    pub fn new(mut config: PerfConfig) -> Result<Self> {
        config.validate()?;

        if config.cibir_id.is_some() && !config.use_tcp {
            warn!("the QUIC transport has no CIBIR extension; identifier ignored");
        }
        if !config.use_encryption && !config.use_tcp {
            warn!("the QUIC transport cannot disable 1-RTT protection; running encrypted");
        }

        let request = RequestBuffer::new(config.io_size, config.download_request());
        let latency = match config.max_latency_index() {
            0 => None,
            capacity => Some(LatencyRing::new(capacity)),
        };
        let tls_config = build_tls_config();
        let quic_config = build_quic_config(&config, &tls_config)?;

        let shared = Arc::new(ClientShared {
            running: AtomicBool::new(true),
            completion: CompletionEvent::new(),
            completed_connections: AtomicU64::new(0),
            connection_count: config.connection_count,
            repeat_connections: config.repeat_connections,
            epoch: Instant::now(),
            latency,
            request,
            tls_config,
            quic_config,
        });

        Ok(Self {
            config: Arc::new(config),
            shared,
            workers: Vec::new(),
            threads: Vec::new(),
            started: false,
            finished: false,
        })
    }

    pub fn config(&self) -> &PerfConfig {
        &self.config
    }

    /// Resolve the target, spawn the workers and queue the connections.
    pub fn start(&mut self) -> Result<()> {
        // One synchronous lookup; workers connect by address afterwards.
        let remote_addr = resolve_target(&self.config)?;
        debug!(%remote_addr, "target resolved");

        let processors = worker::active_processors();
        let worker_count = (self.config.worker_count as usize)
            .max(1)
            .min(processors.len().max(1));
        for index in 0..worker_count {
            let processor = processors[index % processors.len()];
            let target = worker_target(&self.config, processor);
            let local_addr = local_addr_for(&self.config, index);
            self.workers
                .push(Arc::new(Worker::new(processor, target, remote_addr, local_addr)));
        }

        for worker in &self.workers {
            self.threads.push(worker::spawn(
                worker.clone(),
                self.shared.clone(),
                self.config.clone(),
            )?);
        }

        for index in 0..self.config.connection_count {
            let slot = (index % self.workers.len() as u64) as usize;
            self.workers[slot].queue_new_connection();
        }

        self.started = true;
        Ok(())
    }

    /// Block until completion or the timeout, then stop and join the
    /// workers. `timeout_ms` of zero falls back to the configured runtime;
    /// zero runtime waits for scenario completion.
    pub fn wait(&mut self, timeout_ms: u64) -> RunSummary {
        if self.started && !self.finished {
            let effective_ms = if timeout_ms != 0 {
                timeout_ms
            } else {
                self.config.run_time
            };
            let timeout = if effective_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(effective_ms))
            };
            self.shared.completion.wait(timeout);

            self.shared.stop();
            for worker in &self.workers {
                worker.wake();
            }
            for thread in self.threads.drain(..) {
                let _ = thread.join();
            }
            self.finished = true;

            let summary = self.summary();
            self.print_summary(&summary);
            return summary;
        }
        self.summary()
    }

    /// Aggregate counters across the workers.
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for worker in &self.workers {
            let counters = &worker.counters;
            summary.connections_connected +=
                counters.connections_connected.load(Ordering::Acquire);
            summary.connections_completed +=
                counters.connections_completed.load(Ordering::Acquire);
            summary.streams_started += counters.streams_started.load(Ordering::Acquire);
            summary.streams_completed += counters.streams_completed.load(Ordering::Acquire);
        }
        summary.latency_samples = self
            .shared
            .latency
            .as_ref()
            .map(LatencyRing::len)
            .unwrap_or(0);
        summary
    }

    /// Length of the exported latency blob, zero when latency is not tracked.
    pub fn extra_data_len(&self) -> usize {
        match &self.shared.latency {
            None => 0,
            Some(ring) => 16 + ring.len() as usize * 4,
        }
    }

    /// Export `[u64 run time][u64 count][count x u32 samples]` into `out`.
    /// The exported count is derived from the buffer capacity.
    pub fn write_extra_data(&self, out: &mut [u8]) -> usize {
        match &self.shared.latency {
            None => 0,
            Some(ring) => ring.write_blob(self.config.run_time, out),
        }
    }

    fn print_summary(&self, summary: &RunSummary) {
        println!(
            "Completed {} connections and {} streams!",
            summary.connections_completed, summary.streams_completed
        );
        if self.config.print_latency {
            if let Some(stats) = self.shared.latency.as_ref().and_then(LatencyRing::summary) {
                println!(
                    "Latency us: p50 {} p90 {} p99 {} p99.9 {} max {} ({} samples)",
                    stats.p50, stats.p90, stats.p99, stats.p999, stats.max, stats.count
                );
            }
        }
    }
}

/// Shared stream finalization for both transport drivers: judge the stream,
/// print what was asked for, record the latency sample and completion.
pub(crate) fn complete_stream(
    shared: &ClientShared,
    config: &PerfConfig,
    counters: &WorkerCounters,
    machine: &StreamMachine,
) {
    let outcome = machine.finalize();

    if config.print_throughput {
        if outcome.send_success && config.upload > 0 {
            let elapsed = outcome.upload_elapsed_us.max(1);
            println!(
                "  Upload: {} bytes @ {} kbps ({}.{:03} ms).",
                outcome.bytes_acked,
                outcome.bytes_acked * 8_000 / elapsed,
                elapsed / 1000,
                elapsed % 1000
            );
        }
        if outcome.recv_success && config.download > 0 {
            let elapsed = outcome.download_elapsed_us.max(1);
            println!(
                "Download: {} bytes @ {} kbps ({}.{:03} ms).",
                outcome.bytes_received,
                outcome.bytes_received * 8_000 / elapsed,
                elapsed / 1000,
                elapsed % 1000
            );
        }
    }
    if config.print_streams {
        println!(
            "Stream: sent {} acked {} received {} send_ok {} recv_ok {}",
            machine.bytes_sent(),
            outcome.bytes_acked,
            outcome.bytes_received,
            outcome.send_success,
            outcome.recv_success
        );
    }

    if let Some(latency) = outcome.latency_us {
        shared.record_latency(latency);
        counters.streams_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn build_tls_config() -> Arc<rustls::ClientConfig> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls.alpn_protocols = vec![PERF_ALPN.to_vec()];
    Arc::new(tls)
}

fn build_quic_config(
    config: &PerfConfig,
    tls: &Arc<rustls::ClientConfig>,
) -> Result<quinn::ClientConfig> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls.as_ref().clone())
        .map_err(|err| PerfError::ParameterSet(err.to_string()))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(Duration::from_secs(30))
            .map_err(|err| PerfError::ParameterSet(err.to_string()))?,
    ));
    if !config.use_pacing {
        // Skip the slow-start ramp when pacing is off.
        let mut cubic = quinn::congestion::CubicConfig::default();
        cubic.initial_window(UNPACED_INITIAL_WINDOW);
        transport.congestion_controller_factory(Arc::new(cubic));
    }
    client.transport_config(Arc::new(transport));
    Ok(client)
}

/// Initial congestion window used when send pacing is disabled.
const UNPACED_INITIAL_WINDOW: u64 = 16 * 1024 * 1024;

fn resolve_target(config: &PerfConfig) -> Result<SocketAddr> {
    let addrs = (config.target.as_str(), config.target_port)
        .to_socket_addrs()
        .map_err(|err| PerfError::Resolution {
            target: config.target.clone(),
            reason: err.to_string(),
        })?;
    addrs
        .into_iter()
        .find(|addr| match config.target_family {
            AddressFamily::Unspec => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| PerfError::Resolution {
            target: config.target.clone(),
            reason: "no address for the requested family".into(),
        })
}

fn worker_target(config: &PerfConfig, processor: usize) -> String {
    if config.increment_target {
        format!("{}{:02X}", config.target, processor as u8)
    } else {
        config.target.clone()
    }
}

fn local_addr_for(config: &PerfConfig, index: usize) -> Option<SocketAddr> {
    if config.local_addresses.is_empty() {
        None
    } else {
        Some(config.local_addresses[index % config.local_addresses.len()])
    }
}

/// Wildcard bind address matching the remote's family.
pub(crate) fn wildcard_addr(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

/// Accepts any server certificate. The perf peers are trusted lab machines
/// and handshake rate matters more than the trust chain.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PerfConfig {
        PerfConfig {
            target: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates() {
        let config = PerfConfig {
            io_size: 100,
            ..base_config()
        };
        assert!(matches!(
            PerfClient::new(config),
            Err(PerfError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_latency_ring_sized_by_scenario() {
        let config = PerfConfig {
            print_latency: true,
            connection_count: 2,
            stream_count: 3,
            ..base_config()
        };
        let client = PerfClient::new(config).unwrap();
        assert_eq!(client.shared.latency.as_ref().unwrap().capacity(), 6);
    }

    #[test]
    fn test_no_latency_ring_without_flag() {
        let client = PerfClient::new(base_config()).unwrap();
        assert!(client.shared.latency.is_none());
        assert_eq!(client.extra_data_len(), 0);
        let mut out = [0u8; 64];
        assert_eq!(client.write_extra_data(&mut out), 0);
    }

    #[test]
    fn test_extra_data_export() {
        let config = PerfConfig {
            print_latency: true,
            connection_count: 1,
            stream_count: 4,
            run_time: 0,
            ..base_config()
        };
        let client = PerfClient::new(config).unwrap();
        client.shared.record_latency(111);
        client.shared.record_latency(222);

        let len = client.extra_data_len();
        assert_eq!(len, 16 + 2 * 4);
        let mut out = vec![0u8; len];
        assert_eq!(client.write_extra_data(&mut out), len);
        let (run_time, samples) = LatencyRing::read_blob(&out).unwrap();
        assert_eq!(run_time, 0);
        assert_eq!(samples, vec![111, 222]);
    }

    #[test]
    fn test_wait_before_start_is_immediate() {
        let mut client = PerfClient::new(base_config()).unwrap();
        let summary = client.wait(1);
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn test_worker_target_suffix() {
        let mut config = base_config();
        config.target = "host".into();
        assert_eq!(worker_target(&config, 11), "host");
        config.increment_target = true;
        assert_eq!(worker_target(&config, 11), "host0B");
        assert_eq!(worker_target(&config, 255), "hostFF");
    }

    #[test]
    fn test_resolve_target_family_filter() {
        let config = PerfConfig {
            target: "127.0.0.1".into(),
            target_family: AddressFamily::V6,
            ..Default::default()
        };
        assert!(resolve_target(&config).is_err());

        let config = PerfConfig {
            target: "127.0.0.1".into(),
            target_family: AddressFamily::V4,
            ..Default::default()
        };
        assert_eq!(
            resolve_target(&config).unwrap().ip(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_local_addr_round_robin() {
        let mut config = base_config();
        config.local_addresses = vec![
            "10.0.0.1:0".parse().unwrap(),
            "10.0.0.2:0".parse().unwrap(),
        ];
        assert_eq!(local_addr_for(&config, 0), Some("10.0.0.1:0".parse().unwrap()));
        assert_eq!(local_addr_for(&config, 1), Some("10.0.0.2:0".parse().unwrap()));
        assert_eq!(local_addr_for(&config, 2), Some("10.0.0.1:0".parse().unwrap()));
    }

    #[test]
    fn test_completion_event() {
        let event = CompletionEvent::new();
        assert!(!event.wait(Some(Duration::from_millis(5))));
        event.set();
        assert!(event.wait(Some(Duration::from_millis(5))));
        assert!(event.wait(None));
    }
}
