//! End-to-end loopback scenarios against in-process perf peers.
//!
//! The servers implement the client's wire contract: the first eight bytes
//! of each request carry the response length to stream back, little-endian,
//! with `u64::MAX` meaning "until aborted".

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use netsurge::latency::LatencyRing;
use netsurge::tcp::{
    decode_frame_header, encode_frame_header, TcpSendData, FRAME_HEADER_SIZE,
};
use netsurge::{PerfClient, PerfConfig};

const SERVER_CHUNK: usize = 16 * 1024;

fn server_tls_config() -> rustls::ServerConfig {
    let cert = generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();
    config.alpn_protocols = vec![b"perf".to_vec()];
    config
}

fn client_config(addr: SocketAddr) -> PerfConfig {
    PerfConfig {
        target: addr.ip().to_string(),
        target_port: addr.port(),
        worker_count: 2,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// QUIC peer

fn start_quic_server() -> SocketAddr {
    let (addr_tx, addr_rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_tls_config())
                .unwrap();
            let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
            let endpoint =
                quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
            addr_tx.send(endpoint.local_addr().unwrap()).unwrap();
            while let Some(incoming) = endpoint.accept().await {
                tokio::spawn(async move {
                    let Ok(connection) = incoming.await else {
                        return;
                    };
                    while let Ok((send, recv)) = connection.accept_bi().await {
                        tokio::spawn(serve_quic_stream(send, recv));
                    }
                });
            }
        });
    });
    addr_rx.recv().unwrap()
}

async fn serve_quic_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream) {
    let mut header = [0u8; 8];
    if recv.read_exact(&mut header).await.is_err() {
        return;
    }
    let response_len = u64::from_le_bytes(header);

    // Drain the remainder of the upload.
    let mut scratch = vec![0u8; SERVER_CHUNK];
    while let Ok(Some(_)) = recv.read(&mut scratch).await {}

    let chunk = vec![0u8; SERVER_CHUNK];
    let mut remaining = response_len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        if send.write_all(&chunk[..n]).await.is_err() {
            return; // client aborted the receive direction
        }
        remaining = remaining.saturating_sub(n as u64);
    }
    let _ = send.finish();
    let _ = send.stopped().await;
}

// ---------------------------------------------------------------------------
// TCP peer (framed streams over TLS)

/// Returns the listen address plus the source address of every accepted
/// connection, so tests can check which local binding a worker used.
fn start_tcp_server() -> (SocketAddr, Arc<Mutex<Vec<SocketAddr>>>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let peers = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::clone(&peers);
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let acceptor = TlsAcceptor::from(Arc::new(server_tls_config()));
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                accepted.lock().unwrap().push(peer);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        serve_tcp_connection(tls).await;
                    }
                });
            }
        });
    });
    (addr_rx.recv().unwrap(), peers)
}

async fn serve_tcp_connection(tls: tokio_rustls::server::TlsStream<TcpStream>) {
    let (mut read, mut write) = tokio::io::split(tls);
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<(u32, u64)>();

    let writer = tokio::spawn(async move {
        let chunk = vec![0u8; SERVER_CHUNK];
        while let Some((stream_id, response_len)) = reply_rx.recv().await {
            let mut remaining = response_len;
            loop {
                let n = remaining.min(chunk.len() as u64) as u32;
                let last = remaining <= chunk.len() as u64;
                let descriptor = TcpSendData {
                    stream_id,
                    open: false,
                    fin: last,
                    abort: false,
                    len: n,
                };
                let mut header = [0u8; FRAME_HEADER_SIZE];
                encode_frame_header(&descriptor, &mut header);
                if write.write_all(&header).await.is_err() {
                    return;
                }
                if n > 0 && write.write_all(&chunk[..n as usize]).await.is_err() {
                    return;
                }
                if last {
                    break;
                }
                remaining -= u64::from(n);
            }
        }
        let _ = write.shutdown().await;
    });

    let mut requests: HashMap<u32, Option<u64>> = HashMap::new();
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut payload = vec![0u8; SERVER_CHUNK];
    'conn: loop {
        if read.read_exact(&mut header).await.is_err() {
            break;
        }
        let frame = decode_frame_header(&header);

        let mut remaining = frame.len as usize;
        let mut first_bytes = Vec::new();
        while remaining > 0 {
            let chunk = remaining.min(payload.len());
            if read.read_exact(&mut payload[..chunk]).await.is_err() {
                break 'conn;
            }
            if first_bytes.len() < 8 {
                first_bytes.extend_from_slice(&payload[..chunk.min(8 - first_bytes.len())]);
            }
            remaining -= chunk;
        }

        let entry = requests.entry(frame.stream_id).or_insert(None);
        if entry.is_none() && first_bytes.len() >= 8 {
            *entry = Some(u64::from_le_bytes(first_bytes[..8].try_into().unwrap()));
        }
        if frame.abort {
            requests.remove(&frame.stream_id);
        } else if frame.fin {
            let response_len = requests.remove(&frame.stream_id).flatten().unwrap_or(0);
            let _ = reply_tx.send((frame.stream_id, response_len));
        }
    }
    drop(reply_tx);
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn quic_handshake_only() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 2;
    config.stream_count = 0;
    config.print_latency = true;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_connected, 2);
    assert_eq!(summary.connections_completed, 2);
    assert_eq!(summary.streams_completed, 0);
    assert_eq!(summary.latency_samples, 0);
}

#[test]
fn quic_upload_stream() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 1;
    config.stream_count = 1;
    config.upload = 262_144;
    config.io_size = 65_536;
    config.print_latency = true;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_completed, 1);
    assert_eq!(summary.streams_started, 1);
    assert_eq!(summary.streams_completed, 1);
    assert_eq!(summary.latency_samples, 1);

    // Export round-trip: run time and the recorded sample survive.
    let len = client.extra_data_len();
    assert_eq!(len, 16 + 4);
    let mut blob = vec![0u8; len];
    assert_eq!(client.write_extra_data(&mut blob), len);
    let (run_time, samples) = LatencyRing::read_blob(&blob).unwrap();
    assert_eq!(run_time, 0);
    assert_eq!(samples.len(), 1);
    assert!(samples[0] > 0);
}

#[test]
fn quic_download_fanout() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 2;
    config.stream_count = 4;
    config.download = 16_384;
    config.io_size = 4_096;
    config.print_latency = true;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_completed, 2);
    assert_eq!(summary.streams_completed, 8);
    assert_eq!(summary.latency_samples, 8);

    let mut blob = vec![0u8; client.extra_data_len()];
    client.write_extra_data(&mut blob);
    let (_, samples) = LatencyRing::read_blob(&blob).unwrap();
    assert_eq!(samples.len(), 8);
    assert!(samples.iter().all(|&sample| sample > 0));
}

#[test]
fn quic_timed_download_stops_on_deadline() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 1;
    config.stream_count = 1;
    config.timed = true;
    config.download = 150; // ms
    config.run_time = 5_000; // watchdog only

    let mut client = PerfClient::new(config).unwrap();
    let started = Instant::now();
    client.start().unwrap();
    let summary = client.wait(0);

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(summary.connections_completed, 1);
    assert_eq!(summary.streams_completed, 1);
}

#[test]
fn quic_repeat_connections_until_runtime() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 4;
    config.stream_count = 0;
    config.repeat_connections = true;
    config.run_time = 700;

    let mut client = PerfClient::new(config).unwrap();
    let started = Instant::now();
    client.start().unwrap();
    let summary = client.wait(0);
    let elapsed = started.elapsed();

    // The timer, not the scenario, ends the run; the workers then quiesce.
    assert!(elapsed >= Duration::from_millis(700));
    assert!(elapsed < Duration::from_secs(3));
    assert!(summary.connections_completed >= 4);

    // A second wait is immediate and returns the same counters.
    let again = client.wait(0);
    assert_eq!(again, summary);
}

#[test]
fn quic_shared_binding_reuses_local_address() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 4;
    config.stream_count = 1;
    config.upload = 4_096;
    config.io_size = 4_096;
    config.specific_local_addresses = true;
    config.worker_count = 1; // all connections share one worker's binding

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_completed, 4);
    assert_eq!(summary.streams_completed, 4);
}

#[test]
fn quic_repeat_streams_until_runtime() {
    let addr = start_quic_server();
    let mut config = client_config(addr);
    config.connection_count = 1;
    config.stream_count = 2;
    config.upload = 1_024;
    config.io_size = 1_024;
    config.repeat_streams = true;
    config.run_time = 600;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(0);

    // Streams kept repeating until the timer fired.
    assert!(summary.streams_completed > 2);
    assert!(summary.streams_started >= summary.streams_completed);
}

#[test]
fn tcp_upload_download() {
    let (addr, _) = start_tcp_server();
    let mut config = client_config(addr);
    config.use_tcp = true;
    config.connection_count = 1;
    config.stream_count = 2;
    config.upload = 8_192;
    config.download = 8_192;
    config.io_size = 4_096;
    config.print_latency = true;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_connected, 1);
    assert_eq!(summary.connections_completed, 1);
    assert_eq!(summary.streams_started, 2);
    assert_eq!(summary.streams_completed, 2);
    assert_eq!(summary.latency_samples, 2);
}

#[test]
fn tcp_handshake_only() {
    let (addr, _) = start_tcp_server();
    let mut config = client_config(addr);
    config.use_tcp = true;
    config.connection_count = 3;
    config.stream_count = 0;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_connected, 3);
    assert_eq!(summary.connections_completed, 3);
    assert_eq!(summary.streams_completed, 0);
}

#[test]
fn tcp_bind_list_round_robins_across_workers() {
    let (addr, peers) = start_tcp_server();
    let mut config = client_config(addr);
    config.use_tcp = true;
    config.connection_count = 4;
    config.stream_count = 1;
    config.upload = 256;
    config.download = 256;
    config.io_size = 4_096;
    config.worker_count = 2;
    // Two distinct loopback source addresses, one per worker, so the peer
    // can tell which binding each connection used.
    config.local_addresses = vec![
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.2:0".parse().unwrap(),
    ];
    config.specific_local_addresses = true;

    let mut client = PerfClient::new(config).unwrap();
    client.start().unwrap();
    let summary = client.wait(10_000);

    assert_eq!(summary.connections_connected, 4);
    assert_eq!(summary.connections_completed, 4);
    assert_eq!(summary.streams_completed, 4);

    // Connections were dealt round-robin, two per worker, each worker on
    // its own local address.
    let peers = peers.lock().unwrap();
    assert_eq!(peers.len(), 4);
    let first: IpAddr = "127.0.0.1".parse().unwrap();
    let second: IpAddr = "127.0.0.2".parse().unwrap();
    assert_eq!(peers.iter().filter(|peer| peer.ip() == first).count(), 2);
    assert_eq!(peers.iter().filter(|peer| peer.ip() == second).count(), 2);
}
