//! QUIC transport driver
//!
//! Drives the connection and stream machines over quinn. Each connection is
//! one task on its worker's runtime; each stream runs its send and receive
//! directions concurrently against a shared machine. Send pacing rides the
//! path's congestion window, which stands in for the transport's
//! ideal-send-buffer signal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{self, complete_stream};
use crate::connection::{ConnectedAction, ConnectionMachine, StreamDoneAction};
use crate::error::{PerfError, Result};
use crate::stream::{RecvAction, SendOp, StreamMachine};
use crate::worker::WorkerCtx;

/// Establish and run one connection, then report completion to the worker.
/// Every failure path still lands in the completion accounting.
pub(crate) async fn run_connection(ctx: Rc<WorkerCtx>) {
    if let Err(err) = drive_connection(&ctx).await {
        debug!(error = %err, "connection failed");
    }
    ctx.worker.on_connection_complete(&ctx.shared, &ctx.config);
}

async fn drive_connection(ctx: &Rc<WorkerCtx>) -> Result<()> {
    let endpoint = obtain_endpoint(ctx)?;
    let connecting = endpoint
        .connect_with(
            ctx.shared.quic_config.clone(),
            ctx.worker.remote_addr,
            &ctx.worker.target,
        )
        .map_err(|err| PerfError::Start(err.to_string()))?;
    let connection = connecting
        .await
        .map_err(|err| PerfError::Start(err.to_string()))?;

    ctx.worker
        .counters
        .connections_connected
        .fetch_add(1, Ordering::Relaxed);
    readback_local_addr(ctx, &endpoint);

    let machine = RefCell::new(ConnectionMachine::new(&ctx.config));
    let action = machine.borrow().on_connected();
    match action {
        ConnectedAction::Shutdown => {
            // Handshake-only scenario; the close is the whole request.
            connection.close(0u32.into(), b"");
        }
        ConnectedAction::OpenStreams(count) => {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
            for _ in 0..count {
                open_stream(ctx, &machine, &connection, &done_tx);
            }
            while done_rx.recv().await.is_some() {
                let action = machine.borrow_mut().on_stream_shutdown_complete();
                match action {
                    StreamDoneAction::OpenStreams(replacements) => {
                        if ctx.shared.running() {
                            for _ in 0..replacements {
                                open_stream(ctx, &machine, &connection, &done_tx);
                            }
                        } else if machine.borrow().streams_active() == 0 {
                            break;
                        }
                    }
                    StreamDoneAction::Shutdown => break,
                    StreamDoneAction::Continue => {}
                }
            }
            if ctx.config.print_connections {
                let stats = connection.stats();
                println!(
                    "Connection: {} streams, rtt {}us, cwnd {}, lost {} packets",
                    machine.borrow().streams_created(),
                    stats.path.rtt.as_micros(),
                    stats.path.cwnd,
                    stats.path.lost_packets
                );
            }
            connection.close(0u32.into(), b"");
        }
    }
    Ok(())
}

/// One endpoint per worker when binding sharing is on, otherwise a fresh
/// socket per connection.
fn obtain_endpoint(ctx: &Rc<WorkerCtx>) -> Result<quinn::Endpoint> {
    if ctx.config.specific_local_addresses {
        if let Some(endpoint) = ctx.endpoint.borrow().as_ref() {
            return Ok(endpoint.clone());
        }
        let bind = (*ctx.worker.local_addr.lock())
            .unwrap_or_else(|| client::wildcard_addr(ctx.worker.remote_addr));
        let endpoint = quinn::Endpoint::client(bind)
            .map_err(|err| PerfError::TransportOpen(err.to_string()))?;
        *ctx.endpoint.borrow_mut() = Some(endpoint.clone());
        Ok(endpoint)
    } else {
        quinn::Endpoint::client(client::wildcard_addr(ctx.worker.remote_addr))
            .map_err(|err| PerfError::TransportOpen(err.to_string()))
    }
}

/// With binding sharing but no explicit bind address, remember the chosen
/// local address so later connections on this worker reuse it.
fn readback_local_addr(ctx: &Rc<WorkerCtx>, endpoint: &quinn::Endpoint) {
    if !ctx.config.specific_local_addresses {
        return;
    }
    let mut local = ctx.worker.local_addr.lock();
    if local.is_none() {
        *local = endpoint.local_addr().ok();
    }
}

fn open_stream(
    ctx: &Rc<WorkerCtx>,
    machine: &RefCell<ConnectionMachine>,
    connection: &quinn::Connection,
    done_tx: &mpsc::UnboundedSender<()>,
) {
    machine.borrow_mut().register_stream();
    let ctx = ctx.clone();
    let connection = connection.clone();
    let done_tx = done_tx.clone();
    tokio::task::spawn_local(async move {
        run_stream(&ctx, connection).await;
        let _ = done_tx.send(());
    });
}

async fn run_stream(ctx: &Rc<WorkerCtx>, connection: quinn::Connection) {
    let (send, recv) = match connection.open_bi().await {
        Ok(pair) => pair,
        Err(err) => {
            debug!(error = %err, "stream open failed");
            return;
        }
    };
    ctx.worker
        .counters
        .streams_started
        .fetch_add(1, Ordering::Relaxed);

    let machine = RefCell::new(StreamMachine::new(&ctx.config, 0, ctx.shared.now_us()));
    tokio::join!(
        drive_send(ctx, &machine, send, &connection),
        drive_recv(ctx, &machine, recv),
    );
    complete_stream(
        &ctx.shared,
        &ctx.config,
        &ctx.worker.counters,
        &machine.borrow(),
    );
}

async fn drive_send(
    ctx: &Rc<WorkerCtx>,
    machine: &RefCell<StreamMachine>,
    mut send: quinn::SendStream,
    connection: &quinn::Connection,
) {
    let payload = ctx.shared.request.as_slice();
    let mut pending: VecDeque<SendOp> =
        machine.borrow_mut().produce_sends(ctx.shared.now_us()).into();

    while let Some(op) = pending.pop_front() {
        match send.write_all(&payload[..op.len as usize]).await {
            Ok(()) => {
                if op.fin {
                    let _ = send.finish();
                }
                let now = ctx.shared.now_us();
                pending.extend(machine.borrow_mut().on_send_complete(op.len, false, now));
                // Pace against the path: the congestion window is the
                // transport's view of how much should stay in flight.
                let cwnd = connection.stats().path.cwnd;
                pending.extend(machine.borrow_mut().on_ideal_send_buffer(cwnd, now));
            }
            Err(err) => {
                let now = ctx.shared.now_us();
                machine.borrow_mut().on_send_complete(op.len, true, now);
                for rest in pending.drain(..) {
                    machine.borrow_mut().on_send_complete(rest.len, true, now);
                }
                if matches!(err, quinn::WriteError::Stopped(_)) {
                    machine.borrow_mut().on_peer_receive_aborted(now);
                    let _ = send.reset(0u32.into());
                } else {
                    debug!(error = %err, "stream send failed");
                }
                return;
            }
        }
    }

    // All queued data is written; wait for delivery acknowledgement.
    match send.stopped().await {
        Ok(None) => machine
            .borrow_mut()
            .on_send_shutdown_complete(ctx.shared.now_us()),
        Ok(Some(_)) => machine
            .borrow_mut()
            .on_peer_receive_aborted(ctx.shared.now_us()),
        Err(err) => debug!(error = %err, "send shutdown failed"),
    }
}

async fn drive_recv(
    ctx: &Rc<WorkerCtx>,
    machine: &RefCell<StreamMachine>,
    mut recv: quinn::RecvStream,
) {
    let mut buf = vec![0u8; ctx.config.io_size as usize];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(len)) => {
                let action = machine
                    .borrow_mut()
                    .on_receive(len as u64, false, ctx.shared.now_us());
                if action == RecvAction::AbortReceive {
                    let _ = recv.stop(0u32.into());
                    return;
                }
            }
            Ok(None) => {
                machine.borrow_mut().on_receive(0, true, ctx.shared.now_us());
                return;
            }
            Err(quinn::ReadError::Reset(_)) => {
                machine.borrow_mut().on_peer_send_aborted(ctx.shared.now_us());
                return;
            }
            Err(err) => {
                debug!(error = %err, "stream receive failed");
                return;
            }
        }
    }
}
