//! TCP transport driver
//!
//! Multiplexes logical streams over one TLS connection. Each frame carries a
//! little-endian header of payload length, stream id and flags; stream
//! machines live in the connection's stream table and are looked up by id as
//! frames and send completions arrive.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::client::complete_stream;
use crate::connection::{ConnectedAction, ConnectionMachine, StreamDoneAction};
use crate::error::{PerfError, Result};
use crate::stream::{RecvAction, SendOp};
use crate::worker::WorkerCtx;

/// Frame header: `[u32 len][u32 stream id][u8 flags]`, little-endian.
pub const FRAME_HEADER_SIZE: usize = 9;

pub const FLAG_OPEN: u8 = 0x01;
pub const FLAG_FIN: u8 = 0x02;
pub const FLAG_ABORT: u8 = 0x04;

/// One queued send. Pooled per worker; the payload bytes come from the
/// shared request buffer so the descriptor itself stays small.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpSendData {
    pub stream_id: u32,
    pub open: bool,
    pub fin: bool,
    pub abort: bool,
    pub len: u32,
}

impl TcpSendData {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.open {
            flags |= FLAG_OPEN;
        }
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.abort {
            flags |= FLAG_ABORT;
        }
        flags
    }
}

/// Decoded frame header from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub stream_id: u32,
    pub open: bool,
    pub fin: bool,
    pub abort: bool,
}

pub fn encode_frame_header(descriptor: &TcpSendData, out: &mut [u8; FRAME_HEADER_SIZE]) {
    let mut cursor = &mut out[..];
    cursor.put_u32_le(descriptor.len);
    cursor.put_u32_le(descriptor.stream_id);
    cursor.put_u8(descriptor.flags());
}

pub fn decode_frame_header(raw: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
    let mut cursor = &raw[..];
    let len = cursor.get_u32_le();
    let stream_id = cursor.get_u32_le();
    let flags = cursor.get_u8();
    FrameHeader {
        len,
        stream_id,
        open: flags & FLAG_OPEN != 0,
        fin: flags & FLAG_FIN != 0,
        abort: flags & FLAG_ABORT != 0,
    }
}

/// Establish and run one framed TLS connection, then report completion.
pub(crate) async fn run_connection(ctx: Rc<WorkerCtx>) {
    if let Err(err) = drive_connection(&ctx).await {
        debug!(error = %err, "tcp connection failed");
    }
    ctx.worker.on_connection_complete(&ctx.shared, &ctx.config);
}

async fn drive_connection(ctx: &Rc<WorkerCtx>) -> Result<()> {
    let stream = connect_socket(ctx).await?;
    let connector = TlsConnector::from(ctx.shared.tls_config.clone());
    let server_name = rustls::pki_types::ServerName::try_from(ctx.worker.target.clone())
        .map_err(|err| PerfError::TransportOpen(err.to_string()))?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|err| PerfError::TransportOpen(err.to_string()))?;

    ctx.worker
        .counters
        .connections_connected
        .fetch_add(1, Ordering::Relaxed);

    let machine = ConnectionMachine::new(&ctx.config);
    let action = machine.on_connected();
    if action == ConnectedAction::Shutdown {
        // Handshake-only scenario; dropping the stream closes it.
        return Ok(());
    }
    let ConnectedAction::OpenStreams(count) = action else {
        return Ok(());
    };

    let (send_tx, send_rx) = mpsc::unbounded_channel::<TcpSendData>();
    let conn = TcpConn {
        ctx: ctx.clone(),
        machine: RefCell::new(machine),
        sender: RefCell::new(Some(send_tx)),
    };
    for _ in 0..count {
        conn.start_stream();
    }

    let (read_half, write_half) = tokio::io::split(tls);
    let writer = drive_writes(&conn, write_half, send_rx);
    let reader = async {
        let result = drive_reads(&conn, read_half).await;
        // Server went away or finished; unblock the writer either way.
        conn.close();
        result
    };
    let (write_result, read_result) = tokio::join!(writer, reader);

    if ctx.config.print_connections {
        println!(
            "Connection: {} streams over TCP",
            conn.machine.borrow().streams_created()
        );
    }
    write_result.and(read_result)?;
    Ok(())
}

async fn connect_socket(ctx: &WorkerCtx) -> Result<TcpStream> {
    let remote = ctx.worker.remote_addr;
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }?;
    if let Some(local) = *ctx.worker.local_addr.lock() {
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }
    let stream = socket
        .connect(remote)
        .await
        .map_err(|err| PerfError::TransportOpen(err.to_string()))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Connection-local state shared by the read and write directions.
struct TcpConn {
    ctx: Rc<WorkerCtx>,
    machine: RefCell<ConnectionMachine>,
    sender: RefCell<Option<mpsc::UnboundedSender<TcpSendData>>>,
}

impl TcpConn {
    fn enqueue(&self, descriptor: TcpSendData) {
        if let Some(sender) = &*self.sender.borrow() {
            let _ = sender.send(descriptor);
        } else {
            self.ctx.send_pool.release(descriptor);
        }
    }

    /// Dropping the sender lets the writer drain its queue and finish.
    fn close(&self) {
        self.sender.borrow_mut().take();
    }

    fn descriptor(&self, stream_id: u32, op: SendOp) -> TcpSendData {
        let mut descriptor = self.ctx.send_pool.acquire();
        descriptor.stream_id = stream_id;
        descriptor.open = op.open;
        descriptor.fin = op.fin;
        descriptor.abort = false;
        descriptor.len = op.len;
        descriptor
    }

    fn start_stream(&self) {
        // Stream ids are per-worker monotonic.
        let id = self
            .ctx
            .worker
            .counters
            .streams_started
            .fetch_add(1, Ordering::Relaxed) as u32;
        let now = self.ctx.shared.now_us();
        let machine = crate::stream::StreamMachine::new(&self.ctx.config, id, now);
        self.machine.borrow_mut().insert_stream(machine);

        let ops = match self.machine.borrow_mut().stream_mut(id) {
            Some(stream) => stream.produce_sends(now),
            None => Vec::new(),
        };
        for op in ops {
            self.enqueue(self.descriptor(id, op));
        }
    }

    /// A descriptor finished writing. Completion is attributed to the
    /// descriptor being completed.
    fn on_send_complete(&self, descriptor: &TcpSendData) {
        let now = self.ctx.shared.now_us();
        let mut more = Vec::new();
        let mut finished = false;
        {
            let mut machine = self.machine.borrow_mut();
            if let Some(stream) = machine.stream_mut(descriptor.stream_id) {
                if descriptor.len > 0 {
                    more = stream.on_send_complete(descriptor.len, false, now);
                }
                if (descriptor.fin || descriptor.abort) && stream.send_end_time() == 0 {
                    stream.stamp_send_end(now);
                    finished = stream.recv_end_time() != 0;
                }
            }
        }
        for op in more {
            self.enqueue(self.descriptor(descriptor.stream_id, op));
        }
        if finished {
            self.finish_stream(descriptor.stream_id);
        }
    }

    /// A frame arrived from the peer for one of our streams.
    fn on_frame(&self, frame: &FrameHeader) {
        let now = self.ctx.shared.now_us();
        let mut abort = false;
        let mut finished = false;
        {
            let mut machine = self.machine.borrow_mut();
            let Some(stream) = machine.stream_mut(frame.stream_id) else {
                return;
            };
            match stream.on_receive(u64::from(frame.len), frame.fin, now) {
                RecvAction::AbortReceive => {
                    abort = true;
                    finished = stream.send_end_time() != 0;
                }
                RecvAction::Finished => {
                    finished = stream.send_end_time() != 0;
                }
                RecvAction::Continue => {}
            }
            if frame.abort {
                stream.stamp_recv_end(now);
                finished = stream.send_end_time() != 0;
            }
        }
        if abort {
            let mut descriptor = self.ctx.send_pool.acquire();
            descriptor.stream_id = frame.stream_id;
            descriptor.open = false;
            descriptor.fin = false;
            descriptor.abort = true;
            descriptor.len = 0;
            self.enqueue(descriptor);
        }
        if finished {
            self.finish_stream(frame.stream_id);
        }
    }

    fn finish_stream(&self, stream_id: u32) {
        if let Some(stream) = self.machine.borrow_mut().remove_stream(stream_id) {
            complete_stream(
                &self.ctx.shared,
                &self.ctx.config,
                &self.ctx.worker.counters,
                &stream,
            );
        } else {
            return;
        }
        let action = self.machine.borrow_mut().on_stream_shutdown_complete();
        match action {
            StreamDoneAction::OpenStreams(replacements) => {
                if self.ctx.shared.running() {
                    for _ in 0..replacements {
                        self.start_stream();
                    }
                } else if self.machine.borrow().streams_active() == 0 {
                    self.close();
                }
            }
            StreamDoneAction::Shutdown => self.close(),
            StreamDoneAction::Continue => {}
        }
    }
}

async fn drive_writes<W: AsyncWrite + Unpin>(
    conn: &TcpConn,
    mut write: W,
    mut queue: mpsc::UnboundedReceiver<TcpSendData>,
) -> std::io::Result<()> {
    let payload = conn.ctx.shared.request.as_slice();
    let mut header = [0u8; FRAME_HEADER_SIZE];
    while let Some(descriptor) = queue.recv().await {
        encode_frame_header(&descriptor, &mut header);
        write.write_all(&header).await?;
        if descriptor.len > 0 {
            write.write_all(&payload[..descriptor.len as usize]).await?;
        }
        conn.on_send_complete(&descriptor);
        conn.ctx.send_pool.release(descriptor);
    }
    write.shutdown().await
}

async fn drive_reads<R: AsyncRead + Unpin>(conn: &TcpConn, mut read: R) -> std::io::Result<()> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut payload = vec![0u8; conn.ctx.config.io_size as usize];
    loop {
        match read.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let frame = decode_frame_header(&header);
        // Payload contents are irrelevant; drain in io_size chunks.
        let mut remaining = frame.len as usize;
        while remaining > 0 {
            let chunk = remaining.min(payload.len());
            read.read_exact(&mut payload[..chunk]).await?;
            remaining -= chunk;
        }
        conn.on_frame(&frame);
    }
}
