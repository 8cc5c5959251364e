//! Per-request stream state machine
//!
//! Tracks send and receive progress for one request and decides what the
//! transport should do next. The machine is clock-in, action-out: drivers
//! feed transport events with a timestamp and perform the returned send
//! operations, so the same logic serves both the QUIC and TCP back-ends.

use crate::config::PerfConfig;

/// Size of the request header carrying the desired download length.
pub const REQUEST_HEADER_SIZE: u64 = 8;

/// One send handed to the transport. `len` bytes of the shared request
/// buffer, with the stream opened on the first send and finished on `fin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOp {
    pub len: u32,
    pub fin: bool,
    pub open: bool,
}

/// What the receive path should do after delivering data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvAction {
    /// Keep reading.
    Continue,
    /// The peer finished its send direction.
    Finished,
    /// Timed download satisfied; stop the receive direction.
    AbortReceive,
}

/// Result of finalizing a stream. `latency_us` is set only when both
/// directions completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub send_success: bool,
    pub recv_success: bool,
    pub latency_us: Option<u64>,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub upload_elapsed_us: u64,
    pub download_elapsed_us: u64,
}

pub struct StreamMachine {
    id: u32,
    start_time: u64,
    send_end_time: u64,
    recv_start_time: u64,
    recv_end_time: u64,
    bytes_sent: u64,
    bytes_outstanding: u64,
    bytes_acked: u64,
    bytes_received: u64,
    ideal_send_buffer: u64,
    send_complete: bool,
    // scenario parameters
    upload: u64,
    download: u64,
    timed: bool,
    io_size: u32,
    apply_isb: bool,
}

impl StreamMachine {
    pub fn new(config: &PerfConfig, id: u32, now_us: u64) -> Self {
        Self {
            id,
            start_time: now_us,
            send_end_time: 0,
            recv_start_time: 0,
            recv_end_time: 0,
            bytes_sent: 0,
            bytes_outstanding: 0,
            bytes_acked: 0,
            bytes_received: 0,
            ideal_send_buffer: u64::from(config.io_size),
            send_complete: false,
            upload: config.upload,
            download: config.download,
            timed: config.timed,
            io_size: config.io_size,
            apply_isb: config.upload > 0 && !config.use_send_buffering,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn send_end_time(&self) -> u64 {
        self.send_end_time
    }

    pub fn recv_end_time(&self) -> u64 {
        self.recv_end_time
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_outstanding(&self) -> u64 {
        self.bytes_outstanding
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn send_complete(&self) -> bool {
        self.send_complete
    }

    pub fn ideal_send_buffer(&self) -> u64 {
        self.ideal_send_buffer
    }

    /// The send-pacing loop. Queues sends until the request payload is fully
    /// described or the outstanding byte count reaches the ideal send buffer.
    pub fn produce_sends(&mut self, now_us: u64) -> Vec<SendOp> {
        let mut ops = Vec::new();
        while !self.send_complete && self.bytes_outstanding < self.ideal_send_buffer {
            let bytes_left = if self.timed {
                u64::MAX // timed sends run on the clock, not a byte budget
            } else if self.upload > 0 {
                self.upload - self.bytes_sent
            } else {
                REQUEST_HEADER_SIZE
            };

            let mut len = self.io_size;
            let mut fin = false;
            if u64::from(len) >= bytes_left {
                len = bytes_left as u32;
                fin = true;
                self.send_complete = true;
            } else if self.timed
                && now_us.saturating_sub(self.start_time) >= self.upload.saturating_mul(1000)
            {
                fin = true;
                self.send_complete = true;
            }

            let open = self.bytes_sent == 0;
            self.bytes_sent += u64::from(len);
            self.bytes_outstanding += u64::from(len);
            ops.push(SendOp { len, fin, open });
        }
        ops
    }

    /// A queued send finished. Canceled sends are accounted as no longer
    /// outstanding but never credited as acknowledged.
    pub fn on_send_complete(&mut self, len: u32, canceled: bool, now_us: u64) -> Vec<SendOp> {
        self.bytes_outstanding -= u64::from(len);
        if canceled {
            return Vec::new();
        }
        self.bytes_acked += u64::from(len);
        self.produce_sends(now_us)
    }

    /// Transport raised a new ideal-send-buffer value. Only applied while
    /// uploading with send buffering disabled; otherwise the initial window
    /// stands.
    pub fn on_ideal_send_buffer(&mut self, bytes: u64, now_us: u64) -> Vec<SendOp> {
        if bytes == 0 || !self.apply_isb || self.ideal_send_buffer == bytes {
            return Vec::new();
        }
        self.ideal_send_buffer = bytes;
        self.produce_sends(now_us)
    }

    pub fn on_receive(&mut self, len: u64, fin: bool, now_us: u64) -> RecvAction {
        self.bytes_received += len;
        if self.recv_start_time == 0 {
            self.recv_start_time = now_us;
        }
        if fin && self.recv_end_time == 0 {
            self.recv_end_time = now_us;
        }
        if self.timed
            && now_us.saturating_sub(self.recv_start_time) >= self.download.saturating_mul(1000)
        {
            if self.recv_end_time == 0 {
                self.recv_end_time = now_us;
            }
            return RecvAction::AbortReceive;
        }
        if fin {
            RecvAction::Finished
        } else {
            RecvAction::Continue
        }
    }

    /// Peer aborted its send direction; the receive side is over.
    pub fn on_peer_send_aborted(&mut self, now_us: u64) {
        if self.recv_end_time == 0 {
            self.recv_end_time = now_us;
        }
    }

    /// Peer aborted its receive direction; stop sending.
    pub fn on_peer_receive_aborted(&mut self, now_us: u64) {
        if self.send_end_time == 0 {
            self.send_end_time = now_us;
        }
        self.send_complete = true;
    }

    /// All sent data was delivered and acknowledged.
    pub fn on_send_shutdown_complete(&mut self, now_us: u64) {
        if self.send_end_time == 0 {
            self.send_end_time = now_us;
        }
    }

    /// TCP path: a Fin or Abort descriptor finished writing.
    pub fn stamp_send_end(&mut self, now_us: u64) {
        if self.send_end_time == 0 {
            self.send_end_time = now_us;
        }
    }

    /// TCP path: the peer aborted the stream.
    pub fn stamp_recv_end(&mut self, now_us: u64) {
        if self.recv_end_time == 0 {
            self.recv_end_time = now_us;
        }
    }

    pub fn both_ends_stamped(&self) -> bool {
        self.send_end_time != 0 && self.recv_end_time != 0
    }

    /// Judge the stream once the transport reports it fully shut down.
    pub fn finalize(&self) -> StreamOutcome {
        let mut send_success = self.send_end_time != 0;
        if self.upload > 0
            && (self.bytes_acked < REQUEST_HEADER_SIZE
                || (!self.timed && self.bytes_acked < self.upload))
        {
            send_success = false;
        }

        let mut recv_success = self.recv_start_time != 0 && self.recv_end_time != 0;
        if self.download > 0
            && (self.bytes_received == 0
                || (!self.timed && self.bytes_received < self.download))
        {
            recv_success = false;
        }

        let latency_us = (send_success && recv_success)
            .then(|| self.recv_end_time.saturating_sub(self.start_time));

        StreamOutcome {
            send_success,
            recv_success,
            latency_us,
            bytes_acked: self.bytes_acked,
            bytes_received: self.bytes_received,
            upload_elapsed_us: self.send_end_time.saturating_sub(self.start_time),
            download_elapsed_us: self.recv_end_time.saturating_sub(self.recv_start_time),
        }
    }
}
