//! Connection-level stream accounting
//!
//! Owns the per-connection stream counters and, in TCP mode, the table of
//! live stream machines keyed by their 32-bit stream id. Transport drivers
//! ask it what to do after connect and after each stream shutdown.

use std::collections::HashMap;

use crate::config::PerfConfig;
use crate::stream::StreamMachine;

/// Decision after the transport reports a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedAction {
    /// No streams configured; shut down immediately to measure pure HPS.
    Shutdown,
    /// Open this many streams.
    OpenStreams(u64),
}

/// Decision after one stream fully shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDoneAction {
    /// Repeat mode: top the connection back up with this many streams.
    OpenStreams(u64),
    /// Every configured stream ran; shut the connection down.
    Shutdown,
    /// Other streams are still in flight.
    Continue,
}

pub struct ConnectionMachine {
    stream_count: u64,
    repeat_streams: bool,
    streams_created: u64,
    streams_active: u64,
    streams: HashMap<u32, StreamMachine>,
}

impl ConnectionMachine {
    pub fn new(config: &PerfConfig) -> Self {
        Self {
            stream_count: config.stream_count,
            repeat_streams: config.repeat_streams,
            streams_created: 0,
            streams_active: 0,
            streams: HashMap::new(),
        }
    }

    pub fn on_connected(&self) -> ConnectedAction {
        if self.stream_count == 0 {
            ConnectedAction::Shutdown
        } else {
            ConnectedAction::OpenStreams(self.stream_count)
        }
    }

    /// Account for a new stream whose machine lives with its driver task.
    pub fn register_stream(&mut self) {
        self.streams_created += 1;
        self.streams_active += 1;
    }

    /// Account for a new stream and keep its machine in the table (TCP mode).
    pub fn insert_stream(&mut self, machine: StreamMachine) {
        self.register_stream();
        self.streams.insert(machine.id(), machine);
    }

    pub fn stream_mut(&mut self, id: u32) -> Option<&mut StreamMachine> {
        self.streams.get_mut(&id)
    }

    pub fn remove_stream(&mut self, id: u32) -> Option<StreamMachine> {
        self.streams.remove(&id)
    }

    pub fn streams_created(&self) -> u64 {
        self.streams_created
    }

    pub fn streams_active(&self) -> u64 {
        self.streams_active
    }

    pub fn on_stream_shutdown_complete(&mut self) -> StreamDoneAction {
        self.streams_active -= 1;
        if self.repeat_streams {
            StreamDoneAction::OpenStreams(self.stream_count - self.streams_active)
        } else if self.streams_active == 0 && self.streams_created == self.stream_count {
            StreamDoneAction::Shutdown
        } else {
            StreamDoneAction::Continue
        }
    }
}
