//! Scenario configuration and `-name:value` option parsing

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::warn;

use crate::error::{PerfError, Result};
use crate::{DEFAULT_IO_SIZE, DEFAULT_PORT, MAX_REQUESTS_PER_SECOND};

pub const HELP_TEXT: &str = "\
Usage: netsurge -target:<hostname/ip> [options]

  Remote options:
  -ip:<0/4/6>              A hint for resolving the hostname to an IP address. (def:0)
  -port:<####>             The port of the server. (def:4433)
  -cibir:<hex_bytes>       A CIBIR well-known identifier (at most 6 bytes).
  -incrementtarget:<0/1>   Append a per-worker suffix to the target hostname. (def:0)

  Local options:
  -threads:<####>          The max number of worker threads to use.
  -affinitize:<0/1>        Affinitizes worker threads to a core. (def:0)
  -comp:<####>             The network compartment ID to run in. (Windows only)
  -bind:<addr[,addr...]>   The local IP address(es) to bind to.
  -share:<0/1>             Shares the same local bindings. (def:0)

  Config options:
  -tcp:<0/1>               Disables/enables TCP usage (instead of QUIC). (def:0)
  -encrypt:<0/1>           Disables/enables encryption. (def:1)
  -pacing:<0/1>            Disables/enables send pacing. (def:1)
  -sendbuf:<0/1>           Disables/enables send buffering. (def:0)
  -ptput:<0/1>             Print throughput information. (def:0)
  -pconn:<0/1>             Print connection statistics. (def:0)
  -pstream:<0/1>           Print stream statistics. (def:0)
  -platency:<0/1>          Print latency statistics. (def:0)

  Scenario options:
  -conns:<####>            The number of connections to use. (def:1)
  -streams:<####>          The number of streams to send on at a time. (def:0)
  -iosize:<####>           The size of each send request queued. (def:65536)
  -upload:<####>           The length of bytes to send on each stream. (def:0)
  -download:<####>         The length of bytes to receive on each stream. (def:0)
  -timed:<0/1>             Indicates the upload/download args are times (in ms). (def:0)
  -rconn:<0/1>             Repeat the scenario at the connection level. (def:0)
  -rstream:<0/1>           Repeat the scenario at the stream level. (def:0)
  -runtime:<####>          The total runtime (in ms). Required for repeat scenarios. (def:0)
";

/// Address family hint for target resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspec,
    V4,
    V6,
}

/// A CIBIR identifier: a zero offset byte followed by up to six decoded hex bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CibirId {
    bytes: [u8; 7],
    len: u8,
}

impl CibirId {
    pub fn from_hex(raw: &str) -> Result<Self> {
        let decoded = decode_hex(raw).ok_or_else(|| {
            PerfError::InvalidParameter("cibir id must be a non-empty hex string".into())
        })?;
        if decoded.len() > 6 {
            return Err(PerfError::InvalidParameter(
                "cibir id must be a hex string of at most 6 bytes".into(),
            ));
        }
        let mut bytes = [0u8; 7];
        bytes[1..1 + decoded.len()].copy_from_slice(&decoded);
        Ok(Self {
            bytes,
            len: decoded.len() as u8,
        })
    }

    /// Length-prefixed wire form, offset byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len) + 1]
    }
}

/// Immutable client configuration. Populated once by `parse` and shared
/// read-only across the workers for the duration of the run.
#[derive(Debug, Clone)]
pub struct PerfConfig {
    pub target: String,
    pub target_family: AddressFamily,
    pub target_port: u16,
    pub cibir_id: Option<CibirId>,
    pub increment_target: bool,
    pub worker_count: u32,
    pub affinitize_workers: bool,
    pub specific_local_addresses: bool,
    pub local_addresses: Vec<SocketAddr>,
    pub use_tcp: bool,
    pub use_encryption: bool,
    pub use_pacing: bool,
    pub use_send_buffering: bool,
    pub print_throughput: bool,
    pub print_connections: bool,
    pub print_streams: bool,
    pub print_latency: bool,
    pub connection_count: u64,
    pub stream_count: u64,
    pub io_size: u32,
    pub upload: u64,
    pub download: u64,
    pub timed: bool,
    pub repeat_connections: bool,
    pub repeat_streams: bool,
    /// Total runtime in milliseconds. Zero means run to completion.
    pub run_time: u64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            target_family: AddressFamily::Unspec,
            target_port: DEFAULT_PORT,
            cibir_id: None,
            increment_target: false,
            worker_count: num_cpus::get() as u32,
            affinitize_workers: false,
            specific_local_addresses: false,
            local_addresses: Vec::new(),
            use_tcp: false,
            use_encryption: true,
            use_pacing: true,
            use_send_buffering: false,
            print_throughput: false,
            print_connections: false,
            print_streams: false,
            print_latency: false,
            connection_count: 1,
            stream_count: 0,
            io_size: DEFAULT_IO_SIZE,
            upload: 0,
            download: 0,
            timed: false,
            repeat_connections: false,
            repeat_streams: false,
            run_time: 0,
        }
    }
}

impl PerfConfig {
    /// Parse the recognized option set from `-name:value` arguments.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        // Remote target options
        config.target = lookup(args, &["target", "server"])
            .ok_or_else(|| PerfError::InvalidParameter("must specify '-target'".into()))?
            .to_string();
        if let Some(ip) = parse_u64(args, &["ip"])? {
            config.target_family = match ip {
                4 => AddressFamily::V4,
                6 => AddressFamily::V6,
                _ => AddressFamily::Unspec,
            };
        }
        if let Some(port) = parse_u64(args, &["port"])? {
            config.target_port = u16::try_from(port)
                .map_err(|_| PerfError::InvalidParameter(format!("port {port} out of range")))?;
        }
        if let Some(raw) = lookup(args, &["cibir"]) {
            config.cibir_id = Some(CibirId::from_hex(raw)?);
        }
        config.increment_target = parse_bool(args, &["incrementtarget"])?.unwrap_or(false);

        // Local execution options
        if let Some(threads) = parse_u64(args, &["threads", "workers"])? {
            config.worker_count = (threads as u32).max(1);
        }
        config.affinitize_workers = parse_bool(args, &["affinitize"])?.unwrap_or(false);
        if let Some(comp) = parse_u64(args, &["comp"])? {
            if !cfg!(target_os = "windows") {
                warn!(compartment = comp, "network compartments are not supported on this platform");
            }
        }
        config.specific_local_addresses = parse_bool(args, &["share"])?.unwrap_or(false);
        if let Some(raw) = lookup(args, &["bind"]) {
            config.local_addresses = parse_bind_list(raw)?;
            config.specific_local_addresses = true;
        }

        // General configuration options
        config.use_tcp = parse_bool(args, &["tcp"])?.unwrap_or(false);
        config.use_encryption = parse_bool(args, &["encrypt"])?.unwrap_or(true);
        config.use_pacing = parse_bool(args, &["pacing"])?.unwrap_or(true);
        config.use_send_buffering = parse_bool(args, &["sendbuf"])?.unwrap_or(false);
        config.print_throughput = parse_bool(args, &["ptput"])?.unwrap_or(false);
        config.print_connections = parse_bool(args, &["pconn", "pconnection"])?.unwrap_or(false);
        config.print_streams = parse_bool(args, &["pstream"])?.unwrap_or(false);
        config.print_latency = parse_bool(args, &["platency", "plat"])?.unwrap_or(false);

        // Scenario options
        if let Some(conns) = parse_u64(args, &["conns"])? {
            config.connection_count = conns;
        }
        if let Some(streams) = parse_u64(args, &["streams", "requests"])? {
            config.stream_count = streams;
        }
        if let Some(io_size) = parse_u64(args, &["iosize"])? {
            config.io_size = u32::try_from(io_size)
                .map_err(|_| PerfError::InvalidParameter(format!("iosize {io_size} out of range")))?;
        }
        config.upload = parse_u64(args, &["upload", "up", "request"])?.unwrap_or(0);
        config.download = parse_u64(args, &["download", "down", "response"])?.unwrap_or(0);
        config.timed = parse_bool(args, &["timed"])?.unwrap_or(false);
        config.repeat_connections = parse_bool(args, &["rconn"])?.unwrap_or(false);
        config.repeat_streams = parse_bool(args, &["rstream"])?.unwrap_or(false);
        config.run_time = parse_u64(args, &["runtime", "time", "run"])?.unwrap_or(0);

        config.validate()?;
        Ok(config)
    }

    /// Post-parse validation and derivations. Also applied to hand-built
    /// configurations by `PerfClient::new`.
    pub fn validate(&mut self) -> Result<()> {
        if self.target.is_empty() {
            return Err(PerfError::InvalidParameter("must specify '-target'".into()));
        }
        if self.io_size < 256 {
            return Err(PerfError::InvalidParameter("'iosize' too small".into()));
        }
        if (self.repeat_connections || self.repeat_streams) && self.run_time == 0 {
            return Err(PerfError::InvalidParameter(
                "must specify a 'runtime' if using a repeat parameter".into(),
            ));
        }
        if self.use_tcp && !self.use_encryption {
            return Err(PerfError::InvalidParameter(
                "TCP mode doesn't support disabling encryption".into(),
            ));
        }
        if (self.upload > 0 || self.download > 0) && self.stream_count == 0 {
            self.stream_count = 1; // up/down args imply a stream
        }
        Ok(())
    }

    /// Capacity of the latency ring, zero when latency is not tracked.
    pub fn max_latency_index(&self) -> u64 {
        if !self.print_latency {
            return 0;
        }
        // Cap so the sample buffer length stays within a 32-bit byte count.
        let cap = u64::from(u32::MAX) / 4;
        let index = if self.run_time > 0 {
            (self.run_time / 1000).saturating_mul(MAX_REQUESTS_PER_SECOND)
        } else {
            self.connection_count.saturating_mul(self.stream_count)
        };
        if index > cap {
            warn!("limiting request latency tracking to {cap} samples");
            cap
        } else {
            index
        }
    }

    /// Value carried in the first eight bytes of every request payload.
    pub fn download_request(&self) -> u64 {
        if self.timed {
            u64::MAX
        } else {
            self.download
        }
    }
}

fn lookup<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    for arg in args {
        let Some(body) = arg.strip_prefix('-') else {
            continue;
        };
        let Some((key, value)) = body.split_once(':') else {
            continue;
        };
        if names.iter().any(|name| key.eq_ignore_ascii_case(name)) {
            return Some(value);
        }
    }
    None
}

fn parse_u64(args: &[String], names: &[&str]) -> Result<Option<u64>> {
    match lookup(args, names) {
        None => Ok(None),
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
            PerfError::InvalidParameter(format!("'-{}' expects a number, got '{raw}'", names[0]))
        }),
    }
}

fn parse_bool(args: &[String], names: &[&str]) -> Result<Option<bool>> {
    Ok(parse_u64(args, names)?.map(|value| value != 0))
}

fn parse_bind_list(raw: &str) -> Result<Vec<SocketAddr>> {
    raw.split(',')
        .map(|part| {
            let part = part.trim();
            if part == "*" {
                return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            }
            if let Ok(ip) = part.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, 0));
            }
            part.parse::<SocketAddr>().map_err(|_| {
                PerfError::InvalidParameter(format!(
                    "invalid bind address '{part}', must be *, an IPv4 or an IPv6 address"
                ))
            })
        })
        .collect()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}
