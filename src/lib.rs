//! PDL Serial Loader.
//!
//! Bootstraps the two PDL bootloader stages on a target over a serial port,
//! then uploads named partitions into its flash storage.
//!
//! Layers, from the wire up:
//! - [`transport::Transport`] frames packets and enforces the read timeout
//! - [`codec::Codec`] encodes commands and classifies responses
//! - [`upload::ChunkedUploader`] drives START_DATA / MID_DATA / END_DATA
//! - [`Programmer`] sequences bootstrap and flash operations

use std::convert::TryFrom;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod codec;
pub mod partition;
pub mod protocol;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod mock;

use codec::Codec;
use partition::{image_list_payload, PartitionSpec};
use protocol::{Command, Response, PARTITION_CHUNK, STAGE1_ADDR, STAGE2_ADDR, STAGE_CHUNK};
use transport::Transport;
use upload::{ChunkedUploader, Progress, Target};

/// Byte-wise serial port the loader runs over
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("framing error: {0}")]
    Framing(FramingError),

    #[error("device reported {0:?}")]
    Device(Response),

    #[error("device reported unrecognised error code 0x{0:08x}")]
    UnknownDeviceError(u32),

    #[error("device requested a retry ({0:?})")]
    RetryRequested(Response),

    #[error("unrecognised response code 0x{0:08x}")]
    ProtocolViolation(u32),

    #[error("response payload too short ({0} bytes)")]
    ShortPayload(usize),

    #[error("timeout waiting for device response")]
    ResponseTimeout,

    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("invalid configuration: {0}")]
    Config(ConfigError),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Whether the device asked for the failed command to be resent
    pub fn is_retry_hint(&self) -> bool {
        matches!(self, Error::RetryRequested(_))
    }
}

/// Packet framing faults, the link cannot be resynchronised after one of these
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum FramingError {
    #[error("invalid packet tag 0x{0:02x}")]
    BadTag(u8),

    #[error("invalid flow id 0x{0:02x}")]
    BadFlow(u8),

    #[error("packet length {0} exceeds limit")]
    Oversized(usize),
}

/// Invalid arguments, detected before anything is sent to the device
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("partition name is empty")]
    EmptyName,

    #[error("partition name '{0}' is longer than 30 bytes")]
    NameTooLong(String),

    #[error("partition name '{0}' must be ASCII without ',' or NUL")]
    InvalidName(String),

    #[error("cannot parse partition spec '{0}', expected <name>:<file>")]
    MalformedPartition(String),

    #[error("image of {0} bytes does not fit a 32-bit length")]
    BlobTooLarge(usize),

    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Parse an address as `0x` prefixed hex or decimal
pub fn parse_addr(s: &str) -> Result<u32, ConfigError> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(&h.replace('_', ""), 16),
        None => s.parse(),
    };
    r.map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Idle time to wait for each byte of a device response, 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for device responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Times to resend a command when the device answers ACK_AGAIN_*
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub retry_attempts: u32,

    /// Delay before resending a command the device asked to retry
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub retry_delay_ms: u32,

    /// Load and execute address of the first bootloader stage
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x00100100", parse(try_from_str = parse_addr))
    )]
    pub stage1_addr: u32,

    /// Load and execute address of the second bootloader stage
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x80008000", parse(try_from_str = parse_addr))
    )]
    pub stage2_addr: u32,

    /// Increase verbosity, once to log chunks, twice to echo commands
    #[cfg_attr(
        feature = "structopt",
        structopt(short, long, parse(from_occurrences))
    )]
    pub verbose: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 30_000,
            poll_delay_ms: 1,
            retry_attempts: 0,
            retry_delay_ms: 100,
            stage1_addr: STAGE1_ADDR,
            stage2_addr: STAGE2_ADDR,
            verbose: 0,
        }
    }
}

/// Bootloader stage images, loaded in order
#[derive(Clone, PartialEq, Debug)]
pub struct Stages {
    pub stage1: Vec<u8>,
    pub stage2: Vec<u8>,
}

/// A complete loader run
#[derive(Clone, Debug, Default)]
pub struct Job {
    /// Stages to bootstrap, `None` if the PDL stages are already running
    pub stages: Option<Stages>,
    /// Erase all flash before uploading
    pub format_flash: bool,
    /// Partitions to upload, in order
    pub partitions: Vec<PartitionSpec>,
}

type Observer = Box<dyn FnMut(&Progress)>;

pub struct Programmer<P, D, E> {
    options: Options,
    codec: Codec<P, D, E>,
    observer: Option<Observer>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let transport = Transport::new(
            port,
            delay,
            options.response_timeout_ms,
            options.poll_delay_ms,
        );
        let codec = Codec::new(transport, &options);

        Self {
            options,
            codec,
            observer: None,
        }
    }

    /// Fetch the programmer options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Register a callback invoked after each uploaded chunk
    pub fn on_progress<F: FnMut(&Progress) + 'static>(&mut self, f: F) {
        self.observer = Some(Box::new(f));
    }

    /// Access the underlying command codec
    pub fn codec(&mut self) -> &mut Codec<P, D, E> {
        &mut self.codec
    }

    /// Consume the programmer, returning the port and delay
    pub fn release(self) -> (P, D) {
        self.codec.release().release()
    }

    /// Execute a complete job
    pub fn run(&mut self, job: &Job) -> Result<(), Error<E>> {
        if let Some(s) = &job.stages {
            self.bootstrap(&s.stage1, &s.stage2)?;
        }

        let table = self.read_partition_table()?;
        info!("Partition table: {}", table);

        if job.format_flash {
            info!("Formatting flash memory");
            self.format_flash()?;

            let table = self.read_partition_table()?;
            info!("Partition table: {}", table);
        }

        if !job.partitions.is_empty() {
            self.flash(&job.partitions)?;
        }

        Ok(())
    }

    pub fn connect(&mut self) -> Result<(), Error<E>> {
        debug!("Connecting to device");
        self.codec.request(Command::Connect, &[])
    }

    /// Load and execute both bootloader stages
    pub fn bootstrap(&mut self, stage1: &[u8], stage2: &[u8]) -> Result<(), Error<E>> {
        let (a1, a2) = (self.options.stage1_addr, self.options.stage2_addr);

        self.load_stage("pdl1", stage1, a1)?;
        self.load_stage("pdl2", stage2, a2)?;

        info!("Bootloader stages running");
        Ok(())
    }

    fn load_stage(&mut self, label: &str, data: &[u8], addr: u32) -> Result<(), Error<E>> {
        self.connect()?;

        info!("Loading {} ({} bytes) to 0x{:08x}", label, data.len(), addr);
        self.upload(data, Target::Stage { label, addr }, STAGE_CHUNK)?;

        debug!("Executing {} at 0x{:08x}", label, addr);
        self.codec.request(Command::ExecData, &addr.to_le_bytes())
    }

    /// Fetch the device partition layout
    pub fn read_partition_table(&mut self) -> Result<String, Error<E>> {
        let raw = self.codec.communicate_raw(Command::ReadPartitionTable, &[])?;
        let s = String::from_utf8_lossy(&raw);
        Ok(s.trim_end_matches('\0').to_string())
    }

    /// Erase all flash on the device
    pub fn format_flash(&mut self) -> Result<(), Error<E>> {
        self.codec.request(Command::FormatFlash, &[])
    }

    /// Announce, upload and commit a set of partitions
    pub fn flash(&mut self, partitions: &[PartitionSpec]) -> Result<(), Error<E>> {
        self.connect()?;

        let names: Vec<_> = partitions.iter().map(|p| &p.name).collect();
        debug!("Announcing image list: {:?}", names);
        self.codec
            .request(Command::ImageList, &image_list_payload(&names))?;

        for p in partitions {
            let data = p.source.load().map_err(|e| Error::Io(e.kind()))?;

            info!(
                "Sending partition {} ({} bytes) to 0x{:08x}",
                p.name,
                data.len(),
                p.addr
            );
            let target = Target::Partition {
                name: &p.name,
                addr: p.addr,
            };
            self.upload(&data, target, PARTITION_CHUNK)?;
        }

        self.codec.request(Command::DownloadFinish, &[])?;

        info!("Flashed {} partition(s)", partitions.len());
        Ok(())
    }

    fn upload(
        &mut self,
        data: &[u8],
        target: Target,
        chunk_size: usize,
    ) -> Result<u32, Error<E>> {
        let mut noop = |_: &Progress| {};
        let observer: &mut dyn FnMut(&Progress) = match &mut self.observer {
            Some(o) => &mut **o,
            None => &mut noop,
        };

        ChunkedUploader::new(&mut self.codec, chunk_size).upload(data, &target, observer)
    }
}

/// Convert a blob length to the wire's 32-bit length field
pub(crate) fn wire_len(len: usize) -> Result<u32, ConfigError> {
    u32::try_from(len).map_err(|_| ConfigError::BlobTooLarge(len))
}
