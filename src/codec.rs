//! Command encoding and response classification

use embedded_hal::blocking::delay::DelayMs;
use log::Level;

use crate::protocol::{read_u32, Category, Command, Response};
use crate::transport::Transport;
use crate::{Error, Options, SerialPort};

/// Encode a command as `code || payload`
pub fn encode_command(cmd: Command, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&cmd.code().to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode the response code leading an ACK or DATA payload
pub fn decode_response<E>(payload: &[u8]) -> Result<Response, Error<E>> {
    let code = read_u32(payload).ok_or(Error::ShortPayload(payload.len()))?;
    Response::from_code(code).ok_or(Error::ProtocolViolation(code))
}

/// Require an ACK, classifying anything else as an error
pub fn check_ack<E>(rsp: Response) -> Result<(), Error<E>> {
    match rsp.category() {
        Category::Ack => Ok(()),
        Category::RetryHint => Err(Error::RetryRequested(rsp)),
        _ => Err(Error::Device(rsp)),
    }
}

/// Synchronous request / response client, one outstanding command at a time
pub struct Codec<P, D, E> {
    transport: Transport<P, D, E>,
    verbose: u8,
    retry_attempts: u32,
    retry_delay_ms: u32,
}

impl<P, D, E> Codec<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(transport: Transport<P, D, E>, options: &Options) -> Self {
        Self {
            transport,
            verbose: options.verbose,
            retry_attempts: options.retry_attempts,
            retry_delay_ms: options.retry_delay_ms,
        }
    }

    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    /// Consume the codec, returning the transport
    pub fn release(self) -> Transport<P, D, E> {
        self.transport
    }

    // Commands and responses are echoed at info from verbosity 2
    fn echo_level(&self) -> Level {
        if self.verbose >= 2 {
            Level::Info
        } else {
            Level::Trace
        }
    }

    fn send(&mut self, cmd: Command, payload: &[u8]) -> Result<(), Error<E>> {
        log!(self.echo_level(), "<- {:?}", cmd);
        self.transport.write_packet(&encode_command(cmd, payload))
    }

    /// Send a command and decode the response code
    pub fn communicate(&mut self, cmd: Command, payload: &[u8]) -> Result<Response, Error<E>> {
        self.send(cmd, payload)?;

        let (data, _flow) = self.transport.read_packet()?;
        let rsp = decode_response(&data)?;

        log!(self.echo_level(), "-> {:?}", rsp);
        Ok(rsp)
    }

    /// Send a command and return the response payload without decoding it
    pub fn communicate_raw(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>, Error<E>> {
        self.send(cmd, payload)?;

        let (data, _flow) = self.transport.read_packet()?;

        log!(self.echo_level(), "-> (RAW) {}", hex::encode(&data));
        Ok(data)
    }

    /// Send a command that must be acknowledged
    ///
    /// Retry hints resend the command up to `retry_attempts` times, any other
    /// non-ACK outcome is returned as an error.
    pub fn request(&mut self, cmd: Command, payload: &[u8]) -> Result<(), Error<E>> {
        let mut attempt = 0;

        loop {
            let res = self.communicate(cmd, payload).and_then(check_ack);

            match res {
                Err(Error::RetryRequested(r)) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(
                        "{:?} answered with {:?}, resending ({}/{})",
                        cmd, r, attempt, self.retry_attempts
                    );
                    self.transport.pause(self.retry_delay_ms);
                }
                Err(e) => {
                    error!("{:?} failed: {}", cmd, e);
                    return Err(e);
                }
                Ok(()) => return Ok(()),
            }
        }
    }
}
