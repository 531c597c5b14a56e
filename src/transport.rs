//! Packet framing over a byte-wise serial port

use core::marker::PhantomData;
use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{read_u32, Flow, Response, HEADER_LEN, HOST_FLOW_ID, PDL_TAG};
use crate::{wire_len, Error, FramingError, SerialPort};

/// Largest payload accepted from the device
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Frame a host payload as `TAG || len || HOST_FLOW_ID || payload`
pub fn encode_packet(payload: &[u8]) -> Result<Vec<u8>, crate::ConfigError> {
    let len = wire_len(payload.len())?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(PDL_TAG);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(HOST_FLOW_ID);
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Map the payload of an ERROR flow packet to the matching error
pub fn device_error<E>(payload: &[u8]) -> Error<E> {
    let code = match read_u32(payload) {
        Some(c) => c,
        None => return Error::ShortPayload(payload.len()),
    };

    match Response::from_code(code) {
        // ACK is not a failure, an ERROR flow carrying it is a desync
        Some(Response::Ack) => Error::ProtocolViolation(code),
        Some(r) if r.is_retry_hint() => Error::RetryRequested(r),
        Some(r) => Error::Device(r),
        None => Error::UnknownDeviceError(code),
    }
}

pub struct Transport<P, D, E> {
    port: P,
    delay: D,
    response_timeout_ms: u32,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Transport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, response_timeout_ms: u32, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            response_timeout_ms,
            poll_delay_ms,
            _err: PhantomData,
        }
    }

    /// Consume the transport, returning the port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    pub(crate) fn pause(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Frame and write a single packet
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        let frame = encode_packet(payload).map_err(Error::Config)?;

        for b in frame {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Read a single packet, returning its payload and flow
    ///
    /// ERROR flow packets are returned as the error they carry.
    pub fn read_packet(&mut self) -> Result<(Vec<u8>, Flow), Error<E>> {
        let tag = self.read_byte()?;
        if tag != PDL_TAG {
            error!("Invalid tag 0x{:02x}", tag);
            return Err(Error::Framing(FramingError::BadTag(tag)));
        }

        let mut len = [0u8; 4];
        self.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;

        let flow = self.read_byte()?;
        let flow = match Flow::from_byte(flow) {
            Some(f) => f,
            None => {
                error!("Invalid flow id 0x{:02x}", flow);
                return Err(Error::Framing(FramingError::BadFlow(flow)));
            }
        };

        if len > MAX_PACKET_LEN {
            return Err(Error::Framing(FramingError::Oversized(len)));
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;

        trace!("Received {:?} packet, {} bytes", flow, len);

        match flow {
            Flow::Error => {
                let e = device_error(&payload);
                debug!("Device error: {}", e);
                Err(e)
            }
            _ => Ok((payload, flow)),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error<E>> {
        for b in buf.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.response_timeout_ms as u64);
        let mut t: u32 = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t = t.saturating_add(self.poll_delay_ms);

            if self.response_timeout_ms == 0 {
                continue;
            }

            if t > self.response_timeout_ms || start.elapsed() > timeout {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}
