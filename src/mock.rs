//! Scripted PDL device for driving the loader in tests

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::{read_u32, Command, Response, HEADER_LEN, HOST_FLOW_ID, PDL_TAG};

pub const ACK: u8 = 0xFF;
pub const DATA: u8 = 0xBB;
pub const ERROR: u8 = 0xEE;

/// A device to host packet
pub fn frame(flow: u8, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![PDL_TAG];
    f.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    f.push(flow);
    f.extend_from_slice(payload);
    f
}

/// ACK flow packet carrying a response code
pub fn response(r: Response) -> Vec<u8> {
    frame(ACK, &r.code().to_le_bytes())
}

/// ERROR flow packet carrying a raw code
pub fn error(code: u32) -> Vec<u8> {
    frame(ERROR, &code.to_le_bytes())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sent {
    pub cmd: u32,
    pub payload: Vec<u8>,
}

pub struct MockDevice {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    written: Vec<u8>,
    auto_ack: bool,
    script: HashMap<usize, Vec<u8>>,
    pub sent: Vec<Sent>,
}

impl MockDevice {
    /// Device answering every command with ACK unless scripted otherwise
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: vec![],
            written: vec![],
            auto_ack: true,
            script: HashMap::new(),
            sent: vec![],
        }
    }

    /// Device that never answers
    pub fn silent() -> Self {
        Self {
            auto_ack: false,
            ..Self::new()
        }
    }

    /// Silent device with bytes already waiting to be read
    pub fn with_rx(rx: &[u8]) -> Self {
        let mut d = Self::silent();
        d.rx.extend(rx);
        d
    }

    /// Answer the `n`th command (0-based) with `reply` instead of an ACK
    pub fn on(&mut self, n: usize, reply: Vec<u8>) -> &mut Self {
        self.script.insert(n, reply);
        self
    }

    /// Every byte written by the host
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn commands(&self) -> Vec<Command> {
        self.sent
            .iter()
            .map(|s| Command::from_code(s.cmd).expect("unknown command code"))
            .collect()
    }

    pub fn payloads(&self, cmd: Command) -> Vec<&[u8]> {
        self.sent
            .iter()
            .filter(|s| s.cmd == cmd.code())
            .map(|s| s.payload.as_slice())
            .collect()
    }

    fn try_complete(&mut self) {
        if self.tx.len() < HEADER_LEN {
            return;
        }

        let len = read_u32(&self.tx[1..]).unwrap() as usize;
        if self.tx.len() < HEADER_LEN + len {
            return;
        }

        assert_eq!(self.tx[0], PDL_TAG);
        assert_eq!(self.tx[5], HOST_FLOW_ID);

        let body = &self.tx[HEADER_LEN..];
        let cmd = read_u32(body).expect("command code missing");
        let n = self.sent.len();
        self.sent.push(Sent {
            cmd,
            payload: body[4..].to_vec(),
        });
        self.tx.clear();

        match self.script.remove(&n) {
            Some(reply) => self.rx.extend(reply),
            None if self.auto_ack => self.rx.extend(response(Response::Ack)),
            None => (),
        }
    }
}

impl Write<u8> for MockDevice {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.written.push(word);
        self.tx.push(word);
        self.try_complete();
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for MockDevice {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}
