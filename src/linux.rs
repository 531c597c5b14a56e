use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::protocol::BAUD_RATE;
use crate::{Options, Programmer};

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port at the fixed PDL rate and create a programmer on it
    ///
    /// The port is closed when the programmer is dropped.
    pub fn linux<P: AsRef<Path>>(port: P, options: Options) -> Result<Self, SerialError> {
        // Open port
        let path = port.as_ref();
        let mut port = Serial::open(path)?;

        // Apply settings, 8N1 without flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(BAUD_RATE))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads block for at most one poll period, the programmer owns the overall timeout
        let poll = Duration::from_millis(options.poll_delay_ms.max(1) as u64);
        port.0.set_timeout(poll)?;

        debug!("Opened {} at {} baud", path.display(), BAUD_RATE);

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
