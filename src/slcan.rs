//! CAN over a serial line adapter speaking the Lawicel SLCAN protocol.
//!
//! Lets the host tools join the vehicle bus: [`SlcanPort`] implements
//! [`embedded_can::nb::Can`] and plugs into [`crate::can::CanInterface`].

use crate::can::{raw_id, CanFrame};
use crate::protocol::FRAME_CAPACITY;
use crate::Error;
use embedded_can::{Frame, Id};
use embedded_hal::delay::DelayNs;
use std::io::{Read, Write};
use std::time::Duration;

/// Bit rates understood by the `S` command, index = command digit.
pub const BITRATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

const LINE_END: u8 = b'\r';
const BELL: u8 = 0x07;

/// `S` command selecting `bitrate`.
pub fn bitrate_command(bitrate: u32) -> Result<String, Error> {
    BITRATES
        .iter()
        .position(|rate| *rate == bitrate)
        .map(|index| format!("S{index}\r"))
        .ok_or_else(|| Error::Slcan(format!("unsupported bitrate {bitrate}")))
}

/// Serialises a frame as a transmit command, including the line end.
pub fn format_frame(frame: &CanFrame) -> String {
    let id = raw_id(frame.id());
    let mut line = match (frame.is_extended(), frame.is_remote_frame()) {
        (false, false) => format!("t{id:03X}"),
        (false, true) => format!("r{id:03X}"),
        (true, false) => format!("T{id:08X}"),
        (true, true) => format!("R{id:08X}"),
    };
    line.push_str(&frame.dlc().to_string());
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push('\r');
    line
}

/// Parses one received line, without its line end.
///
/// Returns `Ok(None)` for lines that do not carry a frame, such as command
/// acknowledgements.
pub fn parse_line(line: &[u8]) -> Result<Option<CanFrame>, Error> {
    let invalid = || Error::Slcan(String::from_utf8_lossy(line).into_owned());
    let Some((&kind, rest)) = line.split_first() else {
        return Ok(None);
    };
    let (id_len, remote) = match kind {
        b't' => (3, false),
        b'r' => (3, true),
        b'T' => (8, false),
        b'R' => (8, true),
        b'z' | b'Z' => return Ok(None),
        _ => return Err(invalid()),
    };

    // fields are sliced by byte offset
    if !rest.is_ascii() {
        return Err(invalid());
    }
    let text = std::str::from_utf8(rest).map_err(|_| invalid())?;
    if text.len() < id_len + 1 {
        return Err(invalid());
    }
    let id = u32::from_str_radix(&text[..id_len], 16).map_err(|_| invalid())?;
    let dlc = usize::from_str_radix(&text[id_len..id_len + 1], 16).map_err(|_| invalid())?;
    let id: Id = if id_len == 3 {
        embedded_can::StandardId::new(id as u16)
            .ok_or_else(invalid)?
            .into()
    } else {
        embedded_can::ExtendedId::new(id).ok_or_else(invalid)?.into()
    };
    if dlc > FRAME_CAPACITY {
        return Err(invalid());
    }

    if remote {
        return CanFrame::new_remote(id, dlc).map(Some).ok_or_else(invalid);
    }

    let hex = &text[id_len + 1..];
    if hex.len() != dlc * 2 {
        return Err(invalid());
    }
    let mut data = [0u8; FRAME_CAPACITY];
    for (i, byte) in data.iter_mut().take(dlc).enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
    }
    CanFrame::new(id, &data[..dlc]).map(Some).ok_or_else(invalid)
}

/// An SLCAN adapter behind a serial port.
pub struct SlcanPort {
    serial: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SlcanPort {
    /// Opens the adapter and the CAN channel at `bitrate`.
    pub fn open(port: &str, bitrate: u32) -> Result<Self, Error> {
        let serial = serialport::new(port, 115_200)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(std::io::Error::from)?;
        let mut slcan = Self {
            serial,
            pending: Vec::new(),
        };
        // flush whatever a previous session left behind
        slcan.write_line(b"\r\r\r")?;
        slcan.write_line(b"C\r")?;
        slcan.write_line(bitrate_command(bitrate)?.as_bytes())?;
        slcan.write_line(b"O\r")?;
        Ok(slcan)
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), Error> {
        log::trace!("write: {:02X?}", line);
        self.serial.write_all(line)?;
        Ok(())
    }

    /// Moves everything the adapter sent into the line buffer.
    fn fill(&mut self) -> Result<(), Error> {
        let available = self.serial.bytes_to_read().map_err(std::io::Error::from)?;
        if available == 0 {
            return Ok(());
        }
        let mut buffer = vec![0; available as usize];
        let received = self.serial.read(&mut buffer)?;
        log::trace!("read: {:02X?}", &buffer[..received]);
        self.pending.extend_from_slice(&buffer[..received]);
        Ok(())
    }

    /// Next complete line, without its terminator.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let end = self
                .pending
                .iter()
                .position(|byte| *byte == LINE_END || *byte == BELL)?;
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if line[end] == BELL {
                log::warn!("Adapter rejected a command");
                continue;
            }
            return Some(line[..end].to_vec());
        }
    }
}

impl Drop for SlcanPort {
    fn drop(&mut self) {
        if let Err(error) = self.write_line(b"C\r") {
            log::debug!("Cannot close CAN channel: {error}");
        }
    }
}

/// Transport failure of the adapter.
#[derive(Debug)]
pub struct SlcanError(pub Error);

impl embedded_can::Error for SlcanError {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

impl embedded_can::nb::Can for SlcanPort {
    type Frame = CanFrame;
    type Error = SlcanError;

    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<Option<CanFrame>, SlcanError> {
        let line = format_frame(frame);
        self.write_line(line.as_bytes())
            .map_err(|error| nb::Error::Other(SlcanError(error)))?;
        Ok(None)
    }

    fn receive(&mut self) -> nb::Result<CanFrame, SlcanError> {
        self.fill()
            .map_err(|error| nb::Error::Other(SlcanError(error)))?;
        while let Some(line) = self.next_line() {
            match parse_line(&line) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(error) => log::warn!("{error}"),
            }
        }
        Err(nb::Error::WouldBlock)
    }
}

/// Wall clock delay for the host tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::frame_id;

    #[test]
    fn standard_frame() {
        let frame = CanFrame::new(frame_id(0x621).unwrap(), &[0x01, 0xAB]).unwrap();
        assert_eq!(format_frame(&frame), "t621201AB\r");
        assert_eq!(parse_line(b"t621201AB").unwrap(), Some(frame));
    }

    #[test]
    fn extended_frame() {
        let frame = CanFrame::new(frame_id(0x1234_5678).unwrap(), &[]).unwrap();
        assert_eq!(format_frame(&frame), "T123456780\r");
        assert_eq!(parse_line(b"T123456780").unwrap(), Some(frame));
    }

    #[test]
    fn remote_frame() {
        let frame = parse_line(b"r2014").unwrap().unwrap();
        assert!(frame.is_remote_frame());
        assert_eq!(frame.dlc(), 4);
        assert_eq!(format_frame(&frame), "r2014\r");
    }

    #[test]
    fn acknowledgements_carry_no_frame() {
        assert_eq!(parse_line(b"").unwrap(), None);
        assert_eq!(parse_line(b"z").unwrap(), None);
        assert_eq!(parse_line(b"Z").unwrap(), None);
    }

    #[test]
    fn malformed_lines() {
        assert!(matches!(parse_line(b"x123"), Err(Error::Slcan(_))));
        assert!(matches!(parse_line(b"t12"), Err(Error::Slcan(_))));
        // payload shorter than the dlc
        assert!(matches!(parse_line(b"t621201"), Err(Error::Slcan(_))));
        assert!(matches!(parse_line(b"t62190000000000000000"), Err(Error::Slcan(_))));
        assert!(matches!(parse_line(b"tG2110"), Err(Error::Slcan(_))));
    }

    #[test]
    fn non_ascii_lines_are_rejected() {
        assert!(matches!(parse_line(b"t12\xC3\xA9100"), Err(Error::Slcan(_))));
        assert!(matches!(parse_line(b"t62120\xC3\xA90"), Err(Error::Slcan(_))));
        assert!(matches!(parse_line(b"T1234567\xC3\xA9"), Err(Error::Slcan(_))));
    }

    #[test]
    fn bitrates() {
        assert_eq!(bitrate_command(500_000).unwrap(), "S6\r");
        assert_eq!(bitrate_command(10_000).unwrap(), "S0\r");
        assert!(bitrate_command(33_333).is_err());
    }
}
