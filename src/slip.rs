//! SLIP framing
//!
//! Frames begin and end with [`END`]. Within a frame `0xC0` becomes
//! `0xDB 0xDC` and `0xDB` becomes `0xDB 0xDD`. Frames carry no length and do
//! not nest.

use std::io::Write;

use crate::queue::RxQueue;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Streaming SLIP encoder over any writer.
///
/// Writes the leading sentinel on construction; [`finish`](Self::finish)
/// writes the trailing one.
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        let len = writer.write(&[END])?;
        Ok(Self { writer, len })
    }

    pub fn finish(mut self) -> std::io::Result<usize> {
        self.len += self.writer.write(&[END])?;
        Ok(self.len)
    }
}

impl<'a, W: Write> Write for SlipEncoder<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.len += self.writer.write(&[ESC, ESC_END])?;
                }
                ESC => {
                    self.len += self.writer.write(&[ESC, ESC_ESC])?;
                }
                _ => {
                    self.len += self.writer.write(&[*value])?;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Outcome of decoding a single byte from the receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// An unescaped data byte was delivered
    Byte(u8),
    /// An escape sequence was resolved to its data byte
    Escaped(u8),
    /// No data is queued
    Empty,
    /// A bare sentinel appeared where body data was expected
    Delimiter,
    /// An escape byte is queued but its partner has not arrived yet;
    /// nothing was consumed, try again once more data is in
    Partial,
    /// An escape byte was followed by something other than `ESC_END` or
    /// `ESC_ESC`
    BadEscape(u8),
}

/// Decode one SLIP body byte from the queue.
///
/// Never consumes the second byte of an escape sequence unless both bytes
/// are already queued, so a [`DecodeStep::Partial`] caller can simply refill
/// and retry.
pub fn decode_byte(queue: &mut RxQueue) -> DecodeStep {
    match queue.peek() {
        None => DecodeStep::Empty,
        Some(END) => {
            queue.pop();
            DecodeStep::Delimiter
        }
        Some(ESC) => {
            if queue.len() < 2 {
                return DecodeStep::Partial;
            }
            queue.pop();
            match queue.pop() {
                Some(ESC_END) => DecodeStep::Escaped(END),
                Some(ESC_ESC) => DecodeStep::Escaped(ESC),
                Some(other) => DecodeStep::BadEscape(other),
                None => DecodeStep::Partial,
            }
        }
        Some(_) => DecodeStep::Byte(queue.pop().unwrap()),
    }
}

/// Encode a whole buffer into a framed SLIP packet
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    let mut encoder = SlipEncoder::new(&mut out).unwrap();
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ConnectionError, interface::LineLevel, interface::SerialPort};

    /// Hands a fixed byte sequence to the queue through the refresh path
    struct Preload(Vec<u8>);

    impl SerialPort for Preload {
        fn set_speed(&mut self, _baud: u32) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0.drain(..n);
            Ok(n)
        }
        fn write_all(&mut self, _buf: &[u8]) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn available(&mut self) -> Result<usize, ConnectionError> {
            Ok(self.0.len())
        }
        fn set_control(&mut self, _dtr: LineLevel, _rts: LineLevel) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn send_break(&mut self, _ms: u64) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn flush_rx(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn queue_with(bytes: &[u8]) -> RxQueue {
        let mut queue = RxQueue::new(0);
        let mut port = Preload(bytes.to_vec());
        queue.refresh(&mut port).unwrap();
        queue
    }

    #[test]
    fn encode_escapes_sentinel_and_escape_bytes() {
        let encoded = encode(&[0x01, END, 0x02, ESC, 0x03]);
        assert_eq!(
            encoded,
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
        // no unescaped END or ESC inside the frame body
        assert!(!encoded[1..encoded.len() - 1].contains(&END));
        assert!(encoded[1..encoded.len() - 1]
            .iter()
            .zip(encoded[2..encoded.len() - 1].iter())
            .all(|(&a, &b)| a != ESC || b == ESC_END || b == ESC_ESC));
    }

    #[test]
    fn round_trip_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).collect();
        let encoded = encode(&data);
        let mut queue = queue_with(&encoded[1..encoded.len() - 1]);

        let mut decoded = Vec::new();
        loop {
            match decode_byte(&mut queue) {
                DecodeStep::Byte(b) | DecodeStep::Escaped(b) => decoded.push(b),
                DecodeStep::Empty => break,
                other => panic!("unexpected step {other:?}"),
            }
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn partial_escape_consumes_nothing() {
        let mut queue = queue_with(&[ESC]);
        assert_eq!(decode_byte(&mut queue), DecodeStep::Partial);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn bad_escape_and_bare_delimiter() {
        let mut queue = queue_with(&[ESC, 0x42]);
        assert_eq!(decode_byte(&mut queue), DecodeStep::BadEscape(0x42));

        let mut queue = queue_with(&[END]);
        assert_eq!(decode_byte(&mut queue), DecodeStep::Delimiter);
    }

    #[test]
    fn empty_queue_reports_empty() {
        let mut queue = RxQueue::new(0);
        assert_eq!(decode_byte(&mut queue), DecodeStep::Empty);
    }
}
