//! Host-side receive queue
//!
//! [`RxQueue`] sits between the driver's input buffer and the SLIP decoder.
//! It drains the driver on demand and hands bytes out strictly in arrival
//! order, so the decoder can peek ahead without losing data between refills.

use crate::{error::ConnectionError, interface::SerialPort};

pub struct RxQueue {
    data: Vec<u8>,
    /// Index of the oldest unconsumed byte in `data`
    head: usize,
    /// Upper bound on queued bytes; 0 means the queue may grow freely
    max_size: usize,
}

impl RxQueue {
    pub fn new(max_size: usize) -> Self {
        RxQueue {
            data: Vec::new(),
            head: 0,
            max_size,
        }
    }

    /// Number of bytes queued locally
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look at the byte that `pop` would return next, without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.head).copied()
    }

    /// Consume the oldest queued byte
    pub fn pop(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.head += 1;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
        Some(b)
    }

    /// Pull whatever the driver has queued into the local buffer, up to the
    /// configured size limit. Returns the local byte count afterwards.
    pub fn refresh(&mut self, port: &mut dyn SerialPort) -> Result<usize, ConnectionError> {
        let pending = port.available()?;
        if pending == 0 {
            return Ok(self.len());
        }

        // compact live bytes to the front before appending
        if self.head > 0 {
            self.data.drain(..self.head);
            self.head = 0;
        }

        let want = if self.max_size == 0 {
            pending
        } else {
            pending.min(self.max_size.saturating_sub(self.data.len()))
        };
        if want == 0 {
            return Ok(self.len());
        }

        let old_len = self.data.len();
        self.data.resize(old_len + want, 0);
        let got = port.read(&mut self.data[old_len..])?;
        self.data.truncate(old_len + got);

        Ok(self.len())
    }

    /// Total bytes readable right now: queued locally plus queued in the
    /// driver.
    pub fn available_total(&mut self, port: &mut dyn SerialPort) -> Result<usize, ConnectionError> {
        self.refresh(port)?;
        Ok(self.len() + port.available()?)
    }

    /// Fill `buf` completely, blocking on the port until enough bytes have
    /// arrived. Bytes are delivered in strict FIFO order.
    pub fn get_data(
        &mut self,
        port: &mut dyn SerialPort,
        buf: &mut [u8],
    ) -> Result<(), ConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.is_empty() {
                self.refresh(port)?;
            }
            if self.is_empty() {
                // nothing queued anywhere, wait on the port itself
                let got = port.read(&mut buf[filled..filled + 1])?;
                filled += got;
                continue;
            }
            while filled < buf.len() {
                match self.pop() {
                    Some(b) => {
                        buf[filled] = b;
                        filled += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Drop all queued bytes, local and driver-side
    pub fn flush(&mut self, port: &mut dyn SerialPort) -> Result<(), ConnectionError> {
        self.data.clear();
        self.head = 0;
        port.flush_rx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::LineLevel;
    use std::collections::VecDeque;

    struct FakePort {
        rx: VecDeque<u8>,
    }

    impl FakePort {
        fn with(bytes: &[u8]) -> Self {
            FakePort {
                rx: bytes.iter().copied().collect(),
            }
        }
    }

    impl SerialPort for FakePort {
        fn set_speed(&mut self, _baud: u32) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
            let n = buf.len().min(self.rx.len());
            for slot in &mut buf[..n] {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, _buf: &[u8]) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn available(&mut self) -> Result<usize, ConnectionError> {
            Ok(self.rx.len())
        }

        fn set_control(&mut self, _dtr: LineLevel, _rts: LineLevel) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn send_break(&mut self, _ms: u64) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn flush_rx(&mut self) -> Result<(), ConnectionError> {
            self.rx.clear();
            Ok(())
        }
    }

    #[test]
    fn preserves_order_across_refills() {
        let mut port = FakePort::with(&[1, 2, 3]);
        let mut queue = RxQueue::new(0);

        queue.refresh(&mut port).unwrap();
        assert_eq!(queue.pop(), Some(1));

        port.rx.extend([4, 5]);
        queue.refresh(&mut port).unwrap();

        let drained: Vec<u8> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![2, 3, 4, 5]);
    }

    #[test]
    fn bounded_queue_never_exceeds_max_size() {
        let mut port = FakePort::with(&[0u8; 64]);
        let mut queue = RxQueue::new(16);

        queue.refresh(&mut port).unwrap();
        assert_eq!(queue.len(), 16);

        // consuming frees space for the next refill
        for _ in 0..10 {
            queue.pop();
        }
        queue.refresh(&mut port).unwrap();
        assert_eq!(queue.len(), 16);
    }

    #[test]
    fn get_data_blocks_until_satisfied() {
        let mut port = FakePort::with(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut queue = RxQueue::new(0);

        let mut buf = [0u8; 4];
        queue.get_data(&mut port, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn flush_drops_local_and_driver_bytes() {
        let mut port = FakePort::with(&[1, 2, 3, 4]);
        let mut queue = RxQueue::new(0);

        queue.refresh(&mut port).unwrap();
        port.rx.extend([5, 6]);
        queue.flush(&mut port).unwrap();

        assert!(queue.is_empty());
        assert_eq!(port.available().unwrap(), 0);
    }
}
