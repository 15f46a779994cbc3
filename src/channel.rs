//! Buffered duplex channel over a synchronous bit-bang transport.
//!
//! In synchronous bit-bang mode the chip answers every written byte with one
//! sampled byte, so the channel must never let more echoes accumulate in the
//! chip's receive FIFO than the FIFO can hold. `pending` tracks exactly how
//! many bytes have been written but not yet harvested; `discard` counts
//! echoes nobody asked for that the next receive has to drop.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::constants::{FIFO_CHUNK, RX_CAPACITY, VARIABLE_PULSE_WIDTH_WORKAROUND};
use crate::pins::PinDef;
use crate::transport::{BitMode, Transport};

struct RxRing {
    buf: Box<[u8]>,
    len: usize,
    rd: usize,
    wr: usize,
    /// Bytes written to the chip and not yet read back.
    pending: usize,
    /// Echo bytes the next receive must drop.
    discard: usize,
}

impl RxRing {
    fn new() -> Self {
        RxRing {
            buf: vec![0u8; RX_CAPACITY].into_boxed_slice(),
            len: 0,
            rd: 0,
            wr: 0,
            pending: 0,
            discard: 0,
        }
    }

    fn purge(&mut self) {
        self.len = 0;
        self.rd = 0;
        self.wr = 0;
    }

    fn put(&mut self, byte: u8) {
        self.len += 1;
        self.buf[self.wr] = byte;
        self.wr += 1;
        if self.wr >= RX_CAPACITY {
            self.wr = 0;
        }
    }

    fn get(&mut self) -> u8 {
        self.len -= 1;
        let byte = self.buf[self.rd];
        self.rd += 1;
        if self.rd >= RX_CAPACITY {
            self.rd = 0;
        }
        byte
    }
}

pub struct Channel<T> {
    t: T,
    ddr: u8,
    /// Shadow of the last byte driven onto the data pins.
    pub(crate) out: u8,
    baud_mult: usize,
    tx: [u8; FIFO_CHUNK],
    tx_len: usize,
    rx: RxRing,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T, ddr: u8) -> Self {
        Channel {
            t: transport,
            ddr,
            out: 0,
            baud_mult: 1,
            tx: [0u8; FIFO_CHUNK],
            tx_len: 0,
            rx: RxRing::new(),
        }
    }

    pub fn ddr(&self) -> u8 {
        self.ddr
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.t
    }

    pub fn into_transport(self) -> T {
        self.t
    }

    /// Select the bit rate and, with the pulse-width workaround enabled,
    /// the per-byte repetition count that approximates it.
    pub fn set_bitclock(&mut self, rate: u32) -> Result<()> {
        // libftd2xx multiplies bit-bang baud rates by four, so 750 000 baud
        // is the FT232R's 3 MHz toggle ceiling.
        let (ftdi_rate, mult) = if VARIABLE_PULSE_WIDTH_WORKAROUND {
            let ceiling = 3_000_000 / 4;
            let mult = if rate > 0 && rate < ceiling {
                (ceiling + rate - 1) / rate
            } else {
                1
            };
            (ceiling, mult as usize)
        } else {
            (rate, 1)
        };
        log::debug!(
            "bitclk {} -> FTDI rate {}, baud multiplier {}",
            rate,
            ftdi_rate,
            mult
        );
        self.baud_mult = mult;
        self.t.set_baud_rate(ftdi_rate)
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.send2(buf, false)
    }

    pub fn send_and_discard(&mut self, buf: &[u8]) -> Result<()> {
        self.send2(buf, true)
    }

    fn send2(&mut self, buf: &[u8], discard_rx_data: bool) -> Result<()> {
        for &byte in buf {
            for _ in 0..self.baud_mult {
                if discard_rx_data {
                    self.rx.discard += 1;
                }
                self.tx[self.tx_len] = byte;
                self.tx_len += 1;
                if self.tx_len >= FIFO_CHUNK {
                    self.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Push staged bytes to the chip, harvesting echoes whenever the chip's
    /// FIFO would otherwise overflow and silently lose samples.
    pub fn flush(&mut self) -> Result<()> {
        let len = self.tx_len;
        self.tx_len = 0;
        let mut off = 0;
        while off < len {
            let avail = if self.rx.pending >= FIFO_CHUNK {
                self.fill()?
            } else {
                FIFO_CHUNK - self.rx.pending
            };
            let want = avail.min(len - off);
            if want == 0 {
                continue;
            }
            let written = self.t.write(&self.tx[off..off + want])?;
            if written != want {
                bail!("short write to FTDI: {} of {} bytes", written, want);
            }
            off += written;
            self.rx.pending += written;
        }
        Ok(())
    }

    /// Harvest one batch of echoes into the ring. Short reads are fine.
    fn fill(&mut self) -> Result<usize> {
        if self.rx.pending == 0 {
            return Ok(0);
        }
        let mut raw = [0u8; FIFO_CHUNK];
        let want = self.rx.pending.min(FIFO_CHUNK);
        let nread = self.t.read(&mut raw[..want])?;
        self.rx.pending -= nread;
        log::trace!("fill: read {} bytes (pending={})", nread, self.rx.pending);
        for &byte in &raw[..nread] {
            self.rx.put(byte);
        }
        Ok(nread)
    }

    fn fill_and_get(&mut self) -> Result<u8> {
        while self.rx.len == 0 {
            self.fill()?;
        }
        Ok(self.rx.get())
    }

    /// Receive `out.len()` echo bytes, first dropping everything marked for
    /// discard. With a baud multiplier above one only the first copy of each
    /// repeated byte is kept.
    pub fn recv(&mut self, out: &mut [u8]) -> Result<()> {
        self.flush()?;
        self.fill()?;
        log::trace!(
            "recv: discarding {}, consuming {} bytes",
            self.rx.discard,
            out.len()
        );
        while self.rx.discard > 0 {
            self.fill_and_get()?;
            self.rx.discard -= 1;
        }
        for slot in out.iter_mut() {
            *slot = self.fill_and_get()?;
            for _ in 1..self.baud_mult {
                self.fill_and_get()?;
            }
        }
        Ok(())
    }

    /// Flush the chip's internal buffers by bouncing the bit mode, then
    /// forget all local state about in-flight bytes.
    pub fn drain(&mut self) -> Result<()> {
        self.t.set_bitmode(0, BitMode::Reset)?;
        self.t.set_bitmode(self.ddr, BitMode::SyncBitbang)?;
        self.tx_len = 0;
        self.rx.purge();
        self.rx.pending = 0;
        self.rx.discard = 0;
        Ok(())
    }

    /// Make sure pending writes reach the chip before sleeping.
    pub fn usleep(&mut self, usec: u64) -> Result<()> {
        self.flush()?;
        sleep(Duration::from_micros(usec));
        Ok(())
    }

    pub fn set_pin(&mut self, pin: PinDef, value: bool) -> Result<()> {
        if !pin.is_wired() {
            // Not an error: vcc, buff and the leds are optional.
            return Ok(());
        }
        self.out = pin.set(self.out, value);
        let byte = self.out;
        self.send_and_discard(&[byte])
    }

    pub fn get_pin(&mut self, pin: PinDef) -> Result<bool> {
        self.flush()?;
        let sample = self.t.read_data_pins()?;
        log::trace!("pins in 0x{:02x}", sample);
        Ok(pin.get(sample))
    }
}

#[cfg(test)]
impl<T: Transport> Channel<T> {
    pub(crate) fn force_baud_mult(&mut self, mult: usize) {
        self.baud_mult = mult;
    }

    pub(crate) fn tx_len(&self) -> usize {
        self.tx_len
    }

    pub(crate) fn rx_len(&self) -> usize {
        self.rx.len
    }

    pub(crate) fn rx_pending(&self) -> usize {
        self.rx.pending
    }

    pub(crate) fn rx_discard(&self) -> usize {
        self.rx.discard
    }

    pub(crate) fn ring_indices(&self) -> (usize, usize) {
        (self.rx.rd, self.rx.wr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LoopTransport;

    fn loop_channel() -> Channel<LoopTransport> {
        Channel::new(LoopTransport::new(), 0x15)
    }

    #[test]
    fn loopback_returns_sent_bytes_in_order() {
        let mut ch = loop_channel();
        let data: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        ch.send(&data).unwrap();
        let mut back = vec![0u8; data.len()];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(ch.tx_len(), 0);
        assert_eq!(ch.rx_len(), 0);
    }

    #[test]
    fn discarded_send_leaves_channel_empty() {
        let mut ch = loop_channel();
        ch.send_and_discard(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        ch.recv(&mut []).unwrap();
        assert_eq!(ch.rx_discard(), 0);
        assert_eq!(ch.rx_len(), 0);
        assert_eq!(ch.rx_pending(), 0);
    }

    #[test]
    fn pending_stays_within_fifo_bound() {
        let mut ch = loop_channel();
        for chunk in [1usize, 63, 128, 200, 511] {
            ch.send_and_discard(&vec![0xa5; chunk]).unwrap();
            ch.flush().unwrap();
            assert!(ch.rx_pending() <= FIFO_CHUNK);
        }
        ch.recv(&mut []).unwrap();
        assert_eq!(ch.rx_pending(), 0);
    }

    #[test]
    fn ring_length_matches_index_distance() {
        let mut ch = loop_channel();
        for round in 0..40 {
            let n = 17 + round * 31 % 200;
            ch.send(&vec![round as u8; n]).unwrap();
            let mut back = vec![0u8; n / 2];
            ch.recv(&mut back).unwrap();
            let (rd, wr) = ch.ring_indices();
            assert_eq!(
                ch.rx_len(),
                (wr + RX_CAPACITY - rd) % RX_CAPACITY,
                "round {}",
                round
            );
            let mut rest = vec![0u8; n - n / 2];
            ch.recv(&mut rest).unwrap();
        }
    }

    #[test]
    fn rx_fifo_pressure_write() {
        // 4096 discarded bytes must flow through without ever exceeding the
        // chip FIFO; LoopTransport panics if more than FIFO_CHUNK bytes are
        // outstanding at once.
        let mut ch = loop_channel();
        ch.send_and_discard(&vec![0x55; 4096]).unwrap();
        ch.recv(&mut []).unwrap();
        assert_eq!(ch.tx_len(), 0);
        assert_eq!(ch.rx_discard(), 0);
        assert_eq!(ch.rx_len(), 0);
    }

    #[test]
    fn baud_multiplier_replicates_and_dedups() {
        let mut ch = loop_channel();
        ch.force_baud_mult(3);
        ch.send(&[0x11, 0x22, 0x33]).unwrap();
        assert_eq!(ch.rx_pending() + ch.rx_len() + ch.tx_len(), 9);
        let mut back = [0u8; 3];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, [0x11, 0x22, 0x33]);
        assert_eq!(ch.rx_len(), 0);
    }

    #[test]
    fn short_reads_do_not_lose_data() {
        let mut t = LoopTransport::new();
        t.limit_read_chunk(7);
        let mut ch = Channel::new(t, 0x15);
        let data: Vec<u8> = (0..200u8).collect();
        ch.send(&data).unwrap();
        let mut back = vec![0u8; 200];
        ch.recv(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn drain_clears_inflight_state() {
        let mut ch = loop_channel();
        ch.send_and_discard(&[1, 2, 3]).unwrap();
        ch.drain().unwrap();
        assert_eq!(ch.rx_pending(), 0);
        assert_eq!(ch.rx_discard(), 0);
        assert_eq!(ch.rx_len(), 0);
        assert_eq!(ch.tx_len(), 0);
    }
}
