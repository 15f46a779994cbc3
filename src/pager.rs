//! Pipelined paged access to target memories.
//!
//! Every target byte costs 64 host bytes on the wire, so USB round-trips
//! dominate paged transfers. Fragments of up to `FT245R_FRAGMENT_SIZE` host
//! bytes are issued back to back and reconciled later against a FIFO of
//! outstanding requests, with at most `REQ_OUTSTANDINGS` fragments in
//! flight.

use anyhow::{bail, Result};

use crate::constants::{FT245R_CMD_SIZE, FT245R_FRAGMENT_SIZE, REQ_OUTSTANDINGS};
use crate::part::{MemKind, Memory, Part};
use crate::programmer::Programmer;
use crate::transport::Transport;

/// One fragment awaiting its echo: where its data belongs in the memory
/// image, how many sample bytes the chip will return, and how many target
/// bytes to recover from them (zero for pure writes).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    addr: usize,
    bytes: usize,
    n: usize,
}

impl<T: Transport> Programmer<T> {
    fn put_request(&mut self, addr: usize, bytes: usize, n: usize) {
        #[cfg(test)]
        {
            self.max_queue = self.max_queue.max(self.queue.len());
        }
        self.queue.push_back(Request { addr, bytes, n });
    }

    /// Retire the oldest outstanding fragment: consume its echo and place
    /// any recovered bytes into the memory image.
    fn do_request(&mut self, mem: &mut Memory) -> Result<bool> {
        let Some(req) = self.queue.pop_front() else {
            return Ok(false);
        };
        let mut buf = vec![0u8; req.bytes];
        self.ch.recv(&mut buf)?;
        for j in 0..req.n {
            mem.buf[req.addr + j] = self.extract_data(&buf, j * 4 + 3);
        }
        Ok(true)
    }

    fn drain_requests(&mut self, mem: &mut Memory) -> Result<()> {
        while self.do_request(mem)? {}
        Ok(())
    }

    /// Program `n_bytes` of `mem` starting at `addr` from the memory image.
    pub fn paged_write(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        if n_bytes == 0 {
            return Ok(0);
        }
        if mem.kind == MemKind::Flash && !part.is_tpi() {
            self.paged_write_flash(part, mem, addr, n_bytes)
        } else {
            self.paged_write_bytes(part, mem, addr, n_bytes)
        }
    }

    /// Read `n_bytes` of `mem` starting at `addr` into the memory image.
    pub fn paged_load(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        if n_bytes == 0 {
            return Ok(0);
        }
        if mem.kind == MemKind::Flash && !part.is_tpi() {
            self.paged_load_flash(part, mem, addr, n_bytes)
        } else {
            self.paged_load_bytes(part, mem, addr, n_bytes)
        }
    }

    fn paged_write_bytes(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        for a in addr..addr + n_bytes {
            let value = mem.buf[a];
            self.write_byte(part, mem, a, value)?;
        }
        Ok(n_bytes)
    }

    fn paged_load_bytes(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        for a in addr..addr + n_bytes {
            let value = self.read_byte(part, mem, a)?;
            mem.buf[a] = value;
        }
        Ok(n_bytes)
    }

    fn paged_write_flash(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        let (Some(op_lo), Some(op_hi)) = (mem.op_loadpage_lo, mem.op_loadpage_hi) else {
            bail!("loadpage instruction not defined for part {}", part.name);
        };

        let mut buf: Vec<u8> = Vec::with_capacity(FT245R_FRAGMENT_SIZE + 1);
        let mut i = 0usize;
        let mut j = 0usize;
        let mut a = addr;
        let mut addr_save = addr;
        let mut req_count = 0usize;
        let mut do_page_write = false;

        while i < n_bytes {
            let op = if a & 1 == 1 { op_hi } else { op_lo };
            let cmd = op.encode((a / 2) as u32, mem.buf[a]);
            for &byte in &cmd {
                self.set_data(&mut buf, byte);
            }
            i += 1;
            j += 1;
            a += 1;

            if mem.paged && (i % mem.page_size == 0 || i >= n_bytes) {
                do_page_write = true;
            }

            // Page boundary, finished, or fragment full? Close and issue.
            if do_page_write || i >= n_bytes || j >= FT245R_FRAGMENT_SIZE / FT245R_CMD_SIZE {
                if i >= n_bytes {
                    self.sck_idle_byte(&mut buf);
                } else {
                    // Stretch so the final sample lands at a fixed offset.
                    let last = *buf.last().unwrap();
                    buf.push(last);
                }
                self.ch.send(&buf)?;
                self.put_request(addr_save, buf.len(), 0);

                req_count += 1;
                if req_count > REQ_OUTSTANDINGS {
                    self.do_request(mem)?;
                }

                if do_page_write {
                    self.drain_requests(mem)?;
                    let page_base = addr_save - addr_save % mem.page_size;
                    self.write_page(part, mem, page_base)?;
                    do_page_write = false;
                    req_count = 0;
                }

                j = 0;
                buf.clear();
                addr_save = a;
            }
        }

        self.drain_requests(mem)?;
        Ok(n_bytes)
    }

    fn paged_load_flash(
        &mut self,
        part: &Part,
        mem: &mut Memory,
        addr: usize,
        n_bytes: usize,
    ) -> Result<usize> {
        let (Some(op_lo), Some(op_hi)) = (mem.op_read_lo, mem.op_read_hi) else {
            bail!("read instruction not defined for part {}", part.name);
        };

        // The whole range shares the upper address bits, so the extended
        // address byte needs loading at most once, up front.
        if let Some(ext) = mem.op_load_ext_addr {
            let cmd = ext.encode(((addr / 2) >> 16) as u32, 0);
            let mut buf = Vec::with_capacity(FT245R_CMD_SIZE);
            for &byte in &cmd {
                self.set_data(&mut buf, byte);
            }
            self.ch.send_and_discard(&buf)?;
        }

        let mut buf: Vec<u8> = Vec::with_capacity(FT245R_FRAGMENT_SIZE + 1);
        let mut i = 0usize;
        let mut j = 0usize;
        let mut a = addr;
        let mut addr_save = addr;
        let mut req_count = 0usize;

        while i < n_bytes {
            let op = if a & 1 == 1 { op_hi } else { op_lo };
            let cmd = op.encode((a / 2) as u32, 0);
            for &byte in &cmd {
                self.set_data(&mut buf, byte);
            }
            i += 1;
            j += 1;
            a += 1;

            if i >= n_bytes || j >= FT245R_FRAGMENT_SIZE / FT245R_CMD_SIZE {
                if i >= n_bytes {
                    self.sck_idle_byte(&mut buf);
                } else {
                    let last = *buf.last().unwrap();
                    buf.push(last);
                }
                self.ch.send(&buf)?;
                self.put_request(addr_save, buf.len(), j);

                req_count += 1;
                if req_count > REQ_OUTSTANDINGS {
                    self.do_request(mem)?;
                }

                j = 0;
                buf.clear();
                addr_save = a;
            }
        }

        self.drain_requests(mem)?;
        Ok(n_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programmer::Config;
    use crate::sim::AvrIspSim;

    fn pgm(sim: AvrIspSim) -> Programmer<AvrIspSim> {
        Programmer::with_transport(sim, &Config::default()).unwrap()
    }

    #[test]
    fn zero_length_transfers_do_no_io() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(1024, 128));
        let writes_before = p.ch.transport_mut().write_calls;
        let mut flash = part.flash.clone();
        assert_eq!(p.paged_write(&part, &mut flash, 0, 0).unwrap(), 0);
        assert_eq!(p.paged_load(&part, &mut flash, 0, 0).unwrap(), 0);
        assert_eq!(p.ch.transport_mut().write_calls, writes_before);
    }

    #[test]
    fn flash_write_commits_pages_in_order() {
        // 256 bytes over two 128-byte pages: the device must see exactly two
        // page commits, at 0 and 128, and never more than the allowed number
        // of outstanding fragments.
        let part = Part::find("atmega328p").unwrap();
        let mut flash = part.flash.clone();
        for (i, b) in flash.buf[..256].iter_mut().enumerate() {
            *b = (i as u8) ^ 0x5a;
        }
        let mut p = pgm(AvrIspSim::new(1024, 128));
        assert_eq!(p.paged_write(&part, &mut flash, 0, 256).unwrap(), 256);
        assert!(p.queue.is_empty());
        let sim = p.ch.transport_mut();
        assert_eq!(sim.page_writes, vec![0, 128]);
        assert_eq!(&sim.flash[..256], &flash.buf[..256]);
        assert!(sim.flash[256..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn outstanding_fragments_stay_bounded() {
        // A long read produces far more fragments than the in-flight limit:
        // 2048 bytes at 8 target bytes per fragment is 256 fragments.
        let part = Part::find("atmega644p").unwrap();
        let mut sim = AvrIspSim::new(4096, 256);
        for (i, b) in sim.flash.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13);
        }
        let expected = sim.flash[..2048].to_vec();
        let mut p = pgm(sim);
        let mut flash = part.flash.clone();
        assert_eq!(p.paged_load(&part, &mut flash, 0, 2048).unwrap(), 2048);
        assert!(p.max_queue <= REQ_OUTSTANDINGS);
        assert!(p.queue.is_empty());
        assert_eq!(&flash.buf[..2048], &expected[..]);
    }

    #[test]
    fn flash_read_emits_one_extended_address_command() {
        let part = Part::find("atmega2560").unwrap();
        let mut sim = AvrIspSim::new(4096, 256);
        for (i, b) in sim.flash.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        let expected = sim.flash[..128].to_vec();
        let mut p = pgm(sim);
        let mut flash = part.flash.clone();
        assert_eq!(p.paged_load(&part, &mut flash, 0, 128).unwrap(), 128);
        let sim = p.ch.transport_mut();
        assert_eq!(sim.ext_addr_loads, 1);
        assert_eq!(sim.first_op, Some(0x4d));
        assert_eq!(&flash.buf[..128], &expected[..]);
    }

    #[test]
    fn flash_read_roundtrips_without_ext_addr() {
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(1024, 128);
        for (i, b) in sim.flash.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(3);
        }
        let expected = sim.flash.clone();
        let mut p = pgm(sim);
        let mut flash = part.flash.clone();
        assert_eq!(p.paged_load(&part, &mut flash, 0, 1024).unwrap(), 1024);
        let sim = p.ch.transport_mut();
        assert_eq!(sim.ext_addr_loads, 0);
        assert_eq!(&flash.buf[..1024], &expected[..]);
    }

    #[test]
    fn range_end_on_fragment_boundary_parks_sck_low() {
        // Exactly one fragment's worth of target bytes: the closing byte is
        // the SCK-idle byte, not a stretch byte, so the recorded stream must
        // end with SCK low.
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(1024, 128);
        sim.record_stream();
        let mut p = pgm(sim);
        p.ch.transport_mut().stream.as_mut().unwrap().clear();
        let mut flash = part.flash.clone();
        let frag = FT245R_FRAGMENT_SIZE / FT245R_CMD_SIZE;
        p.paged_load(&part, &mut flash, 0, frag).unwrap();
        let sck = 0x01;
        let stream = p.ch.transport_mut().stream.as_ref().unwrap();
        assert_eq!(stream.len(), FT245R_FRAGMENT_SIZE + 1);
        assert_eq!(stream.last().unwrap() & sck, 0);

        // Mid-range fragments of a longer read end stretched, SCK high.
        let mut sim = AvrIspSim::new(1024, 128);
        sim.record_stream();
        let mut p = pgm(sim);
        p.ch.transport_mut().stream.as_mut().unwrap().clear();
        p.paged_load(&part, &mut flash, 0, frag + 1).unwrap();
        let stream = p.ch.transport_mut().stream.as_ref().unwrap();
        let first_frag = &stream[..FT245R_FRAGMENT_SIZE + 1];
        assert_ne!(first_frag.last().unwrap() & sck, 0);
        assert_eq!(
            first_frag[FT245R_FRAGMENT_SIZE],
            first_frag[FT245R_FRAGMENT_SIZE - 1]
        );
    }

    #[test]
    fn eeprom_falls_back_to_byte_access() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(1024, 128));
        let mut eeprom = part.eeprom.clone().unwrap();
        for (i, b) in eeprom.buf[..16].iter_mut().enumerate() {
            *b = 0xe0 | i as u8;
        }
        assert_eq!(p.paged_write(&part, &mut eeprom, 0, 16).unwrap(), 16);
        let mut back = part.eeprom.clone().unwrap();
        assert_eq!(p.paged_load(&part, &mut back, 0, 16).unwrap(), 16);
        assert_eq!(&back.buf[..16], &eeprom.buf[..16]);
    }
}
