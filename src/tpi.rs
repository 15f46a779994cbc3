//! TPI: the single-wire framed protocol of the smallest AVR parts.
//!
//! SDO and SDI are tied together through a 1 kΩ resistor, so every
//! transmitted bit is also read back. A frame is one start bit, eight data
//! bits LSB first, an even parity bit and two stop bits, clocked with the
//! same two-slot cycle as the ISP codec.

use anyhow::{bail, Result};

use crate::part::Part;
use crate::programmer::Programmer;
use crate::transport::Transport;

pub(crate) const TPI_CMD_SLD_PI: u8 = 0x24;
pub(crate) const TPI_CMD_SST: u8 = 0x60;
pub(crate) const TPI_CMD_SST_PI: u8 = 0x64;
pub(crate) const TPI_CMD_SSTPR_LO: u8 = 0x68;
pub(crate) const TPI_CMD_SSTPR_HI: u8 = 0x69;
pub(crate) const TPI_CMD_SLDCS: u8 = 0x80;
pub(crate) const TPI_CMD_SSTCS: u8 = 0xc0;
pub(crate) const TPI_CMD_SKEY: u8 = 0xe0;

pub(crate) const TPI_REG_TPISR: u8 = 0x00;
pub(crate) const TPI_REG_TPIPCR: u8 = 0x02;
pub(crate) const TPI_REG_TPIIR: u8 = 0x0f;

pub(crate) const TPI_IDENT_CODE: u8 = 0x80;
pub(crate) const TPISR_NVMEN: u8 = 0x02;
/// TPIPCR value that removes the extra guard bits between frames.
pub(crate) const TPIPCR_GT_0B: u8 = 0x07;

/// NVM programming key, least significant byte first.
const TPI_SKEY: [u8; 8] = [0xff, 0x88, 0xd8, 0xcd, 0x45, 0xab, 0x89, 0x12];

/// Device signature rows in the TPI data space.
pub(crate) const TPI_SIGNATURE_BASE: u32 = 0x3fc0;

const NVMCSR: u8 = 0x32;
const NVMCMD: u8 = 0x33;
const NVMCSR_BSY: u8 = 0x80;
const NVMCMD_CHIP_ERASE: u8 = 0x10;
const NVMCMD_WORD_WRITE: u8 = 0x1d;

/// I/O space read, 0aa1aaaa encoding.
pub(crate) fn sin(addr: u8) -> u8 {
    0x10 | ((addr & 0x30) << 1) | (addr & 0x0f)
}

/// I/O space write, 1aa1aaaa encoding.
pub(crate) fn sout(addr: u8) -> u8 {
    0x90 | ((addr & 0x30) << 1) | (addr & 0x0f)
}

impl<T: Transport> Programmer<T> {
    fn set_tpi_data(&mut self, buf: &mut Vec<u8>, byte: u8) {
        let mut parity = false;
        self.add_bit(buf, false); // start
        for j in 0..8 {
            let bit = byte & (1 << j) != 0;
            parity ^= bit;
            self.add_bit(buf, bit);
        }
        self.add_bit(buf, parity);
        self.add_bit(buf, true); // stop
        self.add_bit(buf, true);
    }

    /// Transmit one frame; the echo carries nothing of interest.
    pub(crate) fn tpi_tx(&mut self, byte: u8) -> Result<()> {
        let mut buf = Vec::with_capacity(24);
        self.set_tpi_data(&mut buf, byte);
        self.ch.send_and_discard(&buf)
    }

    fn extract_tpi_data(&self, buf: &[u8], pos: &mut usize) -> u8 {
        let mut byte = 0u8;
        for j in 0..8 {
            *pos += 1; // skip the falling-edge slot
            if self.pins.sdi.get(buf[*pos]) {
                byte |= 1 << j;
            }
            *pos += 1;
        }
        byte
    }

    /// Receive one frame. The data line idles high; the start bit must show
    /// up within the first four sampled bit positions.
    pub(crate) fn tpi_rx(&mut self) -> Result<u8> {
        let mut buf = Vec::with_capacity(32);
        self.set_data(&mut buf, 0xff);
        self.set_data(&mut buf, 0xff);
        self.ch.send(&buf)?;
        let mut raw = vec![0u8; buf.len()];
        self.ch.recv(&mut raw)?;

        let mut pos = 0;
        let res = self.extract_tpi_data(&raw, &mut pos) as u32
            | (self.extract_tpi_data(&raw, &mut pos) as u32) << 8;

        // Hunt for the start bit.
        let mut m: u32 = 0x1;
        while m & res != 0 {
            m <<= 1;
        }
        if m >= 0x10 {
            bail!("TPI start bit missing (res=0x{:04x})", res);
        }

        let mut byte = 0u8;
        let mut parity = false;
        for i in 0..8 {
            m <<= 1;
            let bit = res & m != 0;
            parity ^= bit;
            if bit {
                byte |= 1 << i;
            }
        }
        m <<= 1;
        if ((res & m) != 0) != parity {
            bail!("TPI parity bit wrong");
        }
        if res & (m << 1) == 0 || res & (m << 2) == 0 {
            bail!("TPI stop bits wrong");
        }
        Ok(byte)
    }

    /// Send a TPI command and collect its response frames, stopping at the
    /// first receive error.
    pub fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        for &byte in cmd {
            self.tpi_tx(byte)?;
        }
        let mut ret = Ok(());
        for slot in res.iter_mut() {
            match self.tpi_rx() {
                Ok(byte) => *slot = byte,
                Err(e) => {
                    ret = Err(e);
                    break;
                }
            }
        }
        log::debug!("cmd_tpi: [{}] [{}]", hex::encode(cmd), hex::encode(&res[..]));
        ret
    }

    /// Verify the data-line loopback, clock the interface awake and check
    /// the identification register.
    pub(crate) fn tpi_init(&mut self) -> Result<()> {
        let mut link_ok = true;
        for level in [false, true] {
            self.ch.set_pin(self.pins.sdo, level)?;
            if self.ch.get_pin(self.pins.sdi)? != level {
                link_ok = false;
                if self.ovsigck {
                    log::warn!("SDO->SDI {} failed", level as u8);
                } else {
                    bail!("SDO->SDI {} failed", level as u8);
                }
            }
        }
        if link_ok {
            log::debug!("SDO-SDI link present");
        }

        // Keep the data line high for 16 clock cycles to enable TPI.
        self.ch.set_pin(self.pins.sdo, true)?;
        for _ in 0..16 {
            self.set_sck(true)?;
            self.set_sck(false)?;
        }

        // Remove the extra guard bits.
        self.tpi_tx(TPI_CMD_SSTCS | TPI_REG_TPIPCR)?;
        self.tpi_tx(TPIPCR_GT_0B)?;

        self.tpi_tx(TPI_CMD_SLDCS | TPI_REG_TPIIR)?;
        let ident = self.tpi_rx()?;
        if ident != TPI_IDENT_CODE {
            bail!("TPIIR 0x{:02x} not correct", ident);
        }
        Ok(())
    }

    /// Enable NVM programming: guard time, key, then wait for NVMEN.
    pub(crate) fn tpi_program_enable(&mut self, guard_time: u8) -> Result<()> {
        self.cmd_tpi(&[TPI_CMD_SSTCS | TPI_REG_TPIPCR, guard_time], &mut [])?;
        let mut resp = [0u8; 1];
        self.cmd_tpi(&[TPI_CMD_SLDCS | TPI_REG_TPIPCR], &mut resp)?;
        if resp[0] != guard_time {
            bail!("cannot set TPI guard time (read back 0x{:02x})", resp[0]);
        }

        let mut skey = [0u8; 9];
        skey[0] = TPI_CMD_SKEY;
        skey[1..].copy_from_slice(&TPI_SKEY);
        self.cmd_tpi(&skey, &mut [])?;

        for _ in 0..10 {
            let mut status = [0u8; 1];
            self.cmd_tpi(&[TPI_CMD_SLDCS | TPI_REG_TPISR], &mut status)?;
            if status[0] & TPISR_NVMEN != 0 {
                return Ok(());
            }
        }
        bail!("error enabling TPI external programming mode")
    }

    fn tpi_set_pointer(&mut self, addr: u16) -> Result<()> {
        self.cmd_tpi(&[TPI_CMD_SSTPR_LO, addr as u8], &mut [])?;
        self.cmd_tpi(&[TPI_CMD_SSTPR_HI, (addr >> 8) as u8], &mut [])
    }

    fn tpi_nvm_command(&mut self, cmd: u8) -> Result<()> {
        self.cmd_tpi(&[sout(NVMCMD), cmd], &mut [])
    }

    fn tpi_wait_nvmbsy(&mut self) -> Result<()> {
        for _ in 0..256 {
            let mut csr = [0u8; 1];
            self.cmd_tpi(&[sin(NVMCSR)], &mut csr)?;
            if csr[0] & NVMCSR_BSY == 0 {
                return Ok(());
            }
            self.ch.usleep(100)?;
        }
        bail!("timeout waiting for the NVM controller")
    }

    /// A write to any high flash byte with the chip erase command pending
    /// wipes the whole device.
    pub(crate) fn tpi_chip_erase(&mut self, part: &Part) -> Result<()> {
        self.tpi_nvm_command(NVMCMD_CHIP_ERASE)?;
        self.tpi_set_pointer(part.flash.offset as u16 | 1)?;
        self.cmd_tpi(&[TPI_CMD_SST, 0xff], &mut [])?;
        self.tpi_wait_nvmbsy()
    }

    pub(crate) fn tpi_read_byte(&mut self, offset: u32, addr: usize) -> Result<u8> {
        self.tpi_set_pointer(offset as u16 + addr as u16)?;
        let mut data = [0u8; 1];
        self.cmd_tpi(&[TPI_CMD_SLD_PI], &mut data)?;
        Ok(data[0])
    }

    /// Flash is written one word at a time; the half not being set is padded
    /// with 0xff, which leaves it unprogrammed.
    pub(crate) fn tpi_write_byte(&mut self, offset: u32, addr: usize, value: u8) -> Result<()> {
        let word = (addr & !1) as u16;
        let (lo, hi) = if addr & 1 == 0 {
            (value, 0xff)
        } else {
            (0xff, value)
        };
        self.tpi_nvm_command(NVMCMD_WORD_WRITE)?;
        self.tpi_set_pointer(offset as u16 + word)?;
        self.cmd_tpi(&[TPI_CMD_SST_PI, lo], &mut [])?;
        self.cmd_tpi(&[TPI_CMD_SST_PI, hi], &mut [])?;
        self.tpi_wait_nvmbsy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programmer::Config;
    use crate::sim::TpiWireSim;

    fn pgm(sim: TpiWireSim) -> Programmer<TpiWireSim> {
        Programmer::with_transport(sim, &Config::default()).unwrap()
    }

    #[test]
    fn frame_is_start_data_parity_stops() {
        let mut p = pgm(TpiWireSim::echo());
        let mut buf = Vec::new();
        // 0x0f has even weight; 0x01 odd.
        p.set_tpi_data(&mut buf, 0x0f);
        assert_eq!(buf.len(), 12 * 2);
        let sdo = p.pins.sdo.mask;
        let bit = |cycle: usize| buf[cycle * 2] & sdo != 0;
        assert!(!bit(0)); // start
        for j in 0..4 {
            assert!(bit(1 + j), "data bit {}", j);
        }
        for j in 4..8 {
            assert!(!bit(1 + j), "data bit {}", j);
        }
        assert!(!bit(9)); // even parity
        assert!(bit(10) && bit(11)); // stop bits

        buf.clear();
        p.set_tpi_data(&mut buf, 0x01);
        assert!(buf[9 * 2] & sdo != 0); // odd parity
    }

    #[test]
    fn byte_roundtrips_over_the_single_wire() {
        for value in [0x00u8, 0x01, 0x55, 0x80, 0xc2, 0xff] {
            let mut p = pgm(TpiWireSim::echo());
            p.tpi_tx(value).unwrap();
            assert_eq!(p.tpi_rx().unwrap(), value, "value {:#04x}", value);
        }
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        // Flipping any of the start, data, parity or stop bits must raise a
        // framing or parity error, never return a wrong byte silently.
        // Bits 1..12: the eight data bits, parity and both stop bits. A
        // flipped start bit merely delays the frame and is covered by the
        // start-bit hunt instead.
        for value in [0x5au8, 0x00, 0xff] {
            for flip in 1..12 {
                let mut sim = TpiWireSim::echo();
                sim.corrupt_reply_bit(flip);
                let mut p = pgm(sim);
                p.tpi_tx(value).unwrap();
                let got = p.tpi_rx();
                assert!(
                    got.is_err(),
                    "value {:#04x} flip {} slipped through as {:#04x}",
                    value,
                    flip,
                    got.unwrap()
                );
            }
        }
    }

    #[test]
    fn initialize_talks_nvm() {
        let part = Part::find("attiny10").unwrap();
        let mut p = pgm(TpiWireSim::nvm());
        p.initialize(&part).unwrap();
        let frames = &p.ch.transport_mut().frames;
        // Guard time removal must have been sent before the key.
        let guard = frames
            .windows(2)
            .position(|w| w == [TPI_CMD_SSTCS | TPI_REG_TPIPCR, TPIPCR_GT_0B]);
        let key = frames.iter().position(|&f| f == TPI_CMD_SKEY);
        assert!(guard.is_some());
        assert!(key.is_some());
        assert!(guard.unwrap() < key.unwrap());
    }

    #[test]
    fn broken_loopback_fails_before_any_frame() {
        let part = Part::find("attiny10").unwrap();
        let mut sim = TpiWireSim::nvm();
        sim.break_loopback();
        let mut p = pgm(sim);
        assert!(p.initialize(&part).is_err());
        assert!(p.ch.transport_mut().frames.is_empty());
    }

    #[test]
    fn broken_loopback_is_demoted_with_override() {
        let part = Part::find("attiny10").unwrap();
        let mut sim = TpiWireSim::nvm();
        sim.break_loopback();
        let mut p = Programmer::with_transport(
            sim,
            &Config {
                ovsigck: true,
                ..Config::default()
            },
        )
        .unwrap();
        // With the override the loopback failure is only a warning and the
        // session proceeds to the identification register.
        p.initialize(&part).unwrap();
        assert!(!p.ch.transport_mut().frames.is_empty());
    }

    #[test]
    fn chip_erase_sequences_the_nvm_controller() {
        let part = Part::find("attiny10").unwrap();
        let mut p = pgm(TpiWireSim::nvm());
        p.initialize(&part).unwrap();
        p.chip_erase(&part).unwrap();
        let sim = p.ch.transport_mut();
        assert!(sim.nvm_chip_erased);
    }
}
