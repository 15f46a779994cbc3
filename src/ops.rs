//! Default byte-level memory primitives.

use anyhow::{anyhow, bail, Result};

use crate::part::{self, MemKind, Memory, Part};
use crate::programmer::Programmer;
use crate::tpi::TPI_SIGNATURE_BASE;
use crate::transport::Transport;

impl<T: Transport> Programmer<T> {
    /// Read one byte from a target memory.
    pub fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
        if addr >= mem.size {
            bail!(
                "address 0x{:x} outside {} ({} bytes)",
                addr,
                mem.kind.name(),
                mem.size
            );
        }
        if part.is_tpi() {
            return self.tpi_read_byte(mem.offset, addr);
        }
        let (op, op_addr) = match mem.kind {
            MemKind::Flash => {
                let op = if addr & 1 == 1 {
                    mem.op_read_hi
                } else {
                    mem.op_read_lo
                };
                let op = op.ok_or_else(|| {
                    anyhow!("read instruction not defined for part {}", part.name)
                })?;
                (op, (addr / 2) as u32)
            }
            MemKind::Eeprom => {
                let op = mem.op_read.ok_or_else(|| {
                    anyhow!("eeprom read instruction not defined for part {}", part.name)
                })?;
                (op, addr as u32)
            }
        };
        let res = self.cmd(&op.encode(op_addr, 0))?;
        Ok(res[3])
    }

    /// Write one byte. ISP flash has no byte write instruction and must go
    /// through the paged path instead.
    pub fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
        if addr >= mem.size {
            bail!(
                "address 0x{:x} outside {} ({} bytes)",
                addr,
                mem.kind.name(),
                mem.size
            );
        }
        if part.is_tpi() {
            return self.tpi_write_byte(mem.offset, addr, value);
        }
        let op = mem.op_write.ok_or_else(|| {
            anyhow!(
                "byte write instruction not defined for {} of part {}",
                mem.kind.name(),
                part.name
            )
        })?;
        self.cmd(&op.encode(addr as u32, value))?;
        self.ch.usleep(mem.write_delay_us)
    }

    /// Commit the device's page buffer for the page at `addr`.
    pub(crate) fn write_page(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<()> {
        let op = mem.op_write_page.ok_or_else(|| {
            anyhow!("write page instruction not defined for part {}", part.name)
        })?;
        self.cmd(&op.encode((addr / 2) as u32, 0))?;
        self.ch.usleep(mem.write_delay_us)
    }

    /// Read the three device signature bytes.
    pub fn read_signature(&mut self, part: &Part) -> Result<[u8; 3]> {
        let mut sig = [0u8; 3];
        for (i, slot) in sig.iter_mut().enumerate() {
            *slot = if part.is_tpi() {
                self.tpi_read_byte(TPI_SIGNATURE_BASE, i)?
            } else {
                self.cmd(&part::READ_SIGNATURE.encode(i as u32, 0))?[3]
            };
        }
        Ok(sig)
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
    fn flash_byte_read_uses_low_high_instructions() {
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(256, 128);
        sim.flash[0x10] = 0xaa;
        sim.flash[0x11] = 0x55;
        let mut p = pgm(sim);
        assert_eq!(p.read_byte(&part, &part.flash, 0x10).unwrap(), 0xaa);
        assert_eq!(p.read_byte(&part, &part.flash, 0x11).unwrap(), 0x55);
    }

    #[test]
    fn eeprom_byte_write_then_read() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(256, 128));
        let eeprom = part.eeprom.as_ref().unwrap();
        p.write_byte(&part, eeprom, 7, 0x42).unwrap();
        assert_eq!(p.read_byte(&part, eeprom, 7).unwrap(), 0x42);
    }

    #[test]
    fn out_of_range_address_is_rejected() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(256, 128));
        assert!(p.read_byte(&part, &part.flash, part.flash.size).is_err());
    }

    #[test]
    fn signature_comes_back_byte_by_byte() {
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(256, 128);
        sim.signature = [0x1e, 0x95, 0x0f];
        let mut p = pgm(sim);
        assert_eq!(p.read_signature(&part).unwrap(), [0x1e, 0x95, 0x0f]);
    }
}
