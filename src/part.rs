//! AVR part descriptions and serial programming instruction encoding.
//!
//! Parts are described in an embedded YAML database; the 4-byte ISP
//! instruction patterns are the ones shared by the whole classic AVR family,
//! so only sizes and capability flags live in the database and the opcode
//! templates are attached here.

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Where the address bits of an instruction go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrField {
    None,
    /// 16 bits, big-endian, in bytes 1 and 2.
    Word,
    /// One byte in byte 2.
    Byte2,
}

/// Template for one 4-byte serial programming instruction.
#[derive(Debug, Clone, Copy)]
pub struct SpiOp {
    base: [u8; 4],
    addr: AddrField,
    input: bool,
}

impl SpiOp {
    /// Fold an address and an input byte into the template.
    pub fn encode(&self, addr: u32, input: u8) -> [u8; 4] {
        let mut cmd = self.base;
        match self.addr {
            AddrField::None => {}
            AddrField::Word => {
                cmd[1] |= (addr >> 8) as u8;
                cmd[2] |= addr as u8;
            }
            AddrField::Byte2 => {
                cmd[2] |= addr as u8;
            }
        }
        if self.input {
            cmd[3] = input;
        }
        cmd
    }
}

pub const PGM_ENABLE: SpiOp = SpiOp {
    base: [0xac, 0x53, 0x00, 0x00],
    addr: AddrField::None,
    input: false,
};
pub const CHIP_ERASE: SpiOp = SpiOp {
    base: [0xac, 0x80, 0x00, 0x00],
    addr: AddrField::None,
    input: false,
};
pub const READ_LO: SpiOp = SpiOp {
    base: [0x20, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: false,
};
pub const READ_HI: SpiOp = SpiOp {
    base: [0x28, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: false,
};
pub const LOADPAGE_LO: SpiOp = SpiOp {
    base: [0x40, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: true,
};
pub const LOADPAGE_HI: SpiOp = SpiOp {
    base: [0x48, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: true,
};
pub const WRITE_PAGE: SpiOp = SpiOp {
    base: [0x4c, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: false,
};
pub const LOAD_EXT_ADDR: SpiOp = SpiOp {
    base: [0x4d, 0x00, 0x00, 0x00],
    addr: AddrField::Byte2,
    input: false,
};
pub const EEPROM_READ: SpiOp = SpiOp {
    base: [0xa0, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: false,
};
pub const EEPROM_WRITE: SpiOp = SpiOp {
    base: [0xc0, 0x00, 0x00, 0x00],
    addr: AddrField::Word,
    input: true,
};
pub const READ_SIGNATURE: SpiOp = SpiOp {
    base: [0x30, 0x00, 0x00, 0x00],
    addr: AddrField::Byte2,
    input: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Isp,
    Tpi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Flash,
    Eeprom,
}

impl MemKind {
    pub fn name(&self) -> &'static str {
        match self {
            MemKind::Flash => "flash",
            MemKind::Eeprom => "eeprom",
        }
    }
}

/// One memory of a part, together with its host-side image buffer.
#[derive(Debug, Clone)]
pub struct Memory {
    pub kind: MemKind,
    pub size: usize,
    pub page_size: usize,
    pub paged: bool,
    pub write_delay_us: u64,
    /// Base of this memory in the TPI data space; zero for ISP parts.
    pub offset: u32,
    pub buf: Vec<u8>,
    pub op_read_lo: Option<SpiOp>,
    pub op_read_hi: Option<SpiOp>,
    pub op_loadpage_lo: Option<SpiOp>,
    pub op_loadpage_hi: Option<SpiOp>,
    pub op_write_page: Option<SpiOp>,
    pub op_load_ext_addr: Option<SpiOp>,
    pub op_read: Option<SpiOp>,
    pub op_write: Option<SpiOp>,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub signature: [u8; 3],
    pub interface: Interface,
    /// Which response byte of the program enable exchange to poll (1-based)
    /// and the value that signals success.
    pub pollindex: usize,
    pub pollvalue: u8,
    pub chip_erase_delay_us: u64,
    pub flash: Memory,
    pub eeprom: Option<Memory>,
    pub op_pgm_enable: Option<SpiOp>,
    pub op_chip_erase: Option<SpiOp>,
}

impl Part {
    pub fn is_tpi(&self) -> bool {
        self.interface == Interface::Tpi
    }

    pub fn memory(&self, kind: MemKind) -> Option<&Memory> {
        match kind {
            MemKind::Flash => Some(&self.flash),
            MemKind::Eeprom => self.eeprom.as_ref(),
        }
    }

    pub fn memory_mut(&mut self, kind: MemKind) -> Option<&mut Memory> {
        match kind {
            MemKind::Flash => Some(&mut self.flash),
            MemKind::Eeprom => self.eeprom.as_mut(),
        }
    }

    /// Load the full database.
    pub fn all() -> Result<Vec<Part>> {
        let file: PartFile = serde_yaml::from_str(include_str!("../devices/parts.yaml"))?;
        Ok(file.parts.into_iter().map(Part::from_def).collect())
    }

    pub fn find(name: &str) -> Result<Part> {
        let lowered = name.to_ascii_lowercase();
        Part::all()?
            .into_iter()
            .find(|p| p.name == lowered)
            .ok_or_else(|| anyhow!("unknown part {}; try the parts command", name))
    }

    fn from_def(def: PartDef) -> Part {
        let interface = match def.interface {
            InterfaceDef::Isp => Interface::Isp,
            InterfaceDef::Tpi => Interface::Tpi,
        };
        let isp = interface == Interface::Isp;
        let flash = Memory {
            kind: MemKind::Flash,
            size: def.flash.size,
            page_size: def.flash.page_size,
            paged: def.flash.paged,
            write_delay_us: def.flash.write_delay_us,
            offset: def.flash.offset,
            buf: vec![0xff; def.flash.size],
            op_read_lo: isp.then_some(READ_LO),
            op_read_hi: isp.then_some(READ_HI),
            op_loadpage_lo: (isp && def.flash.paged).then_some(LOADPAGE_LO),
            op_loadpage_hi: (isp && def.flash.paged).then_some(LOADPAGE_HI),
            op_write_page: (isp && def.flash.paged).then_some(WRITE_PAGE),
            op_load_ext_addr: (isp && def.flash.load_ext_addr).then_some(LOAD_EXT_ADDR),
            op_read: None,
            op_write: None,
        };
        let eeprom = def.eeprom.map(|m| Memory {
            kind: MemKind::Eeprom,
            size: m.size,
            page_size: m.page_size,
            paged: false,
            write_delay_us: m.write_delay_us,
            offset: m.offset,
            buf: vec![0xff; m.size],
            op_read_lo: None,
            op_read_hi: None,
            op_loadpage_lo: None,
            op_loadpage_hi: None,
            op_write_page: None,
            op_load_ext_addr: None,
            op_read: isp.then_some(EEPROM_READ),
            op_write: isp.then_some(EEPROM_WRITE),
        });
        Part {
            name: def.name,
            signature: def.signature,
            interface,
            pollindex: def.pollindex,
            pollvalue: def.pollvalue,
            chip_erase_delay_us: def.chip_erase_delay_us,
            flash,
            eeprom,
            op_pgm_enable: isp.then_some(PGM_ENABLE),
            op_chip_erase: isp.then_some(CHIP_ERASE),
        }
    }
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (signature {}, {})",
            self.name,
            hex::encode(self.signature),
            match self.interface {
                Interface::Isp => "ISP",
                Interface::Tpi => "TPI",
            }
        )
    }
}

#[derive(Debug, Deserialize)]
struct PartFile {
    parts: Vec<PartDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartDef {
    name: String,
    signature: [u8; 3],
    #[serde(default)]
    interface: InterfaceDef,
    #[serde(default = "default_pollindex")]
    pollindex: usize,
    #[serde(default = "default_pollvalue")]
    pollvalue: u8,
    chip_erase_delay_us: u64,
    flash: MemDef,
    #[serde(default)]
    eeprom: Option<MemDef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InterfaceDef {
    #[default]
    Isp,
    Tpi,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MemDef {
    size: usize,
    page_size: usize,
    #[serde(default)]
    paged: bool,
    write_delay_us: u64,
    #[serde(default)]
    load_ext_addr: bool,
    #[serde(default)]
    offset: u32,
}

fn default_pollindex() -> usize {
    3
}

fn default_pollvalue() -> u8 {
    0x53
}
