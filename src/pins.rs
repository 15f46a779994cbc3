//! Logical pin to DBUS bit mapping.
//!
//! Every programming line is one bit of the 8-bit FTDI data bus, optionally
//! inverted. Pin values are always read and written through a shadow of the
//! last byte driven onto the bus, so a single-pin update never disturbs the
//! other lines.

use anyhow::{bail, Result};

/// One logical pin: a DBUS bitmask plus polarity. A mask of zero means the
/// pin is not wired and writes to it are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinDef {
    pub mask: u8,
    pub invert: bool,
}

impl PinDef {
    pub const fn bit(n: u8) -> Self {
        PinDef {
            mask: 1 << n,
            invert: false,
        }
    }

    pub const fn bit_inverted(n: u8) -> Self {
        PinDef {
            mask: 1 << n,
            invert: true,
        }
    }

    pub const fn unwired() -> Self {
        PinDef {
            mask: 0,
            invert: false,
        }
    }

    pub const fn is_wired(&self) -> bool {
        self.mask != 0
    }

    /// Fold a logical value into `shadow`, honouring polarity.
    pub fn set(&self, shadow: u8, value: bool) -> u8 {
        if value != self.invert {
            shadow | self.mask
        } else {
            shadow & !self.mask
        }
    }

    /// Extract the logical value from a sampled bus byte.
    pub fn get(&self, sample: u8) -> bool {
        ((sample & self.mask) != 0) != self.invert
    }
}

/// Pin assignment for one programmer. SCK, SDO, SDI and RESET must be wired;
/// the buffer enable, target power and LED pins are optional.
#[derive(Debug, Clone, Copy)]
pub struct PinMap {
    pub sck: PinDef,
    pub sdo: PinDef,
    pub sdi: PinDef,
    pub reset: PinDef,
    pub buff: PinDef,
    pub vcc: PinDef,
    pub led_rdy: PinDef,
    pub led_err: PinDef,
    pub led_pgm: PinDef,
    pub led_vfy: PinDef,
}

impl Default for PinMap {
    /// The classic FT232R wiring: SCK on RTS/D0, SDI on RxD/D1, SDO on
    /// TxD/D2, RESET on DTR/D4.
    fn default() -> Self {
        PinMap {
            sck: PinDef::bit(0),
            sdi: PinDef::bit(1),
            sdo: PinDef::bit(2),
            reset: PinDef::bit(4),
            buff: PinDef::unwired(),
            vcc: PinDef::unwired(),
            led_rdy: PinDef::unwired(),
            led_err: PinDef::unwired(),
            led_pgm: PinDef::unwired(),
            led_vfy: PinDef::unwired(),
        }
    }
}

impl PinMap {
    /// Direction register: every output pin drives the bus, SDI is the one
    /// input the protocol samples.
    pub fn ddr(&self) -> u8 {
        self.sck.mask
            | self.sdo.mask
            | self.reset.mask
            | self.buff.mask
            | self.vcc.mask
            | self.led_rdy.mask
            | self.led_err.mask
            | self.led_pgm.mask
            | self.led_vfy.mask
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pin) in [
            ("sck", self.sck),
            ("sdo", self.sdo),
            ("sdi", self.sdi),
            ("reset", self.reset),
        ] {
            if !pin.is_wired() {
                bail!("mandatory pin {} is not assigned to a DBUS bit", name);
            }
        }
        if self.sdi.mask & self.ddr() != 0 {
            bail!("sdi shares a DBUS bit with an output pin");
        }
        Ok(())
    }

    /// Named pins for display purposes.
    pub fn describe(&self) -> Vec<(&'static str, PinDef)> {
        vec![
            ("sck", self.sck),
            ("sdo", self.sdo),
            ("sdi", self.sdi),
            ("reset", self.reset),
            ("buff", self.buff),
            ("vcc", self.vcc),
            ("led_rdy", self.led_rdy),
            ("led_err", self.led_err),
            ("led_pgm", self.led_pgm),
            ("led_vfy", self.led_vfy),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let pin = PinDef::bit(3);
        let shadow = pin.set(0x00, true);
        assert_eq!(shadow, 0x08);
        assert!(pin.get(shadow));
        assert!(!pin.get(pin.set(shadow, false)));
    }

    #[test]
    fn inverted_pin_drives_opposite_level() {
        let pin = PinDef::bit_inverted(7);
        assert_eq!(pin.set(0x00, true), 0x00);
        assert_eq!(pin.set(0x00, false), 0x80);
        assert!(pin.get(0x00));
        assert!(!pin.get(0x80));
    }

    #[test]
    fn unwired_pin_is_inert() {
        let pin = PinDef::unwired();
        assert_eq!(pin.set(0x5a, true), 0x5a);
        assert_eq!(pin.set(0x5a, false), 0x5a);
        assert!(!pin.is_wired());
    }

    #[test]
    fn default_map_ddr_excludes_sdi() {
        let pins = PinMap::default();
        let ddr = pins.ddr();
        assert_eq!(ddr, 0b0001_0101);
        assert_eq!(ddr & pins.sdi.mask, 0);
        pins.validate().unwrap();
    }

    #[test]
    fn missing_reset_is_rejected() {
        let pins = PinMap {
            reset: PinDef::unwired(),
            ..PinMap::default()
        };
        assert!(pins.validate().is_err());
    }

    #[test]
    fn shared_input_output_bit_is_rejected() {
        let pins = PinMap {
            sdi: PinDef::bit(0),
            ..PinMap::default()
        };
        assert!(pins.validate().is_err());
    }
}
