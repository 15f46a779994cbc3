//! Programmer session: open/close, target initialization, program enable.

use std::collections::VecDeque;

use anyhow::{anyhow, bail, Result};

use crate::channel::Channel;
use crate::constants::DEFAULT_BIT_RATE;
use crate::pager::Request;
use crate::part::Part;
use crate::pins::PinMap;
use crate::tpi::TPIPCR_GT_0B;
use crate::transport::{BitMode, FtdiTransport, Transport, UsbOptions};

/// Host-side programmer configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pins: PinMap,
    /// Bit period in microseconds; takes precedence over `baudrate`.
    pub bitclock: Option<f64>,
    pub baudrate: Option<u32>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
    /// Demote the TPI loopback check from fatal to a warning.
    pub ovsigck: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortId {
    First,
    Serial(String),
    Index(i32),
}

/// Parse a `usb:<identifier>` port name. The identifier is cut after eight
/// characters (the length of an FTDI serial number); `ft<N>` selects a
/// device by index, an exact eight-character identifier that is not of that
/// form is a serial number, and an empty identifier means the first device.
fn parse_port(port: &str) -> Result<PortId> {
    let rest = match port.strip_prefix("usb:") {
        Some(rest) => rest,
        None => {
            log::info!("no device identifier in port name, using first device");
            return Ok(PortId::First);
        }
    };
    let id: String = rest.chars().take(8).collect();
    if id.is_empty() {
        return Ok(PortId::First);
    }
    if let Some(num) = id.strip_prefix("ft") {
        if !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(PortId::Index(num.parse()?));
        }
    }
    if id.len() == 8 {
        log::debug!("port identifier parsed as serial number {}", id);
        return Ok(PortId::Serial(id));
    }
    bail!("invalid port name {}: use ft[0-9]+ or serial number", port)
}

pub struct Programmer<T: Transport> {
    pub(crate) ch: Channel<T>,
    pub(crate) pins: PinMap,
    pub(crate) queue: VecDeque<Request>,
    pub(crate) ovsigck: bool,
    closed: bool,
    /// Deepest the request queue has been at fragment issue time.
    #[cfg(test)]
    pub(crate) max_queue: usize,
}

impl Programmer<FtdiTransport> {
    /// Open the FTDI device named by `port` and bring the bus up.
    pub fn open(port: &str, cfg: &Config) -> Result<Programmer<FtdiTransport>> {
        let mut usb = UsbOptions {
            vid: cfg.vid,
            pid: cfg.pid,
            product: cfg.product.clone(),
            serial: None,
            index: 0,
        };
        match parse_port(port)? {
            PortId::First => {}
            PortId::Serial(sn) => usb.serial = Some(sn),
            PortId::Index(i) => usb.index = i,
        }
        cfg.pins.validate()?;
        let transport = FtdiTransport::open(&usb)?;
        Programmer::with_transport(transport, cfg)
    }
}

impl<T: Transport> Programmer<T> {
    /// Bring up an already-open transport: bit-bang mode with the pin map's
    /// directions, bit clock, a drained chip buffer and defined idle levels.
    pub fn with_transport(transport: T, cfg: &Config) -> Result<Programmer<T>> {
        cfg.pins.validate()?;
        let pins = cfg.pins;
        let mut ch = Channel::new(transport, pins.ddr());

        // Idle drive levels: reset released, everything else low.
        let mut out = 0u8;
        out = pins.reset.set(out, true);
        out = pins.sck.set(out, false);
        out = pins.sdo.set(out, false);
        out = pins.buff.set(out, false);
        out = pins.vcc.set(out, false);
        for led in [pins.led_rdy, pins.led_err, pins.led_pgm, pins.led_vfy] {
            out = led.set(out, false);
        }
        ch.out = out;

        let ddr = ch.ddr();
        ch.transport_mut()
            .set_bitmode(ddr, BitMode::SyncBitbang)
            .map_err(|e| anyhow!("synchronous bit-bang mode is not supported: {}", e))?;

        if cfg.bitclock.is_some() && cfg.baudrate.is_some() {
            log::warn!("both baudrate and bitclock set; using bitclock");
        }
        let rate = match (cfg.bitclock, cfg.baudrate) {
            (Some(period_us), _) if period_us > 0.0 => (1e6 / period_us) as u32,
            (_, Some(baud)) => baud,
            _ => DEFAULT_BIT_RATE,
        };
        ch.set_bitclock(rate)?;

        // Get rid of any extraneous input and latch the idle levels.
        ch.drain()?;
        let idle = ch.out;
        ch.send_and_discard(&[idle])?;

        Ok(Programmer {
            ch,
            pins,
            queue: VecDeque::new(),
            ovsigck: cfg.ovsigck,
            closed: false,
            #[cfg(test)]
            max_queue: 0,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The switch into bit-bang mode and back flushes the chip buffer.
        let t = self.ch.transport_mut();
        t.set_bitmode(0, BitMode::SyncBitbang)?;
        t.set_bitmode(0, BitMode::Reset)?;
        t.close()
    }

    pub fn display(&self) {
        log::info!("pin assignment: 0..7 = DBUS0..7");
        for (name, pin) in self.pins.describe() {
            if pin.is_wired() {
                log::info!(
                    "  {:7} = D{}{}",
                    name,
                    pin.mask.trailing_zeros(),
                    if pin.invert { " (inverted)" } else { "" }
                );
            }
        }
    }

    pub(crate) fn set_sck(&mut self, value: bool) -> Result<()> {
        self.ch.set_pin(self.pins.sck, value)
    }

    pub(crate) fn set_reset(&mut self, value: bool) -> Result<()> {
        self.ch.set_pin(self.pins.reset, value)
    }

    fn set_buff(&mut self, value: bool) -> Result<()> {
        self.ch.set_pin(self.pins.buff, value)
    }

    fn set_vcc(&mut self, value: bool) -> Result<()> {
        self.ch.set_pin(self.pins.vcc, value)
    }

    pub fn rdy_led(&mut self, on: bool) -> Result<()> {
        self.ch.set_pin(self.pins.led_rdy, on)
    }

    pub fn err_led(&mut self, on: bool) -> Result<()> {
        self.ch.set_pin(self.pins.led_err, on)
    }

    pub fn pgm_led(&mut self, on: bool) -> Result<()> {
        self.ch.set_pin(self.pins.led_pgm, on)
    }

    pub fn vfy_led(&mut self, on: bool) -> Result<()> {
        self.ch.set_pin(self.pins.led_vfy, on)
    }

    /// Apply power to the target.
    pub fn powerup(&mut self) -> Result<()> {
        self.set_vcc(true)?;
        self.ch.usleep(100)
    }

    /// Remove power from the target.
    pub fn powerdown(&mut self) -> Result<()> {
        self.set_vcc(false)
    }

    /// Reset the target, then enable the line buffer. Pulling reset first
    /// keeps the target from driving the programming lines while the buffer
    /// turns on; a buffered /RESET must therefore bypass the buffer chip.
    pub fn enable(&mut self) -> Result<()> {
        self.set_reset(false)?;
        self.ch.usleep(1)?;
        self.set_buff(true)
    }

    pub fn disable(&mut self) -> Result<()> {
        self.set_buff(false)
    }

    /// Power-up and reset sequence, then enable serial programming.
    pub fn initialize(&mut self, part: &Part) -> Result<()> {
        // Power must arrive while RESET and SCK are low; when SCK cannot be
        // guaranteed low during power-up the part wants a positive RESET
        // pulse of at least two CPU clocks afterwards.
        self.set_sck(false)?;
        self.powerup()?;

        self.set_reset(false)?;
        self.ch.usleep(5_000)?;
        self.set_reset(true)?;
        self.ch.usleep(5_000)?;
        self.set_reset(false)?;

        // At least 20 ms before the program enable instruction.
        self.ch.usleep(20_000)?;

        if part.is_tpi() {
            self.tpi_init()?;
        }
        self.program_enable(part)
    }

    /// Issue the program enable instruction, retrying with reset pulses.
    pub fn program_enable(&mut self, part: &Part) -> Result<()> {
        if part.is_tpi() {
            return self.tpi_program_enable(TPIPCR_GT_0B);
        }

        let op = part.op_pgm_enable.ok_or_else(|| {
            anyhow!("program enable instruction not defined for part {}", part.name)
        })?;
        let cmd = op.encode(0, 0);

        for attempt in 0..4 {
            let res = self.cmd(&cmd)?;
            if res[part.pollindex - 1] == part.pollvalue {
                return Ok(());
            }
            log::debug!("program enable not successful, retrying");
            self.set_reset(true)?;
            self.ch.usleep(20)?;
            self.set_reset(false)?;
            if attempt == 3 {
                self.ch.drain()?;
            }
        }
        bail!("device is not responding to program enable; check connection")
    }

    /// Erase the whole device, then re-enter programming mode.
    pub fn chip_erase(&mut self, part: &Part) -> Result<()> {
        if part.is_tpi() {
            return self.tpi_chip_erase(part);
        }
        let op = part
            .op_chip_erase
            .ok_or_else(|| anyhow!("chip erase instruction not defined for part {}", part.name))?;
        self.cmd(&op.encode(0, 0))?;
        self.ch.usleep(part.chip_erase_delay_us)?;
        self.initialize(part)
    }
}

impl<T: Transport> Drop for Programmer<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::AvrIspSim;

    fn pgm(sim: AvrIspSim) -> Programmer<AvrIspSim> {
        Programmer::with_transport(sim, &Config::default()).unwrap()
    }

    #[test]
    fn port_names_parse_per_convention() {
        assert_eq!(parse_port("usb:").unwrap(), PortId::First);
        assert_eq!(parse_port("usb").unwrap(), PortId::First);
        assert_eq!(parse_port("usb:ft0").unwrap(), PortId::Index(0));
        assert_eq!(parse_port("usb:ft12").unwrap(), PortId::Index(12));
        // Eight characters that happen to start with "ft" are still a
        // serial number unless they are all digits after the prefix.
        assert_eq!(
            parse_port("usb:ftserial").unwrap(),
            PortId::Serial("ftserial".into())
        );
        assert_eq!(parse_port("usb:ft123456").unwrap(), PortId::Index(123456));
        assert_eq!(
            parse_port("usb:A700ebn1").unwrap(),
            PortId::Serial("A700ebn1".into())
        );
        assert!(parse_port("usb:ftx").is_err());
        assert!(parse_port("usb:abc").is_err());
    }

    #[test]
    fn program_enable_happy_path() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(1024, 128));
        p.initialize(&part).unwrap();
        let sim = p.ch.transport_mut();
        assert_eq!(sim.pgm_enable_seen, 1);
        // One reset pulse from the power-up dance, none from retries.
        assert_eq!(sim.reset_pulses, 1);
    }

    #[test]
    fn program_enable_retries_with_reset_pulses() {
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(1024, 128);
        sim.fail_program_enable(3);
        let mut p = pgm(sim);
        p.initialize(&part).unwrap();
        let sim = p.ch.transport_mut();
        assert_eq!(sim.pgm_enable_seen, 4);
        // Power-up pulse plus one per failed attempt.
        assert_eq!(sim.reset_pulses, 4);
    }

    #[test]
    fn program_enable_gives_up_after_four_attempts() {
        let part = Part::find("atmega328p").unwrap();
        let mut sim = AvrIspSim::new(1024, 128);
        sim.fail_program_enable(99);
        let mut p = pgm(sim);
        let err = p.initialize(&part).unwrap_err();
        assert!(err.to_string().contains("not responding"));
        assert_eq!(p.ch.transport_mut().pgm_enable_seen, 4);
    }

    #[test]
    fn chip_erase_reinitializes() {
        let part = Part::find("atmega328p").unwrap();
        let mut p = pgm(AvrIspSim::new(1024, 128));
        p.initialize(&part).unwrap();
        p.ch.transport_mut().flash_fill(0x00);
        p.chip_erase(&part).unwrap();
        let sim = p.ch.transport_mut();
        assert!(sim.flash.iter().all(|&b| b == 0xff));
        assert_eq!(sim.pgm_enable_seen, 2);
    }
}
