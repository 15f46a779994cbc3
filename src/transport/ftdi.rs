//! FTDI D2XX transport.
use std::time::Duration;

use anyhow::{anyhow, Result};
use libftd2xx::{Ftdi, FtdiCommon};

use super::{BitMode, Transport};
use crate::constants::{USB_DEVICE_FT245, USB_VENDOR_FTDI};

/// Device selection for [`FtdiTransport::open`]. Serial number wins over
/// product description, which wins over the zero-based device index.
#[derive(Debug, Clone, Default)]
pub struct UsbOptions {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub index: i32,
}

pub struct FtdiTransport {
    ft: Ftdi,
}

impl FtdiTransport {
    pub fn open(opts: &UsbOptions) -> Result<FtdiTransport> {
        let vid = opts.vid.unwrap_or(USB_VENDOR_FTDI);
        let pid = opts.pid.unwrap_or(USB_DEVICE_FT245);
        libftd2xx::set_vid_pid(vid, pid)
            .map_err(|e| anyhow!("cannot register VID/PID {:04x}:{:04x}: {}", vid, pid, e))?;

        let mut ft = match (&opts.serial, &opts.product) {
            (Some(sn), _) if !sn.is_empty() => Ftdi::with_serial_number(sn)
                .map_err(|e| anyhow!("cannot open ftdi device with serial {}: {}", sn, e))?,
            (_, Some(desc)) if !desc.is_empty() => Ftdi::with_description(desc)
                .map_err(|e| anyhow!("cannot open ftdi device \"{}\": {}", desc, e))?,
            _ => Ftdi::with_index(opts.index)
                .map_err(|e| anyhow!("cannot open ftdi device #{}: {}", opts.index, e))?,
        };

        // 1 ms latency keeps the echo round-trips short.
        ft.set_latency_timer(Duration::from_millis(1))
            .map_err(|e| anyhow!("unable to set latency timer to 1 ms: {}", e))?;

        log::debug!("opened FTDI device {:04x}:{:04x}", vid, pid);
        Ok(FtdiTransport { ft })
    }
}

impl Transport for FtdiTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ft.write(buf).map_err(|e| anyhow!("ftdi write: {}", e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Read whatever already sits in the driver queue; when the queue is
        // empty block for a single byte so the caller's fill loop makes
        // progress instead of spinning.
        let queued = self
            .ft
            .queue_status()
            .map_err(|e| anyhow!("ftdi queue status: {}", e))?;
        let n = queued.clamp(1, buf.len());
        self.ft
            .read_all(&mut buf[..n])
            .map_err(|e| anyhow!("ftdi read: {}", e))?;
        Ok(n)
    }

    fn set_bitmode(&mut self, ddr: u8, mode: BitMode) -> Result<()> {
        let mode = match mode {
            BitMode::Reset => libftd2xx::BitMode::Reset,
            BitMode::SyncBitbang => libftd2xx::BitMode::SyncBitbang,
        };
        self.ft
            .set_bit_mode(ddr, mode)
            .map_err(|e| anyhow!("ftdi set bit mode: {}", e))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.ft
            .set_baud_rate(baud)
            .map_err(|e| anyhow!("setting baudrate {} failed: {}", baud, e))
    }

    fn read_data_pins(&mut self) -> Result<u8> {
        self.ft
            .bit_mode()
            .map_err(|e| anyhow!("ftdi read pins: {}", e))
    }

    fn close(&mut self) -> Result<()> {
        self.ft.close().map_err(|e| anyhow!("ftdi close: {}", e))
    }
}
