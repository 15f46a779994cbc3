use anyhow::Result;

pub use self::ftdi::{FtdiTransport, UsbOptions};

mod ftdi;

/// FTDI operating mode as far as this programmer is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    /// Leave bit-bang mode; flushes the chip's internal buffers.
    Reset,
    /// Synchronous bit-bang: every byte written is latched onto the data
    /// pins and the pin state is sampled back, one byte per byte.
    SyncBitbang,
}

/// Abstraction of the device below the buffered channel. The real
/// implementation wraps an FTDI handle; tests substitute scripted stubs.
pub trait Transport {
    /// Write raw bytes. Returns the number of bytes accepted by the device.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read raw bytes. May return fewer than requested, including zero.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_bitmode(&mut self, ddr: u8, mode: BitMode) -> Result<()>;

    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Instantaneous state of the data pins, independent of the FIFO.
    fn read_data_pins(&mut self) -> Result<u8>;

    fn close(&mut self) -> Result<()>;
}
