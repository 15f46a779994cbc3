//! Wire-level and USB constants for the FT232R/FT245R family.

/// Bit-bang slots per target clock cycle: one with SCK low, one with SCK high.
pub const FT245R_CYCLES: usize = 2;

/// Host bytes for one 4-byte SPI instruction.
pub const FT245R_CMD_SIZE: usize = 4 * 8 * FT245R_CYCLES;

/// Host bytes issued as one USB write during paged access.
pub const FT245R_FRAGMENT_SIZE: usize = 8 * FT245R_CMD_SIZE;

/// Fragments allowed in flight before one must be retired.
pub const REQ_OUTSTANDINGS: usize = 10;

/// Local receive ring capacity.
pub const RX_CAPACITY: usize = 0x2000;

/// Min of the FTDI RX/TX FIFO sizes across the supported chip revisions.
/// Bounds both the transmit staging buffer and the unharvested echo count.
pub const FIFO_CHUNK: usize = 128;

/// Some FT232R revisions mangle bit-bang timing unless the bitclock is locked
/// to the maximum (3 MHz); see FTDI technical note TN_120. Enabling this locks
/// the baud rate and repeats every byte to approximate the requested rate.
pub const VARIABLE_PULSE_WIDTH_WORKAROUND: bool = false;

/// Bit rate used when neither a bitclock nor a baud rate is given. Works with
/// the AVR internal 1 MHz RC oscillator on all FTDI chip revisions.
pub const DEFAULT_BIT_RATE: u32 = 150_000;

pub const USB_VENDOR_FTDI: u16 = 0x0403;
pub const USB_DEVICE_FT245: u16 = 0x6001;
