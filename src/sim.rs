//! Scripted transports for hardware-free tests.
//!
//! `LoopTransport` is a bare echo with an optional one-byte-delayed SDO→SDI
//! mirror, matching how the chip samples the bus just before each new byte
//! is driven. `AvrIspSim` and `TpiWireSim` sit one level deeper: they detect
//! clock edges in the written stream, decode the target-side protocol and
//! synthesize the SDI samples a real part would produce.

use std::collections::VecDeque;

use anyhow::Result;

use crate::constants::FIFO_CHUNK;
use crate::transport::{BitMode, Transport};

// The default pin assignment, as masks.
const SCK: u8 = 0x01;
const SDI: u8 = 0x02;
const SDO: u8 = 0x04;
const RESET: u8 = 0x10;

fn fifo_push(fifo: &mut VecDeque<u8>, byte: u8) {
    fifo.push_back(byte);
    assert!(
        fifo.len() <= FIFO_CHUNK,
        "chip FIFO overflow: {} echo bytes outstanding",
        fifo.len()
    );
}

fn fifo_pop(fifo: &mut VecDeque<u8>, buf: &mut [u8], limit: usize) -> usize {
    let n = buf.len().min(limit).min(fifo.len());
    for slot in &mut buf[..n] {
        *slot = fifo.pop_front().unwrap();
    }
    n
}

/// Plain echo transport. With a mirror configured, the SDI bit of every echo
/// reflects the SDO bit of the previously written byte.
pub struct LoopTransport {
    fifo: VecDeque<u8>,
    mirror: Option<(u8, u8)>,
    read_chunk: usize,
    last_out: u8,
}

impl LoopTransport {
    pub fn new() -> Self {
        LoopTransport {
            fifo: VecDeque::new(),
            mirror: None,
            read_chunk: usize::MAX,
            last_out: 0,
        }
    }

    pub fn with_mirror(sdo: u8, sdi: u8) -> Self {
        let mut t = LoopTransport::new();
        t.mirror = Some((sdo, sdi));
        t
    }

    /// Cap how many bytes a single read may return.
    pub fn limit_read_chunk(&mut self, n: usize) {
        self.read_chunk = n;
    }
}

impl Transport for LoopTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for &byte in buf {
            let echo = match self.mirror {
                None => byte,
                Some((sdo, sdi)) => {
                    if self.last_out & sdo != 0 {
                        byte | sdi
                    } else {
                        byte & !sdi
                    }
                }
            };
            self.last_out = byte;
            fifo_push(&mut self.fifo, echo);
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(fifo_pop(&mut self.fifo, buf, self.read_chunk))
    }

    fn set_bitmode(&mut self, _ddr: u8, mode: BitMode) -> Result<()> {
        if mode == BitMode::Reset {
            self.fifo.clear();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    fn read_data_pins(&mut self) -> Result<u8> {
        Ok(self.last_out)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Device model of an AVR behind the bit-banged ISP lines.
///
/// SDO is sampled on every rising SCK edge; after each full instruction byte
/// the reply byte for the next position is chosen, and its bits drive SDI
/// one rising edge at a time. Replies follow the real parts: each command
/// byte is echoed one position late, reads deliver their data in the fourth
/// byte, and the program enable poll value appears in the third.
pub struct AvrIspSim {
    fifo: VecDeque<u8>,
    prev_sck: bool,
    reset_seen: Option<bool>,
    cur_in: u8,
    in_bits: u8,
    word: [u8; 4],
    word_idx: usize,
    out_byte: u8,
    cur_out_bit: bool,
    ext_addr: u8,
    staged: Vec<(usize, u8)>,
    fail_remaining: usize,
    last_echo: u8,

    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub page_size: usize,
    pub signature: [u8; 3],
    pub page_writes: Vec<usize>,
    pub ext_addr_loads: usize,
    pub first_op: Option<u8>,
    pub pgm_enable_seen: usize,
    pub reset_pulses: usize,
    pub write_calls: usize,
    pub stream: Option<Vec<u8>>,
}

impl AvrIspSim {
    pub fn new(flash_size: usize, page_size: usize) -> Self {
        AvrIspSim {
            fifo: VecDeque::new(),
            prev_sck: false,
            reset_seen: None,
            cur_in: 0,
            in_bits: 0,
            word: [0; 4],
            word_idx: 0,
            out_byte: 0,
            cur_out_bit: false,
            ext_addr: 0,
            staged: Vec::new(),
            fail_remaining: 0,
            last_echo: 0,
            flash: vec![0xff; flash_size],
            eeprom: vec![0xff; 8192],
            page_size,
            signature: [0x1e, 0x95, 0x0f],
            page_writes: Vec::new(),
            ext_addr_loads: 0,
            first_op: None,
            pgm_enable_seen: 0,
            reset_pulses: 0,
            write_calls: 0,
            stream: None,
        }
    }

    /// Answer the next `n` program enable polls with a wrong value.
    pub fn fail_program_enable(&mut self, n: usize) {
        self.fail_remaining = n;
    }

    pub fn flash_fill(&mut self, value: u8) {
        self.flash.fill(value);
    }

    /// Keep a copy of every written byte for inspection.
    pub fn record_stream(&mut self) {
        self.stream = Some(Vec::new());
    }

    fn clock_byte(&mut self, written: u8) -> u8 {
        // The chip samples the bus just before driving the new byte.
        let mut echo = written & !SDI;
        if self.cur_out_bit {
            echo |= SDI;
        }

        let reset = written & RESET != 0;
        if self.reset_seen == Some(false) && reset {
            self.reset_pulses += 1;
        }
        self.reset_seen = Some(reset);

        let sck = written & SCK != 0;
        if !self.prev_sck && sck {
            self.cur_out_bit = self.out_byte & (0x80 >> self.in_bits) != 0;
            self.cur_in = (self.cur_in << 1) | (written & SDO != 0) as u8;
            self.in_bits += 1;
            if self.in_bits == 8 {
                self.complete_byte();
            }
        }
        self.prev_sck = sck;
        echo
    }

    fn complete_byte(&mut self) {
        self.word[self.word_idx] = self.cur_in;
        self.cur_in = 0;
        self.in_bits = 0;
        self.out_byte = self.reply_after(self.word_idx);
        self.word_idx += 1;
        if self.word_idx == 4 {
            self.word_idx = 0;
            self.exec_word();
        }
    }

    fn word_addr(&self) -> usize {
        (self.ext_addr as usize) << 16 | (self.word[1] as usize) << 8 | self.word[2] as usize
    }

    fn reply_after(&self, idx: usize) -> u8 {
        match idx {
            0 => self.word[0],
            1 => {
                if self.word[0] == 0xac && self.word[1] == 0x53 {
                    if self.fail_remaining > 0 {
                        0x00
                    } else {
                        0x53
                    }
                } else {
                    self.word[1]
                }
            }
            2 => match self.word[0] {
                0x20 | 0x28 => {
                    let addr = self.word_addr() * 2 + (self.word[0] == 0x28) as usize;
                    self.flash.get(addr).copied().unwrap_or(0xff)
                }
                0x30 => self.signature[(self.word[2] & 0x03).min(2) as usize],
                0xa0 => {
                    let addr = (self.word[1] as usize) << 8 | self.word[2] as usize;
                    self.eeprom.get(addr).copied().unwrap_or(0xff)
                }
                _ => self.word[2],
            },
            _ => 0,
        }
    }

    fn exec_word(&mut self) {
        if self.first_op.is_none() {
            self.first_op = Some(self.word[0]);
        }
        match self.word[0] {
            0xac if self.word[1] == 0x53 => {
                self.pgm_enable_seen += 1;
                if self.fail_remaining > 0 {
                    self.fail_remaining -= 1;
                }
            }
            0xac if self.word[1] == 0x80 => {
                self.flash.fill(0xff);
                self.eeprom.fill(0xff);
            }
            0x40 | 0x48 => {
                let addr = self.word_addr() * 2 + (self.word[0] == 0x48) as usize;
                self.staged.push((addr, self.word[3]));
            }
            0x4c => {
                let addr = self.word_addr() * 2;
                let base = addr - addr % self.page_size;
                for (addr, value) in self.staged.drain(..) {
                    if addr < self.flash.len() {
                        self.flash[addr] = value;
                    }
                }
                self.page_writes.push(base);
            }
            0x4d => {
                self.ext_addr = self.word[2];
                self.ext_addr_loads += 1;
            }
            0xc0 => {
                let addr = (self.word[1] as usize) << 8 | self.word[2] as usize;
                if addr < self.eeprom.len() {
                    self.eeprom[addr] = self.word[3];
                }
            }
            _ => {}
        }
    }
}

impl Transport for AvrIspSim {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_calls += 1;
        if let Some(stream) = &mut self.stream {
            stream.extend_from_slice(buf);
        }
        for &byte in buf {
            let echo = self.clock_byte(byte);
            self.last_echo = echo;
            fifo_push(&mut self.fifo, echo);
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(fifo_pop(&mut self.fifo, buf, usize::MAX))
    }

    fn set_bitmode(&mut self, _ddr: u8, mode: BitMode) -> Result<()> {
        if mode == BitMode::Reset {
            self.fifo.clear();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    fn read_data_pins(&mut self) -> Result<u8> {
        Ok(self.last_echo)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

enum TpiMode {
    /// Reply to every decoded frame with the frame itself.
    Echo,
    /// Interpret control/status and NVM traffic like a tiny AVR.
    Nvm,
}

enum TpiSink {
    CsReg(u8),
    Key(u8),
    PtrLo,
    PtrHi,
    NvmCmd,
    SstData,
}

/// Device model of the single-wire TPI link. Host bits are sampled on rising
/// SCK edges; reply frames are shifted out one bit per falling edge, with a
/// leading idle bit ahead of the start bit.
pub struct TpiWireSim {
    fifo: VecDeque<u8>,
    prev_sck: bool,
    last_written: u8,
    collecting: Option<Vec<bool>>,
    reply_bits: VecDeque<bool>,
    cur_reply: Option<bool>,
    corrupt: Option<usize>,
    broken_loopback: bool,
    mode: TpiMode,
    sink: Option<TpiSink>,
    cs: [u8; 16],
    nvm_cmd: u8,
    pointer: u16,

    /// Every frame the host transmitted, in order.
    pub frames: Vec<u8>,
    pub nvm_chip_erased: bool,
}

impl TpiWireSim {
    fn with_mode(mode: TpiMode) -> Self {
        TpiWireSim {
            fifo: VecDeque::new(),
            prev_sck: false,
            last_written: 0,
            collecting: None,
            reply_bits: VecDeque::new(),
            cur_reply: None,
            corrupt: None,
            broken_loopback: false,
            mode,
            sink: None,
            cs: [0; 16],
            nvm_cmd: 0,
            pointer: 0,
            frames: Vec::new(),
            nvm_chip_erased: false,
        }
    }

    pub fn echo() -> Self {
        TpiWireSim::with_mode(TpiMode::Echo)
    }

    pub fn nvm() -> Self {
        TpiWireSim::with_mode(TpiMode::Nvm)
    }

    /// Flip one bit of the next reply frame: 0 is the start bit, 1 to 8 the
    /// data bits, 9 the parity bit, 10 and 11 the stop bits.
    pub fn corrupt_reply_bit(&mut self, bit: usize) {
        self.corrupt = Some(bit);
    }

    /// The SDO↔SDI tie reads back high no matter what is driven.
    pub fn break_loopback(&mut self) {
        self.broken_loopback = true;
    }

    fn queue_reply(&mut self, byte: u8) {
        let mut bits = vec![true, false]; // idle, start
        let mut parity = false;
        for k in 0..8 {
            let bit = byte & (1 << k) != 0;
            parity ^= bit;
            bits.push(bit);
        }
        bits.push(parity);
        bits.push(true);
        bits.push(true);
        if let Some(flip) = self.corrupt.take() {
            bits[1 + flip] = !bits[1 + flip];
        }
        self.reply_bits.extend(bits);
    }

    fn handle_frame(&mut self, byte: u8) {
        match self.mode {
            TpiMode::Echo => self.queue_reply(byte),
            TpiMode::Nvm => match self.sink.take() {
                Some(TpiSink::CsReg(reg)) => self.cs[reg as usize] = byte,
                Some(TpiSink::Key(n)) => {
                    if n > 1 {
                        self.sink = Some(TpiSink::Key(n - 1));
                    }
                }
                Some(TpiSink::PtrLo) => self.pointer = (self.pointer & 0xff00) | byte as u16,
                Some(TpiSink::PtrHi) => {
                    self.pointer = (self.pointer & 0x00ff) | (byte as u16) << 8
                }
                Some(TpiSink::NvmCmd) => self.nvm_cmd = byte,
                Some(TpiSink::SstData) => {
                    // Chip erase wants the pointer on a high flash byte.
                    if self.nvm_cmd == 0x10 && self.pointer & 1 == 1 {
                        self.nvm_chip_erased = true;
                    }
                }
                None => match byte {
                    0xe0 => self.sink = Some(TpiSink::Key(8)),
                    b if b & 0xf0 == 0xc0 => self.sink = Some(TpiSink::CsReg(b & 0x0f)),
                    b if b & 0xf0 == 0x80 => {
                        let value = match b & 0x0f {
                            0x0f => 0x80, // identification
                            0x00 => 0x02, // status: NVM enabled
                            reg => self.cs[reg as usize],
                        };
                        self.queue_reply(value);
                    }
                    0x68 => self.sink = Some(TpiSink::PtrLo),
                    0x69 => self.sink = Some(TpiSink::PtrHi),
                    0xf3 => self.sink = Some(TpiSink::NvmCmd), // out to NVMCMD
                    0x72 => self.queue_reply(0x00),            // in from NVMCSR: idle
                    0x60 | 0x64 => self.sink = Some(TpiSink::SstData),
                    0x24 => self.queue_reply(0xff), // data space read
                    _ => {}
                },
            },
        }
    }

    fn clock_byte(&mut self, written: u8) -> u8 {
        // Line state just before this byte latches.
        let line = match self.cur_reply {
            Some(bit) => bit,
            None => written & SDO != 0,
        };
        let mut echo = written & !SDI;
        if line {
            echo |= SDI;
        }

        let sck = written & SCK != 0;
        if self.prev_sck && !sck {
            // The device shifts its reply out on the falling edge.
            self.cur_reply = self.reply_bits.pop_front();
        }
        if !self.prev_sck && sck {
            let bit = written & SDO != 0;
            match &mut self.collecting {
                None => {
                    if !bit {
                        self.collecting = Some(Vec::with_capacity(11));
                    }
                }
                Some(bits) => {
                    bits.push(bit);
                    if bits.len() == 11 {
                        let bits = self.collecting.take().unwrap();
                        let mut byte = 0u8;
                        for (k, &b) in bits[..8].iter().enumerate() {
                            if b {
                                byte |= 1 << k;
                            }
                        }
                        self.frames.push(byte);
                        self.handle_frame(byte);
                    }
                }
            }
        }
        self.prev_sck = sck;
        self.last_written = written;
        echo
    }
}

impl Transport for TpiWireSim {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for &byte in buf {
            let echo = self.clock_byte(byte);
            fifo_push(&mut self.fifo, echo);
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(fifo_pop(&mut self.fifo, buf, usize::MAX))
    }

    fn set_bitmode(&mut self, _ddr: u8, mode: BitMode) -> Result<()> {
        if mode == BitMode::Reset {
            self.fifo.clear();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    fn read_data_pins(&mut self) -> Result<u8> {
        let mut state = self.last_written;
        if self.broken_loopback || self.last_written & SDO != 0 {
            state |= SDI;
        } else {
            state &= !SDI;
        }
        Ok(state)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
