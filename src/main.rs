use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hxdmp::hexdump;

use avrbb::{format, Config, MemKind, Part, Programmer};

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Target part name, e.g. atmega328p
    #[arg(long, short = 'p', value_name = "PART")]
    part: Option<String>,

    /// Port name: usb:, usb:ft<N> or usb:<serial>
    #[arg(long, short = 'P', value_name = "PORT", default_value = "usb:")]
    port: String,

    /// Bit period in microseconds
    #[arg(long, short = 'B', value_name = "US")]
    bitclock: Option<f64>,

    /// Bit rate in Hz
    #[arg(long, short = 'b', value_name = "HZ")]
    baudrate: Option<u32>,

    /// Carry on when signature or loopback checks fail
    #[arg(long, short = 'F')]
    force: bool,

    /// Turn debugging information on
    #[arg(long = "verbose", short = 'v')]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the parts in the database
    Parts {},
    /// Probe the target and report its signature
    Info {},
    /// Perform a chip erase
    Erase {},
    /// Program a firmware file into flash
    Flash {
        /// Firmware file (Intel HEX, ELF or raw binary)
        path: String,
        /// Do not erase the chip before programming
        #[clap(short = 'E', long)]
        no_erase: bool,
    },
    /// Read a memory out of the target
    Read {
        /// Memory to read: flash or eeprom
        #[arg(value_name = "MEMORY", default_value = "flash")]
        memory: String,
        /// File to write; hexdump to stdout when absent
        path: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Commands::Parts {} = cli.command {
        for part in Part::all()? {
            println!("{}", part);
        }
        return Ok(());
    }

    let Some(part_name) = cli.part.as_deref() else {
        bail!("no part given; use -p <part> (see the parts command)");
    };
    let part = Part::find(part_name)?;

    let cfg = Config {
        bitclock: cli.bitclock,
        baudrate: cli.baudrate,
        ovsigck: cli.force,
        ..Config::default()
    };
    let mut pgm = Programmer::open(&cli.port, &cfg)?;
    if cli.debug {
        pgm.display();
    }

    pgm.enable()?;
    pgm.initialize(&part)?;
    pgm.rdy_led(true)?;

    let result = run(&cli, &mut pgm, &part);
    if result.is_err() {
        let _ = pgm.err_led(true);
    }

    let _ = pgm.rdy_led(false);
    let _ = pgm.disable();
    let _ = pgm.powerdown();
    pgm.close()?;
    result
}

fn run(cli: &Cli, pgm: &mut Programmer<avrbb::FtdiTransport>, part: &Part) -> Result<()> {
    let signature = pgm.read_signature(part)?;
    if signature != part.signature {
        let msg = format!(
            "signature {} does not match {} (expected {})",
            hex::encode(signature),
            part.name,
            hex::encode(part.signature)
        );
        if cli.force {
            log::warn!("{}", msg);
        } else {
            bail!(msg);
        }
    }

    match &cli.command {
        Commands::Parts {} => unreachable!("handled before opening the port"),
        Commands::Info {} => {
            log::info!("device: {}", part);
            log::info!(
                "flash: {} bytes ({}-byte pages), eeprom: {} bytes",
                part.flash.size,
                part.flash.page_size,
                part.eeprom.as_ref().map_or(0, |m| m.size)
            );
        }
        Commands::Erase {} => {
            log::info!("erasing chip");
            pgm.chip_erase(part)?;
            log::info!("chip erased");
        }
        Commands::Flash { path, no_erase } => {
            let image = format::read_image(path)?;
            if image.len() > part.flash.size {
                bail!(
                    "firmware is {} bytes but {} flash holds {}",
                    image.len(),
                    part.name,
                    part.flash.size
                );
            }
            if *no_erase {
                log::warn!("skipping chip erase");
            } else {
                log::info!("erasing chip");
                pgm.chip_erase(part)?;
            }

            let n = image.len();
            let mut flash = part.flash.clone();
            flash.buf[..n].copy_from_slice(&image);
            pgm.pgm_led(true)?;
            let written = pgm.paged_write(part, &mut flash, 0, n);
            pgm.pgm_led(false)?;
            log::info!("{} bytes of flash written", written?);
        }
        Commands::Read { memory, path } => {
            let kind = match memory.as_str() {
                "flash" => MemKind::Flash,
                "eeprom" => MemKind::Eeprom,
                other => bail!("unknown memory {}; use flash or eeprom", other),
            };
            let Some(mem) = part.memory(kind) else {
                bail!("{} has no {}", part.name, kind.name());
            };
            let mut mem = mem.clone();
            let size = mem.size;
            log::info!("reading {} bytes of {}", size, kind.name());
            pgm.paged_load(part, &mut mem, 0, size)?;
            match path {
                Some(path) => {
                    std::fs::write(path, &mem.buf)?;
                    log::info!("{} written to {}", kind.name(), path);
                }
                None => {
                    let mut out = vec![];
                    hexdump(&mem.buf, &mut out)?;
                    println!("{}", String::from_utf8_lossy(&out));
                }
            }
        }
    }
    Ok(())
}
