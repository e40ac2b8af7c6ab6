//! Types and functions for the command-line interface
//!
//! This is a thin dispatcher: every option here maps onto a library call.
//! Arguments may also be supplied through the `ESP_TOOL` environment
//! variable, which is processed as a prefix of the argument list.

use std::{path::PathBuf, str::FromStr};

use clap::{ArgGroup, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::{
    byte_file::ByteFile,
    connection::reset::ResetMode,
    elf::ElfReader,
    error::Error,
    flasher::{Flasher, FLASH_BLOCK_SIZE},
    image_format::{
        self, Combiner, FlashFreq, FlashMode, FlashSize, FLASH_FREQ_MASK, FLASH_MODE_MASK,
        FLASH_SIZE_MASK,
    },
    interface::{PortSettings, SerialInterface, SystemClock},
    progress::{NoProgress, ProgressCallbacks},
};

#[derive(Parser)]
#[command(name = "esp-tool", version, about = "ESP8266 serial flasher and image tool")]
#[command(group(ArgGroup::new("operation").multiple(false)))]
#[command(group(ArgGroup::new("container").args(["padded", "sparse"]).multiple(false)))]
pub struct Cli {
    /// Serial port connected to the device, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    pub port: Option<String>,
    /// Baud rate for talking to the ROM loader
    #[arg(short, long, default_value_t = 115_200)]
    pub baud: u32,
    /// Target address for the next file operation (decimal, 0x hex, K suffix)
    #[arg(short, long, value_parser = parse_num)]
    pub address: Option<u32>,
    /// Region size for read-flash and dump-mem
    #[arg(short, long, value_parser = parse_num)]
    pub size: Option<u32>,
    /// ELF file to process
    #[arg(short, long, value_name = "ELF")]
    pub elf_file: Option<PathBuf>,
    /// Flash chip capacity written into image headers (512K, 256K, 1M, ...)
    #[arg(long, value_parser = FlashSize::from_str)]
    pub flash_size: Option<FlashSize>,
    /// Flash SPI mode written into image headers (QIO, QOUT, DIO, DOUT)
    #[arg(long, value_parser = FlashMode::from_str)]
    pub flash_mode: Option<FlashMode>,
    /// Flash SPI frequency written into image headers (40M, 26M, 20M, 80M)
    #[arg(long, value_parser = FlashFreq::from_str)]
    pub flash_freq: Option<FlashFreq>,
    /// Raw flash parameter word, setting all three fields at once
    #[arg(long, value_parser = parse_num)]
    pub flash_parm: Option<u32>,
    /// Hardware reset scheme (none, auto, dtronly, ck, wifio, nodemcu)
    #[arg(short, long, default_value = "none", value_parser = ResetMode::from_str)]
    pub reset: ResetMode,
    /// Do not run the device after the operations complete
    #[arg(long)]
    pub no_run: bool,
    /// Suppress progress reporting (errors are still shown)
    #[arg(short, long)]
    pub quiet: bool,
    /// Disable reply-timeout enforcement, for protocol debugging
    #[arg(long, hide = true)]
    pub no_time_limit: bool,

    /// Write the given files to flash (the default operation)
    #[arg(long, group = "operation")]
    pub write_flash: bool,
    /// Read flash into the given file; requires --size
    #[arg(long, group = "operation")]
    pub read_flash: bool,
    /// Dump a memory region into the given file; requires --address and --size
    #[arg(long, group = "operation")]
    pub dump_mem: bool,
    /// Erase all of flash, or SIZE bytes at the pending address
    #[arg(
        long,
        group = "operation",
        value_name = "SIZE",
        num_args = 0..=1,
        default_missing_value = "",
    )]
    pub erase_flash: Option<String>,
    /// Report the flash chip identification
    #[arg(long, group = "operation")]
    pub flash_id: bool,
    /// Describe the given image files
    #[arg(long, group = "operation")]
    pub image_info: bool,
    /// Report the station and AP MAC addresses
    #[arg(long, group = "operation")]
    pub read_mac: bool,
    /// List the sections of the ELF file
    #[arg(long, group = "operation")]
    pub elf_info: bool,
    /// Extract the named ELF section(s) into the given files; a comma
    /// separated list produces a boot image, a single name a raw binary
    #[arg(long, group = "operation", value_name = "NAMES")]
    pub section: Option<String>,
    /// Extract the canonical images from the ELF; optionally names an extra
    /// image file to include when combining
    #[arg(
        long,
        group = "operation",
        value_name = "IMAGE",
        num_args = 0..=1,
        default_missing_value = "",
    )]
    pub extract: Option<String>,

    /// Combine images into a padded (flash snapshot) container file
    #[arg(long, value_name = "FILE")]
    pub padded: Option<PathBuf>,
    /// Combine images into a sparse container file
    #[arg(long, value_name = "FILE")]
    pub sparse: Option<PathBuf>,
    /// Append to an existing container instead of creating it
    #[arg(long, requires = "container")]
    pub append: bool,

    /// Files to process with the selected operation. A name of the form
    /// `@<name>0x<hex>` supplies the flash address for that file.
    pub files: Vec<String>,
}

/// Insert `ESP_TOOL` arguments (whitespace-separated, quotes observed)
/// ahead of the command-line ones.
pub fn args_with_env() -> Vec<String> {
    let mut argv: Vec<String> = std::env::args().collect();
    if let Ok(env_str) = std::env::var("ESP_TOOL") {
        let mut merged = Vec::with_capacity(argv.len());
        merged.push(argv.remove(0));
        merged.extend(split_args(&env_str));
        merged.extend(argv);
        return merged;
    }
    argv
}

fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut arg = String::new();
        if c == '"' || c == '\'' {
            let quote = c;
            chars.next();
            for ch in chars.by_ref() {
                if ch == quote {
                    break;
                }
                arg.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                arg.push(ch);
                chars.next();
            }
        }
        args.push(arg);
    }
    args
}

/// Accept decimal, `0x`/`x` hexadecimal, and a trailing `K` multiplier
fn parse_num(input: &str) -> Result<u32, String> {
    let mut s = input;
    let mut multiplier = 1u32;
    if let Some(stripped) = s.strip_suffix(['k', 'K']) {
        s = stripped;
        multiplier = 1024;
    }
    let value = if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .or_else(|| s.strip_prefix(['x', 'X']))
    {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    value
        .map_err(|_| format!("invalid numeric value \"{input}\""))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("numeric value \"{input}\" is out of range"))
}

/// Pull a flash address out of an `@<name>0x<hex>` filename
fn extract_address(file: &str) -> Option<(&str, u32)> {
    let name = file.strip_prefix('@')?;
    let at = name.find("0x").or_else(|| name.find("0X"))?;
    let digits: String = name[at + 2..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    let addr = u32::from_str_radix(&digits, 16).ok()?;
    Some((name, addr))
}

enum Operation {
    WriteFlash,
    ReadFlash,
    DumpMem,
    EraseFlash(Option<u32>),
    FlashId,
    ImageInfo,
    ReadMac,
    ElfInfo,
    Section(String),
    Extract(Option<String>),
    Combine,
}

impl Operation {
    fn from_cli(cli: &Cli) -> Result<Self, Error> {
        if cli.read_flash {
            Ok(Operation::ReadFlash)
        } else if cli.dump_mem {
            Ok(Operation::DumpMem)
        } else if let Some(size) = &cli.erase_flash {
            let size = match size.as_str() {
                "" => None,
                s => Some(parse_num(s).map_err(Error::Param)?),
            };
            Ok(Operation::EraseFlash(size))
        } else if cli.flash_id {
            Ok(Operation::FlashId)
        } else if cli.image_info {
            Ok(Operation::ImageInfo)
        } else if cli.read_mac {
            Ok(Operation::ReadMac)
        } else if cli.elf_info {
            Ok(Operation::ElfInfo)
        } else if let Some(names) = &cli.section {
            Ok(Operation::Section(names.clone()))
        } else if let Some(extra) = &cli.extract {
            Ok(Operation::Extract(match extra.as_str() {
                "" => None,
                name => Some(name.to_string()),
            }))
        } else if !cli.write_flash && (cli.padded.is_some() || cli.sparse.is_some()) {
            Ok(Operation::Combine)
        } else {
            Ok(Operation::WriteFlash)
        }
    }
}

/// Execute the parsed command line. Exits non-zero through `main` on the
/// first unrecovered error.
pub fn run(cli: Cli) -> miette::Result<()> {
    let operation = Operation::from_cli(&cli)?;

    // the flash parameter word, assembled from whichever options were given
    let mut parm_val: u16 = 0;
    let mut parm_mask: u16 = 0;
    for (val, mask) in [
        (cli.flash_mode.map(|m| m as u16), FLASH_MODE_MASK),
        (cli.flash_size.map(|s| s as u16), FLASH_SIZE_MASK),
        (cli.flash_freq.map(|f| f as u16), FLASH_FREQ_MASK),
        (
            cli.flash_parm.map(|p| p as u16),
            FLASH_MODE_MASK | FLASH_SIZE_MASK | FLASH_FREQ_MASK,
        ),
    ] {
        if let Some(val) = val {
            parm_val = (parm_val & !mask) | (val & mask);
            parm_mask |= mask;
        }
    }

    let elf_data = match &cli.elf_file {
        Some(path) => Some(std::fs::read(path).map_err(|source| Error::FileOpen {
            path: path.display().to_string(),
            source,
        })?),
        None => None,
    };
    let elf = match (&cli.elf_file, &elf_data) {
        (Some(path), Some(data)) => Some(ElfReader::parse(&path.display().to_string(), data)?),
        _ => None,
    };
    // combined-container target, shared by extract and combine operations
    let container_path = cli.padded.as_ref().or(cli.sparse.as_ref());
    let mut combiner = Combiner::new(cli.padded.is_some());
    let mut container = match container_path {
        Some(path) if cli.append => Some(ByteFile::open_rw(path)?),
        Some(path) => Some(ByteFile::create(path)?),
        None => None,
    };

    let mut flasher: Option<Flasher> = None;
    let mut pending_address = cli.address;
    let mut progress: Box<dyn ProgressCallbacks> = if cli.quiet {
        Box::new(NoProgress)
    } else {
        Box::new(CliProgress::default())
    };

    macro_rules! device {
        () => {{
            if flasher.is_none() {
                flasher = Some(open_device(&cli)?);
            }
            flasher.as_mut().unwrap()
        }};
    }

    match operation {
        Operation::FlashId => {
            let id = device!().flash_id()?;
            println!(
                "Manufacturer: {:02x}, Device: {:02x}{:02x}",
                id & 0xFF,
                (id >> 8) & 0xFF,
                (id >> 16) & 0xFF
            );
        }
        Operation::ReadMac => {
            let mac = device!().read_mac()?;
            let fmt = |m: [u8; 6]| {
                m.iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            };
            println!("Station MAC is {}", fmt(mac.station));
            println!("     AP MAC is {}", fmt(mac.ap));
        }
        Operation::EraseFlash(size) => match size {
            None => device!().erase_flash()?,
            Some(size) => {
                let addr = pending_address
                    .ok_or_else(|| Error::Param("no address specified for the erase".into()))?;
                device!().erase_region(addr, size)?;
            }
        },
        Operation::ElfInfo => {
            print!("{}", need_elf(&elf)?.section_info());
        }
        Operation::Section(names) => {
            require_files(&cli.files, "section extraction")?;
            for file in &cli.files {
                let mut out = ByteFile::create(file)?;
                image_format::write_sections(need_elf(&elf)?, &mut out, &names, parm_val)?;
            }
        }
        Operation::Extract(extra) => {
            let extra = match extra {
                Some(name) => {
                    if container.is_none() {
                        return Err(Error::Param(
                            "an additional image file is allowed only when combining the extracted images"
                                .into(),
                        )
                        .into());
                    }
                    let (name, addr) = match pending_address.take() {
                        Some(addr) => (name.as_str(), addr),
                        None => extract_address(&name).unwrap_or((name.as_str(), 0)),
                    };
                    Some((name.to_string(), addr))
                }
                None => None,
            };
            let combine = container.as_mut().map(|c| (&mut combiner, c));
            image_format::auto_extract(
                need_elf(&elf)?,
                combine,
                parm_val,
                extra.as_ref().map(|(n, a)| (n.as_str(), *a)),
            )?;
        }
        Operation::ImageInfo => {
            require_files(&cli.files, "image-info")?;
            for file in &cli.files {
                let mut vf = ByteFile::open(file)?;
                print!("{}", image_format::image_info(&mut vf)?);
            }
        }
        Operation::Combine => {
            require_files(&cli.files, "combining")?;
            let container = container
                .as_mut()
                .expect("combine operation always has a container");
            for file in &cli.files {
                let (name, addr) = take_file_address(file, &mut pending_address);
                let addr = if let Some(addr) = addr {
                    addr
                } else if container.is_empty()? {
                    // the first image of a fresh container lands at zero
                    0
                } else {
                    return Err(Error::Param(format!(
                        "no Flash address was specified for the image file \"{name}\""
                    ))
                    .into());
                };
                let mut image = ByteFile::open(name)?;
                combiner.add_image(container, &mut image, addr)?;
            }
        }
        Operation::WriteFlash => {
            require_files(&cli.files, "write-flash")?;
            for file in &cli.files {
                let (name, addr) = take_file_address(file, &mut pending_address);
                let addr = addr.unwrap_or(0);
                if addr & (FLASH_BLOCK_SIZE - 1) != 0 {
                    return Err(Error::Param(format!(
                        "the address {addr:#x} is not an integral multiple of the block size ({FLASH_BLOCK_SIZE})"
                    ))
                    .into());
                }
                let mut vf = ByteFile::open(name)?;
                device!().flash_write(&mut vf, addr, parm_val, parm_mask, progress.as_mut())?;
            }
        }
        Operation::ReadFlash => {
            require_files(&cli.files, "read-flash")?;
            let size = cli
                .size
                .ok_or_else(|| Error::Param("the size to read must be specified".into()))?;
            let addr = pending_address.take().unwrap_or(0);
            for file in &cli.files {
                let mut vf = ByteFile::create(file)?;
                device!().flash_read(&mut vf, addr, size, progress.as_mut())?;
            }
        }
        Operation::DumpMem => {
            require_files(&cli.files, "dump-mem")?;
            let size = cli
                .size
                .ok_or_else(|| Error::Param("the size to dump must be specified".into()))?;
            let addr = pending_address
                .take()
                .filter(|a| *a != 0)
                .ok_or_else(|| Error::Param("the starting address to dump must be non-zero".into()))?;
            for file in &cli.files {
                let mut vf = ByteFile::create(file)?;
                device!().dump_mem(&mut vf, addr, size, progress.as_mut())?;
            }
        }
    }

    // leave the device running user code unless told otherwise
    if let Some(flasher) = flasher.as_mut() {
        if !cli.no_run {
            if cli.reset == ResetMode::None {
                flasher.run(true)?;
            } else {
                flasher.reset_device(cli.reset)?;
            }
            info!("Device started");
        }
    }

    Ok(())
}

fn open_device(cli: &Cli) -> Result<Flasher, Error> {
    let port = cli
        .port
        .as_deref()
        .ok_or_else(|| Error::Param("no serial port was specified".into()))?;

    let (dtr, rts) = cli.reset.initial_levels();
    let settings = PortSettings {
        dtr,
        rts,
        ..Default::default()
    };
    let serial = SerialInterface::open(port, cli.baud, settings)?;

    let mut flasher = Flasher::new(Box::new(serial), Box::new(SystemClock::new()));
    flasher.connection_mut().set_no_time_limit(cli.no_time_limit);
    flasher.connect(cli.reset)?;
    Ok(flasher)
}

fn need_elf<'a, 'data>(elf: &'a Option<ElfReader<'data>>) -> Result<&'a ElfReader<'data>, Error> {
    elf.as_ref()
        .ok_or_else(|| Error::Param("no ELF file was specified".into()))
}

fn require_files(files: &[String], what: &str) -> Result<(), Error> {
    if files.is_empty() {
        return Err(Error::Param(format!("no files were given for {what}")));
    }
    Ok(())
}

/// Resolve the flash address for a file: an explicit pending `--address`
/// wins, then an `@<name>0x<hex>` form; either way the pending address is
/// consumed.
fn take_file_address<'a>(file: &'a str, pending: &mut Option<u32>) -> (&'a str, Option<u32>) {
    if let Some(addr) = pending.take() {
        return (file.strip_prefix('@').unwrap_or(file), Some(addr));
    }
    match extract_address(file) {
        Some((name, addr)) => (name, Some(addr)),
        None => (file, None),
    }
}

/// Renders library progress through an indicatif bar
#[derive(Default)]
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40}] {bytes:>9}/{total_bytes:>9} at {msg}")
                .expect("valid template")
                .progress_chars("=> "),
        );
        bar.set_message(format!("{addr:#x}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
