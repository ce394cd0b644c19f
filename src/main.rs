use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hidock::device_ids::{DeviceCompat, DeviceIdentity, identify_device};
use hidock::firmware::{FirmwareImage, UpgradeState};
use hidock::frame::CommandId;
use hidock::protocol::SettingsUpdate;
use hidock::session::{DeviceSession, SessionConfig};
use hidock::transport::{AttachedDevice, list_devices};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rustyline::error::ReadlineError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "hidock", version, about = "Manage HiDock recorders over USB")]
struct Cli {
    #[command(flatten)]
    spec: DeviceSpec,

    #[command(subcommand)]
    command: TopCommand,
}

#[derive(Subcommand, Debug)]
enum TopCommand {
    /// List all connected HiDock devices (vendor ID 0x10d6)
    List,

    /// Open a device and run commands against it interactively
    Shell,

    #[command(flatten)]
    Device(DeviceCommand),
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Show firmware version and serial number
    Info,

    /// Show the device clock
    Time,

    /// Set the device clock to the local time of this computer
    SyncTime,

    /// List recordings stored on the device
    Files,

    /// Download a recording
    Download {
        name: String,

        /// Destination file (defaults to the recording's name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Continue a partial download, keeping the bytes already in the destination
        #[arg(long)]
        resume: bool,
    },

    /// Delete a recording
    Delete { name: String },

    /// Show device settings
    Settings,

    /// Change device settings
    Set {
        #[arg(long)]
        auto_record: Option<bool>,
        #[arg(long)]
        auto_play: Option<bool>,
        #[arg(long)]
        notification: Option<bool>,
        #[arg(long)]
        bluetooth_tone: Option<bool>,
    },

    /// Show storage card usage
    Card,

    /// Erase all recordings
    Format {
        #[arg(long)]
        yes: bool,
    },

    /// Restore factory settings
    FactoryReset {
        #[arg(long)]
        yes: bool,
    },

    /// Remove all meeting schedule entries from the device
    ClearSchedule,

    /// Flash a firmware image
    Upgrade {
        file: PathBuf,

        /// Version of the image, as MAJOR.MINOR.PATCH
        #[arg(long)]
        firmware_version: String,

        #[arg(long)]
        yes: bool,
    },

    /// Send a command by number and print the raw reply
    Raw {
        command: u16,

        /// Request payload as hex, e.g. 01020304
        payload: Option<String>,
    },
}

/// One line typed into the interactive shell.
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    command: DeviceCommand,
}

#[derive(Error, Debug)]
enum MatchError {
    #[error("no devices match specification")]
    NoDevices,

    #[error("multiple devices match specification")]
    MultipleDevices,
}

#[derive(clap::Args, Debug)]
struct DeviceSpec {
    /// Product ID (vendor ID is always matched against HiDock's, 0x10d6)
    #[arg(short, long, value_parser = parse_pid, global = true)]
    pid: Option<u16>,

    /// Allow devices with an unrecognized product ID
    #[arg(long, global = true)]
    force: bool,

    /// Seconds to wait for a reply to simple commands
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Bytes requested per file block
    #[arg(long, global = true)]
    block_size: Option<u32>,
}

fn parse_pid(text: &str) -> Result<u16, String> {
    let digits = text.trim_start_matches("0x");
    u16::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

impl DeviceSpec {
    fn matches(&self, device: &AttachedDevice) -> bool {
        if let Some(pid) = self.pid {
            if device.id.pid != pid {
                return false;
            }
        }

        match identify_device(device.id) {
            DeviceCompat::Compatible(_) => true,
            DeviceCompat::Untested => self.force,
            DeviceCompat::Incompatible => false,
        }
    }

    fn get_device(&self) -> Result<DeviceIdentity> {
        let devices = list_devices()?;
        let mut candidates = devices.iter().filter(|d| self.matches(d));

        match candidates.next() {
            None => Err(MatchError::NoDevices.into()),
            Some(dev) => {
                if candidates.next().is_some() {
                    Err(MatchError::MultipleDevices.into())
                } else {
                    if identify_device(dev.id) == DeviceCompat::Untested {
                        warn!("Device {} is untested, proceeding because of --force", dev.id);
                    }
                    Ok(DeviceIdentity::for_product(dev.id.pid))
                }
            }
        }
    }

    fn open(&self) -> Result<DeviceSession> {
        let identity = self.get_device()?;
        let mut config = SessionConfig::default();
        if let Some(secs) = self.timeout {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        let session = DeviceSession::connect(&identity, config)
            .with_context(|| format!("opening {}", identity.usb_id()))?;
        info!("Connected to {}", identity.usb_id());
        Ok(session)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("HIDOCK_LOG", "info")
            .write_style("HIDOCK_LOG_STYLE"),
    )
    .init();

    let cli = Cli::parse();

    match cli.command {
        TopCommand::List => list()?,
        TopCommand::Shell => shell(&cli.spec.open()?)?,
        TopCommand::Device(command) => {
            let session = cli.spec.open()?;
            run(&session, command)?;
            session.disconnect();
        }
    };

    Ok(())
}

fn list() -> Result<()> {
    for dev in list_devices()? {
        let support_status = match identify_device(dev.id) {
            DeviceCompat::Compatible(model) => format!("{model}"),
            DeviceCompat::Untested => "unknown device, proceed at your own risk".to_owned(),
            DeviceCompat::Incompatible => continue,
        };
        println!(
            "{} bus {:03} address {:03} [{}]",
            dev.id, dev.bus, dev.address, support_status
        );
    }
    Ok(())
}

fn shell(session: &DeviceSession) -> Result<()> {
    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline("hidock> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            return Ok(());
        }
        editor.add_history_entry(line)?;

        let parsed = match ShellLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Help and usage errors alike.
                let _ = e.print();
                continue;
            }
        };

        if let Err(e) = run(session, parsed.command) {
            eprintln!("Error: {e:#}");
            if !session.is_connected() {
                bail!("device disconnected");
            }
        }
    }
}

fn run(session: &DeviceSession, command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::Info => {
            let info = session.get_device_info()?;
            println!("Firmware version: {}", info.version_code);
            println!("Serial number: {}", info.serial_number);
        }
        DeviceCommand::Time => match session.get_device_time()? {
            Some(time) => println!("{time}"),
            None => println!("Clock not set"),
        },
        DeviceCommand::SyncTime => {
            let now = chrono::Local::now().naive_local();
            session.set_device_time(&now)?;
            println!("Device clock set to {now}");
        }
        DeviceCommand::Files => {
            let files = session.list_files()?;
            for file in &files {
                println!("{:>12}  {}", file.length, file.name);
            }
            println!("{} recordings", files.len());
        }
        DeviceCommand::Download {
            name,
            output,
            resume,
        } => download(session, &name, output.unwrap_or_else(|| PathBuf::from(&name)), resume)?,
        DeviceCommand::Delete { name } => {
            session.list_files()?;
            session.delete_file(&name)?;
        }
        DeviceCommand::Settings => {
            let settings = session.get_settings()?;
            println!("Auto record: {}", settings.auto_record);
            println!("Auto play: {}", settings.auto_play);
            println!("Notification: {}", settings.notification);
            println!("Bluetooth tone: {}", settings.bluetooth_tone);
        }
        DeviceCommand::Set {
            auto_record,
            auto_play,
            notification,
            bluetooth_tone,
        } => session.set_settings(&SettingsUpdate {
            auto_record,
            auto_play,
            notification,
            bluetooth_tone,
        })?,
        DeviceCommand::Card => {
            let card = session.get_card_info()?;
            println!(
                "{} MiB used of {} MiB ({} MiB free)",
                card.used_mib(),
                card.capacity_mib,
                card.free_mib
            );
        }
        DeviceCommand::Format { yes } => {
            if !yes {
                bail!("formatting erases every recording; pass --yes to confirm");
            }
            session.format_card()?;
        }
        DeviceCommand::FactoryReset { yes } => {
            if !yes {
                bail!("pass --yes to confirm restoring factory settings");
            }
            session.restore_factory_settings()?;
        }
        DeviceCommand::ClearSchedule => session.send_schedule_info(&[])?,
        DeviceCommand::Upgrade {
            file,
            firmware_version,
            yes,
        } => upgrade(session, &file, &firmware_version, yes)?,
        DeviceCommand::Raw { command, payload } => {
            let command = CommandId::try_from(command)?;
            let payload = parse_hex(payload.as_deref().unwrap_or(""))?;
            let reply = session.request(command, &payload, None)?;
            println!("{} #{}: {:02x?}", reply.command, reply.sequence, reply.payload);
        }
    };

    Ok(())
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    if !text.is_ascii() || text.len() % 2 != 0 {
        bail!("hex payload must be an even number of hex digits");
    }
    (0..text.len())
        .step_by(2)
        .map(|i| Ok(u8::from_str_radix(&text[i..i + 2], 16)?))
        .collect()
}

fn progress_bar(len: u64, template: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn download(session: &DeviceSession, name: &str, path: PathBuf, resume: bool) -> Result<()> {
    session.list_files()?;
    let handle = session.file_handle(name)?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resume)
        .truncate(!resume)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let offset = if resume {
        file.metadata()?.len().try_into()?
    } else {
        0
    };

    let pb = progress_bar(
        handle.total_size.into(),
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )?;
    pb.set_position(offset.into());

    let mut transfer = session.resume_download(handle, offset)?;
    for block in &mut transfer {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                pb.abandon();
                return Err(e).context("download stopped; rerun with --resume to continue");
            }
        };
        file.write_all(&block.data)?;
        pb.set_position(block.bytes_received.into());
    }

    pb.finish_with_message("Download complete");
    println!("Saved {}", path.display());
    Ok(())
}

fn upgrade(session: &DeviceSession, path: &Path, version: &str, yes: bool) -> Result<()> {
    let version = FirmwareImage::parse_version(version)?;
    let mut file = std::fs::File::open(path)?;
    let image = FirmwareImage::load(&mut file, version)?;

    let current = session.get_device_info()?;
    println!(
        "Upgrading from {} to {:#010x} ({} bytes, CRC32 {:#010x})",
        current.version_code,
        image.version(),
        image.size(),
        image.crc32()
    );
    if !yes {
        bail!("pass --yes to start the upgrade; do not unplug the device while it runs");
    }

    let upgrade = session.begin_firmware_upgrade(&image)?;
    let pb = progress_bar(
        upgrade.session().total_chunks.into(),
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] chunk {pos}/{len} {msg}",
    )?;
    upgrade.run(|progress| {
        pb.set_length(progress.total_chunks.into());
        pb.set_position(progress.chunks_sent.into());
        if progress.state == UpgradeState::Verifying {
            pb.set_message("verifying");
        }
    })?;

    pb.finish_with_message("Upgrade complete");
    println!("The device will restart with the new firmware");
    Ok(())
}
