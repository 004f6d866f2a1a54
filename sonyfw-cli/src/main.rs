//! sonyfw CLI - a thin inspector shell over the `sonyfw` codec library.
//!
//! Deliberately secondary: argument parsing, progress printing, and
//! on-disk tree materialisation are out of scope for the library itself
//! (every core entry point only ever sees a `Read + Seek` byte source),
//! so this binary is where those concerns live for manual smoke testing.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use sonyfw::cipher;
use sonyfw::fs::UnixFile;
use sonyfw::{dat, fdat, fs as sfs, msfirm};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

mod keys;
mod pack;

use keys::EnvKeyProvider;

/// sonyfw - inspect and unpack Sony camera firmware images.
#[derive(Parser)]
#[command(name = "sonyfw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify a file's format and print its headline metadata.
    Info {
        /// Path to the firmware file (`.dat`, an already-decrypted
        /// `FDAT` payload, a memory-stick image, or a bare filesystem).
        file: PathBuf,
    },
    /// Unpack a `.dat`/`FDAT` firmware image to a directory tree.
    Unpack {
        /// Path to the `.dat` firmware file.
        file: PathBuf,
        /// Destination directory (created if missing).
        #[arg(short, long, default_value = "out")]
        out: PathBuf,
    },
    /// List the entries of a bare filesystem image (cramfs, FAT, ext2, ...).
    Ls {
        /// Path to the filesystem image.
        file: PathBuf,
    },
    /// Re-pack a directory tree into a cramfs image.
    PackCramfs {
        /// Directory to stage as the image's contents.
        dir: PathBuf,
        /// Output cramfs image path.
        #[arg(short, long, default_value = "out.cramfs")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match &cli.command {
        Commands::Info { file } => cmd_info(file),
        Commands::Unpack { file, out } => cmd_unpack(file, out),
        Commands::Ls { file } => cmd_ls(file),
        Commands::PackCramfs { dir, out } => pack::cmd_pack_cramfs(dir, out),
    }
}

/// Prints whichever format `detectAndUnpack` would have picked, without
/// writing anything to disk.
fn cmd_info(path: &Path) -> Result<()> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    if dat::is_dat(&mut f) {
        f.seek(SeekFrom::Start(0))?;
        let record = dat::read_dat(&mut f).context("reading .dat container")?;
        println!("format: DAT container");
        println!("  lens accessory: {}", record.is_lens);
        println!(
            "  normal-mode USB descriptors: {}",
            record.normal_usb_descriptors.len()
        );
        println!(
            "  updater-mode USB descriptors: {}",
            record.updater_usb_descriptors.len()
        );
        println!("  FDAT payload: {} bytes (still encrypted)", record.firmware_data.len());
        return Ok(());
    }

    f.seek(SeekFrom::Start(0))?;
    let mut probe = Vec::new();
    f.read_to_end(&mut probe)?;
    if fdat::is_fdat(&probe) {
        print_fdat_info(std::io::Cursor::new(probe))?;
        return Ok(());
    }

    let keys = EnvKeyProvider;
    if let Ok((id, record)) = msfirm::read_ms_firm(&probe, &keys) {
        println!("format: MS-firm container ({id})");
        println!("  model: {:?}", record.model);
        println!("  region: {:?}", record.region);
        println!("  version: {:?}", record.version);
        println!("  files: {}", record.files.len());
        return Ok(());
    }

    f.seek(SeekFrom::Start(0))?;
    if sfs::is_archive(&mut f)? {
        println!("format: filesystem image (use `sonyfw ls` to list contents)");
        return Ok(());
    }

    bail!("unrecognised input: no DAT/FDAT/MsFirm/filesystem magic matched");
}

fn print_fdat_info(source: std::io::Cursor<Vec<u8>>) -> Result<()> {
    let parsed = fdat::read_fdat(source).context("reading FDAT payload")?;
    println!("format: FDAT payload");
    println!("  model: {:#010x}", parsed.model);
    println!("  region: {}", parsed.region);
    println!("  version: {}", parsed.version);
    println!("  accessory: {}", parsed.is_accessory);
    Ok(())
}

/// Full pipeline: DAT -> trial-decrypt -> FDAT -> filesystem + firmware
/// tar, materialised under `out`. This is the "on-disk tree
/// materialisation" the core itself deliberately does not do.
fn cmd_unpack(path: &Path, out: &Path) -> Result<()> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if !dat::is_dat(&mut f) {
        bail!("{} is not a .dat container", path.display());
    }
    f.seek(SeekFrom::Start(0))?;
    let record = dat::read_dat(&mut f).context("reading .dat container")?;
    info!("dat container parsed, FDAT payload is {} bytes", record.firmware_data.len());

    let keys = EnvKeyProvider;
    let (crypter_id, decrypted) =
        cipher::decrypt_fdat(std::io::Cursor::new(record.firmware_data), &keys, fdat::is_fdat)
            .context("trial-decrypting the FDAT payload")?;
    println!("decrypted with crypter: {crypter_id}");

    let parsed = fdat::read_fdat(decrypted).context("reading FDAT payload")?;
    println!(
        "model {:#010x} region {} version {} (accessory: {})",
        parsed.model, parsed.region, parsed.version, parsed.is_accessory
    );

    std::fs::create_dir_all(out)?;

    let fw_path = out.join("firmware.tar");
    extract_stream(parsed.firmware, &fw_path)?;
    println!("firmware tar -> {}", fw_path.display());

    let fs_dir = out.join("fs");
    std::fs::create_dir_all(&fs_dir)?;
    let files = sfs::read_archive(parsed.fs).context("reading embedded filesystem image")?;
    extract_files(files, &fs_dir)?;

    Ok(())
}

fn extract_stream(mut source: impl Read, dest: &Path) -> Result<()> {
    let mut out = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    std::io::copy(&mut source, &mut out)?;
    Ok(())
}

fn extract_files(files: Vec<UnixFile<'static>>, root: &Path) -> Result<()> {
    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    for mut entry in files {
        bar.set_message(entry.path.clone());
        let rel = entry.path.trim_start_matches('/');
        let dest = if rel.is_empty() { root.to_path_buf() } else { root.join(rel) };
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut contents = entry
                .contents
                .take()
                .ok_or_else(|| anyhow::anyhow!("{}: missing contents", entry.path))?;
            let mut out = File::create(&dest).with_context(|| format!("creating {}", dest.display()))?;
            std::io::copy(&mut contents, &mut out)?;
        }
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(())
}

fn cmd_ls(path: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let files = sfs::read_archive(f).context("reading filesystem image")?;
    for entry in &files {
        let kind = if entry.is_dir() {
            'd'
        } else if entry.is_symlink() {
            'l'
        } else {
            '-'
        };
        println!("{kind} {:6o} {:>10} {}", entry.mode & 0o7777, entry.size, entry.path);
    }
    Ok(())
}
