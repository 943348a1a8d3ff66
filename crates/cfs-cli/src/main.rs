#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs::{
    ByteBlockDevice, CheckReport, FileByteDevice, FormatOptions, MountOptions, OpenFlags, Volume,
    VolumeStats,
};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::Path;

type ImageVolume = Volume<ByteBlockDevice<FileByteDevice>>;

/// Options that take a value; everything else starting with `--` is a switch.
const VALUE_OPTIONS: &[&str] = &["--block-size", "--dir-capacity"];

struct Args {
    positional: Vec<String>,
    switches: Vec<String>,
    values: Vec<(String, String)>,
}

impl Args {
    fn parse(mut raw: impl Iterator<Item = String>) -> Result<Self> {
        let mut args = Self {
            positional: Vec::new(),
            switches: Vec::new(),
            values: Vec::new(),
        };
        while let Some(arg) = raw.next() {
            if VALUE_OPTIONS.contains(&arg.as_str()) {
                let Some(value) = raw.next() else {
                    bail!("{arg} requires a value");
                };
                args.values.push((arg, value));
            } else if arg.starts_with("--") {
                args.switches.push(arg);
            } else {
                args.positional.push(arg);
            }
        }
        Ok(args)
    }

    fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|s| s == switch)
    }

    fn value_u32(&self, name: &str) -> Result<Option<u32>> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| {
                value
                    .parse()
                    .with_context(|| format!("{name} expects a number, got {value:?}"))
            })
            .transpose()
    }

    fn require(&self, idx: usize, usage: &str) -> Result<&str> {
        match self.positional.get(idx) {
            Some(arg) => Ok(arg.as_str()),
            None => bail!("usage: cfs-cli {usage}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    image: String,
    #[serde(flatten)]
    stats: VolumeStats,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut raw = env::args().skip(1);
    let Some(command) = raw.next() else {
        print_usage();
        return Ok(());
    };
    let args = Args::parse(raw)?;

    match command.as_str() {
        "format" => {
            let usage = "format <image> <blocks> [--block-size N] [--dir-capacity N]";
            let image = args.require(0, usage)?;
            let blocks: u64 = args
                .require(1, usage)?
                .parse()
                .context("block count must be a number")?;
            let defaults = FormatOptions::default();
            let options = FormatOptions {
                block_size: args.value_u32("--block-size")?.unwrap_or(defaults.block_size),
                directory_capacity: args
                    .value_u32("--dir-capacity")?
                    .unwrap_or(defaults.directory_capacity),
            };
            format(Path::new(image), blocks, &options)
        }
        "info" => info(Path::new(args.require(0, "info <image> [--json]")?), args.has("--json")),
        "ls" => {
            let image = args.require(0, "ls <image> [path]")?;
            let path = args.positional.get(1).map_or("/", String::as_str);
            ls(Path::new(image), path)
        }
        "mkdir" => {
            let usage = "mkdir <image> <path>";
            mkdir(Path::new(args.require(0, usage)?), args.require(1, usage)?)
        }
        "put" => {
            let usage = "put <image> <host-file> <path> [--append]";
            put(
                Path::new(args.require(0, usage)?),
                Path::new(args.require(1, usage)?),
                args.require(2, usage)?,
                args.has("--append"),
            )
        }
        "cat" => {
            let usage = "cat <image> <path>";
            cat(Path::new(args.require(0, usage)?), args.require(1, usage)?)
        }
        "rm" => {
            let usage = "rm <image> <path>";
            rm(Path::new(args.require(0, usage)?), args.require(1, usage)?)
        }
        "check" => check(
            Path::new(args.require(0, "check <image> [--json]")?),
            args.has("--json"),
        ),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cfs-cli\n");
    println!("USAGE:");
    println!("  cfs-cli format <image> <blocks> [--block-size N] [--dir-capacity N]");
    println!("  cfs-cli info <image> [--json]");
    println!("  cfs-cli ls <image> [path]");
    println!("  cfs-cli mkdir <image> <path>");
    println!("  cfs-cli put <image> <host-file> <path> [--append]");
    println!("  cfs-cli cat <image> <path>");
    println!("  cfs-cli rm <image> <path>");
    println!("  cfs-cli check <image> [--json]");
}

fn open_volume(image: &Path) -> Result<ImageVolume> {
    Volume::open_image(image, &MountOptions::default())
        .with_context(|| format!("failed to mount {}", image.display()))
}

fn finish(vol: ImageVolume) -> Result<()> {
    vol.unmount().context("unmount")?;
    Ok(())
}

fn format(image: &Path, blocks: u64, options: &FormatOptions) -> Result<()> {
    let vol = Volume::format_image(image, blocks, options)
        .with_context(|| format!("failed to format {}", image.display()))?;
    let stats = vol.stats();
    finish(vol)?;
    println!(
        "formatted {}: {} blocks of {} bytes, {} free",
        image.display(),
        stats.block_count,
        stats.block_size,
        stats.free_blocks
    );
    Ok(())
}

fn info(image: &Path, json: bool) -> Result<()> {
    let vol = open_volume(image)?;
    let output = InfoOutput {
        image: image.display().to_string(),
        stats: vol.stats(),
    };
    finish(vol)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        let stats = &output.stats;
        println!("ChainFS volume: {}", output.image);
        println!("block_size: {}", stats.block_size);
        println!("block_count: {}", stats.block_count);
        println!("reserved_blocks: {}", stats.reserved_blocks);
        println!("free_blocks: {}", stats.free_blocks);
        println!("used_blocks: {}", stats.used_blocks);
        println!(
            "directory: {}/{} entries",
            stats.directory_entries, stats.directory_capacity
        );
    }
    Ok(())
}

fn ls(image: &Path, path: &str) -> Result<()> {
    let vol = open_volume(image)?;
    let entries = vol
        .list(path)
        .with_context(|| format!("cannot list {path}"))?;
    for entry in &entries {
        if entry.is_dir() {
            println!("{:>10}  {}/", "-", entry.name);
        } else {
            println!("{:>10}  {}", entry.size, entry.name);
        }
    }
    finish(vol)
}

fn mkdir(image: &Path, path: &str) -> Result<()> {
    let mut vol = open_volume(image)?;
    vol.mkdir(path)
        .with_context(|| format!("cannot create directory {path}"))?;
    finish(vol)
}

fn put(image: &Path, host_file: &Path, path: &str, append: bool) -> Result<()> {
    let data = std::fs::read(host_file)
        .with_context(|| format!("failed to read {}", host_file.display()))?;
    let mut vol = open_volume(image)?;
    let mode = if append {
        OpenFlags::APPEND
    } else {
        OpenFlags::TRUNCATE
    };
    let handle = vol
        .open(path, OpenFlags::WRITE_ONLY | OpenFlags::CREATE | mode)
        .with_context(|| format!("cannot open {path} for writing"))?;
    let written = vol
        .write(handle, &data)
        .with_context(|| format!("write to {path} failed"))?;
    vol.close(handle)?;
    let size = vol.stat(path)?.size;
    finish(vol)?;
    println!("{path}: wrote {written} bytes, size now {size}");
    Ok(())
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let mut vol = open_volume(image)?;
    let handle = vol
        .open(path, OpenFlags::READ_ONLY)
        .with_context(|| format!("cannot open {path}"))?;
    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = vol.read(handle, &mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).context("write to stdout")?;
    }
    stdout.flush().context("flush stdout")?;
    vol.close(handle)?;
    finish(vol)
}

fn rm(image: &Path, path: &str) -> Result<()> {
    let mut vol = open_volume(image)?;
    vol.remove(path)
        .with_context(|| format!("cannot remove {path}"))?;
    finish(vol)
}

fn print_report(report: &CheckReport) {
    println!("files checked: {}", report.files_checked);
    println!(
        "blocks: {} total, {} reserved, {} reachable, {} free, {} leaked",
        report.total_blocks,
        report.reserved_blocks,
        report.reachable_blocks,
        report.free_blocks,
        report.leaked_blocks
    );
    for finding in &report.findings {
        println!("  {}: {}", finding.component, finding.detail);
    }
    println!(
        "verdict: {}",
        if report.healthy { "clean" } else { "INCONSISTENT" }
    );
}

fn check(image: &Path, json: bool) -> Result<()> {
    let vol = open_volume(image)?;
    let report = vol.check();
    finish(vol)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print_report(&report);
    }
    if !report.healthy {
        bail!("{} has {} consistency problems", image.display(), report.failed());
    }
    Ok(())
}
