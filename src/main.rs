mod boot_sector;
mod cluster_reader;
mod data_runs;
mod error;
mod file_carver;
mod image;
mod mft_record;
mod orchestrator;
mod partition;
mod report;
mod scanner;
mod vbr_recovery;

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use log::info;
use serde::Serialize;

use crate::error::{RescueError, Result};
use crate::image::DiskImage;
use crate::orchestrator::{diagnose, run, scan_and_recover, RescueConfig};
use crate::partition::{propose_partitions, rebuild_image, scan_for_boot_sectors};
use crate::report::{write_json_report, RebuildReport};
use crate::vbr_recovery::{Assume, ConfirmPolicy};

const USAGE: &str = "\
usage: ntfs_rescue <command> <image> [options]

commands:
  diagnose   classify boot-sector damage
  scan       sweep for MFT records and recover deleted files (read-only)
  recover    repair the VBR from its backup, then scan and recover
  rebuild    sweep for boot sectors and propose a new partition table

options:
  --out <path>        output directory (scan/recover) or rebuilt image (rebuild)
  --report <file>     also write the JSON result to <file>
  --offsets           keep the raw signature-hit offset list
  --yes               answer yes to every confirmation
  --apply             write the rebuilt image (rebuild, needs --out)
  --max-sectors <n>   bound the rebuild sweep to the first <n> sectors";

struct CliOptions {
    image: PathBuf,
    out: Option<PathBuf>,
    report: Option<PathBuf>,
    offsets: bool,
    yes: bool,
    apply: bool,
    max_sectors: Option<u64>,
}

/// Interactive y/N prompt on stderr, so stdout stays pure JSON.
struct StdinConfirm;

impl ConfirmPolicy for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        eprint!("{prompt} [y/N] ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes" | "YES")
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = run_cli(&args) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run_cli(args: &[String]) -> Result<()> {
    let command = match args.first() {
        Some(c) => c.as_str(),
        None => {
            eprintln!("{USAGE}");
            return Err(RescueError::Precondition("no command given".into()));
        }
    };
    let options = parse_options(&args[1..])?;

    match command {
        "diagnose" => cmd_diagnose(&options),
        "scan" => cmd_scan(&options),
        "recover" => cmd_recover(&options),
        "rebuild" => cmd_rebuild(&options),
        other => {
            eprintln!("{USAGE}");
            Err(RescueError::Precondition(format!("unknown command {other:?}")))
        }
    }
}

fn parse_options(args: &[String]) -> Result<CliOptions> {
    let mut image = None;
    let mut options = CliOptions {
        image: PathBuf::new(),
        out: None,
        report: None,
        offsets: false,
        yes: false,
        apply: false,
        max_sectors: None,
    };

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--out" => options.out = Some(PathBuf::from(expect_value(&mut it, "--out")?)),
            "--report" => options.report = Some(PathBuf::from(expect_value(&mut it, "--report")?)),
            "--offsets" => options.offsets = true,
            "--yes" => options.yes = true,
            "--apply" => options.apply = true,
            "--max-sectors" => {
                let raw = expect_value(&mut it, "--max-sectors")?;
                options.max_sectors = Some(raw.parse().map_err(|_| {
                    RescueError::Precondition(format!("--max-sectors: {raw:?} is not a number"))
                })?);
            }
            flag if flag.starts_with("--") => {
                eprintln!("{USAGE}");
                return Err(RescueError::Precondition(format!("unknown option {flag:?}")));
            }
            positional => {
                if image.replace(PathBuf::from(positional)).is_some() {
                    return Err(RescueError::Precondition(
                        "more than one image path given".into(),
                    ));
                }
            }
        }
    }

    options.image = image.ok_or_else(|| {
        eprintln!("{USAGE}");
        RescueError::Precondition("no image path given".into())
    })?;
    Ok(options)
}

fn expect_value<'a>(it: &mut std::slice::Iter<'a, String>, flag: &str) -> Result<&'a String> {
    it.next()
        .ok_or_else(|| RescueError::Precondition(format!("{flag} needs a value")))
}

fn cmd_diagnose(options: &CliOptions) -> Result<()> {
    let mut img = DiskImage::open(&options.image)?;
    let diagnosis = diagnose(&mut img)?;
    emit(&diagnosis, options.report.as_deref())
}

fn cmd_scan(options: &CliOptions) -> Result<()> {
    let mut img = DiskImage::open(&options.image)?;
    let diagnosis = diagnose(&mut img)?;
    let config = scan_config(options);
    let report = scan_and_recover(&mut img, &diagnosis, &config)?;
    emit(&report, options.report.as_deref())
}

fn cmd_recover(options: &CliOptions) -> Result<()> {
    // The size-checked copy made here satisfies the verified-backup
    // precondition of the VBR overwrite.
    backup_file(&options.image)?;
    let mut img = DiskImage::open_rw(&options.image)?;
    let config = RescueConfig {
        backup_verified: true,
        scan_when_healthy: options.yes,
        ..scan_config(options)
    };
    let outcome = if options.yes {
        run(&mut img, &config, &mut Assume(true))?
    } else {
        run(&mut img, &config, &mut StdinConfirm)?
    };
    emit(&outcome, options.report.as_deref())
}

fn cmd_rebuild(options: &CliOptions) -> Result<()> {
    let mut img = DiskImage::open(&options.image)?;
    let candidates = scan_for_boot_sectors(&mut img, options.max_sectors)?;
    let proposals = propose_partitions(&candidates, img.total_sectors());

    let applied_to = if options.apply {
        let destination = options.out.clone().ok_or_else(|| {
            RescueError::Precondition("--apply needs --out <path> for the rebuilt image".into())
        })?;
        rebuild_image(&options.image, &destination, &proposals)?;
        Some(destination)
    } else {
        None
    };

    let report = RebuildReport {
        image: options.image.clone(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        candidates_found: candidates.len(),
        proposals,
        applied_to,
    };
    emit(&report, options.report.as_deref())
}

fn scan_config(options: &CliOptions) -> RescueConfig {
    let mut config = RescueConfig {
        keep_offset_list: options.offsets,
        scan_when_healthy: true,
        ..RescueConfig::default()
    };
    if let Some(out) = &options.out {
        config.output_dir = out.clone();
    }
    config
}

/// Copy the image aside before opening it for writing. The copy must be
/// byte-complete or the destructive command does not proceed.
fn backup_file(image: &Path) -> Result<()> {
    let mut backup = image.as_os_str().to_owned();
    backup.push(".backup");
    let backup = PathBuf::from(backup);

    let copied = fs::copy(image, &backup)?;
    let original = fs::metadata(image)?.len();
    if copied != original {
        return Err(RescueError::Precondition(format!(
            "backup copy at {} is {copied} bytes, original is {original}",
            backup.display()
        )));
    }
    info!("image backed up to {}", backup.display());
    Ok(())
}

fn emit<T: Serialize>(value: &T, report: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    println!("{json}");
    if let Some(path) = report {
        write_json_report(path, value)?;
    }
    Ok(())
}
