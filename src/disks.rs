/*! Discovery of disks suitable as installation targets
*/
use std::{cmp::Reverse, path::PathBuf};

use crate::{feedback::Feedback, CommandRunner, InstallCommand, KunsInstallerError};

/// Disks smaller than this are never offered as targets
pub const MINIMUM_DISK_SIZE: u64 = 1024 * 1024 * 1024;

/// Device name prefixes which are never installation targets (loop, optical, RAM disks)
const IGNORED_DEVICE_PREFIXES: &[&str] = &["loop", "sr", "ram", "zram"];

/// A whole disk as reported by `lsblk`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Disk {
    pub device: PathBuf,
    /// The size as `lsblk` renders it, e.g. `238.5G`
    pub size: String,
    /// `0` if `size` could not be parsed
    pub size_bytes: u64,
    pub model: String,
}

/** List the disks an installation could target, largest first

Partitions, loop devices, optical drives, RAM disks and disks under [`MINIMUM_DISK_SIZE`] are
left out. Disks whose size can't be parsed are kept, sorted last.
*/
#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_disks(
    runner: &dyn CommandRunner,
    feedback: &dyn Feedback,
) -> Result<Vec<Disk>, KunsInstallerError> {
    let command = InstallCommand::new("lsblk").args(["-dpno", "NAME,SIZE,TYPE,MODEL"]);
    let stdout = runner
        .capture(&command, feedback)
        .await
        .ok_or_else(|| KunsInstallerError::ListDisks(command.to_string()))?;

    let mut disks = parse_lsblk(&stdout);
    disks.sort_by_key(|disk| Reverse(disk.size_bytes));
    tracing::debug!(count = disks.len(), "Found candidate disks");
    Ok(disks)
}

fn parse_lsblk(stdout: &str) -> Vec<Disk> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let size = fields.next()?;
            let device_type = fields.next()?;
            let model = fields.collect::<Vec<_>>().join(" ");

            if device_type != "disk" || !device.starts_with("/dev/") {
                return None;
            }
            let name = device.trim_start_matches("/dev/");
            if IGNORED_DEVICE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
            {
                return None;
            }

            let size_bytes = match parse_size(size) {
                Some(bytes) if bytes < MINIMUM_DISK_SIZE => return None,
                Some(bytes) => bytes,
                None => 0,
            };

            Some(Disk {
                device: PathBuf::from(device),
                size: size.to_string(),
                size_bytes,
                model: match model.is_empty() {
                    true => "Unknown".to_string(),
                    false => model,
                },
            })
        })
        .collect()
}

/// Parse a human readable size such as `8G`, `500M` or `1.5T` (binary multiples) into bytes
pub fn parse_size(size: &str) -> Option<u64> {
    let size = size.trim().to_ascii_uppercase();
    let multiplier: u64 = match size.chars().last()? {
        'B' => 1,
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return parse_number(&size).map(|v| v as u64),
    };
    let number = parse_number(&size[..size.len() - 1])?;
    Some((number * multiplier as f64) as u64)
}

fn parse_number(number: &str) -> Option<f64> {
    // lsblk uses the locale's decimal separator
    let number = number.replace(',', ".").parse::<f64>().ok()?;
    match number.is_finite() && number >= 0.0 {
        true => Some(number),
        false => None,
    }
}
