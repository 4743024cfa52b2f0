/*! The two-partition layout written to the target disk and where it gets mounted
*/
use std::path::{Path, PathBuf};

/// Start of the EFI system partition
pub const EFI_START: &str = "1MiB";
/// End of the EFI system partition, and start of the root partition
pub const EFI_END: &str = "513MiB";
/// End of the root partition
pub const ROOT_END: &str = "100%";

/// Device name fragments whose partitions are suffixed `p1`, `p2`, ...
const SEPARATED_PARTITION_MARKERS: &[&str] = &["nvme", "mmc"];

/** Device paths of the partitions on the target disk

The layout is always exactly two partitions: an EFI system partition (FAT32, 512 MiB) and the
root partition (ext4, the remaining space).
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub efi_partition: PathBuf,
    pub root_partition: PathBuf,
}

impl PartitionLayout {
    pub fn for_disk(disk: impl AsRef<Path>) -> Self {
        Self {
            efi_partition: partition_path(disk.as_ref(), 1),
            root_partition: partition_path(disk.as_ref(), 2),
        }
    }

    pub fn partitions(&self) -> [&Path; 2] {
        [&self.efi_partition, &self.root_partition]
    }
}

/// The device node of partition `number` on `disk`
pub fn partition_path(disk: &Path, number: u8) -> PathBuf {
    let disk = disk.as_os_str().to_string_lossy();
    let separator = match SEPARATED_PARTITION_MARKERS
        .iter()
        .any(|marker| disk.contains(marker))
    {
        true => "p",
        false => "",
    };
    PathBuf::from(format!("{disk}{separator}{number}"))
}

/** Where the target system is mounted during a run

The root filesystem is mounted at [`root`](MountTopology::root) and the EFI system partition is
nested at [`boot`](MountTopology::boot), so root must be mounted first.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTopology {
    root: PathBuf,
}

impl MountTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boot(&self) -> PathBuf {
        self.root.join("boot")
    }

    /// A path inside the target system, `relative` is interpreted relative to the target's `/`
    pub fn target_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        self.root.join(relative.strip_prefix("/").unwrap_or(relative))
    }
}
