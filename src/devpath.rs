//! Mapping UEFI device paths of measured boot applications back to files.
//!
//! Firmware records the partition GUID and a backslash-separated path relative
//! to the partition root. We find the partition through udev's by-partuuid
//! links and look up where the kernel has it mounted.

use log::{debug, trace};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::parsed::{EventParseError, ImageLoadEvent};

pub const DEFAULT_BY_PARTUUID: &str = "/dev/disk/by-partuuid";
pub const DEFAULT_MOUNTS: &str = "/proc/self/mounts";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("event data could not be parsed: {0}")]
    Parse(#[from] EventParseError),
    #[error("device path does not refer to a GPT partition")]
    NoPartition,
    #[error("device path has no file component")]
    NoFilePath,
    #[error("partition {0} is not mounted")]
    NotMounted(Uuid),
    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Undoes the octal escaping the kernel applies to spaces and friends.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Default)]
pub struct MountTable {
    entries: Vec<(PathBuf, PathBuf)>,
}

impl MountTable {
    pub fn parse(contents: &str) -> MountTable {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let target = fields.next()?;
                Some((
                    PathBuf::from(unescape_mount_field(source)),
                    PathBuf::from(unescape_mount_field(target)),
                ))
            })
            .collect();
        MountTable { entries }
    }

    pub fn read(path: &Path) -> Result<MountTable, io::Error> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// First mount point of the given (canonical) block device.
    pub fn find(&self, device: &Path) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(source, _)| {
                source == device
                    || (source.is_absolute()
                        && fs::canonicalize(source).map_or(false, |s| s == device))
            })
            .map(|(_, target)| target.as_path())
    }
}

/// Walks `relative` below `root`, matching each component without regard to
/// ASCII case, since the ESP is FAT and firmware likes upper case names.
///
/// Once a component is missing the rest is joined as given; the caller decides
/// what a path that does not exist means.
fn resolve_case_insensitive(root: &Path, relative: &str) -> Result<PathBuf, io::Error> {
    let mut current = root.to_path_buf();
    let mut components = relative.split('/').filter(|c| !c.is_empty());
    for component in components.by_ref() {
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }
        if !current.is_dir() {
            current = exact;
            break;
        }
        let mut found = None;
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.eq_ignore_ascii_case(component))
            {
                found = Some(entry.path());
                break;
            }
        }
        match found {
            Some(path) => current = path,
            None => {
                current = exact;
                break;
            }
        }
    }
    Ok(components.fold(current, |path, component| path.join(component)))
}

pub struct DevicePathResolver {
    pub by_partuuid: PathBuf,
    pub mounts: PathBuf,
}

impl Default for DevicePathResolver {
    fn default() -> Self {
        DevicePathResolver {
            by_partuuid: PathBuf::from(DEFAULT_BY_PARTUUID),
            mounts: PathBuf::from(DEFAULT_MOUNTS),
        }
    }
}

impl DevicePathResolver {
    pub fn mount_point(&self, partition: &Uuid) -> Result<PathBuf, ResolveError> {
        let link = self.by_partuuid.join(partition.to_string());
        let device = match fs::canonicalize(&link) {
            Ok(device) => device,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResolveError::NotMounted(*partition))
            }
            Err(e) => return Err(e.into()),
        };
        trace!("Partition {} is {}", partition, device.display());

        MountTable::read(&self.mounts)?
            .find(&device)
            .map(Path::to_path_buf)
            .ok_or(ResolveError::NotMounted(*partition))
    }

    /// Maps the payload of an EFI_BOOT_SERVICES_APPLICATION event to a file.
    pub fn resolve(&self, event_data: &[u8]) -> Result<PathBuf, ResolveError> {
        let event = ImageLoadEvent::parse(event_data)?;
        let device_path = &event.device_path;

        let partition = device_path
            .partition_guid()?
            .ok_or(ResolveError::NoPartition)?;
        let file_path = device_path.file_path().ok_or(ResolveError::NoFilePath)?;

        let mount_point = self.mount_point(&partition)?;
        let relative = file_path.replace('\\', "/");
        let path = resolve_case_insensitive(&mount_point, &relative)?;
        debug!(
            "Device path {}:{} resolved to {}",
            partition,
            file_path,
            path.display()
        );

        if !path.is_file() {
            return Err(ResolveError::NotAFile(path));
        }
        Ok(path)
    }
}
