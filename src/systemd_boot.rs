//! Prediction of the kernel command line systemd-boot will measure into PCR 8
//! on the next boot.

use log::{debug, trace};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::parsed::string_from_widechar;

pub const DEFAULT_EFIVARS: &str = "/sys/firmware/efi/efivars";
/// Vendor GUID of the systemd-boot loader interface variables.
pub const LOADER_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("not a systemd-boot environment: {0}")]
    NotRecognized(String),
    #[error("malformed EFI variable {0}")]
    BadVariable(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn read_optional(path: &Path) -> Result<Option<String>, io::Error> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Matches systemd-boot's `default` patterns: `*` and `?` wildcards.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// A Boot Loader Specification type #1 entry, reduced to what ends up on the
/// kernel command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoaderEntry {
    pub linux: Option<String>,
    pub initrd: Vec<String>,
    pub options: Vec<String>,
}

impl LoaderEntry {
    pub fn parse(contents: &str) -> LoaderEntry {
        let mut entry = LoaderEntry::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            match key {
                "linux" => entry.linux = Some(value.to_string()),
                "initrd" => entry.initrd.push(value.to_string()),
                "options" => entry.options.push(value.to_string()),
                _ => trace!("Ignoring loader entry key {}", key),
            }
        }
        entry
    }

    /// The command line the way systemd-boot assembles it: every initrd as an
    /// `initrd=` argument with an EFI-style path, followed by the options.
    pub fn cmdline(&self) -> String {
        self.initrd
            .iter()
            .map(|initrd| format!("initrd={}", initrd.replace('/', "\\")))
            .chain(self.options.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct LoaderPredictor {
    pub efivars: PathBuf,
}

impl Default for LoaderPredictor {
    fn default() -> Self {
        LoaderPredictor {
            efivars: PathBuf::from(DEFAULT_EFIVARS),
        }
    }
}

impl LoaderPredictor {
    /// Reads a string variable of the loader interface from efivarfs.
    pub fn read_variable(&self, name: &str) -> Result<Option<String>, LoaderError> {
        let path = self.efivars.join(format!("{}-{}", name, LOADER_GUID));
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // The first four bytes are the variable attributes
        if data.len() < 4 {
            return Err(LoaderError::BadVariable(name.to_string()));
        }
        let value = string_from_widechar(&data[4..])
            .map_err(|_| LoaderError::BadVariable(name.to_string()))?;
        trace!("EFI variable {} = {:?}", name, value);
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    /// The ESP is the closest ancestor of the boot loader binary holding the
    /// loader configuration.
    pub fn esp_root(last_efi_binary: &Path) -> Option<PathBuf> {
        last_efi_binary
            .ancestors()
            .skip(1)
            .find(|dir| dir.join("loader").is_dir())
            .map(Path::to_path_buf)
    }

    fn entry_ids(esp: &Path) -> Result<Vec<String>, io::Error> {
        let dir = esp.join("loader/entries");
        let mut ids = Vec::new();
        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    if let Some(name) = entry?.file_name().to_str() {
                        if name.ends_with(".conf") {
                            ids.push(name.to_string());
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        // Newest versions first, as the boot menu lists them
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    fn configured_default(esp: &Path) -> Result<Option<String>, LoaderError> {
        let conf = match read_optional(&esp.join("loader/loader.conf"))? {
            Some(conf) => conf,
            None => return Ok(None),
        };
        let pattern = conf.lines().find_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(char::is_whitespace)?;
            if key == "default" {
                Some(value.trim().to_string())
            } else {
                None
            }
        });
        let pattern = match pattern {
            Some(pattern) => pattern,
            None => return Ok(None),
        };
        Ok(Self::entry_ids(esp)?.into_iter().find(|id| {
            glob_match(&pattern, id) || glob_match(&pattern, id.trim_end_matches(".conf"))
        }))
    }

    /// Id of the entry that will be booted next.
    pub fn next_entry(&self, esp: &Path) -> Result<String, LoaderError> {
        if let Some(id) = self.read_variable("LoaderEntryOneShot")? {
            debug!("Next entry from LoaderEntryOneShot: {}", id);
            return Ok(id);
        }
        if let Some(id) = self.read_variable("LoaderEntryDefault")? {
            debug!("Next entry from LoaderEntryDefault: {}", id);
            return Ok(id);
        }
        if let Some(id) = Self::configured_default(esp)? {
            debug!("Next entry from loader.conf: {}", id);
            return Ok(id);
        }
        if let Some(id) = self.read_variable("LoaderEntrySelected")? {
            debug!("Next entry from LoaderEntrySelected: {}", id);
            return Ok(id);
        }
        Err(LoaderError::NotRecognized(
            "no boot entry is selected".to_string(),
        ))
    }

    /// Kernel command line for the next boot, given the last boot application
    /// measured in this one.
    pub fn next_cmdline(&self, last_efi_binary: Option<&Path>) -> Result<String, LoaderError> {
        let binary = last_efi_binary.ok_or_else(|| {
            LoaderError::NotRecognized("no boot application was measured".to_string())
        })?;
        let esp = Self::esp_root(binary).ok_or_else(|| {
            LoaderError::NotRecognized(format!(
                "no loader configuration next to {}",
                binary.display()
            ))
        })?;

        let id = self.next_entry(&esp)?;
        let file = if id.ends_with(".conf") {
            id
        } else {
            format!("{}.conf", id)
        };
        let path = esp.join("loader/entries").join(&file);
        let contents = read_optional(&path)?.ok_or_else(|| {
            LoaderError::NotRecognized(format!("{} does not exist", path.display()))
        })?;

        let entry = LoaderEntry::parse(&contents);
        if entry.linux.is_none() {
            return Err(LoaderError::NotRecognized(format!(
                "{} is not a Linux entry",
                file
            )));
        }
        Ok(entry.cmdline())
    }
}

/// systemd-boot measures the command line as the UTF-16LE load options,
/// including the terminating NUL.
pub fn loader_encode_pcr8(cmdline: &str) -> Vec<u8> {
    let mut encoded: Vec<u8> = cmdline
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    encoded.extend_from_slice(&[0, 0]);
    encoded
}
