//! Reading the SHA-1 PCR values of the live TPM.

use log::debug;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::{Digest, Error, PCR_SIZE};

pub const DEFAULT_TPM_SYSFS: &str = "/sys/class/tpm/tpm0";

pub trait PcrReader {
    fn read_pcr(&self, index: u32) -> Result<Digest, Error>;
}

fn parse_hex_digest(index: u32, text: &str) -> Result<Digest, Error> {
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&text).map_err(|e| Error::LivePcr(index, e.to_string()))?;
    if bytes.len() != PCR_SIZE {
        return Err(Error::LivePcr(
            index,
            format!("expected {} bytes, got {}", PCR_SIZE, bytes.len()),
        ));
    }
    let mut digest = [0; PCR_SIZE];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

/// Reads PCRs through the kernel's sysfs interface.
///
/// TPM 2.0 devices export one file per register under `pcr-sha1/`; TPM 1.2
/// devices only have the combined `device/pcrs` listing.
pub struct SysfsPcrReader {
    pub root: PathBuf,
}

impl Default for SysfsPcrReader {
    fn default() -> Self {
        SysfsPcrReader {
            root: PathBuf::from(DEFAULT_TPM_SYSFS),
        }
    }
}

impl SysfsPcrReader {
    fn read_legacy(&self, index: u32) -> Result<Digest, Error> {
        let listing = fs::read_to_string(self.root.join("device/pcrs"))?;
        let label = format!("PCR-{:02}:", index);
        let line = listing
            .lines()
            .find(|line| line.starts_with(&label))
            .ok_or_else(|| Error::LivePcr(index, "not listed".to_string()))?;
        parse_hex_digest(index, &line[label.len()..])
    }
}

impl PcrReader for SysfsPcrReader {
    fn read_pcr(&self, index: u32) -> Result<Digest, Error> {
        let path = self.root.join("pcr-sha1").join(index.to_string());
        match fs::read_to_string(&path) {
            Ok(text) => parse_hex_digest(index, &text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist, trying TPM 1.2 listing", path.display());
                self.read_legacy(index)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpm2_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pcr-sha1")).unwrap();
        fs::write(
            dir.path().join("pcr-sha1/7"),
            "A1B2C3D4E5F60718293A4B5C6D7E8F9011223344\n",
        )
        .unwrap();
        fs::write(dir.path().join("pcr-sha1/8"), "0011\n").unwrap();

        let reader = SysfsPcrReader {
            root: dir.path().to_path_buf(),
        };
        assert_eq!(
            crate::to_hex(&reader.read_pcr(7).unwrap()),
            "a1b2c3d4e5f60718293a4b5c6d7e8f9011223344"
        );
        assert!(matches!(reader.read_pcr(8), Err(Error::LivePcr(8, _))));
    }

    #[test]
    fn tpm12_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("device")).unwrap();
        let mut listing = String::new();
        for i in 0..24 {
            let byte = if (17..=22).contains(&i) { "FF" } else { "00" };
            listing.push_str(&format!("PCR-{:02}: {}\n", i, vec![byte; 20].join(" ")));
        }
        listing = listing.replace(
            "PCR-04: 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00",
            "PCR-04: 12 34 56 78 9A BC DE F0 12 34 56 78 9A BC DE F0 12 34 56 78",
        );
        fs::write(dir.path().join("device/pcrs"), listing).unwrap();

        let reader = SysfsPcrReader {
            root: dir.path().to_path_buf(),
        };
        assert_eq!(
            crate::to_hex(&reader.read_pcr(4).unwrap()),
            "123456789abcdef0123456789abcdef012345678"
        );
        assert_eq!(reader.read_pcr(17).unwrap(), [0xFF; 20]);
        assert!(reader.read_pcr(30).is_err());
    }
}
