//! Predict the TPM PCR values of the next boot by replaying the UEFI event log
//! of the current one.
//!
//! The replay keeps two SHA-1 banks in lockstep: one reconstructs what the
//! firmware measured during this boot, the other substitutes what is expected
//! to be measured after a reboot (the boot binaries currently on disk and the
//! next systemd-boot kernel command line).

use serde::Serializer;
use thiserror::Error;

pub mod devpath;
pub mod eventlog;
pub mod parsed;
pub mod pcr;
pub mod pecoff;
pub mod predict;
pub mod report;
pub mod systemd_boot;
pub mod tpm;

pub use eventlog::{EventKind, EventType, LogEntry, Parser};
pub use parsed::EventParseError;
pub use pcr::PcrBank;
pub use predict::{BootEnvironment, Policy, Predictor, ReplayState, Settings, SystemEnvironment};

/// Number of PCRs in a PC client TPM bank.
pub const NUM_PCRS: usize = 24;
/// Size of a SHA-1 PCR value.
pub const PCR_SIZE: usize = 20;
/// Windows logs measurements of its "virtual PCR[-1]" with this index.
pub const VIRTUAL_PCR: u32 = 0xFFFF_FFFF;

pub type Digest = [u8; PCR_SIZE];

pub fn hash_bytes(data: &[u8]) -> Digest {
    openssl::sha::sha1(data)
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub(crate) fn serialize_as_hex<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&to_hex(bytes))
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("End of file reached")]
    Eof,
    #[error("Unsupported digest method {0} encountered")]
    UnsupportedDigestMethod(u16),
    #[error("Error parsing event: {0}")]
    EventParse(#[from] EventParseError),
    #[error("PCR index {0} is out of range")]
    PcrIndexOutOfRange(u32),
    #[error("{0} is not a PE/COFF image")]
    NotPe(String),
    #[error("Malformed PE/COFF image {path}: {reason}")]
    PeParse {
        path: String,
        #[source]
        reason: pecoff::PeError,
    },
    #[error("Could not read PCR {0}: {1}")]
    LivePcr(u32, String),
    #[error("Could not predict the boot loader command line: {0}")]
    Loader(#[from] systemd_boot::LoaderError),
    #[error("PCR {pcr_index} event {event:?} did not map to a file: {reason}")]
    UnmappedBootApplication {
        pcr_index: u32,
        event: EventType,
        reason: devpath::ResolveError,
    },
}
