use byteorder::{LittleEndian, ReadBytesExt};
use fallible_iterator::FallibleIterator;
use log::{info, trace};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::parsed::{EfiSpecId, EventParseError};
use crate::{Digest, Error, PCR_SIZE};

pub const DEFAULT_LOG_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

// Nothing legitimate in a boot log comes close to this
const MAX_EVENT_SIZE: u32 = 16 * 1024 * 1024;

const TPM_ALG_SHA1: u16 = 0x0004;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Eof
    } else {
        Error::Io(e)
    }
}

#[derive(Debug)]
enum LogType {
    PcrEvent,
    Event2,
}

const EFI_EVENT_BASE: u32 = 0x80000000;

#[derive(Debug, PartialEq, Eq, FromPrimitive, Copy, Clone)]
#[repr(u32)]
pub enum TcgEvent {
    // TCG PC Client Specific Implementation Specification for Conventional BIOS
    PrebootCert = 0x0,
    PostCode = 0x1,
    Unused = 0x2,
    NoAction = 0x3,
    Separator = 0x4,
    Action = 0x5,
    EventTag = 0x6,
    CrtmContents = 0x7,
    CrtmVersion = 0x8,
    CpuMicrocode = 0x9,
    PlatformConfigFlags = 0xA,
    TableOfDevices = 0xB,
    CompactHash = 0xC,
    Ipl = 0xD,
    IplPartitionData = 0xE,
    NonhostCode = 0xF,
    NonhostConfig = 0x10,
    NonhostInfo = 0x11,
    OmitBootDeviceEvents = 0x12,

    // TCG EFI Platform Specification For TPM Family 1.1 or 1.2, table 7-1
    EfiVariableDriverConfig = EFI_EVENT_BASE + 0x1,
    EfiVariableBoot = EFI_EVENT_BASE + 0x2,
    EfiBootServicesApplication = EFI_EVENT_BASE + 0x3,
    EfiBootServicesDriver = EFI_EVENT_BASE + 0x4,
    EfiRuntimeServicesDriver = EFI_EVENT_BASE + 0x5,
    EfiGptEvent = EFI_EVENT_BASE + 0x6,
    EfiAction = EFI_EVENT_BASE + 0x7,
    EfiPlatformFirmwareBlob = EFI_EVENT_BASE + 0x8,
    EfiHandoffTables = EFI_EVENT_BASE + 0x9,
    EfiPlatformFirmwareBlob2 = EFI_EVENT_BASE + 0xA,
    EfiHandoffTables2 = EFI_EVENT_BASE + 0xB,
    EfiVariableBoot2 = EFI_EVENT_BASE + 0xC,
    EfiHcrtmEvent = EFI_EVENT_BASE + 0x10,
    EfiVariableAuthority = EFI_EVENT_BASE + 0xE0,
    EfiSpdmFirmwareBlob = EFI_EVENT_BASE + 0xE1,
    EfiSpdmFirmwareConfig = EFI_EVENT_BASE + 0xE2,
}

/// Event type of a log record, as found in the log.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum EventType {
    Known(TcgEvent),
    Unknown(u32),
}

impl From<u32> for EventType {
    fn from(raw: u32) -> Self {
        match TcgEvent::from_u32(raw) {
            Some(known) => EventType::Known(known),
            None => EventType::Unknown(raw),
        }
    }
}

impl From<TcgEvent> for EventType {
    fn from(known: TcgEvent) -> Self {
        EventType::Known(known)
    }
}

/// The distinctions the replay cares about.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum EventKind {
    BootServicesApplication,
    Ipl,
    NoAction,
    Other(EventType),
}

impl From<EventType> for EventKind {
    fn from(event: EventType) -> Self {
        match event {
            EventType::Known(TcgEvent::EfiBootServicesApplication) => {
                EventKind::BootServicesApplication
            }
            EventType::Known(TcgEvent::Ipl) => EventKind::Ipl,
            EventType::Known(TcgEvent::NoAction) => EventKind::NoAction,
            other => EventKind::Other(other),
        }
    }
}

/// One measurement record, reduced to the SHA-1 bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub pcr_index: u32,
    pub event: EventType,
    pub data: Vec<u8>,
    /// Absent when the record did not extend the SHA-1 bank.
    pub sha1: Option<Digest>,
}

impl LogEntry {
    pub fn kind(&self) -> EventKind {
        EventKind::from(self.event)
    }
}

#[derive(Debug)]
pub struct Parser<R: Read> {
    reader: R,
    logtype: Option<LogType>,
    log_info: Option<EfiSpecId>,
}

impl Parser<BufReader<File>> {
    /// Opens the given log, or the kernel's copy of the firmware log.
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_LOG_PATH));
        info!("Reading event log from {}", path.display());
        Ok(Parser::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> Parser<R> {
    pub fn new(reader: R) -> Self {
        Parser {
            reader,
            logtype: None,
            log_info: None,
        }
    }

    fn read_event_data(&mut self) -> Result<Vec<u8>, Error> {
        let event_size = self.reader.read_u32::<LittleEndian>()?;
        if event_size > MAX_EVENT_SIZE {
            return Err(Error::EventParse(EventParseError::InvalidValue));
        }
        let mut eventbuf = vec![0; event_size as usize];
        self.reader.read_exact(&mut eventbuf)?;
        Ok(eventbuf)
    }

    fn parse_pcr_event(&mut self) -> Result<LogEntry, Error> {
        let pcr_index = self.reader.read_u32::<LittleEndian>().map_err(map_eof)?;
        let event = EventType::from(self.reader.read_u32::<LittleEndian>()?);
        let mut digest = [0; PCR_SIZE];
        self.reader.read_exact(&mut digest)?;
        let data = self.read_event_data()?;

        trace!("Parsed PcrEvent of type {:?}, PCR {}", event, pcr_index);

        Ok(LogEntry {
            pcr_index,
            event,
            data,
            sha1: Some(digest),
        })
    }

    fn parse_event2(&mut self) -> Result<LogEntry, Error> {
        let pcr_index = self.reader.read_u32::<LittleEndian>().map_err(map_eof)?;
        let event = EventType::from(self.reader.read_u32::<LittleEndian>()?);

        let digest_count = self.reader.read_u32::<LittleEndian>()?;
        let mut sha1 = None;
        for _ in 0..digest_count {
            let raw_algo = self.reader.read_u16::<LittleEndian>()?;
            let algo_size = self
                .log_info
                .as_ref()
                .and_then(|info| info.algo_sizes.get(&raw_algo))
                .copied()
                .ok_or(Error::UnsupportedDigestMethod(raw_algo))?;
            let mut digbuf = vec![0; algo_size as usize];
            self.reader.read_exact(&mut digbuf)?;

            if raw_algo == TPM_ALG_SHA1 && digbuf.len() == PCR_SIZE {
                let mut digest = [0; PCR_SIZE];
                digest.copy_from_slice(&digbuf);
                sha1 = Some(digest);
            }
        }

        let data = self.read_event_data()?;

        trace!(
            "Parsed Event2 of type {:?}, size {}, PCR {}, sha1 {}",
            event,
            data.len(),
            pcr_index,
            sha1.is_some()
        );

        Ok(LogEntry {
            pcr_index,
            event,
            data,
            sha1,
        })
    }
}

impl<R: Read> FallibleIterator for Parser<R> {
    type Item = LogEntry;
    type Error = Error;

    fn next(&mut self) -> Result<Option<LogEntry>, Error> {
        if self.logtype.is_none() {
            let firstevent = match self.parse_pcr_event() {
                Err(Error::Eof) => return Ok(None),
                Err(e) => return Err(e),
                Ok(val) => val,
            };

            if firstevent.event == EventType::Known(TcgEvent::NoAction)
                && EfiSpecId::is_spec_id(&firstevent.data)
            {
                let spec_id = EfiSpecId::parse(&firstevent.data)?;
                info!(
                    "Log type: event2 (spec {}.{})",
                    spec_id.spec_version_major, spec_id.spec_version_minor
                );
                trace!("Parsed first event: {:?}", spec_id);
                if spec_id.uintn_size != 2 {
                    return Err(Error::EventParse(EventParseError::UnsupportedLog));
                }
                self.log_info = Some(spec_id);
                self.logtype = Some(LogType::Event2);
            // In this case, we explicitly fall through, to not return this marker event
            } else {
                info!("Log type: PcrEvent");
                self.logtype = Some(LogType::PcrEvent);
                return Ok(Some(firstevent));
            }
        }

        let new_event = match self.logtype {
            Some(LogType::Event2) => self.parse_event2(),
            _ => self.parse_pcr_event(),
        };

        match new_event {
            Err(Error::Eof) => Ok(None),
            Err(e) => Err(e),
            Ok(val) => Ok(Some(val)),
        }
    }
}
