use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("Text decoding error")]
    TextDecoding,
    #[error("Contents are too short")]
    TooShort,
    #[error("Invalid structure signature")]
    InvalidSignature,
    #[error("Unsupported log version")]
    UnsupportedLog,
    #[error("A value was unaligned")]
    Unaligned,
    #[error("An invalid value was encountered")]
    InvalidValue,
    #[error("Invalid GUID: {0}")]
    InvalidGuid(String),
}

impl From<uuid::Error> for EventParseError {
    fn from(err: uuid::Error) -> EventParseError {
        EventParseError::InvalidGuid(format!("{:?}", err))
    }
}

/// Decodes a UTF-16LE buffer, dropping any trailing NUL characters.
pub(crate) fn string_from_widechar(wchar: &[u8]) -> Result<String, EventParseError> {
    if wchar.len() % 2 != 0 {
        return Err(EventParseError::Unaligned);
    }
    let units: Vec<u16> = wchar.chunks_exact(2).map(LittleEndian::read_u16).collect();
    let ustr = widestring::U16String::from_vec(units);
    ustr.to_string()
        .map(|s| String::from(s.trim_end_matches('\0')))
        .map_err(|_| EventParseError::TextDecoding)
}

pub(crate) fn parse_uuid(data: &[u8]) -> Result<Uuid, EventParseError> {
    if data.len() != 16 {
        return Err(EventParseError::TooShort);
    }

    // First three fields are little-endian, the rest is a byte string
    let data1 = LittleEndian::read_u32(&data[0..4]);
    let data2 = LittleEndian::read_u16(&data[4..6]);
    let data3 = LittleEndian::read_u16(&data[6..8]);
    let data4 = &data[8..16];

    Ok(Uuid::from_fields(data1, data2, data3, data4)?)
}

/// Text of a systemd-boot IPL event: the command line as UTF-16LE.
///
/// Some loaders count the terminator in bytes rather than characters, which
/// leaves a dangling odd byte at the end.
pub fn decode_loader_cmdline(data: &[u8]) -> Option<String> {
    let even = &data[..data.len() - data.len() % 2];
    string_from_widechar(even).ok()
}

#[derive(Debug, FromPrimitive, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum PartitionFormat {
    Mbr = 0x01,
    Gpt = 0x02,
}

#[derive(Debug, FromPrimitive, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum SignatureType {
    NoSignature = 0x00,
    MbrType = 0x01,
    Guid = 0x02,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DevicePathNode {
    // Device types we don't need to look into
    Unknown {
        device_type: u8,
        device_subtype: u8,
        data: Vec<u8>,
    },

    // Type: Device Path End
    End,

    // Type: Media Device Path
    HardDrive {
        partition_number: u32,
        partition_start: u64,
        partition_size: u64,
        partition_signature: Vec<u8>,
        partition_format: PartitionFormat,
        signature_type: SignatureType,
    },
    FilePath {
        path: String,
    },
}

impl DevicePathNode {
    fn parse(
        device_type: u8,
        device_subtype: u8,
        data: &[u8],
    ) -> Result<DevicePathNode, EventParseError> {
        match (device_type, device_subtype) {
            // Type: Device Path End
            //  Sub-type: End Entire Device Path
            (0x7F, 0xFF) => Ok(DevicePathNode::End),

            // Type Media Devices
            //  Sub-type: Hard Drive
            (0x04, 0x01) => {
                if data.len() != 38 {
                    return Err(EventParseError::TooShort);
                }
                let partition_format = match PartitionFormat::from_u8(data[36]) {
                    None => return Err(EventParseError::InvalidValue),
                    Some(v) => v,
                };
                let signature_type = match SignatureType::from_u8(data[37]) {
                    None => return Err(EventParseError::InvalidValue),
                    Some(v) => v,
                };
                Ok(DevicePathNode::HardDrive {
                    partition_number: LittleEndian::read_u32(&data[0..4]),
                    partition_start: LittleEndian::read_u64(&data[4..12]),
                    partition_size: LittleEndian::read_u64(&data[12..20]),
                    partition_signature: data[20..36].to_vec(),
                    partition_format,
                    signature_type,
                })
            }

            //  Sub-type: File Path
            (0x04, 0x04) => Ok(DevicePathNode::FilePath {
                path: string_from_widechar(data)?,
            }),

            _ => Ok(DevicePathNode::Unknown {
                device_type,
                device_subtype,
                data: data.to_vec(),
            }),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Default)]
pub struct DevicePath {
    pub nodes: Vec<DevicePathNode>,
}

impl DevicePath {
    pub fn parse(mut data: &[u8]) -> Result<DevicePath, EventParseError> {
        let mut nodes = Vec::new();

        while !data.is_empty() {
            if data.len() < 4 {
                return Err(EventParseError::TooShort);
            }
            let device_type = data[0];
            let device_subtype = data[1];
            let node_len = LittleEndian::read_u16(&data[2..4]) as usize;
            if node_len < 4 || node_len > data.len() {
                return Err(EventParseError::InvalidValue);
            }

            let node = DevicePathNode::parse(device_type, device_subtype, &data[4..node_len])?;
            let is_end = node == DevicePathNode::End;
            nodes.push(node);
            data = &data[node_len..];

            if is_end {
                break;
            }
        }

        Ok(DevicePath { nodes })
    }

    /// The partition GUID of the first GPT hard drive node, if any.
    pub fn partition_guid(&self) -> Result<Option<Uuid>, EventParseError> {
        for node in &self.nodes {
            if let DevicePathNode::HardDrive {
                partition_signature,
                partition_format: PartitionFormat::Gpt,
                signature_type: SignatureType::Guid,
                ..
            } = node
            {
                return Ok(Some(parse_uuid(partition_signature)?));
            }
        }
        Ok(None)
    }

    /// All file path nodes joined together, as firmware spells them.
    pub fn file_path(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                DevicePathNode::FilePath { path } => Some(path.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }
}

/// UEFI_IMAGE_LOAD_EVENT, the payload of EFI boot/runtime services image events.
#[derive(Debug)]
pub struct ImageLoadEvent {
    pub image_location_in_memory: u64,
    pub image_length_in_memory: u64,
    pub image_link_time_address: u64,
    pub device_path: DevicePath,
}

impl ImageLoadEvent {
    pub fn parse(data: &[u8]) -> Result<ImageLoadEvent, EventParseError> {
        if data.len() < 32 {
            return Err(EventParseError::TooShort);
        }
        let image_location_in_memory = LittleEndian::read_u64(&data[0..8]);
        let image_length_in_memory = LittleEndian::read_u64(&data[8..16]);
        let image_link_time_address = LittleEndian::read_u64(&data[16..24]);
        let device_path_len = LittleEndian::read_u64(&data[24..32]) as usize;

        let device_path_data = data
            .get(32..32usize.saturating_add(device_path_len))
            .ok_or(EventParseError::TooShort)?;

        Ok(ImageLoadEvent {
            image_location_in_memory,
            image_length_in_memory,
            image_link_time_address,
            device_path: DevicePath::parse(device_path_data)?,
        })
    }
}

const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";

#[derive(Debug)]
pub(crate) struct EfiSpecId {
    pub(crate) spec_version_major: u8,
    pub(crate) spec_version_minor: u8,
    pub(crate) uintn_size: u8,
    pub(crate) algo_sizes: HashMap<u16, u16>,
}

impl EfiSpecId {
    pub(crate) fn parse(data: &[u8]) -> Result<EfiSpecId, EventParseError> {
        if data.len() < 29 {
            return Err(EventParseError::TooShort);
        }
        if &data[0..16] != SPEC_ID_SIGNATURE {
            return Err(EventParseError::InvalidSignature);
        }
        let spec_version_minor = data[20];
        let spec_version_major = data[21];
        let uintn_size = data[23];
        let num_algorithms = LittleEndian::read_u32(&data[24..28]) as usize;

        let offset = 28 + num_algorithms * 4;
        if data.len() <= offset {
            return Err(EventParseError::TooShort);
        }
        let mut algo_sizes = HashMap::new();
        for entry in data[28..offset].chunks_exact(4) {
            let algo_id = LittleEndian::read_u16(&entry[0..2]);
            let digest_size = LittleEndian::read_u16(&entry[2..4]);
            algo_sizes.insert(algo_id, digest_size);
        }
        let vendor_info_size = data[offset] as usize;
        if data.len() != (offset + vendor_info_size + 1) {
            return Err(EventParseError::TooShort);
        }

        Ok(EfiSpecId {
            spec_version_major,
            spec_version_minor,
            uintn_size,
            algo_sizes,
        })
    }

    pub(crate) fn is_spec_id(data: &[u8]) -> bool {
        data.len() >= 16 && &data[0..16] == SPEC_ID_SIGNATURE
    }
}
