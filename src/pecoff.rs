//! Authenticode digest of PE/COFF images, as firmware computes it for
//! EV_EFI_BOOT_SERVICES_APPLICATION measurements.
//!
//! The checksum field, the certificate table directory entry and the
//! certificate table itself are left out, so signing an image does not change
//! its measurement.

use log::trace;
use object::pe::{
    ImageDataDirectory, ImageFileHeader, ImageNtHeaders32, ImageNtHeaders64,
    IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_DOS_SIGNATURE,
};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile};
use object::{FileKind, LittleEndian as LE};
use openssl::sha::Sha1;
use std::fs;
use std::mem;
use std::path::Path;

use crate::{Digest, Error};

/// Offset of `CheckSum` within the optional header, the same for PE32 and PE32+.
const CHECKSUM_OFFSET: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum PeError {
    #[error("error while parsing PE file: {0}")]
    Object(#[from] object::Error),
    #[error("{0}")]
    Layout(&'static str),
}

struct Layout {
    checksum: usize,
    cert_dir: Option<usize>,
    size_of_headers: usize,
    sections: Vec<(usize, usize)>,
    cert_table_size: usize,
}

fn layout<Pe: ImageNtHeaders>(data: &[u8]) -> Result<Layout, PeError> {
    let file: PeFile<Pe> = PeFile::parse(data)?;
    let optional_header = file.nt_headers().optional_header();

    let nt_offset = file.dos_header().nt_headers_offset() as usize;
    let optional = nt_offset + mem::size_of::<u32>() + mem::size_of::<ImageFileHeader>();
    let checksum = optional + CHECKSUM_OFFSET;
    let size_of_headers = optional_header.size_of_headers() as usize;

    let cert_dir = if optional_header.number_of_rva_and_sizes() as usize
        > IMAGE_DIRECTORY_ENTRY_SECURITY
    {
        Some(
            optional
                + mem::size_of::<Pe::ImageOptionalHeader>()
                + IMAGE_DIRECTORY_ENTRY_SECURITY * mem::size_of::<ImageDataDirectory>(),
        )
    } else {
        None
    };
    let cert_table_size = file
        .data_directories()
        .get(IMAGE_DIRECTORY_ENTRY_SECURITY)
        .map_or(0, |dir| dir.size.get(LE) as usize);

    let mut sections: Vec<(usize, usize)> = file
        .section_table()
        .iter()
        .map(|section| {
            (
                section.pointer_to_raw_data.get(LE) as usize,
                section.size_of_raw_data.get(LE) as usize,
            )
        })
        .filter(|&(_, size)| size > 0)
        .collect();
    sections.sort_unstable();

    if size_of_headers > data.len() || checksum + 4 > size_of_headers {
        return Err(PeError::Layout("bad SizeOfHeaders"));
    }
    if let Some(entry) = cert_dir {
        if entry < checksum + 4 || entry + mem::size_of::<ImageDataDirectory>() > size_of_headers
        {
            return Err(PeError::Layout("bad data directory layout"));
        }
    }

    Ok(Layout {
        checksum,
        cert_dir,
        size_of_headers,
        sections,
        cert_table_size,
    })
}

/// Authenticode SHA-1 of an in-memory image.
pub fn authenticode_sha1(data: &[u8]) -> Result<Digest, PeError> {
    let layout = match FileKind::parse(data)? {
        FileKind::Pe32 => layout::<ImageNtHeaders32>(data)?,
        FileKind::Pe64 => layout::<ImageNtHeaders64>(data)?,
        _ => return Err(PeError::Layout("not a PE32 or PE32+ image")),
    };
    let mut hasher = Sha1::new();

    hasher.update(&data[..layout.checksum]);
    match layout.cert_dir {
        Some(entry) => {
            let entry_end = entry + mem::size_of::<ImageDataDirectory>();
            hasher.update(&data[layout.checksum + 4..entry]);
            hasher.update(&data[entry_end..layout.size_of_headers]);
        }
        None => hasher.update(&data[layout.checksum + 4..layout.size_of_headers]),
    }

    let mut hashed = layout.size_of_headers;
    for (offset, size) in layout.sections {
        let section = data
            .get(offset..offset.saturating_add(size))
            .ok_or(PeError::Layout("section extends past end of file"))?;
        hasher.update(section);
        hashed += size;
    }

    let trailer_end = data
        .len()
        .checked_sub(layout.cert_table_size)
        .ok_or(PeError::Layout("certificate table larger than file"))?;
    if trailer_end > hashed {
        trace!("Hashing {} bytes of trailing data", trailer_end - hashed);
        hasher.update(&data[hashed..trailer_end]);
    }

    Ok(hasher.finish())
}

/// Predicted measurement of the boot binary at `path`.
pub fn hash_pecoff(path: &Path) -> Result<Digest, Error> {
    let data = fs::read(path)?;
    if !data.starts_with(&IMAGE_DOS_SIGNATURE.to_le_bytes()) {
        return Err(Error::NotPe(path.display().to_string()));
    }
    authenticode_sha1(&data).map_err(|reason| Error::PeParse {
        path: path.display().to_string(),
        reason,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use object::pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC;

    /// A minimal PE32+ image with one section and an optional signature blob.
    pub(crate) fn build_image(section: &[u8], certificate: &[u8]) -> Vec<u8> {
        let nt = 0x40;
        let optional = nt + 4 + 20;
        let optional_size = 240;
        let table = optional + optional_size;
        let size_of_headers = 0x200;
        let section_offset = size_of_headers;
        let section_size = section.len();

        let mut image = vec![0u8; size_of_headers];
        image[0..2].copy_from_slice(b"MZ");
        image[0x3c..0x40].copy_from_slice(&(nt as u32).to_le_bytes());
        image[nt..nt + 4].copy_from_slice(b"PE\0\0");
        image[nt + 4..nt + 6].copy_from_slice(&0x8664u16.to_le_bytes());
        image[nt + 6..nt + 8].copy_from_slice(&1u16.to_le_bytes());
        image[nt + 20..nt + 22].copy_from_slice(&(optional_size as u16).to_le_bytes());
        image[optional..optional + 2]
            .copy_from_slice(&IMAGE_NT_OPTIONAL_HDR64_MAGIC.to_le_bytes());
        image[optional + 60..optional + 64]
            .copy_from_slice(&(size_of_headers as u32).to_le_bytes());
        image[optional + 64..optional + 68].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        image[optional + 108..optional + 112].copy_from_slice(&16u32.to_le_bytes());
        image[table..table + 5].copy_from_slice(b".text");
        image[table + 16..table + 20].copy_from_slice(&(section_size as u32).to_le_bytes());
        image[table + 20..table + 24].copy_from_slice(&(section_offset as u32).to_le_bytes());
        image.extend_from_slice(section);

        if !certificate.is_empty() {
            let cert_dir = optional + 112 + 4 * 8;
            let cert_offset = image.len() as u32;
            image[cert_dir..cert_dir + 4].copy_from_slice(&cert_offset.to_le_bytes());
            image[cert_dir + 4..cert_dir + 8]
                .copy_from_slice(&(certificate.len() as u32).to_le_bytes());
            image.extend_from_slice(certificate);
        }
        image
    }

    #[test]
    fn known_digest() {
        let image = build_image(&[0x90; 0x200], &[]);
        assert_eq!(
            crate::to_hex(&authenticode_sha1(&image).unwrap()),
            "449c32797e22d04079c6f9564466f051459028e5"
        );
    }

    #[test]
    fn header_layout() {
        let image = build_image(&[0x90; 0x200], &[0x30; 0x80]);
        let layout = layout::<ImageNtHeaders64>(&image).unwrap();
        assert_eq!(layout.checksum, 0x40 + 24 + 64);
        assert_eq!(layout.cert_dir, Some(0x40 + 24 + 112 + 4 * 8));
        assert_eq!(layout.size_of_headers, 0x200);
        assert_eq!(layout.sections, vec![(0x200, 0x200)]);
        assert_eq!(layout.cert_table_size, 0x80);
    }

    #[test]
    fn signing_does_not_change_digest() {
        let unsigned = build_image(&[0x90; 0x200], &[]);
        let signed = build_image(&[0x90; 0x200], &[0x30; 0x80]);
        assert_ne!(unsigned, signed);
        assert_eq!(
            authenticode_sha1(&unsigned).unwrap(),
            authenticode_sha1(&signed).unwrap()
        );
    }

    #[test]
    fn checksum_is_excluded() {
        let image = build_image(&[0x90; 0x200], &[]);
        let mut other = image.clone();
        let checksum = 0x40 + 24 + 64;
        other[checksum] ^= 0xff;
        assert_eq!(
            authenticode_sha1(&image).unwrap(),
            authenticode_sha1(&other).unwrap()
        );

        other[0x400 - 1] ^= 0xff;
        assert_ne!(
            authenticode_sha1(&image).unwrap(),
            authenticode_sha1(&other).unwrap()
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            authenticode_sha1(b"not a PE file"),
            Err(PeError::Object(_))
        ));

        let mut image = build_image(&[0x90; 0x200], &[]);
        image.truncate(0x300);
        assert!(matches!(
            authenticode_sha1(&image),
            Err(PeError::Layout("section extends past end of file"))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grub.cfg");
        fs::write(&path, b"set timeout=5\n").unwrap();
        assert!(matches!(hash_pecoff(&path), Err(Error::NotPe(_))));
        assert!(matches!(
            hash_pecoff(&dir.path().join("missing.efi")),
            Err(Error::Io(_))
        ));

        let truncated = dir.path().join("truncated.efi");
        fs::write(&truncated, &build_image(&[0x90; 0x200], &[])[..0x300]).unwrap();
        assert!(matches!(
            hash_pecoff(&truncated),
            Err(Error::PeParse { .. })
        ));
    }
}
