//! In-memory tar packaging of a single source file.
//!
//! The archive is uploaded into the container filesystem before start, so the
//! runner image finds the payload under its well-known file name.

use std::io::{Cursor, Read};

use forge_types::{ForgeError, Result};

/// Permission bits of the packed entry (read/execute for everyone).
pub const ENTRY_MODE: u32 = 0o755;

/// A serialized single-entry tar archive.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    entry_name: String,
    size: u64,
    bytes: Vec<u8>,
}

/// One entry read back from a packed archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub body: Vec<u8>,
}

impl PackedArchive {
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    /// Size of the payload (not of the tar stream).
    pub fn payload_size(&self) -> u64 {
        self.size
    }

    /// Raw tar stream, end-of-archive marker included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parse the tar stream back into its entries.
    pub fn read_entries(&self) -> Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(Cursor::new(self.bytes.as_slice()));
        let mut entries = Vec::new();
        for entry in archive.entries().map_err(read_error)? {
            let mut entry = entry.map_err(read_error)?;
            let name = entry
                .path()
                .map_err(read_error)?
                .to_string_lossy()
                .into_owned();
            let mode = entry.header().mode().map_err(read_error)?;
            let size = entry.header().size().map_err(read_error)?;
            let mut body = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut body).map_err(read_error)?;
            entries.push(ArchiveEntry {
                name,
                mode,
                size,
                body,
            });
        }
        Ok(entries)
    }
}

/// Pack `code` as the single file `file_name`.
///
/// The payload is written byte-for-byte; an empty payload is valid.
pub fn pack(file_name: &str, code: &[u8]) -> Result<PackedArchive> {
    let size = code.len() as u64;

    let mut header = tar::Header::new_gnu();
    header
        .set_path(file_name)
        .map_err(|e| ForgeError::Packaging(format!("Failed to write the TAR header: {e}")))?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(ENTRY_MODE);
    header.set_size(size);
    header.set_mtime(0);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::with_capacity(code.len() + 1024));
    builder
        .append(&header, code)
        .map_err(|e| ForgeError::Packaging(format!("Failed to write the TAR body: {e}")))?;
    let bytes = builder
        .into_inner()
        .map_err(|e| ForgeError::Packaging(format!("Failed to close the writer: {e}")))?;

    Ok(PackedArchive {
        entry_name: file_name.to_string(),
        size,
        bytes,
    })
}

fn read_error(e: std::io::Error) -> ForgeError {
    ForgeError::Packaging(format!("Failed to read archive: {e}"))
}
