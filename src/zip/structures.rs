use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Bzip2,
    Lzma,
    Zstd,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            12 => CompressionMethod::Bzip2,
            14 => CompressionMethod::Lzma,
            93 => CompressionMethod::Zstd,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Bzip2 => 12,
            CompressionMethod::Lzma => 14,
            CompressionMethod::Zstd => 93,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    /// Whether extraction of this method can resume mid-entry.
    pub fn is_resumable(&self) -> bool {
        matches!(self, CompressionMethod::Stored | CompressionMethod::Deflate)
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionMethod::Stored => f.write_str("stored"),
            CompressionMethod::Deflate => f.write_str("deflate"),
            CompressionMethod::Bzip2 => f.write_str("bzip2"),
            CompressionMethod::Lzma => f.write_str("lzma"),
            CompressionMethod::Zstd => f.write_str("zstd"),
            CompressionMethod::Unknown(v) => write!(f, "method {}", v),
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::corrupt("invalid end of central directory record"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::corrupt("invalid zip64 end of central directory locator"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::corrupt("invalid zip64 end of central directory record"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// General purpose flag: entry is encrypted
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag, LZMA only: stream ends with an end marker
pub const FLAG_LZMA_EOS: u16 = 0x0002;

const HOST_UNIX: u16 = 3;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const MSDOS_READONLY: u32 = 0x01;
const MSDOS_DIR: u32 = 0x10;

/// Parsed ZIP file entry information
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub version_made_by: u16,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub external_attrs: u32,
    pub is_directory: bool,
}

impl ZipFileEntry {
    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Full unix mode (file type and permission bits).
    ///
    /// Archives made on unix carry it in the high half of the external
    /// attributes. Anything else gets a default mode derived from the
    /// MS-DOS attributes and the trailing slash.
    pub fn unix_mode(&self) -> u32 {
        if self.version_made_by >> 8 == HOST_UNIX {
            let mode = self.external_attrs >> 16;
            if mode != 0 {
                return mode;
            }
        }

        let mut mode = if self.is_directory || self.external_attrs & MSDOS_DIR != 0 {
            S_IFDIR | 0o775
        } else {
            0o100664
        };
        if self.external_attrs & MSDOS_READONLY != 0 {
            mode &= !0o222;
        }
        mode
    }

    pub fn kind(&self) -> EntryKind {
        let mode = self.unix_mode();
        if self.is_directory || mode & S_IFMT == S_IFDIR {
            EntryKind::Dir
        } else if mode & S_IFMT == S_IFLNK {
            EntryKind::Symlink
        } else {
            EntryKind::File
        }
    }

    /// The engine-facing view of this entry, with nothing written yet.
    pub fn to_entry(&self) -> Entry {
        let mut path = self.file_name.replace('\\', "/");
        while path.ends_with('/') {
            path.pop();
        }
        Entry {
            kind: self.kind(),
            canonical_path: path,
            compressed_size: self.compressed_size,
            uncompressed_size: self.uncompressed_size,
            mode: self.unix_mode() & 0o7777,
            write_offset: 0,
            crc32: self.crc32,
            write_crc32: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_entry(name: &str, version_made_by: u16, external_attrs: u32) -> ZipFileEntry {
        ZipFileEntry {
            file_name: name.to_string(),
            version_made_by,
            flags: 0,
            compression_method: CompressionMethod::Deflate,
            compressed_size: 3,
            uncompressed_size: 5,
            crc32: 7,
            lfh_offset: 0,
            last_mod_time: 0,
            last_mod_date: 0,
            external_attrs,
            is_directory: name.ends_with('/'),
        }
    }

    #[test]
    fn unix_attributes_decide_kind_and_mode() {
        let link = zip_entry("lib/libfoo.so", 0x031E, 0o120777 << 16);
        assert_eq!(link.kind(), EntryKind::Symlink);
        assert_eq!(link.to_entry().mode, 0o777);

        let exe = zip_entry("bin/tool", 0x031E, 0o100755 << 16);
        assert_eq!(exe.kind(), EntryKind::File);
        assert_eq!(exe.to_entry().mode, 0o755);
    }

    #[test]
    fn dos_attributes_get_default_modes() {
        let dir = zip_entry("b/", 0x0014, MSDOS_DIR);
        let entry = dir.to_entry();
        assert_eq!(entry.kind, EntryKind::Dir);
        assert_eq!(entry.canonical_path, "b");
        assert_eq!(entry.mode, 0o775);

        let readonly = zip_entry("docs\\readme.txt", 0x0014, MSDOS_READONLY);
        let entry = readonly.to_entry();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.canonical_path, "docs/readme.txt");
        assert_eq!(entry.mode, 0o444);
    }

    #[test]
    fn method_codes() {
        for code in [0u16, 8, 12, 14, 93, 99] {
            assert_eq!(CompressionMethod::from_u16(code).as_u16(), code);
        }
        assert!(CompressionMethod::Deflate.is_resumable());
        assert!(!CompressionMethod::Lzma.is_resumable());
        assert_eq!(CompressionMethod::Unknown(99).to_string(), "method 99");
    }
}
