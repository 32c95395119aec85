//! On-disk record layouts.
//!
//! Every integer on disk is little-endian, regardless of host. Directory and
//! snapshot bodies end with a trailing `i64` total length so readers can pick
//! it up without walking the records.

use crate::hash::{HASH_SIZE, Hash};

/// Format version carried in every blob intro.
pub const BLOB_VERSION: i8 = 7;

/// Legacy snapshot tag found in old repositories, never written anymore.
pub const LEGACY_SNAPSHOT_TAG: i8 = 3;

/// Maximum snapshot name length, including the terminating NUL.
pub const SNAPSHOT_NAME_SIZE: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("invalid blob type 0x{0:02x}")]
    UnknownBlobType(i8),
    #[error("unsupported legacy snapshot blob")]
    LegacySnapshot,
    #[error("malformed {0} blob")]
    Malformed(&'static str),
    #[error("unknown entry kind 0x{0:04x}")]
    UnknownEntryKind(i16),
    #[error("unsafe entry name '{0}'")]
    UnsafeName(String),
    #[error("snapshot name is too long (limit is {} bytes)", SNAPSHOT_NAME_SIZE - 1)]
    NameTooLong,
}

/// Semantic type of a blob, mixed into its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum BlobType {
    Chunk = 0,
    File = 1,
    Directory = 2,
    Link = 4,
    Snapshot = 5,
}

impl BlobType {
    pub fn from_tag(tag: i8) -> Result<Self, FormatError> {
        match tag {
            0 => Ok(BlobType::Chunk),
            1 => Ok(BlobType::File),
            2 => Ok(BlobType::Directory),
            4 => Ok(BlobType::Link),
            5 => Ok(BlobType::Snapshot),
            LEGACY_SNAPSHOT_TAG => Err(FormatError::LegacySnapshot),
            other => Err(FormatError::UnknownBlobType(other)),
        }
    }

    pub fn tag(self) -> i8 {
        self as i8
    }

    pub fn name(self) -> &'static str {
        match self {
            BlobType::Chunk => "Chunk",
            BlobType::File => "File",
            BlobType::Directory => "Directory",
            BlobType::Link => "Link",
            BlobType::Snapshot => "Snapshot",
        }
    }
}

/// Hash of `plaintext` as a blob of type `ty` under the repository salt.
pub fn hash_blob(salt: &[u8; 32], ty: BlobType, plaintext: &[u8]) -> Hash {
    Hash::keyed(salt, ty.tag() as u8, plaintext)
}

/// One chunk reference inside a File blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: Hash,
    pub offset: i64,
    pub len: i32,
}

impl ChunkRef {
    pub const SIZE: usize = HASH_SIZE + 8 + 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.hash.as_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Malformed("file"));
        }

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[..HASH_SIZE]);

        Ok(ChunkRef {
            hash: hash.into(),
            offset: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
            len: i32::from_le_bytes(buf[40..44].try_into().unwrap()),
        })
    }
}

/// Parses a File blob body into its chunk list and declared total length.
pub fn parse_file(body: &[u8]) -> Result<(Vec<ChunkRef>, i64), FormatError> {
    if body.len() < 8 || (body.len() - 8) % ChunkRef::SIZE != 0 {
        return Err(FormatError::Malformed("file"));
    }

    let (records, tail) = body.split_at(body.len() - 8);
    let total = i64::from_le_bytes(tail.try_into().unwrap());
    if total < 0 {
        return Err(FormatError::Malformed("file"));
    }

    let chunks = records
        .chunks_exact(ChunkRef::SIZE)
        .map(ChunkRef::decode)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((chunks, total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum EntryKind {
    Directory = 0,
    File = 1,
    Link = 2,
    Unknown = 3,
}

impl EntryKind {
    fn from_raw(raw: i16) -> Result<Self, FormatError> {
        match raw {
            0 => Ok(EntryKind::Directory),
            1 => Ok(EntryKind::File),
            2 => Ok(EntryKind::Link),
            3 => Ok(EntryKind::Unknown),
            other => Err(FormatError::UnknownEntryKind(other)),
        }
    }
}

/// Entry flag: metadata was captured when the entry was stated.
pub const ENTRY_STATED: u16 = 1 << 0;
/// Entry flag: the entry body was stored successfully and can be restored.
pub const ENTRY_READABLE: u16 = 1 << 1;

/// One child record inside a Directory or Snapshot body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub hash: Hash,
    pub kind: EntryKind,
    pub flags: u16,
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub name: String,
}

impl EntryRecord {
    /// Fixed part of the record, before the name bytes.
    pub const HEAD_SIZE: usize = HASH_SIZE + 2 + 2 + 8 + 8 + 4 + 4 + 4 + 8 + 2;

    pub fn new(kind: EntryKind, name: String) -> Self {
        EntryRecord {
            hash: Hash::ZERO,
            kind,
            flags: 0,
            mtime: 0,
            btime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            name,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.flags & ENTRY_READABLE != 0
    }

    pub fn encoded_size(&self) -> usize {
        Self::HEAD_SIZE + self.name.len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.hash.as_bytes());
        out.extend_from_slice(&(self.kind as i16).to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.btime.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as i16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
    }

    /// Decodes one record and validates its name. Separators are only legal
    /// inside snapshot roots, where entries encode absolute source paths.
    pub fn decode(buf: &[u8], allow_separators: bool) -> Result<(Self, usize), FormatError> {
        if buf.len() < Self::HEAD_SIZE {
            return Err(FormatError::Malformed("directory"));
        }

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[..HASH_SIZE]);

        let kind = EntryKind::from_raw(i16::from_le_bytes(buf[32..34].try_into().unwrap()))?;
        let flags = u16::from_le_bytes(buf[34..36].try_into().unwrap());
        let mtime = i64::from_le_bytes(buf[36..44].try_into().unwrap());
        let btime = i64::from_le_bytes(buf[44..52].try_into().unwrap());
        let mode = u32::from_le_bytes(buf[52..56].try_into().unwrap());
        let uid = u32::from_le_bytes(buf[56..60].try_into().unwrap());
        let gid = u32::from_le_bytes(buf[60..64].try_into().unwrap());
        let size = i64::from_le_bytes(buf[64..72].try_into().unwrap());
        let name_len = i16::from_le_bytes(buf[72..74].try_into().unwrap());

        if name_len <= 0 || buf.len() < Self::HEAD_SIZE + name_len as usize {
            return Err(FormatError::Malformed("directory"));
        }

        let name = std::str::from_utf8(&buf[Self::HEAD_SIZE..Self::HEAD_SIZE + name_len as usize])
            .map_err(|_| FormatError::Malformed("directory"))?
            .to_owned();

        if name.starts_with('/') || name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(FormatError::UnsafeName(name));
        }
        if !allow_separators && name.contains('/') {
            return Err(FormatError::UnsafeName(name));
        }

        let record = EntryRecord {
            hash: hash.into(),
            kind,
            flags,
            mtime,
            btime,
            mode,
            uid,
            gid,
            size,
            name,
        };
        let skip = record.encoded_size();
        Ok((record, skip))
    }
}

/// Header of a Directory body: aggregate byte size and entry count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryHeader {
    pub size: i64,
    pub entries: i64,
}

impl DirectoryHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.entries.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Malformed("directory"));
        }
        Ok(DirectoryHeader {
            size: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            entries: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Parses a Directory body (header, records, trailing total length).
pub fn parse_directory(
    body: &[u8],
    allow_separators: bool,
) -> Result<(DirectoryHeader, Vec<EntryRecord>), FormatError> {
    if body.len() < DirectoryHeader::SIZE + 8 {
        return Err(FormatError::Malformed("directory"));
    }

    let header = DirectoryHeader::decode(body)?;
    let records = &body[DirectoryHeader::SIZE..body.len() - 8];

    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < records.len() {
        let (entry, skip) = EntryRecord::decode(&records[offset..], allow_separators)?;
        entries.push(entry);
        offset += skip;
    }

    Ok((header, entries))
}

/// Header of a Snapshot blob. The name is NUL-padded to a fixed field so the
/// tag payload can carry the header prefix up to and including the NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub time: i64,
    pub name: String,
    pub size: i64,
    pub storage: i64,
}

impl SnapshotHeader {
    pub const SIZE: usize = 8 + SNAPSHOT_NAME_SIZE + 8 + 8;

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), FormatError> {
        if self.name.len() >= SNAPSHOT_NAME_SIZE {
            return Err(FormatError::NameTooLong);
        }

        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.resize(out.len() + SNAPSHOT_NAME_SIZE - self.name.len(), 0);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.storage.to_le_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Malformed("snapshot"));
        }

        let time = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let name_field = &buf[8..8 + SNAPSHOT_NAME_SIZE];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(SNAPSHOT_NAME_SIZE);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| FormatError::Malformed("snapshot"))?
            .to_owned();

        let size = i64::from_le_bytes(buf[264..272].try_into().unwrap());
        let storage = i64::from_le_bytes(buf[272..280].try_into().unwrap());

        Ok(SnapshotHeader {
            time,
            name,
            size,
            storage,
        })
    }

    /// Length of the tag payload: the header prefix through the name's NUL.
    pub fn tag_payload_len(&self) -> usize {
        8 + self.name.len() + 1
    }
}

/// Parses a tag payload: snapshot time followed by the NUL-terminated name.
pub fn parse_tag_payload(payload: &[u8]) -> Result<(i64, String), FormatError> {
    if payload.len() < 9 {
        return Err(FormatError::Malformed("tag"));
    }

    let time = i64::from_le_bytes(payload[0..8].try_into().unwrap());
    let rest = &payload[8..];
    let name_len = rest.iter().position(|&b| b == 0).ok_or(FormatError::Malformed("tag"))?;
    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|_| FormatError::Malformed("tag"))?
        .to_owned();

    Ok((time, name))
}
