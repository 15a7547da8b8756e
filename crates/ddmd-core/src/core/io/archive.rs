use crate::core::boundary::Boundary;
use crate::core::models::atom::Atom;
use crate::core::models::group::Group;
use crate::core::models::mask::{MASK_CAPACITY, Mask};
use crate::core::storage::StorageError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Vector3;
use std::io::{Read, Write};
use thiserror::Error;

/// Magic bytes at the start of every archive.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"DDMD";

/// Current archive format version.
pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a DDMD archive (bad magic bytes)")]
    BadMagic,

    #[error("Unsupported archive version {found} (this build reads version {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Unexpected archive section '{found}', expected '{expected}'")]
    UnexpectedSection { expected: String, found: String },

    #[error("Invalid value in archive: {0}")]
    InvalidValue(String),

    #[error("Failed to restore storage from archive: {0}")]
    Storage(#[from] StorageError),
}

/// Types that can be written to and read back from a binary archive.
///
/// Each implementation writes its typed fields one after the other in a
/// fixed order; there is no self-describing schema, so `load` must mirror
/// `save` exactly.
pub trait Archivable: Sized {
    fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError>;
    fn load<R: Read>(ar: &mut IArchive<R>) -> Result<Self, ArchiveError>;
}

/// A little-endian binary output archive.
pub struct OArchive<W: Write> {
    writer: W,
}

impl<W: Write> OArchive<W> {
    /// Creates an archive and writes the magic bytes and format version.
    pub fn new(mut writer: W) -> Result<Self, ArchiveError> {
        writer.write_all(&ARCHIVE_MAGIC)?;
        writer.write_u32::<LittleEndian>(ARCHIVE_VERSION)?;
        Ok(Self { writer })
    }

    /// Writes a four-byte section tag that the reader checks with
    /// [`IArchive::expect_section`].
    pub fn write_section(&mut self, tag: &[u8; 4]) -> Result<(), ArchiveError> {
        self.writer.write_all(tag)?;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), ArchiveError> {
        self.writer.write_u8(value)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), ArchiveError> {
        self.writer.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), ArchiveError> {
        self.writer.write_u64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), ArchiveError> {
        self.writer.write_f64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_vector(&mut self, value: &Vector3<f64>) -> Result<(), ArchiveError> {
        for component in value.iter() {
            self.write_f64(*component)?;
        }
        Ok(())
    }

    /// Writes a length prefix followed by every item.
    pub fn write_all<'a, T, I>(&mut self, items: I) -> Result<(), ArchiveError>
    where
        T: Archivable + 'a,
        I: ExactSizeIterator<Item = &'a T>,
    {
        self.write_u64(items.len() as u64)?;
        for item in items {
            item.save(self)?;
        }
        Ok(())
    }

    pub fn save<T: Archivable>(&mut self, value: &T) -> Result<(), ArchiveError> {
        value.save(self)
    }

    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// A little-endian binary input archive.
pub struct IArchive<R: Read> {
    reader: R,
    version: u32,
}

impl<R: Read> IArchive<R> {
    /// Opens an archive, checking the magic bytes and the format version.
    pub fn new(mut reader: R) -> Result<Self, ArchiveError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != ARCHIVE_MAGIC {
            return Err(ArchiveError::BadMagic);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::UnsupportedVersion {
                found: version,
                expected: ARCHIVE_VERSION,
            });
        }
        Ok(Self { reader, version })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn expect_section(&mut self, tag: &[u8; 4]) -> Result<(), ArchiveError> {
        let mut found = [0u8; 4];
        self.reader.read_exact(&mut found)?;
        if &found != tag {
            return Err(ArchiveError::UnexpectedSection {
                expected: String::from_utf8_lossy(tag).into_owned(),
                found: String::from_utf8_lossy(&found).into_owned(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.reader.read_u8()?)
    }

    pub fn read_u32(&mut self) -> Result<u32, ArchiveError> {
        Ok(self.reader.read_u32::<LittleEndian>()?)
    }

    pub fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        Ok(self.reader.read_u64::<LittleEndian>()?)
    }

    pub fn read_f64(&mut self) -> Result<f64, ArchiveError> {
        Ok(self.reader.read_f64::<LittleEndian>()?)
    }

    pub fn read_vector(&mut self) -> Result<Vector3<f64>, ArchiveError> {
        let x = self.read_f64()?;
        let y = self.read_f64()?;
        let z = self.read_f64()?;
        Ok(Vector3::new(x, y, z))
    }

    /// Reads a length prefix followed by that many items.
    pub fn read_all<T: Archivable>(&mut self) -> Result<Vec<T>, ArchiveError> {
        let len = self.read_u64()? as usize;
        // The length comes from the archive, so it only bounds the loop.
        let mut items = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            items.push(T::load(self)?);
        }
        Ok(items)
    }

    pub fn load<T: Archivable>(&mut self) -> Result<T, ArchiveError> {
        T::load(self)
    }
}

impl Archivable for Mask {
    fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_u8(self.size() as u8)?;
        for partner in self.as_slice() {
            ar.write_u32(*partner)?;
        }
        Ok(())
    }

    fn load<R: Read>(ar: &mut IArchive<R>) -> Result<Self, ArchiveError> {
        let size = ar.read_u8()? as usize;
        if size > MASK_CAPACITY {
            return Err(ArchiveError::InvalidValue(format!(
                "mask size {} exceeds capacity {}",
                size, MASK_CAPACITY
            )));
        }
        let mut mask = Mask::new();
        for _ in 0..size {
            let partner = ar.read_u32()?;
            mask.append(partner)
                .map_err(|e| ArchiveError::InvalidValue(e.to_string()))?;
        }
        Ok(mask)
    }
}

impl Archivable for Atom {
    fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_u32(self.id)?;
        ar.write_u32(self.type_id)?;
        ar.write_vector(&self.position)?;
        ar.write_vector(&self.velocity)?;
        ar.save(&self.mask)
    }

    fn load<R: Read>(ar: &mut IArchive<R>) -> Result<Self, ArchiveError> {
        let id = ar.read_u32()?;
        let type_id = ar.read_u32()?;
        let position = ar.read_vector()?;
        let velocity = ar.read_vector()?;
        let mask = ar.load::<Mask>()?;
        let mut atom = Atom::new(id, type_id, position).with_velocity(velocity);
        atom.mask = mask;
        Ok(atom)
    }
}

impl<const N: usize> Archivable for Group<N> {
    fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_u32(self.id)?;
        ar.write_u32(self.type_id)?;
        for atom_id in &self.atom_ids {
            ar.write_u32(*atom_id)?;
        }
        Ok(())
    }

    fn load<R: Read>(ar: &mut IArchive<R>) -> Result<Self, ArchiveError> {
        let id = ar.read_u32()?;
        let type_id = ar.read_u32()?;
        let mut atom_ids = [0; N];
        for atom_id in atom_ids.iter_mut() {
            *atom_id = ar.read_u32()?;
        }
        Ok(Group::new(id, type_id, atom_ids))
    }
}

impl Archivable for Boundary {
    fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_vector(self.lengths())
    }

    fn load<R: Read>(ar: &mut IArchive<R>) -> Result<Self, ArchiveError> {
        let lengths = ar.read_vector()?;
        Boundary::new(lengths).map_err(|e| ArchiveError::InvalidValue(e.to_string()))
    }
}
