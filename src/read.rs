use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{CorruptKind, Error, Result};

/// Ceiling for any single length-prefixed allocation. Declared lengths are
/// 32-bit, so a corrupt file could otherwise demand a 4 GiB buffer up front.
pub(crate) const MAX_PREALLOC: usize = 16 * 1024 * 1024;

fn read_failed(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Corrupt(CorruptKind::UnexpectedEof)
    } else {
        Error::Io(e)
    }
}

/// Big-endian primitive reads over any `Read + Seek` source.
///
/// The class file format stores every multi-byte integer big endian; floats
/// and doubles are bit reinterpretations of the same-width unsigned integer,
/// which is what the byteorder float reads do. Short reads surface as
/// `Corrupt(UnexpectedEof)` rather than plain I/O errors.
pub(crate) trait ByteRead: Read + Seek {
    fn u8(&mut self) -> Result<u8> {
        ReadBytesExt::read_u8(self).map_err(read_failed)
    }

    fn u16(&mut self) -> Result<u16> {
        ReadBytesExt::read_u16::<BigEndian>(self).map_err(read_failed)
    }

    fn u32(&mut self) -> Result<u32> {
        ReadBytesExt::read_u32::<BigEndian>(self).map_err(read_failed)
    }

    fn i32(&mut self) -> Result<i32> {
        ReadBytesExt::read_i32::<BigEndian>(self).map_err(read_failed)
    }

    fn i64(&mut self) -> Result<i64> {
        ReadBytesExt::read_i64::<BigEndian>(self).map_err(read_failed)
    }

    fn f32(&mut self) -> Result<f32> {
        ReadBytesExt::read_f32::<BigEndian>(self).map_err(read_failed)
    }

    fn f64(&mut self) -> Result<f64> {
        ReadBytesExt::read_f64::<BigEndian>(self).map_err(read_failed)
    }

    /// Reads exactly `len` bytes, refusing oversized declared lengths.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_PREALLOC {
            return Err(CorruptKind::OversizedAllocation.into());
        }

        let mut buf = vec![0; len];
        self.read_exact(&mut buf).map_err(read_failed)?;
        Ok(buf)
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        self.seek(SeekFrom::Current(len as i64)).map_err(Error::Io)?;
        Ok(())
    }

    fn position(&mut self) -> Result<u64> {
        self.stream_position().map_err(Error::Io)
    }
}

impl<R: Read + Seek> ByteRead for R {}
