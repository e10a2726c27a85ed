//! On-disk encoding of sortable items.
//!
//! Runs are written as a plain concatenation of encoded items. Fixed-size
//! integers are stored little endian; variable-length payloads carry a `u32`
//! length prefix, the same framing the run files use for keys and values.

use std::io::{self, Read, Write};

/// An item that can be spilled to a run file and read back.
pub trait Record: Sized {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>;
}

macro_rules! impl_record_for_int {
    ($($t:ty),*) => {
        $(
            impl Record for $t {
                #[inline]
                fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
                    writer.write_all(&self.to_le_bytes())
                }

                #[inline]
                fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    reader.read_exact(&mut buf)?;
                    Ok(<$t>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_record_for_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl Record for usize {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        (*self as u64).write_to(writer)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let value = u64::read_from(reader)?;
        usize::try_from(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn write_len_prefixed<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 length"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)
}

fn read_len_prefixed<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    // Grows with the bytes actually read, not the claimed length.
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("length prefix {} runs past the end of the data", len),
        ));
    }
    Ok(bytes)
}

impl Record for Vec<u8> {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_len_prefixed(writer, self)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        read_len_prefixed(reader)
    }
}

impl Record for String {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_len_prefixed(writer, self.as_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let bytes = read_len_prefixed(reader)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

// Key/value pairs, e.g. `(Vec<u8>, Vec<u8>)` records.
impl<A: Record, B: Record> Record for (A, B) {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.0.write_to(writer)?;
        self.1.write_to(writer)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let a = A::read_from(reader)?;
        let b = B::read_from(reader)?;
        Ok((a, b))
    }
}

/// Bytes charged against a memory budget for one buffered item.
#[inline]
pub fn item_size<T>() -> usize {
    std::mem::size_of::<T>().max(1)
}
