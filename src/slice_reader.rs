use crate::error::{WireError, WireErrorKind, WireResult};

/// Simple reader state for extracting data from a `&[u8]` slice.
///
/// Unlike the [`std::io::Read`] implementation for `&[u8]`, this keeps track of the location
/// within the packet for more informative errors via [`WireError`].
///
/// # Example
///
/// ```
/// use mpegts_mux::SliceReader;
/// let some_data = [0x42];
/// let mut reader = SliceReader::new(&some_data);
/// assert_eq!(reader.read_u8()?, 0x42);
/// # Ok::<(), mpegts_mux::WireError>(())
/// ```
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
    location: usize,
}

impl<'a> SliceReader<'a> {
    /// Initializes a reader from any byte slice.
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, location: 0 }
    }

    /// Creates a fixed `length` sub-reader at the current position, then advances this reader to
    /// the sub-reader's end position.
    ///
    /// The sub-reader semantic makes reading nested data of known lengths easier with correct
    /// bounds checking of the nested data.
    pub fn new_sub_reader(&mut self, length: usize) -> WireResult<Self> {
        let location = self.location;
        Ok(Self {
            slice: self.read(length)?,
            location,
        })
    }

    /// Creates a [`WireError`] tagged with the reader's current location.
    pub fn make_error(&self, kind: WireErrorKind) -> WireError {
        kind.at(self.location)
    }

    /// Number of bytes remaining in the slice reader.
    pub fn remaining_len(&self) -> usize {
        self.slice.len()
    }

    /// Current byte offset from the start of the original slice.
    pub fn location(&self) -> usize {
        self.location
    }

    /// Advance reader without extracting any data from the slice.
    pub fn skip(&mut self, length: usize) -> WireResult<()> {
        if length > self.slice.len() {
            Err(self.make_error(WireErrorKind::PacketOverrun(length)))
        } else {
            self.location += length;
            self.slice = &self.slice[length..];
            Ok(())
        }
    }

    /// Extract a fixed `length` sub-slice from this reader and advance.
    pub fn read(&mut self, length: usize) -> WireResult<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(WireErrorKind::PacketOverrun(length)))
        } else {
            self.location += length;
            let (left, right) = self.slice.split_at(length);
            self.slice = right;
            Ok(left)
        }
    }

    /// Extract a sub-slice of all data remaining to be read.
    pub fn read_to_end(&mut self) -> WireResult<&'a [u8]> {
        self.read(self.slice.len())
    }

    /// Same as [`SliceReader::read`] but also converts the slice to an array reference of length
    /// `N`.
    #[allow(unsafe_code)]
    pub fn read_array_ref<const N: usize>(&mut self) -> WireResult<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by read()
            Ok(&*(self.read(N)?.as_ptr() as *const [u8; N]))
        }
    }

    /// Read one byte interpreted as [`u8`].
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.read_array_ref::<1>()?[0])
    }

    /// Read two bytes interpreted as big-endian [`u16`].
    pub fn read_be_u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_be_bytes(*self.read_array_ref::<2>()?))
    }

    /// Read three bytes interpreted as big-endian `u24`.
    pub fn read_be_u24(&mut self) -> WireResult<u32> {
        let bytes = *self.read_array_ref::<3>()?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Read four bytes interpreted as big-endian [`u32`].
    pub fn read_be_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_be_bytes(*self.read_array_ref::<4>()?))
    }

    /// Extract a fixed `length` sub-slice from this reader without advancing.
    pub fn peek(&mut self, length: usize) -> WireResult<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(WireErrorKind::PacketOverrun(length)))
        } else {
            Ok(&self.slice[0..length])
        }
    }

    /// Same as [`SliceReader::peek`] but also converts the slice to an array reference of length
    /// `N`.
    #[allow(unsafe_code)]
    pub fn peek_array_ref<const N: usize>(&mut self) -> WireResult<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by peek()
            Ok(&*(self.peek(N)?.as_ptr() as *const [u8; N]))
        }
    }
}

/// Convenience macro to read a modular bitfield from a [`SliceReader`].
///
/// Wraps [`SliceReader::read_array_ref`] to read the exact number of bytes required by the
/// bitfield type. Must be expanded in a function that returns a [`WireResult`].
#[macro_export]
macro_rules! read_bitfield {
    ($reader:expr, $type:ty) => {
        <$type>::from_bytes(*$reader.read_array_ref::<{ std::mem::size_of::<$type>() }>()?)
    };
}

/// Append the wire representation of a bitfield to a growable byte buffer.
#[macro_export]
macro_rules! write_bitfield {
    ($buf:expr, $value:expr) => {
        $buf.extend_from_slice(&$value.into_bytes())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_tracks_location() {
        let data = [1u8, 2, 3, 4, 5];
        let mut r = SliceReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.location(), 1);
        assert_eq!(r.read_be_u16().unwrap(), 0x0203);
        assert_eq!(r.remaining_len(), 2);
    }

    #[test]
    fn overrun_is_an_error() {
        let data = [1u8];
        let mut r = SliceReader::new(&data);
        assert!(matches!(
            r.read(2),
            Err(e) if matches!(e.details(), WireErrorKind::PacketOverrun(2))
        ));
    }

    #[test]
    fn sub_reader_advances_parent() {
        let data = [1u8, 2, 3, 4];
        let mut r = SliceReader::new(&data);
        let mut sub = r.new_sub_reader(2).unwrap();
        assert_eq!(sub.read_to_end().unwrap(), &[1, 2]);
        assert_eq!(r.read_to_end().unwrap(), &[3, 4]);
    }
}
