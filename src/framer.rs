//! Splits a raw byte source into the fixed-size packets making up a transport stream.

use crate::packet::Packet;
use std::io;
use std::io::Read;

/// Produces a finite, non-restartable sequence of exactly-188-byte transport stream packets
/// from an underlying reader.
///
/// A source whose length is not a whole number of packets ends the sequence at the last whole
/// packet; the leftover bytes are counted in [`Framer::trailing_bytes()`] rather than treated
/// as an error, since a truncated final packet is common in interrupted recordings.
pub struct Framer<R> {
    source: R,
    frame: [u8; Packet::SIZE],
    trailing: usize,
}

impl<R: Read> Framer<R> {
    /// Wraps the given byte source.  Callers wanting buffered reads should pass a
    /// `BufReader`; the framer itself issues one `read()` per packet in the common case.
    pub fn new(source: R) -> Framer<R> {
        Framer {
            source,
            frame: [0; Packet::SIZE],
            trailing: 0,
        }
    }

    /// Reads the next whole packet, or `Ok(None)` at end of stream.
    ///
    /// The returned reference is only valid until the next call; each call reuses the same
    /// internal buffer.
    pub fn next_frame(&mut self) -> io::Result<Option<&[u8; Packet::SIZE]>> {
        let mut filled = 0;
        while filled < Packet::SIZE {
            match self.source.read(&mut self.frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match filled {
            0 => Ok(None),
            Packet::SIZE => Ok(Some(&self.frame)),
            n => {
                self.trailing = n;
                Ok(None)
            }
        }
    }

    /// Number of bytes (between 1 and 187) left over past the last whole packet, or zero if
    /// the source ended on a packet boundary or has not been fully read yet.
    pub fn trailing_bytes(&self) -> usize {
        self.trailing
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_source() {
        let mut framer = Framer::new(Cursor::new(vec![]));
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.trailing_bytes(), 0);
    }

    #[test]
    fn source_shorter_than_one_packet() {
        let mut framer = Framer::new(Cursor::new(vec![0x47; 187]));
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.trailing_bytes(), 187);
    }

    #[test]
    fn whole_packets() {
        let mut data = vec![0u8; Packet::SIZE * 2];
        data[0] = 0x47;
        data[Packet::SIZE] = 0x47;
        data[Packet::SIZE + 2] = 0x09;
        let mut framer = Framer::new(Cursor::new(data));
        assert_eq!(framer.next_frame().unwrap().unwrap()[0], 0x47);
        assert_eq!(framer.next_frame().unwrap().unwrap()[2], 0x09);
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.trailing_bytes(), 0);
    }

    #[test]
    fn truncated_tail() {
        let mut data = vec![0u8; Packet::SIZE + 5];
        data[0] = 0x47;
        let mut framer = Framer::new(Cursor::new(data));
        assert!(framer.next_frame().unwrap().is_some());
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.trailing_bytes(), 5);
    }
}
