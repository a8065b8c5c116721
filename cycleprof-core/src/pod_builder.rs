//! Allocation-free POD writer over a fixed scratch buffer.
//!
//! Writes past the end of the buffer are not performed but still advance the
//! offset, so after building a record the caller can tell how large it would
//! have been and reject it as a whole.

use cycleprof_types::pod::{
    pad8, POD_HEADER_SIZE, TYPE_DOUBLE, TYPE_FLOAT, TYPE_FRACTION, TYPE_INT, TYPE_LONG,
    TYPE_OBJECT, TYPE_STRING, TYPE_STRUCT,
};
use cycleprof_types::Fraction;

const PADDING: [u8; 8] = [0; 8];

/// Position of an open container, returned by `push_*` and consumed by `pop`.
#[must_use]
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    start: usize,
}

pub struct PodBuilder<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> PodBuilder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes written so far, including any that did not fit.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The finished bytes, or the required size when they did not fit.
    pub fn finish(self) -> Result<&'a [u8], usize> {
        if self.offset > self.buf.len() {
            Err(self.offset)
        } else {
            Ok(&self.buf[..self.offset])
        }
    }

    fn raw(&mut self, bytes: &[u8]) {
        let end = self.offset + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.offset..end].copy_from_slice(bytes);
        }
        self.offset = end;
    }

    fn pad(&mut self) {
        let padding = pad8(self.offset) - self.offset;
        self.raw(&PADDING[..padding]);
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        if at + 4 <= self.buf.len() {
            self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn header(&mut self, size: u32, ty: u32) {
        self.raw(&size.to_le_bytes());
        self.raw(&ty.to_le_bytes());
    }

    fn primitive(&mut self, ty: u32, body: &[u8]) {
        self.header(body.len() as u32, ty);
        self.raw(body);
        self.pad();
    }

    pub fn int(&mut self, value: i32) {
        self.primitive(TYPE_INT, &value.to_le_bytes());
    }

    pub fn long(&mut self, value: i64) {
        self.primitive(TYPE_LONG, &value.to_le_bytes());
    }

    pub fn float(&mut self, value: f32) {
        self.primitive(TYPE_FLOAT, &value.to_le_bytes());
    }

    pub fn double(&mut self, value: f64) {
        self.primitive(TYPE_DOUBLE, &value.to_le_bytes());
    }

    pub fn fraction(&mut self, value: Fraction) {
        let mut body = [0u8; 8];
        body[..4].copy_from_slice(&value.num.to_le_bytes());
        body[4..].copy_from_slice(&value.denom.to_le_bytes());
        self.primitive(TYPE_FRACTION, &body);
    }

    /// A NUL-terminated string.
    pub fn string(&mut self, value: &str) {
        self.string_truncated(value, value.len());
    }

    /// A NUL-terminated string, cut to `max_len` bytes on a char boundary.
    pub fn string_truncated(&mut self, value: &str, max_len: usize) {
        let mut len = value.len().min(max_len);
        while !value.is_char_boundary(len) {
            len -= 1;
        }
        self.header(len as u32 + 1, TYPE_STRING);
        self.raw(&value.as_bytes()[..len]);
        self.raw(&[0]);
        self.pad();
    }

    pub fn push_struct(&mut self) -> Frame {
        let frame = Frame { start: self.offset };
        self.header(0, TYPE_STRUCT);
        frame
    }

    pub fn push_object(&mut self, object_type: u32, object_id: u32) -> Frame {
        let frame = Frame { start: self.offset };
        self.header(0, TYPE_OBJECT);
        self.raw(&object_type.to_le_bytes());
        self.raw(&object_id.to_le_bytes());
        frame
    }

    /// Start an object property. The value POD must follow.
    pub fn prop(&mut self, key: u32, flags: u32) {
        self.raw(&key.to_le_bytes());
        self.raw(&flags.to_le_bytes());
    }

    /// Close a container and fill in its body size.
    pub fn pop(&mut self, frame: Frame) {
        let size = self.offset - frame.start - POD_HEADER_SIZE;
        self.patch_u32(frame.start, size as u32);
        self.pad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_is_padded() {
        let mut buf = [0xffu8; 32];
        let mut b = PodBuilder::new(&mut buf);
        b.int(-2);
        let out = b.finish().unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &4u32.to_le_bytes());
        assert_eq!(&out[4..8], &TYPE_INT.to_le_bytes());
        assert_eq!(&out[8..12], &(-2i32).to_le_bytes());
        assert_eq!(&out[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_string_size_counts_terminator() {
        let mut buf = [0u8; 32];
        let mut b = PodBuilder::new(&mut buf);
        b.string("abc");
        let out = b.finish().unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &4u32.to_le_bytes());
        assert_eq!(&out[8..12], b"abc\0");
    }

    #[test]
    fn test_string_truncated_on_char_boundary() {
        let mut buf = [0u8; 32];
        let mut b = PodBuilder::new(&mut buf);
        // 'é' is two bytes; a limit of 2 must not split it.
        b.string_truncated("aé", 2);
        let out = b.finish().unwrap();
        assert_eq!(&out[..4], &2u32.to_le_bytes());
        assert_eq!(&out[8..10], b"a\0");
    }

    #[test]
    fn test_struct_size_patched() {
        let mut buf = [0u8; 64];
        let mut b = PodBuilder::new(&mut buf);
        let f = b.push_struct();
        b.long(1);
        b.int(2);
        b.pop(f);
        let out = b.finish().unwrap();
        assert_eq!(out.len(), 8 + 16 + 16);
        assert_eq!(&out[..4], &32u32.to_le_bytes());
        assert_eq!(&out[4..8], &TYPE_STRUCT.to_le_bytes());
    }

    #[test]
    fn test_object_header() {
        let mut buf = [0u8; 64];
        let mut b = PodBuilder::new(&mut buf);
        let f = b.push_object(0x4000a, 0);
        b.pop(f);
        let out = b.finish().unwrap();
        // Header plus object type and id.
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &8u32.to_le_bytes());
        assert_eq!(&out[8..12], &0x4000au32.to_le_bytes());
    }

    #[test]
    fn test_overflow_reports_required_size() {
        let mut buf = [0u8; 16];
        let mut b = PodBuilder::new(&mut buf);
        b.long(1);
        b.long(2);
        assert_eq!(b.offset(), 32);
        assert_eq!(b.finish(), Err(32));
    }
}
