//! Profile record wire format.
//!
//! Records are SPA-style PODs, little-endian. Every POD is
//! `[u32 size][u32 type][body][padding to 8 bytes]` where `size` counts the
//! body only. A record is an Object whose properties are Structs; a flush
//! batch is a Struct wrapping any number of concatenated records.

use std::fmt;

use crate::graph::Fraction;
use crate::record::{Block, ClockSection, InfoSection, ProfileRecord};

pub const TYPE_INT: u32 = 4;
pub const TYPE_LONG: u32 = 5;
pub const TYPE_FLOAT: u32 = 6;
pub const TYPE_DOUBLE: u32 = 7;
pub const TYPE_STRING: u32 = 8;
pub const TYPE_FRACTION: u32 = 11;
pub const TYPE_STRUCT: u32 = 14;
pub const TYPE_OBJECT: u32 = 15;

/// Object type of a profile record.
pub const OBJECT_PROFILER: u32 = 0x4000a;

pub const PROFILER_INFO: u32 = 0x10001;
pub const PROFILER_CLOCK: u32 = 0x10002;
pub const PROFILER_DRIVER_BLOCK: u32 = 0x10003;
pub const PROFILER_FOLLOWER_BLOCK: u32 = 0x20001;

/// Size of a POD header.
pub const POD_HEADER_SIZE: usize = 8;

/// Round `n` up to the POD alignment.
pub const fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

/// Error while decoding profile data.
#[derive(Debug, Clone, PartialEq)]
pub enum PodError {
    /// Data ended before a POD or field was complete.
    Truncated { offset: usize, needed: usize },
    /// A POD had a different type than the format requires.
    UnexpectedType { offset: usize, expected: u32, found: u32 },
    /// An object was not a profile record.
    UnexpectedObject { offset: usize, object_type: u32 },
    /// A string was not NUL terminated or not UTF-8.
    BadString { offset: usize },
    /// A record had no info, clock or driver section.
    MissingSection { counter: Option<i64>, key: u32 },
}

impl fmt::Display for PodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset, needed } => {
                write!(f, "truncated pod at offset {}: need {} more bytes", offset, needed)
            }
            Self::UnexpectedType { offset, expected, found } => write!(
                f,
                "unexpected pod type at offset {}: expected {}, found {}",
                offset, expected, found
            ),
            Self::UnexpectedObject { offset, object_type } => {
                write!(f, "unexpected object type {:#x} at offset {}", object_type, offset)
            }
            Self::BadString { offset } => write!(f, "malformed string at offset {}", offset),
            Self::MissingSection { counter, key } => match counter {
                Some(c) => write!(f, "record {} has no section {:#x}", c, key),
                None => write!(f, "record has no section {:#x}", key),
            },
        }
    }
}

impl std::error::Error for PodError {}

/// Sequential reader over a run of PODs.
struct PodReader<'a> {
    data: &'a [u8],
    /// Offset of `data[0]` in the outermost buffer, for error messages
    base: usize,
    pos: usize,
}

impl<'a> PodReader<'a> {
    fn new(data: &'a [u8], base: usize) -> Self {
        Self { data, base, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PodError> {
        let remaining = self.data.len().saturating_sub(self.pos);
        if remaining < n {
            return Err(PodError::Truncated {
                offset: self.offset(),
                needed: n - remaining,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, PodError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read one POD, returning its type, body and the body offset.
    fn pod(&mut self) -> Result<(u32, &'a [u8], usize), PodError> {
        let size = self.u32()? as usize;
        let ty = self.u32()?;
        let body_offset = self.offset();
        let body = self.take(size)?;
        // Trailing padding of the final POD may be absent.
        let padding = pad8(size) - size;
        self.pos = (self.pos + padding).min(self.data.len());
        Ok((ty, body, body_offset))
    }

    fn expect(&mut self, expected: u32) -> Result<(&'a [u8], usize), PodError> {
        let offset = self.offset();
        let (ty, body, body_offset) = self.pod()?;
        if ty != expected {
            return Err(PodError::UnexpectedType { offset, expected, found: ty });
        }
        if body.len() < fixed_size(expected) {
            return Err(PodError::Truncated {
                offset: body_offset,
                needed: fixed_size(expected) - body.len(),
            });
        }
        Ok((body, body_offset))
    }

    fn int(&mut self) -> Result<i32, PodError> {
        let (b, _) = self.expect(TYPE_INT)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn long(&mut self) -> Result<i64, PodError> {
        let (b, _) = self.expect(TYPE_LONG)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[..8]);
        Ok(i64::from_le_bytes(raw))
    }

    fn float(&mut self) -> Result<f32, PodError> {
        let (b, _) = self.expect(TYPE_FLOAT)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn double(&mut self) -> Result<f64, PodError> {
        let (b, _) = self.expect(TYPE_DOUBLE)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[..8]);
        Ok(f64::from_le_bytes(raw))
    }

    fn fraction(&mut self) -> Result<Fraction, PodError> {
        let (b, _) = self.expect(TYPE_FRACTION)?;
        Ok(Fraction {
            num: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            denom: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        })
    }

    fn string(&mut self) -> Result<String, PodError> {
        let (b, offset) = self.expect(TYPE_STRING)?;
        let end = b
            .iter()
            .position(|&c| c == 0)
            .ok_or(PodError::BadString { offset })?;
        std::str::from_utf8(&b[..end])
            .map(str::to_string)
            .map_err(|_| PodError::BadString { offset })
    }
}

fn fixed_size(ty: u32) -> usize {
    match ty {
        TYPE_INT | TYPE_FLOAT => 4,
        TYPE_LONG | TYPE_DOUBLE | TYPE_FRACTION => 8,
        TYPE_STRING => 1,
        _ => 0,
    }
}

/// Parse a flush batch: a Struct POD wrapping concatenated records.
pub fn parse_batch(data: &[u8]) -> Result<Vec<ProfileRecord>, PodError> {
    let mut reader = PodReader::new(data, 0);
    let (body, body_offset) = reader.expect(TYPE_STRUCT)?;
    parse_records_at(body, body_offset)
}

/// Parse a run of concatenated records without the batch wrapper.
pub fn parse_records(data: &[u8]) -> Result<Vec<ProfileRecord>, PodError> {
    parse_records_at(data, 0)
}

fn parse_records_at(data: &[u8], base: usize) -> Result<Vec<ProfileRecord>, PodError> {
    let mut reader = PodReader::new(data, base);
    let mut records = Vec::new();
    while !reader.is_empty() {
        let offset = reader.offset();
        let (body, body_offset) = reader.expect(TYPE_OBJECT)?;
        records.push(parse_object(body, body_offset, offset)?);
    }
    Ok(records)
}

fn parse_object(body: &[u8], base: usize, offset: usize) -> Result<ProfileRecord, PodError> {
    let mut reader = PodReader::new(body, base);
    let object_type = reader.u32()?;
    let _object_id = reader.u32()?;
    if object_type != OBJECT_PROFILER {
        return Err(PodError::UnexpectedObject { offset, object_type });
    }

    let mut info = None;
    let mut clock = None;
    let mut driver = None;
    let mut followers = Vec::new();

    while !reader.is_empty() {
        let key = reader.u32()?;
        let _flags = reader.u32()?;
        let value_offset = reader.offset();
        let (ty, value, value_body) = reader.pod()?;
        if ty != TYPE_STRUCT {
            // Unknown or future properties may carry any type.
            if matches!(
                key,
                PROFILER_INFO | PROFILER_CLOCK | PROFILER_DRIVER_BLOCK | PROFILER_FOLLOWER_BLOCK
            ) {
                return Err(PodError::UnexpectedType {
                    offset: value_offset,
                    expected: TYPE_STRUCT,
                    found: ty,
                });
            }
            continue;
        }
        let mut fields = PodReader::new(value, value_body);
        match key {
            PROFILER_INFO => info = Some(parse_info(&mut fields)?),
            PROFILER_CLOCK => clock = Some(parse_clock(&mut fields)?),
            PROFILER_DRIVER_BLOCK => driver = Some(parse_block(&mut fields)?),
            PROFILER_FOLLOWER_BLOCK => followers.push(parse_block(&mut fields)?),
            _ => {}
        }
    }

    let info = info.ok_or(PodError::MissingSection { counter: None, key: PROFILER_INFO })?;
    let counter = Some(info.counter);
    Ok(ProfileRecord {
        clock: clock.ok_or(PodError::MissingSection { counter, key: PROFILER_CLOCK })?,
        driver: driver.ok_or(PodError::MissingSection { counter, key: PROFILER_DRIVER_BLOCK })?,
        info,
        followers,
    })
}

fn parse_info(r: &mut PodReader<'_>) -> Result<InfoSection, PodError> {
    Ok(InfoSection {
        counter: r.long()?,
        cpu_load: [r.float()?, r.float()?, r.float()?],
        xrun_count: r.int()?,
    })
}

fn parse_clock(r: &mut PodReader<'_>) -> Result<ClockSection, PodError> {
    Ok(ClockSection {
        flags: r.int()? as u32,
        id: r.int()? as u32,
        name: r.string()?,
        nsec: r.long()?,
        rate: r.fraction()?,
        position: r.long()?,
        duration: r.long()?,
        delay: r.long()?,
        rate_diff: r.double()?,
        next_nsec: r.long()?,
    })
}

fn parse_block(r: &mut PodReader<'_>) -> Result<Block, PodError> {
    Ok(Block {
        id: r.int()? as u32,
        name: r.string()?,
        prev_signal_time: r.long()?,
        signal_time: r.long()?,
        awake_time: r.long()?,
        finish_time: r.long()?,
        status: r.int()?,
        latency: r.fraction()?,
        xrun_count: r.int()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(out: &mut Vec<u8>, ty: u32, body: &[u8]) {
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(body);
        out.resize(pad8(out.len()), 0);
    }

    fn int(out: &mut Vec<u8>, v: i32) {
        pod(out, TYPE_INT, &v.to_le_bytes());
    }

    fn long(out: &mut Vec<u8>, v: i64) {
        pod(out, TYPE_LONG, &v.to_le_bytes());
    }

    fn string(out: &mut Vec<u8>, s: &str) {
        let mut body = s.as_bytes().to_vec();
        body.push(0);
        pod(out, TYPE_STRING, &body);
    }

    fn fraction(out: &mut Vec<u8>, num: u32, denom: u32) {
        let mut body = num.to_le_bytes().to_vec();
        body.extend_from_slice(&denom.to_le_bytes());
        pod(out, TYPE_FRACTION, &body);
    }

    fn block(id: i32, name: &str) -> Vec<u8> {
        let mut s = Vec::new();
        int(&mut s, id);
        string(&mut s, name);
        for t in [10, 20, 30, 40] {
            long(&mut s, t);
        }
        int(&mut s, 3);
        fraction(&mut s, 256, 48000);
        int(&mut s, 0);
        s
    }

    fn record(counter: i64, extra: Option<(u32, Vec<u8>)>) -> Vec<u8> {
        let mut info = Vec::new();
        long(&mut info, counter);
        for load in [0.1f32, 0.2, 0.3] {
            pod(&mut info, TYPE_FLOAT, &load.to_le_bytes());
        }
        int(&mut info, 2);

        let mut clock = Vec::new();
        int(&mut clock, 0);
        int(&mut clock, 30);
        string(&mut clock, "clock.system.monotonic");
        long(&mut clock, 1_000);
        fraction(&mut clock, 1, 48000);
        long(&mut clock, 4096);
        long(&mut clock, 256);
        long(&mut clock, 0);
        pod(&mut clock, TYPE_DOUBLE, &1.0f64.to_le_bytes());
        long(&mut clock, 6_333);

        let mut props = Vec::new();
        props.extend_from_slice(&OBJECT_PROFILER.to_le_bytes());
        props.extend_from_slice(&0u32.to_le_bytes());
        let mut sections = vec![
            (PROFILER_INFO, info),
            (PROFILER_CLOCK, clock),
            (PROFILER_DRIVER_BLOCK, block(30, "alsa_output")),
            (PROFILER_FOLLOWER_BLOCK, block(41, "player")),
        ];
        if let Some(extra) = extra {
            sections.push(extra);
        }
        for (key, body) in sections {
            props.extend_from_slice(&key.to_le_bytes());
            props.extend_from_slice(&0u32.to_le_bytes());
            pod(&mut props, TYPE_STRUCT, &body);
        }

        let mut out = Vec::new();
        pod(&mut out, TYPE_OBJECT, &props);
        out
    }

    #[test]
    fn parses_batch_of_two_records() {
        let mut records = record(7, None);
        records.extend(record(9, None));
        let mut batch = Vec::new();
        pod(&mut batch, TYPE_STRUCT, &records);

        let parsed = parse_batch(&batch).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].info.counter, 7);
        assert_eq!(parsed[0].info.xrun_count, 2);
        assert_eq!(parsed[0].clock.name, "clock.system.monotonic");
        assert_eq!(parsed[0].clock.rate, Fraction::new(1, 48000));
        assert_eq!(parsed[0].driver.name, "alsa_output");
        assert_eq!(parsed[0].followers.len(), 1);
        assert_eq!(parsed[0].followers[0].id, 41);
        assert_eq!(parsed[0].followers[0].latency, Fraction::new(256, 48000));
        assert_eq!(parsed[0].gap_to(&parsed[1]), 1);
    }

    #[test]
    fn skips_unknown_properties() {
        let mut extra = Vec::new();
        long(&mut extra, 99);
        let data = record(1, Some((0x1000001, extra)));
        let parsed = parse_records(&data).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].followers.len(), 1);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let data = record(1, None);
        let err = parse_records(&data[..data.len() - 16]).unwrap_err();
        assert!(matches!(err, PodError::Truncated { .. }), "{:?}", err);
    }

    #[test]
    fn wrong_wrapper_type_is_an_error() {
        let data = record(1, None);
        let err = parse_batch(&data).unwrap_err();
        assert_eq!(
            err,
            PodError::UnexpectedType { offset: 0, expected: TYPE_STRUCT, found: TYPE_OBJECT }
        );
    }

    #[test]
    fn empty_batch_has_no_records() {
        let mut batch = Vec::new();
        pod(&mut batch, TYPE_STRUCT, &[]);
        assert!(parse_batch(&batch).unwrap().is_empty());
    }
}
