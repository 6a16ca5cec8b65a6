// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Binary row layout for byte-oriented backends.
//!
//! ```text
//! | id: i32 | present: u8 | cint: i32 | clong: i64 | cfloat: f32 | cdouble: f64 | aid: i32 | cvarbinary | cvarchar |
//! ```
//!
//! All integers are little endian. Bit `i` of `present` is set when column
//! `i` of the entity is non-NULL; absent columns take no space. Variable
//! length columns are length prefixed, with a one byte prefix when the
//! column's maximum encoded size fits in a byte and a two byte prefix
//! otherwise.

use std::io::Write;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, ConfigError};
use crate::model::{Column, Entity, Row};

const SHORT_PREFIX_MAX: usize = u8::MAX as usize;
const LONG_PREFIX_MAX: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    pub fn max_bytes_per_char(self) -> usize {
        match self {
            Charset::Utf8 => 4,
            Charset::Latin1 => 1,
        }
    }
}

impl FromStr for Charset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Charset::Utf8),
            "latin1" | "iso-8859-1" => Ok(Charset::Latin1),
            _ => Err(ConfigError::UnknownCharset(s.to_string())),
        }
    }
}

/// Character encoder/decoder for varchar columns.
///
/// A transcoder belongs to one session; it keeps its scratch buffer between
/// calls so encoding a column does not allocate.
#[derive(Debug)]
pub struct Transcoder {
    charset: Charset,
    scratch: Vec<u8>,
}

impl Transcoder {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            scratch: Vec::new(),
        }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn encode(&mut self, s: &str) -> Result<&[u8], CodecError> {
        self.scratch.clear();
        match self.charset {
            Charset::Utf8 => self.scratch.extend_from_slice(s.as_bytes()),
            Charset::Latin1 => {
                for c in s.chars() {
                    let b = u8::try_from(u32::from(c)).map_err(|_| CodecError::Unmappable(c))?;
                    self.scratch.push(b);
                }
            }
        }
        Ok(&self.scratch)
    }

    pub fn decode(&self, bytes: &[u8], column: Column) -> Result<String, CodecError> {
        match self.charset {
            Charset::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| CodecError::InvalidUtf8(column)),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Encodes and decodes full rows of one entity.
#[derive(Debug)]
pub struct RowCodec {
    entity: Entity,
    max_varbinary_bytes: usize,
    max_varchar_chars: usize,
    transcoder: Transcoder,
}

impl RowCodec {
    pub fn new(
        entity: Entity,
        max_varbinary_bytes: usize,
        max_varchar_chars: usize,
        transcoder: Transcoder,
    ) -> Self {
        Self {
            entity,
            max_varbinary_bytes,
            max_varchar_chars,
            transcoder,
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    fn max_varchar_bytes(&self) -> usize {
        self.max_varchar_chars
            .saturating_mul(self.transcoder.charset().max_bytes_per_char())
            .min(LONG_PREFIX_MAX)
    }

    fn max_encoded(&self, column: Column) -> usize {
        match column {
            Column::Cvarbinary => self.max_varbinary_bytes,
            Column::Cvarchar => self.max_varchar_bytes(),
            _ => 0,
        }
    }

    pub fn encode(&mut self, row: &Row) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(32);
        out.write_i32::<LittleEndian>(row.id)?;

        let mut present = 0u8;
        for (i, &column) in self.entity.columns().iter().enumerate() {
            if !matches!(row.get(column), crate::model::Value::Null) {
                present |= 1 << i;
            }
        }
        out.write_u8(present)?;

        if let Some(v) = row.cint {
            out.write_i32::<LittleEndian>(v)?;
        }
        if let Some(v) = row.clong {
            out.write_i64::<LittleEndian>(v)?;
        }
        if let Some(v) = row.cfloat {
            out.write_f32::<LittleEndian>(v)?;
        }
        if let Some(v) = row.cdouble {
            out.write_f64::<LittleEndian>(v)?;
        }
        if self.entity == Entity::B {
            if let Some(v) = row.aid {
                out.write_i32::<LittleEndian>(v)?;
            }
            if let Some(v) = &row.cvarbinary {
                let max = self.max_encoded(Column::Cvarbinary);
                write_prefixed(&mut out, Column::Cvarbinary, v, max)?;
            }
            if let Some(v) = &row.cvarchar {
                let max = self.max_encoded(Column::Cvarchar);
                if v.chars().count() > self.max_varchar_chars {
                    return Err(CodecError::TooLong {
                        column: Column::Cvarchar,
                        len: v.chars().count(),
                        max: self.max_varchar_chars,
                    });
                }
                let bytes = self.transcoder.encode(v)?;
                write_prefixed(&mut out, Column::Cvarchar, bytes, max)?;
            }
        }
        Ok(out)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Row, CodecError> {
        let mut reader = Reader::new(buf);
        let mut row = Row::new(reader.i32()?);

        let present = reader.u8()?;
        let column_count = self.entity.columns().len();
        if u32::from(present) >> column_count != 0 {
            return Err(CodecError::Bitmap(present));
        }
        let has = |column: Column| {
            self.entity
                .columns()
                .iter()
                .position(|c| *c == column)
                .is_some_and(|i| present & (1 << i) != 0)
        };

        if has(Column::Cint) {
            row.cint = Some(reader.i32()?);
        }
        if has(Column::Clong) {
            row.clong = Some(reader.i64()?);
        }
        if has(Column::Cfloat) {
            row.cfloat = Some(reader.f32()?);
        }
        if has(Column::Cdouble) {
            row.cdouble = Some(reader.f64()?);
        }
        if has(Column::Aid) {
            row.aid = Some(reader.i32()?);
        }
        if has(Column::Cvarbinary) {
            let max = self.max_encoded(Column::Cvarbinary);
            row.cvarbinary = Some(reader.prefixed(Column::Cvarbinary, max)?.to_vec());
        }
        if has(Column::Cvarchar) {
            let max = self.max_encoded(Column::Cvarchar);
            let bytes = reader.prefixed(Column::Cvarchar, max)?;
            row.cvarchar = Some(self.transcoder.decode(bytes, Column::Cvarchar)?);
        }

        match reader.remaining() {
            0 => Ok(row),
            n => Err(CodecError::Trailing(n)),
        }
    }
}

fn write_prefixed(
    out: &mut Vec<u8>,
    column: Column,
    bytes: &[u8],
    max: usize,
) -> Result<(), CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLong {
            column,
            len: bytes.len(),
            max,
        });
    }
    if max <= SHORT_PREFIX_MAX {
        out.write_u8(bytes.len() as u8)?;
    } else {
        out.write_u16::<LittleEndian>(bytes.len() as u16)?;
    }
    out.write_all(bytes)?;
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                offset: self.total - self.buf.len(),
                needed: n - self.buf.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.read_u8()?)
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.read_i32::<LittleEndian>()?)
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.read_i64::<LittleEndian>()?)
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        self.need(4)?;
        Ok(self.buf.read_f32::<LittleEndian>()?)
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        self.need(8)?;
        Ok(self.buf.read_f64::<LittleEndian>()?)
    }

    fn prefixed(&mut self, column: Column, max: usize) -> Result<&'a [u8], CodecError> {
        let len = if max <= SHORT_PREFIX_MAX {
            usize::from(self.u8()?)
        } else {
            self.need(2)?;
            usize::from(self.buf.read_u16::<LittleEndian>()?)
        };
        if len > max {
            return Err(CodecError::TooLong { column, len, max });
        }
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{varbinary_value, varchar_value};
    use proptest::prelude::*;

    fn b_codec(max_bin: usize, max_char: usize, charset: Charset) -> RowCodec {
        RowCodec::new(Entity::B, max_bin, max_char, Transcoder::new(charset))
    }

    fn full_b_row(id: i32, len: usize) -> Row {
        Row {
            id,
            cint: Some(id),
            clong: Some(i64::from(id)),
            cfloat: Some(id as f32),
            cdouble: Some(f64::from(id)),
            aid: Some(id),
            cvarbinary: Some(varbinary_value(id, len)),
            cvarchar: Some(varchar_value(id, len)),
        }
    }

    #[test]
    fn short_prefix_layout() {
        let mut codec = b_codec(10, 10, Charset::Latin1);
        let mut row = Row::new(1);
        row.cvarbinary = Some(vec![9, 8]);
        let buf = codec.encode(&row).unwrap();
        // id, bitmap with only cvarbinary (bit 5), one byte prefix, payload
        assert_eq!(buf, vec![1, 0, 0, 0, 0b0010_0000, 2, 9, 8]);
        assert_eq!(codec.decode(&buf).unwrap(), row);
    }

    #[test]
    fn long_prefix_used_past_255() {
        let mut codec = b_codec(1000, 0, Charset::Utf8);
        let mut row = Row::new(2);
        row.cvarbinary = Some(varbinary_value(2, 300));
        let buf = codec.encode(&row).unwrap();
        assert_eq!(buf.len(), 4 + 1 + 2 + 300);
        assert_eq!(&buf[5..7], &300u16.to_le_bytes());
        assert_eq!(codec.decode(&buf).unwrap(), row);
    }

    #[test]
    fn utf8_varchar_widens_prefix() {
        // 100 chars may take 400 bytes in utf8
        let mut codec = b_codec(0, 100, Charset::Utf8);
        let mut row = Row::new(3);
        row.cvarchar = Some("é".repeat(100));
        let buf = codec.encode(&row).unwrap();
        assert_eq!(codec.decode(&buf).unwrap(), row);
    }

    #[test]
    fn rejects_overlong_values() {
        let mut codec = b_codec(4, 4, Charset::Latin1);
        let mut row = Row::new(1);
        row.cvarbinary = Some(vec![0; 5]);
        assert!(matches!(
            codec.encode(&row),
            Err(CodecError::TooLong {
                column: Column::Cvarbinary,
                len: 5,
                max: 4
            })
        ));

        let mut row = Row::new(1);
        row.cvarchar = Some("abcde".into());
        assert!(matches!(codec.encode(&row), Err(CodecError::TooLong { .. })));
    }

    #[test]
    fn latin1_rejects_wide_chars() {
        let mut transcoder = Transcoder::new(Charset::Latin1);
        assert_eq!(transcoder.encode("ÿ").unwrap(), &[0xff]);
        assert_eq!(transcoder.encode("€"), Err(CodecError::Unmappable('€')));
        assert_eq!(
            transcoder.decode(&[0x61, 0xe9], Column::Cvarchar).unwrap(),
            "aé"
        );
    }

    #[test]
    fn decode_reports_truncation_and_garbage() {
        let mut codec = b_codec(10, 10, Charset::Utf8);
        let buf = codec.encode(&full_b_row(5, 3)).unwrap();
        assert!(matches!(
            codec.decode(&buf[..buf.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));

        let mut extended = buf.clone();
        extended.push(0);
        assert_eq!(codec.decode(&extended), Err(CodecError::Trailing(1)));

        let a_codec = RowCodec::new(Entity::A, 0, 0, Transcoder::new(Charset::Utf8));
        assert_eq!(
            a_codec.decode(&[0, 0, 0, 0, 0b1000_0000]),
            Err(CodecError::Bitmap(0b1000_0000))
        );
    }

    proptest! {
        #[test]
        fn b_rows_survive_encoding(id in any::<i32>(), len in 0usize..300, nulls in any::<u8>()) {
            let mut row = full_b_row(id, len);
            for (i, column) in Column::ALL.iter().enumerate() {
                if nulls & (1 << i) != 0 {
                    row.set(*column, crate::model::Value::Null).unwrap();
                }
            }
            let mut codec = b_codec(300, 300, Charset::Latin1);
            let buf = codec.encode(&row).unwrap();
            prop_assert_eq!(codec.decode(&buf).unwrap(), row);
        }

        #[test]
        fn decode_never_panics(buf in proptest::collection::vec(any::<u8>(), 0..64)) {
            let codec = b_codec(20, 20, Charset::Utf8);
            let _ = codec.decode(&buf);
        }
    }
}
