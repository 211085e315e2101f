//! Positional binary format for scratch pads
//!
//! ## Layout (big-endian)
//!
//! ```text
//! u8   algorithm version
//! u8   natural-order present?  [u32 count, string*]
//! u32  column count, string*   sorted union of all column names
//! cell*                        root cells, one per column
//! level                        root children
//!
//! level := u32 count [u8 node-type tag, (identity cell* level)*]
//! string := u32 byte length, UTF-8
//! ```
//!
//! Every pad references columns by their index in the shared table, so a
//! name is written once per tree instead of once per cell. Version 1 froze
//! accumulators as three doubles (mean, sd, se); version 2 appends the
//! confidence interval. Both are readable, version 2 is written.

use bytes::{Buf, BufMut};
use chrono::DateTime;
use std::collections::{BTreeSet, HashMap};

use super::accumulator::{AccumulatedValues, Accumulator};
use super::{Pad, PadKind, PadLevel, ScratchPad, Status, Value};
use crate::error::{AppError, Result};

/// Version written by [`serialize`]
pub const ALGORITHM_VERSION: u8 = 2;
/// Oldest readable version, frozen accumulators without confidence interval
pub const LEGACY_ALGORITHM_VERSION: u8 = 1;

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN_TRUE: u8 = 1;
    pub const BOOLEAN_FALSE: u8 = 2;
    pub const DOUBLE: u8 = 3;
    pub const INTEGER: u8 = 4;
    pub const STRING: u8 = 5;
    pub const STATUS: u8 = 6;
    pub const DATE: u8 = 7;
    pub const ACCUMULATOR_DYNAMIC: u8 = 8;
    pub const ACCUMULATOR_FROZEN: u8 = 9;
    pub const ACCUMULATOR_STDDEV_SAMPLE: u8 = 10;
    pub const ACCUMULATOR_STDERR: u8 = 11;
}

/// Serialize a scratch pad; grafted children are skipped
pub fn serialize(scratch_pad: &ScratchPad) -> Vec<u8> {
    let columns = column_table(scratch_pad.root());
    let index: HashMap<&str, u32> = columns
        .iter()
        .enumerate()
        .map(|(position, name)| (name.as_str(), position as u32))
        .collect();

    let mut buf = Vec::with_capacity(256);
    buf.put_u8(ALGORITHM_VERSION);

    match scratch_pad.natural_column_order() {
        Some(order) => {
            buf.put_u8(1);
            buf.put_u32(order.len() as u32);
            for name in order {
                put_string(&mut buf, name);
            }
        }
        None => buf.put_u8(0),
    }

    buf.put_u32(columns.len() as u32);
    for name in &columns {
        put_string(&mut buf, name);
    }

    let writer = Writer {
        columns: &columns,
        index: &index,
    };
    writer.write_cells(&mut buf, scratch_pad.root());
    writer.write_level(&mut buf, scratch_pad.root());

    buf
}

/// Rebuild a scratch pad written by [`serialize`]
pub fn deserialize(bytes: &[u8]) -> Result<ScratchPad> {
    let mut reader = Reader { buf: bytes };

    let version = reader.u8()?;
    if version != ALGORITHM_VERSION && version != LEGACY_ALGORITHM_VERSION {
        return Err(AppError::codec_error(format!(
            "unsupported algorithm version {}",
            version
        )));
    }

    let natural_column_order = match reader.u8()? {
        0 => None,
        1 => {
            let count = reader.u32()? as usize;
            let mut order = Vec::with_capacity(count.min(reader.buf.remaining()));
            for _ in 0..count {
                order.push(reader.string()?);
            }
            Some(order)
        }
        other => {
            return Err(AppError::codec_error(format!(
                "invalid natural-order marker {}",
                other
            )))
        }
    };

    let column_count = reader.u32()? as usize;
    let mut columns = Vec::with_capacity(column_count.min(reader.buf.remaining()));
    for _ in 0..column_count {
        columns.push(reader.string()?);
    }

    let mut root = Pad::new(PadKind::Root);
    reader.read_cells(&mut root, &columns, version)?;
    root.children = reader.read_level(&columns, version, None)?;

    if reader.buf.has_remaining() {
        return Err(AppError::codec_error(format!(
            "{} trailing bytes after scratch pad",
            reader.buf.remaining()
        )));
    }

    Ok(ScratchPad::from_parts(root, natural_column_order))
}

/// Column names used anywhere in the tree plus every projection source
fn column_table(root: &Pad) -> Vec<String> {
    let mut names = BTreeSet::new();
    root.walk(&mut |pad| {
        for (name, value) in pad.columns() {
            names.insert(name.to_string());
            if let Value::AccumulatorStdErr { source } | Value::AccumulatorStdDevSample { source } =
                value
            {
                names.insert(source.clone());
            }
        }
    });
    names.into_iter().collect()
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

struct Writer<'a> {
    columns: &'a [String],
    index: &'a HashMap<&'a str, u32>,
}

impl Writer<'_> {
    fn write_level(&self, buf: &mut Vec<u8>, parent: &Pad) {
        let children: Vec<&Pad> = parent
            .children()
            .iter()
            .filter(|child| !child.is_grafted())
            .collect();

        buf.put_u32(children.len() as u32);
        let Some(level) = children.first().and_then(|child| child.level()) else {
            return;
        };
        buf.put_u8(level.tag());

        for child in children {
            self.write_identity(buf, child.kind());
            self.write_cells(buf, child);
            self.write_level(buf, child);
        }
    }

    fn write_identity(&self, buf: &mut Vec<u8>, kind: &PadKind) {
        match kind {
            PadKind::User { name } | PadKind::Project { name } | PadKind::Sample { name } => {
                put_string(buf, name)
            }
            PadKind::Replicate { date } => buf.put_i64(date.timestamp_millis()),
            PadKind::Acquisition { number } | PadKind::Cycle { number } => buf.put_i32(*number),
            PadKind::Root => {}
        }
    }

    fn write_cells(&self, buf: &mut Vec<u8>, pad: &Pad) {
        for column in self.columns {
            match pad.get_value(column) {
                None => buf.put_u8(tag::NULL),
                Some(Value::Boolean(true)) => buf.put_u8(tag::BOOLEAN_TRUE),
                Some(Value::Boolean(false)) => buf.put_u8(tag::BOOLEAN_FALSE),
                Some(Value::Double(value)) => {
                    buf.put_u8(tag::DOUBLE);
                    buf.put_f64(*value);
                }
                Some(Value::Integer(value)) => {
                    buf.put_u8(tag::INTEGER);
                    buf.put_i64(*value);
                }
                Some(Value::String(value)) => {
                    buf.put_u8(tag::STRING);
                    put_string(buf, value);
                }
                Some(Value::Status(status)) => {
                    buf.put_u8(tag::STATUS);
                    buf.put_u8(status.ordinal());
                }
                Some(Value::Date(date)) => {
                    buf.put_u8(tag::DATE);
                    buf.put_i64(date.timestamp_millis());
                }
                Some(Value::Accumulator(Accumulator::Dynamic { recursive })) => {
                    buf.put_u8(tag::ACCUMULATOR_DYNAMIC);
                    buf.put_u8(u8::from(*recursive));
                }
                Some(Value::Accumulator(Accumulator::Frozen(values))) => {
                    buf.put_u8(tag::ACCUMULATOR_FROZEN);
                    buf.put_f64(values.mean);
                    buf.put_f64(values.std_dev);
                    buf.put_f64(values.std_err);
                    buf.put_f64(values.confidence_interval);
                }
                Some(Value::AccumulatorStdDevSample { source }) => {
                    buf.put_u8(tag::ACCUMULATOR_STDDEV_SAMPLE);
                    buf.put_u32(self.index[source.as_str()]);
                }
                Some(Value::AccumulatorStdErr { source }) => {
                    buf.put_u8(tag::ACCUMULATOR_STDERR);
                    buf.put_u32(self.index[source.as_str()]);
                }
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(AppError::codec_error(format!(
                "truncated input while reading {}",
                what
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.ensure(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.ensure(len, "string")?;
        let value = String::from_utf8(self.buf[..len].to_vec())
            .map_err(|e| AppError::codec_error(format!("invalid UTF-8 string: {}", e)))?;
        self.buf.advance(len);
        Ok(value)
    }

    fn date(&mut self) -> Result<chrono::DateTime<chrono::Utc>> {
        let millis = self.i64()?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| AppError::codec_error(format!("date out of range: {}", millis)))
    }

    fn column_ref(&mut self, columns: &[String]) -> Result<String> {
        let position = self.u32()? as usize;
        columns.get(position).cloned().ok_or_else(|| {
            AppError::codec_error(format!("column index {} out of range", position))
        })
    }

    /// Children of a pad at `parent` level, `None` for the root
    fn read_level(
        &mut self,
        columns: &[String],
        version: u8,
        parent: Option<PadLevel>,
    ) -> Result<Vec<Pad>> {
        let count = self.u32()? as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let node_tag = self.u8()?;
        let level = PadLevel::from_tag(node_tag)
            .ok_or_else(|| AppError::codec_error(format!("unknown node type {}", node_tag)))?;
        if let Some(parent) = parent {
            if level >= parent {
                return Err(AppError::codec_error(format!(
                    "{} children under a {} pad",
                    level, parent
                )));
            }
        }

        let mut pads = Vec::with_capacity(count.min(self.buf.remaining()));
        for _ in 0..count {
            let kind = match level {
                PadLevel::User => PadKind::User {
                    name: self.string()?,
                },
                PadLevel::Project => PadKind::Project {
                    name: self.string()?,
                },
                PadLevel::Sample => PadKind::Sample {
                    name: self.string()?,
                },
                PadLevel::Replicate => PadKind::Replicate { date: self.date()? },
                PadLevel::Acquisition => PadKind::Acquisition {
                    number: self.i32()?,
                },
                PadLevel::Cycle => PadKind::Cycle {
                    number: self.i32()?,
                },
            };

            let mut pad = Pad::new(kind);
            self.read_cells(&mut pad, columns, version)?;
            pad.children = self.read_level(columns, version, Some(level))?;
            pads.push(pad);
        }
        Ok(pads)
    }

    fn read_cells(&mut self, pad: &mut Pad, columns: &[String], version: u8) -> Result<()> {
        for column in columns {
            let cell_tag = self.u8()?;
            let value = match cell_tag {
                tag::NULL => continue,
                tag::BOOLEAN_TRUE => Value::Boolean(true),
                tag::BOOLEAN_FALSE => Value::Boolean(false),
                tag::DOUBLE => Value::Double(self.f64()?),
                tag::INTEGER => Value::Integer(self.i64()?),
                tag::STRING => Value::String(self.string()?),
                tag::STATUS => {
                    let ordinal = self.u8()?;
                    Value::Status(Status::from_ordinal(ordinal).ok_or_else(|| {
                        AppError::codec_error(format!("unknown status ordinal {}", ordinal))
                    })?)
                }
                tag::DATE => Value::Date(self.date()?),
                tag::ACCUMULATOR_DYNAMIC => Value::Accumulator(Accumulator::Dynamic {
                    recursive: self.u8()? != 0,
                }),
                tag::ACCUMULATOR_FROZEN => {
                    let mean = self.f64()?;
                    let std_dev = self.f64()?;
                    let std_err = self.f64()?;
                    let confidence_interval = if version >= ALGORITHM_VERSION {
                        self.f64()?
                    } else {
                        f64::NAN
                    };
                    Value::Accumulator(Accumulator::Frozen(AccumulatedValues::new(
                        mean,
                        std_dev,
                        std_err,
                        confidence_interval,
                    )))
                }
                tag::ACCUMULATOR_STDDEV_SAMPLE => Value::AccumulatorStdDevSample {
                    source: self.column_ref(columns)?,
                },
                tag::ACCUMULATOR_STDERR => Value::AccumulatorStdErr {
                    source: self.column_ref(columns)?,
                },
                other => {
                    return Err(AppError::codec_error(format!(
                        "unknown cell tag {} in column '{}'",
                        other, column
                    )))
                }
            };
            pad.columns.insert(column.clone(), value);
        }
        Ok(())
    }
}
