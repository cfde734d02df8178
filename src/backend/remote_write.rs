//! Remote-write wire encoding
//!
//! Hand-rolled protobuf for the four messages Prometheus remote write needs:
//!
//! ```text
//! WriteRequest { repeated TimeSeries timeseries = 1; }
//! TimeSeries   { repeated Label labels = 1; repeated Sample samples = 2; }
//! Label        { string name = 1; string value = 2; }
//! Sample       { double value = 1; int64 timestamp = 2; }
//! ```
//!
//! Field key = `(field_number << 3) | wire_type`. Embedded messages and
//! strings are length-delimited (varint length + bytes), the sample value is
//! a little-endian IEEE-754 double and the timestamp an int64 varint.
//! Labels are emitted sorted by name; the body is snappy block-compressed.

use crate::dataset::Labels;
use crate::error::{ReplayError, ReplayResult};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;

pub const CONTENT_TYPE: &str = "application/x-protobuf";
pub const CONTENT_ENCODING: &str = "snappy";
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp_ms: i64,
}

/// One label set and its samples, ordered by timestamp on encode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: Labels) -> Self {
        Self {
            labels,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, timestamp_ms: i64, value: f64) {
        self.samples.push(Sample {
            value,
            timestamp_ms,
        });
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut scratch = Vec::with_capacity(64);
        for (name, value) in &self.labels {
            scratch.clear();
            put_string(&mut scratch, 1, name);
            put_string(&mut scratch, 2, value);
            put_message(buf, 1, &scratch);
        }

        let mut ordered = self.samples.clone();
        ordered.sort_by_key(|s| s.timestamp_ms);
        for sample in &ordered {
            scratch.clear();
            put_key(&mut scratch, 1, WIRE_FIXED64);
            scratch.extend_from_slice(&sample.value.to_le_bytes());
            put_key(&mut scratch, 2, WIRE_VARINT);
            put_varint(&mut scratch, sample.timestamp_ms as u64);
            put_message(buf, 2, &scratch);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteRequest {
    pub timeseries: Vec<TimeSeries>,
}

impl WriteRequest {
    pub fn sample_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.samples.len()).sum()
    }

    /// Uncompressed protobuf bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.sample_count() * 24 + 64);
        let mut series = Vec::with_capacity(256);
        for ts in &self.timeseries {
            series.clear();
            ts.encode_into(&mut series);
            put_message(&mut buf, 1, &series);
        }
        buf
    }

    /// Protobuf bytes compressed with the snappy block format.
    pub fn encode_snappy(&self) -> ReplayResult<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(&self.encode())
            .map_err(|e| ReplayError::backend("prometheus", format!("snappy compression failed: {}", e)))
    }
}

#[inline]
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[inline]
fn put_key(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, u64::from(field << 3 | u32::from(wire_type)));
}

fn put_bytes(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_key(buf, field, WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_string(buf: &mut Vec<u8>, field: u32, s: &str) {
    put_bytes(buf, field, s.as_bytes());
}

fn put_message(buf: &mut Vec<u8>, field: u32, encoded: &[u8]) {
    put_bytes(buf, field, encoded);
}
