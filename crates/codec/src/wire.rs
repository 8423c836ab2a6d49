//! Protobuf wire-format primitives and the schema-driven walkers.

use indexmap::IndexMap;

use crate::{
    CodecError,
    schema::{Field, Kind, MessageDescriptor},
    value::Value,
};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

const MAX_NESTING: usize = 24;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
            self.pos += 1;

            if shift >= 64 {
                return Err(CodecError::Truncated);
            }

            value |= u64::from(byte & 0x7f) << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;

        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }

        let slice = &self.buf[self.pos..end];
        self.pos = end;

        Ok(slice)
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            buf.push(byte);
            return;
        }

        buf.push(byte | 0x80);
    }
}

fn write_tag(buf: &mut Vec<u8>, number: u32, wire_type: u8) {
    write_varint(buf, (u64::from(number) << 3) | u64::from(wire_type));
}

fn write_len_prefixed(buf: &mut Vec<u8>, payload: &[u8]) {
    write_varint(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

fn mismatch(field: &Field, expected: &'static str) -> CodecError {
    CodecError::FieldMismatch {
        field: field.name,
        expected,
    }
}

pub(crate) fn encode_message(value: &Value, descriptor: &MessageDescriptor, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let Some(map) = value.as_map() else {
        return Err(CodecError::FieldMismatch {
            field: "<message>",
            expected: "a map",
        });
    };

    for field in descriptor.fields {
        let Some(value) = map.get(field.name) else {
            continue;
        };

        if matches!(value, Value::Null) {
            continue;
        }

        if field.repeated {
            match value {
                Value::List(items) => {
                    for item in items {
                        encode_field(field, item, buf)?;
                    }
                }
                other => encode_field(field, other, buf)?,
            }
        } else {
            encode_field(field, value, buf)?;
        }
    }

    for key in map.keys() {
        if !descriptor.fields.iter().any(|f| f.name == key) {
            log::debug!("codec: dropping unknown field '{key}' during encode");
        }
    }

    Ok(())
}

fn encode_field(field: &Field, value: &Value, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    match &field.kind {
        Kind::Text => {
            let text = value.as_text().ok_or_else(|| mismatch(field, "text"))?;
            write_tag(buf, field.number, WIRE_LEN);
            write_len_prefixed(buf, text.as_bytes());
        }
        Kind::Bool => {
            let flag = value.as_bool().ok_or_else(|| mismatch(field, "a boolean"))?;
            write_tag(buf, field.number, WIRE_VARINT);
            write_varint(buf, u64::from(flag));
        }
        Kind::Int => {
            let int = value.as_int().ok_or_else(|| mismatch(field, "an integer"))?;
            write_tag(buf, field.number, WIRE_VARINT);
            write_varint(buf, int as u64);
        }
        Kind::Float => {
            let float = value.as_f64().ok_or_else(|| mismatch(field, "a number"))?;
            write_tag(buf, field.number, WIRE_FIXED64);
            buf.extend_from_slice(&float.to_bits().to_le_bytes());
        }
        Kind::Bytes => {
            let bytes = value.as_bytes().ok_or_else(|| mismatch(field, "bytes"))?;
            write_tag(buf, field.number, WIRE_LEN);
            write_len_prefixed(buf, bytes);
        }
        Kind::Json => {
            let json = serde_json::to_string(&value.to_json())?;
            write_tag(buf, field.number, WIRE_LEN);
            write_len_prefixed(buf, json.as_bytes());
        }
        Kind::Message(descriptor) => {
            let mut nested = Vec::new();
            encode_message(value, descriptor, &mut nested)?;
            write_tag(buf, field.number, WIRE_LEN);
            write_len_prefixed(buf, &nested);
        }
        Kind::Map(descriptor) => {
            let map = value.as_map().ok_or_else(|| mismatch(field, "a map"))?;

            for (key, entry) in map {
                let mut entry_buf = Vec::new();
                write_tag(&mut entry_buf, 1, WIRE_LEN);
                write_len_prefixed(&mut entry_buf, key.as_bytes());

                let mut nested = Vec::new();
                encode_message(entry, descriptor, &mut nested)?;
                write_tag(&mut entry_buf, 2, WIRE_LEN);
                write_len_prefixed(&mut entry_buf, &nested);

                write_tag(buf, field.number, WIRE_LEN);
                write_len_prefixed(buf, &entry_buf);
            }
        }
    }

    Ok(())
}

pub(crate) fn decode_message(bytes: &[u8], descriptor: &MessageDescriptor) -> Result<Value, CodecError> {
    let mut reader = Reader::new(bytes);
    let mut out: IndexMap<String, Value> = IndexMap::new();

    while !reader.is_empty() {
        let key = reader.varint()?;
        let number = (key >> 3) as u32;
        let wire_type = (key & 0x7) as u8;

        let Some(field) = descriptor.fields.iter().find(|f| f.number == number) else {
            log::debug!("codec: skipping unknown field number {number}");
            skip_field(&mut reader, wire_type)?;
            continue;
        };

        let decoded = decode_field(&mut reader, field, wire_type)?;
        store_field(&mut out, field, decoded);
    }

    Ok(Value::Map(out))
}

fn store_field(out: &mut IndexMap<String, Value>, field: &Field, decoded: Value) {
    if let Kind::Map(_) = field.kind {
        // decoded is a single-entry map; merge into the accumulated map.
        match out.get_mut(field.name) {
            Some(Value::Map(existing)) => {
                if let Value::Map(entry) = decoded {
                    existing.extend(entry);
                }
            }
            _ => {
                out.insert(field.name.to_owned(), decoded);
            }
        }
        return;
    }

    if field.repeated {
        match out.get_mut(field.name) {
            Some(Value::List(items)) => items.push(decoded),
            _ => {
                out.insert(field.name.to_owned(), Value::List(vec![decoded]));
            }
        }
        return;
    }

    out.insert(field.name.to_owned(), decoded);
}

fn decode_field(reader: &mut Reader<'_>, field: &Field, wire_type: u8) -> Result<Value, CodecError> {
    match &field.kind {
        Kind::Text => {
            let payload = read_len_payload(reader, wire_type)?;
            let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(Value::Text(text.to_owned()))
        }
        Kind::Bool => {
            expect_wire(wire_type, WIRE_VARINT)?;
            Ok(Value::Bool(reader.varint()? != 0))
        }
        Kind::Int => {
            expect_wire(wire_type, WIRE_VARINT)?;
            Ok(Value::Int(reader.varint()? as i64))
        }
        Kind::Float => match wire_type {
            WIRE_FIXED64 => {
                let bytes = reader.take(8)?;
                let bits = u64::from_le_bytes(bytes.try_into().map_err(|_| CodecError::Truncated)?);
                Ok(Value::Float(f64::from_bits(bits)))
            }
            WIRE_FIXED32 => {
                let bytes = reader.take(4)?;
                let bits = u32::from_le_bytes(bytes.try_into().map_err(|_| CodecError::Truncated)?);
                Ok(Value::Float(f64::from(f32::from_bits(bits))))
            }
            other => Err(CodecError::InvalidWireType(other)),
        },
        Kind::Bytes => {
            let payload = read_len_payload(reader, wire_type)?;
            Ok(Value::Bytes(payload.to_vec()))
        }
        Kind::Json => {
            let payload = read_len_payload(reader, wire_type)?;
            let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
            let json: serde_json::Value = serde_json::from_str(text)?;
            Ok(Value::from_json(&json))
        }
        Kind::Message(descriptor) => {
            let payload = read_len_payload(reader, wire_type)?;
            decode_message(payload, descriptor)
        }
        Kind::Map(descriptor) => {
            let payload = read_len_payload(reader, wire_type)?;
            decode_map_entry(payload, descriptor)
        }
    }
}

fn decode_map_entry(bytes: &[u8], descriptor: &MessageDescriptor) -> Result<Value, CodecError> {
    let mut reader = Reader::new(bytes);
    let mut key = String::new();
    let mut value = Value::Map(IndexMap::new());

    while !reader.is_empty() {
        let tag = reader.varint()?;
        let number = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match number {
            1 => {
                let payload = read_len_payload(&mut reader, wire_type)?;
                key = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?.to_owned();
            }
            2 => {
                let payload = read_len_payload(&mut reader, wire_type)?;
                value = decode_message(payload, descriptor)?;
            }
            _ => skip_field(&mut reader, wire_type)?,
        }
    }

    let mut entry = IndexMap::new();
    entry.insert(key, value);

    Ok(Value::Map(entry))
}

fn read_len_payload<'a>(reader: &mut Reader<'a>, wire_type: u8) -> Result<&'a [u8], CodecError> {
    expect_wire(wire_type, WIRE_LEN)?;
    let len = reader.varint()? as usize;
    reader.take(len)
}

fn expect_wire(actual: u8, expected: u8) -> Result<(), CodecError> {
    if actual == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidWireType(actual))
    }
}

fn skip_field(reader: &mut Reader<'_>, wire_type: u8) -> Result<(), CodecError> {
    match wire_type {
        WIRE_VARINT => {
            reader.varint()?;
        }
        WIRE_FIXED64 => {
            reader.take(8)?;
        }
        WIRE_LEN => {
            let len = reader.varint()? as usize;
            reader.take(len)?;
        }
        WIRE_FIXED32 => {
            reader.take(4)?;
        }
        other => return Err(CodecError::InvalidWireType(other)),
    }

    Ok(())
}

/// Schemaless decode: maps keyed by decimal field numbers, nested messages
/// tried before text, text before raw bytes.
pub(crate) fn decode_untyped(bytes: &[u8], depth: usize) -> Option<Value> {
    if depth > MAX_NESTING {
        return None;
    }

    let mut reader = Reader::new(bytes);
    let mut out: IndexMap<String, Value> = IndexMap::new();

    while !reader.is_empty() {
        let key = reader.varint().ok()?;
        let number = key >> 3;

        if number == 0 {
            return None;
        }

        let value = match (key & 0x7) as u8 {
            WIRE_VARINT => Value::Int(reader.varint().ok()? as i64),
            WIRE_FIXED64 => {
                let bytes = reader.take(8).ok()?;
                Value::Int(i64::from_le_bytes(bytes.try_into().ok()?))
            }
            WIRE_LEN => {
                let len = reader.varint().ok()? as usize;
                let payload = reader.take(len).ok()?;
                classify_payload(payload, depth)
            }
            WIRE_FIXED32 => {
                let bytes = reader.take(4).ok()?;
                Value::Int(i64::from(u32::from_le_bytes(bytes.try_into().ok()?)))
            }
            _ => return None,
        };

        let key = number.to_string();

        match out.get_mut(&key) {
            Some(Value::List(items)) => items.push(value),
            Some(existing) => {
                let prev = std::mem::replace(existing, Value::Null);
                *existing = Value::List(vec![prev, value]);
            }
            None => {
                out.insert(key, value);
            }
        }
    }

    Some(Value::Map(out))
}

fn classify_payload(payload: &[u8], depth: usize) -> Value {
    if payload.is_empty() {
        return Value::Text(String::new());
    }

    if let Some(nested) = decode_untyped(payload, depth + 1) {
        return nested;
    }

    match std::str::from_utf8(payload) {
        Ok(text) => Value::Text(text.to_owned()),
        Err(_) => Value::Bytes(payload.to_vec()),
    }
}
