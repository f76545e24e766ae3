//! Binary payload codec.
//!
//! The payload is the uncompressed body of an envelope: the reference table
//! followed by the root primitive, as length-prefixed tagged records over
//! LEB128 varints. Every length read from the wire is checked against the
//! bytes actually remaining, so a hostile length cannot drive allocation.

use crate::error::{Error, Result};
use crate::tensor::DType;
use crate::varint::{decode_varint_from, decode_varint_i64_from, encode_varint_i64_to, encode_varint_to};
use crate::wire::{Primitive, RefTable, RefValue, WireTable};

const TAG_NIL: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_REF: u8 = 4;

const ENTRY_STR: u8 = 0;
const ENTRY_TABLE: u8 = 1;
const ENTRY_FUNCTION: u8 = 2;
const ENTRY_TENSOR: u8 = 3;
const ENTRY_STORAGE: u8 = 4;
const ENTRY_ENV: u8 = 5;
const ENTRY_USERDATA: u8 = 6;

/// Encode a reference table and root into payload bytes.
pub fn encode_payload(root: &Primitive, refs: &RefTable) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_varint_to(refs.len() as u64, &mut out)?;
    for entry in refs.iter() {
        write_entry(&mut out, entry)?;
    }
    write_primitive(&mut out, root)?;
    Ok(out)
}

/// Decode payload bytes back into a reference table and root.
pub fn decode_payload(bytes: &[u8]) -> Result<(Primitive, RefTable)> {
    let mut input = bytes;
    let count = read_len(&mut input)?;
    let mut entries = Vec::new();
    for _ in 0..count {
        entries.push(read_entry(&mut input)?);
    }
    let root = read_primitive(&mut input)?;
    if !input.is_empty() {
        return Err(Error::malformed(format!(
            "{} trailing bytes after the root value",
            input.len()
        )));
    }
    Ok((root, RefTable::from_entries(entries)))
}

fn write_primitive(out: &mut Vec<u8>, primitive: &Primitive) -> Result<()> {
    match primitive {
        Primitive::Nil => out.push(TAG_NIL),
        Primitive::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Primitive::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Primitive::Str(s) => {
            out.push(TAG_STR);
            write_bytes(out, s)?;
        }
        Primitive::Ref(index) => {
            if *index < 0 {
                return Err(Error::malformed(format!(
                    "negative reference index {index}"
                )));
            }
            out.push(TAG_REF);
            encode_varint_to(*index as u64, out)?;
        }
    }
    Ok(())
}

fn read_primitive(input: &mut &[u8]) -> Result<Primitive> {
    let tag = read_u8(input)?;
    match tag {
        TAG_NIL => Ok(Primitive::Nil),
        TAG_NUMBER => {
            let bytes = read_exact(input, 8)?;
            Ok(Primitive::Number(f64::from_le_bytes(
                bytes.try_into().expect("length checked"),
            )))
        }
        TAG_BOOL => match read_u8(input)? {
            0 => Ok(Primitive::Bool(false)),
            1 => Ok(Primitive::Bool(true)),
            value => Err(Error::InvalidDiscriminant {
                value,
                type_name: "bool",
            }),
        },
        TAG_STR => Ok(Primitive::Str(read_byte_string(input)?)),
        TAG_REF => {
            let index = decode_varint_from(input)?;
            if index > i64::MAX as u64 {
                return Err(Error::malformed(format!(
                    "reference index {index} out of range"
                )));
            }
            Ok(Primitive::Ref(index as i64))
        }
        value => Err(Error::InvalidDiscriminant {
            value,
            type_name: "primitive",
        }),
    }
}

fn write_entry(out: &mut Vec<u8>, entry: &RefValue) -> Result<()> {
    match entry {
        RefValue::Str(s) => {
            out.push(ENTRY_STR);
            write_bytes(out, s)?;
        }
        RefValue::Table(table) => {
            out.push(ENTRY_TABLE);
            write_table(out, table)?;
        }
        RefValue::Function { code, upvalues } => {
            out.push(ENTRY_FUNCTION);
            write_bytes(out, code)?;
            encode_varint_to(upvalues.len() as u64, out)?;
            for upvalue in upvalues {
                write_primitive(out, upvalue)?;
            }
        }
        RefValue::Tensor { dtype, shape, data } => {
            out.push(ENTRY_TENSOR);
            out.push(*dtype as u8);
            encode_varint_to(shape.len() as u64, out)?;
            for dim in shape {
                encode_varint_i64_to(*dim, out)?;
            }
            write_bytes(out, data)?;
        }
        RefValue::Storage { dtype, data } => {
            out.push(ENTRY_STORAGE);
            out.push(*dtype as u8);
            write_bytes(out, data)?;
        }
        RefValue::EnvLocation { env, key } => {
            out.push(ENTRY_ENV);
            write_primitive(out, env)?;
            write_primitive(out, key)?;
        }
        RefValue::UserData { type_key, payload } => {
            out.push(ENTRY_USERDATA);
            write_bytes(out, type_key.as_bytes())?;
            write_bytes(out, payload)?;
        }
    }
    Ok(())
}

fn read_entry(input: &mut &[u8]) -> Result<RefValue> {
    let tag = read_u8(input)?;
    match tag {
        ENTRY_STR => Ok(RefValue::Str(read_byte_string(input)?)),
        ENTRY_TABLE => Ok(RefValue::Table(read_table(input)?)),
        ENTRY_FUNCTION => {
            let code = read_byte_string(input)?;
            let count = read_len(input)?;
            let mut upvalues = Vec::new();
            for _ in 0..count {
                upvalues.push(read_primitive(input)?);
            }
            Ok(RefValue::Function { code, upvalues })
        }
        ENTRY_TENSOR => {
            let dtype = read_dtype(input)?;
            let ndim = read_len(input)?;
            let mut shape = Vec::new();
            for _ in 0..ndim {
                shape.push(decode_varint_i64_from(input)?);
            }
            let data = read_byte_string(input)?;
            Ok(RefValue::Tensor { dtype, shape, data })
        }
        ENTRY_STORAGE => {
            let dtype = read_dtype(input)?;
            let data = read_byte_string(input)?;
            Ok(RefValue::Storage { dtype, data })
        }
        ENTRY_ENV => {
            let env = read_primitive(input)?;
            let key = read_primitive(input)?;
            Ok(RefValue::EnvLocation { env, key })
        }
        ENTRY_USERDATA => {
            let key_bytes = read_byte_string(input)?;
            let type_key = String::from_utf8(key_bytes)
                .map_err(|_| Error::malformed("userdata key is not valid UTF-8"))?;
            let payload = read_byte_string(input)?;
            Ok(RefValue::UserData { type_key, payload })
        }
        value => Err(Error::InvalidDiscriminant {
            value,
            type_name: "reference entry",
        }),
    }
}

fn write_table(out: &mut Vec<u8>, table: &WireTable) -> Result<()> {
    encode_varint_to(table.list.len() as u64, out)?;
    for item in &table.list {
        write_primitive(out, item)?;
    }
    encode_varint_to(table.int_keys.len() as u64, out)?;
    for (key, value) in &table.int_keys {
        encode_varint_i64_to(*key, out)?;
        write_primitive(out, value)?;
    }
    encode_varint_to(table.string_keys.len() as u64, out)?;
    for (key, value) in &table.string_keys {
        write_bytes(out, key)?;
        write_primitive(out, value)?;
    }
    write_optional(out, table.true_key.as_ref())?;
    write_optional(out, table.false_key.as_ref())?;
    encode_varint_to(table.other_keys.len() as u64, out)?;
    for (key, value) in &table.other_keys {
        write_primitive(out, key)?;
        write_primitive(out, value)?;
    }
    write_optional(out, table.metatable.as_ref())?;
    write_optional(out, table.special_key.as_ref())?;
    write_optional(out, table.special_value.as_ref())?;
    Ok(())
}

fn read_table(input: &mut &[u8]) -> Result<WireTable> {
    let mut table = WireTable::default();
    for _ in 0..read_len(input)? {
        table.list.push(read_primitive(input)?);
    }
    for _ in 0..read_len(input)? {
        let key = decode_varint_i64_from(input)?;
        table.int_keys.insert(key, read_primitive(input)?);
    }
    for _ in 0..read_len(input)? {
        let key = read_byte_string(input)?;
        table.string_keys.insert(key, read_primitive(input)?);
    }
    table.true_key = read_optional(input)?;
    table.false_key = read_optional(input)?;
    for _ in 0..read_len(input)? {
        let key = read_primitive(input)?;
        let value = read_primitive(input)?;
        table.other_keys.push((key, value));
    }
    table.metatable = read_optional(input)?;
    table.special_key = read_optional(input)?;
    table.special_value = read_optional(input)?;
    Ok(table)
}

fn write_optional(out: &mut Vec<u8>, primitive: Option<&Primitive>) -> Result<()> {
    match primitive {
        None => {
            out.push(0);
            Ok(())
        }
        Some(p) => {
            out.push(1);
            write_primitive(out, p)
        }
    }
}

fn read_optional(input: &mut &[u8]) -> Result<Option<Primitive>> {
    match read_u8(input)? {
        0 => Ok(None),
        1 => Ok(Some(read_primitive(input)?)),
        value => Err(Error::InvalidDiscriminant {
            value,
            type_name: "optional field",
        }),
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    encode_varint_to(bytes.len() as u64, out)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_byte_string(input: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_len(input)?;
    Ok(read_exact(input, len)?.to_vec())
}

fn read_u8(input: &mut &[u8]) -> Result<u8> {
    let (&byte, rest) = input
        .split_first()
        .ok_or_else(|| Error::malformed("unexpected end of payload"))?;
    *input = rest;
    Ok(byte)
}

fn read_exact<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if len > input.len() {
        return Err(Error::malformed(format!(
            "record claims {len} bytes but only {} remain",
            input.len()
        )));
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Ok(bytes)
}

/// A length or count. Bounded by the remaining input, since every counted
/// record occupies at least one byte.
fn read_len(input: &mut &[u8]) -> Result<usize> {
    let value = decode_varint_from(input)?;
    if value > input.len() as u64 {
        return Err(Error::malformed(format!(
            "count {value} exceeds the {} bytes remaining",
            input.len()
        )));
    }
    Ok(value as usize)
}

fn read_dtype(input: &mut &[u8]) -> Result<DType> {
    let value = read_u8(input)?;
    DType::from_u8(value).ok_or(Error::InvalidDiscriminant {
        value,
        type_name: "dtype",
    })
}
