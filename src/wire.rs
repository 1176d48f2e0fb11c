use crate::errors::Result;
use crate::types::{Typ, Value};

/// Result-frame type tags.
pub const FRAME_NOTHING: u8 = 0x00;
pub const FRAME_STATUS: u8 = 0x21;
pub const FRAME_REPORT: u8 = 0x22;
pub const FRAME_ROW: u8 = 0x23;
pub const FRAME_CURSOR: u8 = 0x24;

/// End-of-row marker inside a row frame.
pub const EOR: u8 = 0x19;

/// Status frame: error code (0 = OK) plus detail text.
pub fn status(out: &mut Vec<u8>, errcode: u32, details: &str) {
    out.push(FRAME_STATUS);
    out.extend_from_slice(&errcode.to_le_bytes());
    out.extend_from_slice(&(details.len() as u32).to_le_bytes());
    out.extend_from_slice(details.as_bytes());
}

/// Report frame: rows affected, errors, runtime in microseconds.
pub fn report(out: &mut Vec<u8>, affected: u64, errors: u64, runtime_us: u64) {
    out.push(FRAME_REPORT);
    out.extend_from_slice(&affected.to_le_bytes());
    out.extend_from_slice(&errors.to_le_bytes());
    out.extend_from_slice(&runtime_us.to_le_bytes());
}

/// Cursor frame header: the server-assigned cursor id. Row frames follow.
pub fn cursor(out: &mut Vec<u8>, id: u64) {
    out.push(FRAME_CURSOR);
    out.extend_from_slice(&id.to_le_bytes());
}

fn cell(out: &mut Vec<u8>, v: &Value) {
    out.push(v.typ() as u32 as u8);
    match v {
        Value::Nothing => {}
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Text(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        other => out.extend_from_slice(&other.to_raw().to_le_bytes()),
    }
}

/// Encode one row frame: (type-tag, value) cells, end-of-row terminated.
#[must_use]
pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + values.len() * 9);
    out.push(FRAME_ROW);
    for v in values {
        cell(&mut out, v);
    }
    out.push(EOR);
    out
}

/// Decode all row frames in a buffer, tolerating a trailing partial row
/// (returned as leftover bytes). Used by tests and the client side of the
/// protocol.
pub fn decode_rows(buf: &[u8]) -> Result<(Vec<Vec<Value>>, usize)> {
    let mut rows = Vec::new();
    let mut pos = 0;
    'outer: while pos < buf.len() {
        let row_start = pos;
        if buf[pos] != FRAME_ROW {
            // a different frame follows; the caller picks up from here
            return Ok((rows, pos));
        }
        pos += 1;
        let mut row = Vec::new();
        loop {
            if pos >= buf.len() {
                return Ok((rows, row_start));
            }
            if buf[pos] == EOR {
                pos += 1;
                rows.push(row);
                continue 'outer;
            }
            let typ = Typ::from_tag(u32::from(buf[pos]));
            pos += 1;
            match typ {
                Typ::Nothing => row.push(Value::Nothing),
                Typ::Bool => {
                    if pos + 1 > buf.len() {
                        return Ok((rows, row_start));
                    }
                    row.push(Value::Bool(buf[pos] != 0));
                    pos += 1;
                }
                Typ::Text => {
                    if pos + 4 > buf.len() {
                        return Ok((rows, row_start));
                    }
                    let len =
                        u32::from_le_bytes(buf[pos..pos + 4].try_into().expect("4 bytes"))
                            as usize;
                    pos += 4;
                    if pos + len > buf.len() {
                        return Ok((rows, row_start));
                    }
                    let s = String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
                    row.push(Value::Text(s));
                    pos += len;
                }
                _ => {
                    if pos + 8 > buf.len() {
                        return Ok((rows, row_start));
                    }
                    let raw = u64::from_le_bytes(buf[pos..pos + 8].try_into().expect("8 bytes"));
                    row.push(Value::from_raw(typ, raw));
                    pos += 8;
                }
            }
        }
    }
    Ok((rows, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_roundtrip() {
        let row = vec![
            Value::UInt(42),
            Value::Text("hello".into()),
            Value::Float(2.5),
            Value::Nothing,
            Value::Bool(true),
        ];
        let buf = encode_row(&row);
        let (rows, consumed) = decode_rows(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn partial_row_is_leftover() {
        let row = vec![Value::UInt(1), Value::Text("abcdef".into())];
        let buf = encode_row(&row);
        let cut = buf.len() - 3;
        let (rows, leftover_at) = decode_rows(&buf[..cut]).unwrap();
        assert!(rows.is_empty());
        assert_eq!(leftover_at, 0);
    }

    #[test]
    fn frames_have_expected_tags() {
        let mut out = Vec::new();
        status(&mut out, 0, "");
        assert_eq!(out[0], FRAME_STATUS);
        out.clear();
        report(&mut out, 5, 0, 123);
        assert_eq!(out[0], FRAME_REPORT);
        assert_eq!(out.len(), 25);
        out.clear();
        cursor(&mut out, 9);
        assert_eq!(out[0], FRAME_CURSOR);
    }
}
