use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;
use std::ops::Range;

/// Nesting deeper than this is rejected rather than risking the stack.
const MAX_DEPTH: usize = 64;

/// Decode bencoded data into a BencodeValue
#[cfg(test)]
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    decode_with_span(data, &[]).map(|(value, _)| value)
}

/// Decode `data` and also report the raw byte range of the value found at
/// `path` (a chain of dictionary keys from the root), if any.
pub fn decode_with_span(data: &[u8], path: &[&str]) -> Result<(BencodeValue, Option<Range<usize>>)> {
    let mut decoder = Decoder {
        data,
        pos: 0,
        path,
        span: None,
    };
    let value = decoder.value(0, true)?;
    if decoder.pos != data.len() {
        return Err(err(format!("{} trailing bytes", data.len() - decoder.pos)));
    }
    Ok((value, decoder.span))
}

fn err(msg: impl Into<String>) -> BittorrentError {
    BittorrentError::Bencode(msg.into())
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    path: &'a [&'a str],
    span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| err("unexpected end of input"))
    }

    /// `on_path` is true while every key so far matched the tracked path.
    fn value(&mut self, depth: usize, on_path: bool) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(err("nesting too deep"));
        }

        let start = self.pos;
        let value = match self.peek()? {
            b'i' => self.integer()?,
            b'l' => self.list(depth)?,
            b'd' => self.dict(depth, on_path)?,
            b'0'..=b'9' => BencodeValue::String(self.bytes()?),
            c => return Err(err(format!("invalid token {:?}", c as char))),
        };

        if on_path && depth == self.path.len() && depth > 0 {
            self.span = Some(start..self.pos);
        }
        Ok(value)
    }

    fn until(&mut self, stop: u8) -> Result<&'a str> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == stop)
            .ok_or_else(|| err(format!("missing {:?}", stop as char)))?;
        self.pos = start + len + 1;
        std::str::from_utf8(&self.data[start..start + len]).map_err(|_| err("non-ascii number"))
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let raw = self.until(b'e')?;
        if raw.is_empty() || raw == "-0" || (raw.len() > 1 && raw.trim_start_matches('-').starts_with('0')) {
            return Err(err(format!("invalid integer {:?}", raw)));
        }
        raw.parse::<i64>()
            .map(BencodeValue::Integer)
            .map_err(|_| err(format!("invalid integer {:?}", raw)))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let raw = self.until(b':')?;
        let len: usize = raw
            .parse()
            .map_err(|_| err(format!("invalid string length {:?}", raw)))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| err("string length exceeds data"))?;
        let out = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value(depth + 1, false)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(list))
    }

    fn dict(&mut self, depth: usize, on_path: bool) -> Result<BencodeValue> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(err("dictionary key must be a string"));
            }
            let key = self.bytes()?;
            let follows = on_path
                && self
                    .path
                    .get(depth)
                    .is_some_and(|want| want.as_bytes() == key.as_slice());
            let value = self.value(depth + 1, follows)?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dict(dict))
    }
}
