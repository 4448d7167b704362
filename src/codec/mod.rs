use anyhow::{Context, Result};

pub(crate) mod reader;
pub(crate) mod writer;

/// Big-endian cursor over class-file bytes.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .context("unexpected end of class file")?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok(hi << 32 | lo)
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .context("unexpected end of class file")?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }
}

/// Big-endian append-only buffer for encoding.
#[derive(Default)]
pub(crate) struct ByteWriter {
    pub(crate) out: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn i16(&mut self, value: i16) {
        self.u16(value as u16);
    }

    pub(crate) fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    pub(crate) fn len(&self) -> usize {
        self.out.len()
    }
}

/// Decode a JVM modified-UTF-8 constant into a string. Surrogate pairs
/// arrive as two three-byte units and are stitched back through UTF-16.
pub(crate) fn decode_mutf8(data: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let a = data[i];
        if a & 0x80 == 0 {
            if a == 0 {
                anyhow::bail!("embedded NUL in modified UTF-8 constant");
            }
            units.push(a as u16);
            i += 1;
        } else if a & 0xe0 == 0xc0 {
            let b = *data.get(i + 1).context("truncated UTF-8 constant")?;
            units.push(((a as u16 & 0x1f) << 6) | (b as u16 & 0x3f));
            i += 2;
        } else if a & 0xf0 == 0xe0 {
            let b = *data.get(i + 1).context("truncated UTF-8 constant")?;
            let c = *data.get(i + 2).context("truncated UTF-8 constant")?;
            units.push(((a as u16 & 0x0f) << 12) | ((b as u16 & 0x3f) << 6) | (c as u16 & 0x3f));
            i += 3;
        } else {
            anyhow::bail!("invalid modified UTF-8 byte {a:#04x}");
        }
    }
    String::from_utf16(&units).context("invalid UTF-16 in constant")
}

/// Encode a string as JVM modified UTF-8.
pub(crate) fn encode_mutf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

/// Slot width of one field descriptor: 2 for `J`/`D`, 1 otherwise.
pub(crate) fn field_size(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Argument slot widths and return width (0 for void) of a method
/// descriptor. Only the arity and widths are needed anywhere in the crate,
/// so the scan stays deliberately shallow.
pub(crate) fn method_descriptor(descriptor: &str) -> Result<(Vec<u8>, u8)> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        anyhow::bail!("malformed method descriptor: {descriptor}");
    }
    let mut args = Vec::new();
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        let start = bytes[i];
        args.push(if start == b'J' || start == b'D' { 2 } else { 1 });
        i = skip_type(bytes, i)
            .with_context(|| format!("malformed method descriptor: {descriptor}"))?;
    }
    if i >= bytes.len() || bytes[i] != b')' {
        anyhow::bail!("malformed method descriptor: {descriptor}");
    }
    let ret = match bytes.get(i + 1) {
        Some(b'V') => 0,
        Some(b'J') | Some(b'D') => 2,
        Some(_) => 1,
        None => anyhow::bail!("malformed method descriptor: {descriptor}"),
    };
    Ok((args, ret))
}

fn skip_type(bytes: &[u8], mut i: usize) -> Option<usize> {
    while bytes.get(i) == Some(&b'[') {
        i += 1;
    }
    match bytes.get(i)? {
        b'L' => {
            while *bytes.get(i)? != b';' {
                i += 1;
            }
            Some(i + 1)
        }
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(i + 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_descriptor_widths() {
        let (args, ret) = method_descriptor("(IJLjava/lang/String;[[D)J").expect("parse");
        assert_eq!(args, vec![1, 2, 1, 1]);
        assert_eq!(ret, 2);

        let (args, ret) = method_descriptor("()V").expect("parse");
        assert!(args.is_empty());
        assert_eq!(ret, 0);
    }

    #[test]
    fn method_descriptor_rejects_garbage() {
        assert!(method_descriptor("I)V").is_err());
        assert!(method_descriptor("(Q)V").is_err());
        assert!(method_descriptor("(I").is_err());
    }

    #[test]
    fn mutf8_round_trip() {
        for text in ["<init>", "côté", "a\u{0000}b", "\u{10348}"] {
            let encoded = encode_mutf8(text);
            assert!(!encoded.contains(&0));
            assert_eq!(decode_mutf8(&encoded).expect("decode"), text);
        }
    }

    #[test]
    fn field_sizes() {
        assert_eq!(field_size("J"), 2);
        assert_eq!(field_size("D"), 2);
        assert_eq!(field_size("I"), 1);
        assert_eq!(field_size("Ljava/lang/Object;"), 1);
        assert_eq!(field_size("[J"), 1);
    }
}
