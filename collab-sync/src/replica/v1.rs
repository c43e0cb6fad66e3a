//! Structural check of yrs v1 encodings before they reach the decoder.
//!
//! The yrs decoders trust what they read: counts become up-front
//! allocations, strings are taken as UTF-8 unchecked, and block clocks are
//! added without overflow checks. A few hostile bytes can exhaust memory or
//! corrupt the block store. [`check_update`] and [`check_state_vector`] walk
//! the same layout without allocating and reject anything a well-behaved
//! client never produces.
//!
//! Layout of an update:
//! ```text
//! update      = varuint(clients) client_blocks* delete_set
//! client_blocks = varuint(blocks) varuint(client) varuint(clock) block*
//! block       = 0 varuint(len)                      ; GC
//!             | 10 varuint(len)                     ; skip
//!             | info [origin] [right] [parent [sub]] content
//! delete_set  = varuint(clients) (varuint(client) varuint(ranges) (varuint(clock) varuint(len))*)*
//! ```

const GC: u8 = 0;
const SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;

/// Shared types a document may contain (array through xml text).
const MAX_TYPE_REF: u8 = 6;
const TYPE_XML_ELEMENT: u8 = 3;

/// Nesting limit for `Any` maps and arrays.
const MAX_ANY_DEPTH: usize = 64;

type Check<T> = Result<T, String>;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Check<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| format!("unexpected end of input at byte {}", self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip(&mut self, len: usize) -> Check<&'a [u8]> {
        if len > self.remaining() {
            return Err(format!(
                "{len} bytes requested at byte {}, {} left",
                self.pos,
                self.remaining()
            ));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// LEB128 unsigned, at most 64 bits.
    fn var_u64(&mut self) -> Check<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err(format!("varint overflows 64 bits at byte {}", self.pos));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn var_u32(&mut self) -> Check<u32> {
        let value = self.var_u64()?;
        u32::try_from(value).map_err(|_| format!("value {value} exceeds 32 bits"))
    }

    /// lib0 signed varint: sign and six bits in the first byte.
    fn var_i64(&mut self) -> Check<()> {
        let mut byte = self.u8()?;
        let mut bits = 6;
        while byte & 0x80 != 0 {
            if bits >= 64 {
                return Err(format!("signed varint too long at byte {}", self.pos));
            }
            byte = self.u8()?;
            bits += 7;
        }
        Ok(())
    }

    /// A count of items that each take at least `min_item_bytes`.
    fn count(&mut self, min_item_bytes: usize) -> Check<usize> {
        let count = self.var_u64()?;
        let room = (self.remaining() / min_item_bytes) as u64;
        if count > room {
            return Err(format!(
                "count {count} at byte {} exceeds the {} bytes left",
                self.pos,
                self.remaining()
            ));
        }
        Ok(count as usize)
    }

    fn buf(&mut self) -> Check<&'a [u8]> {
        let len = self.count(1)?;
        self.skip(len)
    }

    fn string(&mut self) -> Check<&'a str> {
        let at = self.pos;
        std::str::from_utf8(self.buf()?).map_err(|e| format!("string at byte {at}: {e}"))
    }

    fn id(&mut self) -> Check<()> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }
}

/// Check an encoded state vector (peer digest).
pub fn check_state_vector(bytes: &[u8]) -> Check<()> {
    let mut r = Reader::new(bytes);
    let entries = r.count(2)?;
    for _ in 0..entries {
        r.var_u64()?;
        r.var_u32()?;
    }
    Ok(())
}

/// Check an encoded v1 update (full state or incremental).
pub fn check_update(bytes: &[u8]) -> Check<()> {
    let mut r = Reader::new(bytes);

    let clients = r.count(3)?;
    for _ in 0..clients {
        let blocks = r.count(2)?;
        r.var_u32()?;
        let mut clock = r.var_u32()?;
        for _ in 0..blocks {
            let len = block(&mut r)?;
            clock = clock
                .checked_add(len)
                .ok_or_else(|| format!("block clock overflows at byte {}", r.pos))?;
        }
    }

    delete_set(&mut r)
}

/// One block; returns the clock span it covers.
fn block(r: &mut Reader<'_>) -> Check<u32> {
    let info = r.u8()?;
    if info == GC || info == SKIP {
        let len = r.var_u32()?;
        if len == 0 {
            return Err(format!("empty range block at byte {}", r.pos));
        }
        return Ok(len);
    }

    if info & HAS_ORIGIN != 0 {
        r.id()?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        r.id()?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if r.var_u32()? == 1 {
            r.string()?;
        } else {
            r.id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            r.string()?;
        }
    }
    content(r, info & 0b1111)
}

fn content(r: &mut Reader<'_>, kind: u8) -> Check<u32> {
    match kind {
        CONTENT_DELETED => r.var_u32(),
        CONTENT_BINARY => r.buf().map(|_| 1),
        CONTENT_STRING => {
            let text = r.string()?;
            u32::try_from(text.encode_utf16().count())
                .map_err(|_| "string block too long".to_string())
        }
        CONTENT_EMBED => r.string().map(|_| 1),
        CONTENT_FORMAT => {
            r.string()?;
            r.string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            let type_ref = r.u8()?;
            if type_ref > MAX_TYPE_REF {
                return Err(format!("unsupported shared type {type_ref}"));
            }
            // xml elements carry their tag name
            if type_ref == TYPE_XML_ELEMENT {
                r.string()?;
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let values = r.count(1)?;
            for _ in 0..values {
                any(r, 0)?;
            }
            u32::try_from(values).map_err(|_| "too many values".to_string())
        }
        other => Err(format!("unsupported content kind {other}")),
    }
}

fn any(r: &mut Reader<'_>, depth: usize) -> Check<()> {
    if depth >= MAX_ANY_DEPTH {
        return Err(format!("value nested deeper than {MAX_ANY_DEPTH}"));
    }
    match r.u8()? {
        127 | 126 | 121 | 120 => {}
        125 => r.var_i64()?,
        124 => {
            r.skip(4)?;
        }
        123 | 122 => {
            r.skip(8)?;
        }
        119 => {
            r.string()?;
        }
        118 => {
            let entries = r.count(2)?;
            for _ in 0..entries {
                r.string()?;
                any(r, depth + 1)?;
            }
        }
        117 => {
            let items = r.count(1)?;
            for _ in 0..items {
                any(r, depth + 1)?;
            }
        }
        116 => {
            r.buf()?;
        }
        tag => return Err(format!("unknown value tag {tag}")),
    }
    Ok(())
}

fn delete_set(r: &mut Reader<'_>) -> Check<()> {
    let clients = r.count(2)?;
    for _ in 0..clients {
        r.var_u32()?;
        let ranges = r.count(2)?;
        for _ in 0..ranges {
            let clock = r.var_u32()?;
            let len = r.var_u32()?;
            if len == 0 || clock.checked_add(len).is_none() {
                return Err(format!("invalid delete range {clock}+{len}"));
            }
        }
    }
    Ok(())
}
