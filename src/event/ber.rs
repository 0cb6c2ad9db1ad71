//! Minimal BER codec for SNMPv2c messages.
//!
//! ```text
//! Message  ::= SEQUENCE { version INTEGER, community OCTET STRING, pdu PDU }
//! PDU      ::= [tag] { request-id INTEGER, error-status INTEGER,
//!                      error-index INTEGER, SEQUENCE OF VarBind }
//! VarBind  ::= SEQUENCE { name OBJECT IDENTIFIER, value ANY }
//! ```
//!
//! Only INTEGER, OCTET STRING, NULL, OBJECT IDENTIFIER and SEQUENCE plus the
//! PDU tags below are understood.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::record::Cell;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

/// SNMP version field value for v2c.
pub(crate) const VERSION_2C: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PduKind {
    GetRequest,
    Response,
    SetRequest,
    Trap,
}

impl PduKind {
    fn tag(self) -> u8 {
        match self {
            Self::GetRequest => 0xa0,
            Self::Response => 0xa2,
            Self::SetRequest => 0xa3,
            Self::Trap => 0xa7,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0xa0 => Some(Self::GetRequest),
            0xa2 => Some(Self::Response),
            0xa3 => Some(Self::SetRequest),
            0xa7 => Some(Self::Trap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pdu {
    pub(crate) kind: PduKind,
    pub(crate) request_id: i32,
    pub(crate) error_status: i64,
    pub(crate) error_index: i64,
    pub(crate) varbinds: Vec<(String, Cell)>,
}

impl Pdu {
    pub(crate) fn new(kind: PduKind, request_id: i32, varbinds: Vec<(String, Cell)>) -> Self {
        Self {
            kind,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub(crate) community: Vec<u8>,
    pub(crate) pdu: Pdu,
}

pub(crate) fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut varbinds = BytesMut::new();
    for (name, value) in &msg.pdu.varbinds {
        let mut vb = BytesMut::new();
        put_oid(&mut vb, name)?;
        put_cell(&mut vb, value)?;
        put_tlv(&mut varbinds, TAG_SEQUENCE, &vb);
    }

    let mut pdu = BytesMut::new();
    put_integer(&mut pdu, i64::from(msg.pdu.request_id));
    put_integer(&mut pdu, msg.pdu.error_status);
    put_integer(&mut pdu, msg.pdu.error_index);
    put_tlv(&mut pdu, TAG_SEQUENCE, &varbinds);

    let mut body = BytesMut::new();
    put_integer(&mut body, VERSION_2C);
    put_tlv(&mut body, TAG_OCTET_STRING, &msg.community);
    put_tlv(&mut body, msg.pdu.kind.tag(), &pdu);

    let mut out = BytesMut::with_capacity(body.len() + 6);
    put_tlv(&mut out, TAG_SEQUENCE, &body);
    Ok(out.to_vec())
}

pub(crate) fn decode_message(buf: &[u8]) -> Result<Message> {
    let mut outer = Reader::new(buf);
    let body = outer.expect(TAG_SEQUENCE)?;
    if !outer.is_empty() {
        return Err(Error::Protocol("trailing bytes after snmp message"));
    }

    let mut r = Reader::new(body);
    let version = decode_integer(r.expect(TAG_INTEGER)?)?;
    if version != VERSION_2C {
        return Err(Error::protocol_owned(format!(
            "unsupported snmp version {version}"
        )));
    }
    let community = r.expect(TAG_OCTET_STRING)?.to_vec();
    let (tag, pdu_body) = r.tlv()?;
    let kind = PduKind::from_tag(tag).ok_or(Error::Protocol("unsupported pdu type"))?;

    let mut p = Reader::new(pdu_body);
    let request_id = decode_integer(p.expect(TAG_INTEGER)?)?;
    let request_id =
        i32::try_from(request_id).map_err(|_| Error::Protocol("request id out of range"))?;
    let error_status = decode_integer(p.expect(TAG_INTEGER)?)?;
    let error_index = decode_integer(p.expect(TAG_INTEGER)?)?;

    let mut list = Reader::new(p.expect(TAG_SEQUENCE)?);
    let mut varbinds = Vec::new();
    while !list.is_empty() {
        let mut vb = Reader::new(list.expect(TAG_SEQUENCE)?);
        let name = decode_oid(vb.expect(TAG_OBJECT_ID)?)?;
        let (tag, value) = vb.tlv()?;
        varbinds.push((name, decode_cell(tag, value)?));
    }

    Ok(Message {
        community,
        pdu: Pdu {
            kind,
            request_id,
            error_status,
            error_index,
            varbinds,
        },
    })
}

/// Total encoded length of the message whose first bytes are `head`.
///
/// Returns `None` until enough of the header is available.
pub(crate) fn message_len(head: &[u8]) -> Option<usize> {
    let mut r = Reader::new(head);
    let tag = r.byte().ok()?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let len = r.length().ok()?;
    Some(r.pos + len)
}

fn put_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.put_u8(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn put_tlv(out: &mut BytesMut, tag: u8, content: &[u8]) {
    out.put_u8(tag);
    put_length(out, content.len());
    out.extend_from_slice(content);
}

fn put_integer(out: &mut BytesMut, v: i64) {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    // Drop redundant sign bytes, keeping the sign bit of the next byte.
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    put_tlv(out, TAG_INTEGER, &bytes[start..]);
}

fn put_oid(out: &mut BytesMut, oid: &str) -> Result<()> {
    let arcs = parse_oid(oid)?;
    let mut content = Vec::with_capacity(arcs.len() + 1);
    let first = arcs[0]
        .checked_mul(40)
        .and_then(|v| v.checked_add(arcs[1]))
        .ok_or(Error::InvalidArgument("object identifier arc out of range"))?;
    put_base128(&mut content, first);
    for arc in &arcs[2..] {
        put_base128(&mut content, *arc);
    }
    put_tlv(out, TAG_OBJECT_ID, &content);
    Ok(())
}

fn put_cell(out: &mut BytesMut, cell: &Cell) -> Result<()> {
    match cell {
        Cell::Integer(v) => put_integer(out, *v),
        Cell::OctetString(b) => put_tlv(out, TAG_OCTET_STRING, b),
        Cell::ObjectId(s) => put_oid(out, s)?,
        Cell::Null => put_tlv(out, TAG_NULL, &[]),
    }
    Ok(())
}

fn parse_oid(oid: &str) -> Result<Vec<u64>> {
    let arcs = oid
        .split('.')
        .map(|s| s.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidArgument("invalid object identifier"))?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(Error::InvalidArgument("invalid object identifier"));
    }
    Ok(arcs)
}

fn put_base128(out: &mut Vec<u8>, mut v: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (j, b) in tmp.iter().enumerate().skip(i) {
        out.push(if j == last { *b } else { *b | 0x80 });
    }
}

fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(Error::Protocol("invalid integer length"));
    }
    let fill = if content[0] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut bytes = [fill; 8];
    bytes[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(bytes))
}

fn decode_oid(content: &[u8]) -> Result<String> {
    let mut arcs = Vec::new();
    let mut acc: u64 = 0;
    for (i, b) in content.iter().enumerate() {
        if acc > u64::MAX >> 7 {
            return Err(Error::Protocol("object identifier arc overflow"));
        }
        acc = (acc << 7) | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        } else if i + 1 == content.len() {
            return Err(Error::Protocol("truncated object identifier"));
        }
    }
    if arcs.is_empty() {
        return Err(Error::Protocol("empty object identifier"));
    }
    Ok(arcs
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join("."))
}

fn decode_cell(tag: u8, content: &[u8]) -> Result<Cell> {
    match tag {
        TAG_INTEGER => decode_integer(content).map(Cell::Integer),
        TAG_OCTET_STRING => Ok(Cell::OctetString(content.to_vec())),
        TAG_OBJECT_ID => decode_oid(content).map(Cell::ObjectId),
        TAG_NULL => Ok(Cell::Null),
        // noSuchObject, noSuchInstance, endOfMibView
        0x80..=0x82 => Ok(Cell::Null),
        _ => Err(Error::protocol_owned(format!(
            "unsupported value type {tag:#04x}"
        ))),
    }
}

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

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(Error::Protocol("truncated ber element"))?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let n = usize::from(first & 0x7f);
        if n == 0 || n > 4 {
            return Err(Error::Protocol("unsupported ber length"));
        }
        let mut len = 0usize;
        for _ in 0..n {
            len = (len << 8) | usize::from(self.byte()?);
        }
        Ok(len)
    }

    fn tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let len = self.length()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::Protocol("truncated ber element"))?;
        let content = &self.buf[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8]> {
        let (found, content) = self.tlv()?;
        if found != tag {
            return Err(Error::protocol_owned(format!(
                "expected ber tag {tag:#04x}, found {found:#04x}"
            )));
        }
        Ok(content)
    }
}
