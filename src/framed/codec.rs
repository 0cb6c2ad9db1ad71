//! Wire layout of the socket-based SMAPI protocol.
//!
//! ```text
//! request:  u32 total_len (excluding itself)
//!           { u32 len, bytes } x (function, user, password, target[, force_time])
//! response: u32 request_id
//!           i32 output_len, request_id, rc, rs, processed, not_processed, failing_len
//!           output_len - 24 trailing bytes
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Size of the full response header.
pub const HEADER_LEN: usize = 28;

/// Size of the header prefix every server sends: output length, request id, rc and rs.
pub const SHORT_HEADER_LEN: usize = 16;

// Header fields counted by output_len (everything after output_len itself).
const COUNTED_HEADER_LEN: usize = HEADER_LEN - 4;

/// Functions understood by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Log on an image.
    ImageActivate,
    /// Log off and on again.
    ImageRecycle,
    /// Log off an image.
    ImageDeactivate,
    /// Query whether an image is logged on.
    ImageStatusQuery,
}

impl Function {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImageActivate => "Image_Activate",
            Self::ImageRecycle => "Image_Recycle",
            Self::ImageDeactivate => "Image_Deactivate",
            Self::ImageStatusQuery => "Image_Status_Query",
        }
    }

    /// Wire name without underscores, as shown in messages.
    pub fn printable(self) -> &'static str {
        match self {
            Self::ImageActivate => "ImageActivate",
            Self::ImageRecycle => "ImageRecycle",
            Self::ImageDeactivate => "ImageDeactivate",
            Self::ImageStatusQuery => "ImageStatusQuery",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        [
            Self::ImageActivate,
            Self::ImageRecycle,
            Self::ImageDeactivate,
            Self::ImageStatusQuery,
        ]
        .into_iter()
        .find(|f| f.as_str() == name)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deactivation grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceTime {
    /// Log off at once.
    Immediate,
    /// Give the guest this many seconds to shut down.
    Within(u32),
}

impl fmt::Display for ForceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("IMMED"),
            Self::Within(secs) => write!(f, "WITHIN {secs}"),
        }
    }
}

/// One request.
#[derive(Clone, PartialEq, Eq)]
pub struct Request<'a> {
    /// Function to call.
    pub function: Function,
    /// Authenticated user id.
    pub user: &'a str,
    /// Password of the user id.
    pub password: &'a [u8],
    /// Target image.
    pub target: &'a str,
    /// Only sent for [`Function::ImageDeactivate`].
    pub force_time: Option<ForceTime>,
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("function", &self.function)
            .field("user", &self.user)
            .field("password", &"<secret>")
            .field("target", &self.target)
            .field("force_time", &self.force_time)
            .finish()
    }
}

/// Encode a request, length prefix included.
pub fn encode_request(req: &Request<'_>) -> Result<BytesMut> {
    let force_time = match (req.function, req.force_time) {
        (Function::ImageDeactivate, Some(ft)) => Some(ft.to_string()),
        (Function::ImageDeactivate, None) => {
            return Err(Error::InvalidArgument("deactivate requires a force time"));
        }
        _ => None,
    };

    let mut fields: Vec<&[u8]> = vec![
        req.function.as_str().as_bytes(),
        req.user.as_bytes(),
        req.password,
        req.target.as_bytes(),
    ];
    if let Some(ft) = &force_time {
        fields.push(ft.as_bytes());
    }

    let body_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let total = u32::try_from(body_len).map_err(|_| Error::InvalidArgument("request too large"))?;

    let mut out = BytesMut::with_capacity(4 + body_len);
    out.put_u32(total);
    for field in fields {
        out.put_u32(field.len() as u32);
        out.extend_from_slice(field);
    }
    Ok(out)
}

/// A request as seen by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    /// Function name.
    pub function: String,
    /// User id.
    pub user: String,
    /// Password bytes.
    pub password: Vec<u8>,
    /// Target image.
    pub target: String,
    /// Force-time text, when present.
    pub force_time: Option<String>,
}

/// Decode a complete request, length prefix included.
pub fn decode_request(mut buf: &[u8]) -> Result<DecodedRequest> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol("short request"));
    }
    let total = buf.get_u32() as usize;
    if buf.remaining() != total {
        return Err(Error::Protocol("request length mismatch"));
    }

    let mut fields = Vec::with_capacity(5);
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("truncated field length"));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::Protocol("truncated field"));
        }
        fields.push(buf[..len].to_vec());
        buf.advance(len);
    }
    if !(4..=5).contains(&fields.len()) {
        return Err(Error::Protocol("unexpected field count"));
    }

    let text = |b: Vec<u8>| String::from_utf8(b).map_err(|_| Error::Protocol("field is not utf-8"));
    let mut it = fields.into_iter();
    let mut next = || it.next().ok_or(Error::Protocol("missing field"));
    let function = text(next()?)?;
    let user = text(next()?)?;
    let password = next()?;
    let target = text(next()?)?;
    let force_time = next().ok().map(text).transpose()?;

    Ok(DecodedRequest {
        function,
        user,
        password,
        target,
        force_time,
    })
}

/// Response header.
///
/// Older servers send only the four-field prefix. The output length tells the
/// two layouts apart: the image counters are present only when it covers them,
/// otherwise they stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    /// Bytes following this field.
    pub output_length: i32,
    /// Echo of the request id.
    pub request_id: i32,
    /// Return code.
    pub rc: i32,
    /// Reason code.
    pub rs: i32,
    /// Images processed.
    pub processed: i32,
    /// Images not processed.
    pub not_processed: i32,
    /// Length of the failing-image array.
    pub failing_array_length: i32,
}

impl ResponseHeader {
    /// Header with no trailing data.
    pub fn new(request_id: i32, rc: i32, rs: i32) -> Self {
        Self {
            output_length: COUNTED_HEADER_LEN as i32,
            request_id,
            rc,
            rs,
            ..Self::default()
        }
    }

    /// Decode the header from a prefix or a full header.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SHORT_HEADER_LEN {
            return Err(Error::Protocol("short response header"));
        }
        let mut header = Self {
            output_length: buf.get_i32(),
            request_id: buf.get_i32(),
            rc: buf.get_i32(),
            rs: buf.get_i32(),
            ..Self::default()
        };
        let counters = HEADER_LEN - SHORT_HEADER_LEN;
        if header.encoded_len() == HEADER_LEN && buf.remaining() >= counters {
            header.processed = buf.get_i32();
            header.not_processed = buf.get_i32();
            header.failing_array_length = buf.get_i32();
        }
        Ok(header)
    }

    /// Encode the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        for v in [
            self.output_length,
            self.request_id,
            self.rc,
            self.rs,
            self.processed,
            self.not_processed,
            self.failing_array_length,
        ] {
            out.put_i32(v);
        }
        let mut arr = [0u8; HEADER_LEN];
        arr.copy_from_slice(&out);
        arr
    }

    /// Size of the header on the wire, as announced by the output length.
    pub fn encoded_len(&self) -> usize {
        match usize::try_from(self.output_length) {
            Ok(n) if n >= COUNTED_HEADER_LEN => HEADER_LEN,
            _ => SHORT_HEADER_LEN,
        }
    }

    /// Number of output bytes that follow the header.
    pub fn trailing_len(&self) -> Result<usize> {
        let counted = self.encoded_len() - 4;
        usize::try_from(self.output_length)
            .ok()
            .and_then(|n| n.checked_sub(counted))
            .ok_or(Error::Protocol("invalid output length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_is_length_prefixed() {
        let req = Request {
            function: Function::ImageActivate,
            user: "MAINT",
            password: b"pw",
            target: "LINUX1",
            force_time: None,
        };
        let wire = encode_request(&req).expect("encode");
        let mut expected = Vec::new();
        expected.extend_from_slice(&(4 + 14 + 4 + 5 + 4 + 2 + 4 + 6u32).to_be_bytes());
        expected.extend_from_slice(&14u32.to_be_bytes());
        expected.extend_from_slice(b"Image_Activate");
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"MAINT");
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"pw");
        expected.extend_from_slice(&6u32.to_be_bytes());
        expected.extend_from_slice(b"LINUX1");
        assert_eq!(&wire[..], &expected[..]);
    }

    #[test]
    fn force_time_only_travels_with_deactivate() {
        let req = Request {
            function: Function::ImageRecycle,
            user: "u",
            password: b"p",
            target: "t",
            force_time: Some(ForceTime::Immediate),
        };
        let decoded = decode_request(&encode_request(&req).expect("encode")).expect("decode");
        assert_eq!(decoded.force_time, None);

        let req = Request {
            function: Function::ImageDeactivate,
            force_time: None,
            ..req
        };
        assert!(matches!(encode_request(&req), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn header_decodes_big_endian_fields() {
        let header = ResponseHeader {
            output_length: 32,
            request_id: 9,
            rc: 200,
            rs: 12,
            processed: 0,
            not_processed: 1,
            failing_array_length: 8,
        };
        let wire = header.encode();
        assert_eq!(&wire[..4], &[0, 0, 0, 32]);
        assert_eq!(&wire[8..12], &[0, 0, 0, 200]);
        let back = ResponseHeader::decode(&wire).expect("decode");
        assert_eq!(back, header);
        assert_eq!(back.trailing_len().expect("trailing"), 8);
    }

    #[test]
    fn output_length_selects_header_layout() {
        let header = ResponseHeader {
            output_length: 20,
            ..ResponseHeader::default()
        };
        assert_eq!(header.encoded_len(), SHORT_HEADER_LEN);
        assert_eq!(header.trailing_len().expect("trailing"), 8);

        let full = ResponseHeader::new(1, 0, 0);
        assert_eq!(full.encoded_len(), HEADER_LEN);
        assert_eq!(full.trailing_len().expect("trailing"), 0);

        let bogus = ResponseHeader {
            output_length: 11,
            ..ResponseHeader::default()
        };
        assert!(bogus.trailing_len().is_err());
        assert!(ResponseHeader::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn printable_names_drop_underscores() {
        assert_eq!(Function::ImageStatusQuery.printable(), "ImageStatusQuery");
        assert_eq!(
            Function::from_wire("Image_Deactivate"),
            Some(Function::ImageDeactivate)
        );
        assert_eq!(Function::from_wire("Image_Lock"), None);
    }
}
