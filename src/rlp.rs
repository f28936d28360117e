//! Minimal recursive-length-prefix encoding, scoped to the handful of field
//! types the discovery payloads need: unsigned integers, byte strings, IP
//! addresses, and lists of RLP-encodable structs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RlpDecodeError {
    #[error("input too short")]
    InvalidLength,
    #[error("unexpected RLP string where a list was expected")]
    UnexpectedString,
    #[error("unexpected RLP list where a string was expected")]
    UnexpectedList,
    #[error("leading zero in RLP length or integer encoding")]
    MalformedLength,
    #[error("field {0} failed to decode: {1}")]
    Field(&'static str, Box<RlpDecodeError>),
    #[error("trailing bytes after decoding field {0}")]
    TrailingBytes(&'static str),
}

pub trait RlpEncode {
    fn rlp_encode(&self, buf: &mut Vec<u8>);

    fn rlp_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.rlp_encode(&mut buf);
        buf
    }
}

pub trait RlpDecode: Sized {
    fn rlp_decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError>;
}

fn encode_length(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len < 56 {
        out.push(offset + len as u8);
    } else {
        let be = len.to_be_bytes();
        let first_nonzero = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
        let trimmed = &be[first_nonzero..];
        out.push(offset + 55 + trimmed.len() as u8);
        out.extend_from_slice(trimmed);
    }
}

pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    if bytes.len() == 1 && bytes[0] <= 0x7f {
        out.push(bytes[0]);
    } else {
        encode_length(bytes.len(), 0x80, out);
        out.extend_from_slice(bytes);
    }
}

fn encode_list_payload(payload: &[u8], out: &mut Vec<u8>) {
    encode_length(payload.len(), 0xc0, out);
    out.extend_from_slice(payload);
}

/// Splits the next RLP item off `buf`, returning `(is_list, payload, rest)`.
fn decode_item(buf: &[u8]) -> Result<(bool, &[u8], &[u8]), RlpDecodeError> {
    let first = *buf.first().ok_or(RlpDecodeError::InvalidLength)?;
    match first {
        0x00..=0x7f => Ok((false, &buf[..1], &buf[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            let (payload, rest) = split_checked(buf, 1, len)?;
            if len == 1 && payload[0] <= 0x7f {
                return Err(RlpDecodeError::MalformedLength);
            }
            Ok((false, payload, rest))
        }
        0xb8..=0xbf => {
            let len_of_len = (first - 0xb7) as usize;
            let len = read_be_len(buf, 1, len_of_len)?;
            let (payload, rest) = split_checked(buf, 1 + len_of_len, len)?;
            Ok((false, payload, rest))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            let (payload, rest) = split_checked(buf, 1, len)?;
            Ok((true, payload, rest))
        }
        0xf8..=0xff => {
            let len_of_len = (first - 0xf7) as usize;
            let len = read_be_len(buf, 1, len_of_len)?;
            let (payload, rest) = split_checked(buf, 1 + len_of_len, len)?;
            Ok((true, payload, rest))
        }
    }
}

fn split_checked(buf: &[u8], header_len: usize, payload_len: usize) -> Result<(&[u8], &[u8]), RlpDecodeError> {
    let total = header_len
        .checked_add(payload_len)
        .ok_or(RlpDecodeError::InvalidLength)?;
    if buf.len() < total {
        return Err(RlpDecodeError::InvalidLength);
    }
    Ok((&buf[header_len..total], &buf[total..]))
}

fn read_be_len(buf: &[u8], offset: usize, len_of_len: usize) -> Result<usize, RlpDecodeError> {
    let (len_bytes, _) = split_checked(buf, offset, len_of_len)?;
    if len_bytes.first() == Some(&0) {
        return Err(RlpDecodeError::MalformedLength);
    }
    let mut padded = [0u8; 8];
    if len_bytes.len() > 8 {
        return Err(RlpDecodeError::InvalidLength);
    }
    padded[8 - len_bytes.len()..].copy_from_slice(len_bytes);
    Ok(usize::from_be_bytes(padded))
}

macro_rules! impl_uint {
    ($ty:ty) => {
        impl RlpEncode for $ty {
            fn rlp_encode(&self, buf: &mut Vec<u8>) {
                let be = self.to_be_bytes();
                let first_nonzero = be.iter().position(|b| *b != 0);
                match first_nonzero {
                    None => encode_bytes(&[], buf),
                    Some(i) => encode_bytes(&be[i..], buf),
                }
            }
        }

        impl RlpDecode for $ty {
            fn rlp_decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError> {
                let (is_list, payload, rest) = decode_item(buf)?;
                if is_list {
                    return Err(RlpDecodeError::UnexpectedList);
                }
                if payload.len() > std::mem::size_of::<$ty>() {
                    return Err(RlpDecodeError::InvalidLength);
                }
                let mut padded = [0u8; std::mem::size_of::<$ty>()];
                padded[std::mem::size_of::<$ty>() - payload.len()..].copy_from_slice(payload);
                Ok((<$ty>::from_be_bytes(padded), rest))
            }
        }
    };
}

impl_uint!(u8);
impl_uint!(u16);
impl_uint!(u32);
impl_uint!(u64);

impl RlpEncode for IpAddr {
    fn rlp_encode(&self, buf: &mut Vec<u8>) {
        match self {
            IpAddr::V4(v4) => encode_bytes(&v4.octets(), buf),
            IpAddr::V6(v6) => encode_bytes(&v6.octets(), buf),
        }
    }
}

impl RlpDecode for IpAddr {
    fn rlp_decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError> {
        let (is_list, payload, rest) = decode_item(buf)?;
        if is_list {
            return Err(RlpDecodeError::UnexpectedList);
        }
        match payload.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(payload);
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(payload);
                Ok((IpAddr::V6(Ipv6Addr::from(octets)), rest))
            }
            _ => Err(RlpDecodeError::InvalidLength),
        }
    }
}

impl<T: RlpEncode> RlpEncode for Vec<T> {
    fn rlp_encode(&self, buf: &mut Vec<u8>) {
        let mut payload = Vec::new();
        for item in self {
            item.rlp_encode(&mut payload);
        }
        encode_list_payload(&payload, buf);
    }
}

impl<T: RlpDecode> RlpDecode for Vec<T> {
    fn rlp_decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError> {
        let (is_list, mut payload, rest) = decode_item(buf)?;
        if !is_list {
            return Err(RlpDecodeError::UnexpectedString);
        }
        let mut items = Vec::new();
        while !payload.is_empty() {
            let (item, remainder) = T::rlp_decode_unfinished(payload)?;
            items.push(item);
            payload = remainder;
        }
        Ok((items, rest))
    }
}

/// Builds a list-typed RLP item out of already-encoded fields, mirroring the
/// field-by-field struct encoders used throughout the wire types.
pub struct Encoder {
    payload: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { payload: Vec::new() }
    }

    pub fn field<T: RlpEncode>(mut self, value: &T) -> Self {
        value.rlp_encode(&mut self.payload);
        self
    }

    /// Encodes a raw byte string field (signatures, public keys, hashes) —
    /// these are `&[u8]` slices rather than `RlpEncode` values since a byte
    /// string and a list of bytes differ in their RLP length prefix.
    pub fn bytes_field(mut self, bytes: &[u8]) -> Self {
        encode_bytes(bytes, &mut self.payload);
        self
    }

    pub fn raw_field(mut self, already_encoded: &[u8]) -> Self {
        self.payload.extend_from_slice(already_encoded);
        self
    }

    pub fn finish(self, out: &mut Vec<u8>) {
        encode_list_payload(&self.payload, out);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwraps the outer list and hands back a cursor over its payload, so
/// callers can pull fields off in order the way `decode_field` does.
pub struct Decoder<'a> {
    payload: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RlpDecodeError> {
        let (is_list, payload, _rest) = decode_item(buf)?;
        if !is_list {
            return Err(RlpDecodeError::UnexpectedString);
        }
        Ok(Self { payload })
    }

    pub fn field<T: RlpDecode>(&mut self, name: &'static str) -> Result<T, RlpDecodeError> {
        let (value, rest) = T::rlp_decode_unfinished(self.payload)
            .map_err(|e| RlpDecodeError::Field(name, Box::new(e)))?;
        self.payload = rest;
        Ok(value)
    }

    /// Decodes a raw byte string field (signatures, public keys, hashes).
    pub fn bytes_field(&mut self, name: &'static str) -> Result<Vec<u8>, RlpDecodeError> {
        let (is_list, payload, rest) = decode_item(self.payload)
            .map_err(|e| RlpDecodeError::Field(name, Box::new(e)))?;
        if is_list {
            return Err(RlpDecodeError::Field(
                name,
                Box::new(RlpDecodeError::UnexpectedList),
            ));
        }
        self.payload = rest;
        Ok(payload.to_vec())
    }

    /// Remaining undecoded payload bytes, for trailing optional fields like
    /// `enr_seq` that some peers omit.
    pub fn remaining(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u64() {
        for n in [0u64, 1, 127, 128, 255, 256, 65535, 1_000_000_000] {
            let encoded = n.rlp_bytes();
            let (decoded, rest) = u64::rlp_decode_unfinished(&encoded).unwrap();
            assert_eq!(decoded, n);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn roundtrip_ipv4() {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let encoded = ip.rlp_bytes();
        let (decoded, rest) = IpAddr::rlp_decode_unfinished(&encoded).unwrap();
        assert_eq!(decoded, ip);
        assert!(rest.is_empty());
    }

    #[test]
    fn list_roundtrip() {
        let mut out = Vec::new();
        Encoder::new()
            .field(&1u32)
            .field(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .finish(&mut out);
        let mut decoder = Decoder::new(&out).unwrap();
        let a: u32 = decoder.field("a").unwrap();
        let b: IpAddr = decoder.field("b").unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn vec_of_uints_roundtrip() {
        let values: Vec<u32> = vec![1, 256, 70000];
        let encoded = values.rlp_bytes();
        let (decoded, rest) = Vec::<u32>::rlp_decode_unfinished(&encoded).unwrap();
        assert_eq!(decoded, values);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_vec_roundtrips() {
        let values: Vec<u32> = vec![];
        let encoded = values.rlp_bytes();
        let (decoded, _) = Vec::<u32>::rlp_decode_unfinished(&encoded).unwrap();
        assert!(decoded.is_empty());
    }
}
