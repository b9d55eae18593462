//! BER encoding of SNMP messages: community-based v1/v2c and USM-based v3.

use super::{format_oid, parse_oid, SnmpValue, VarBind};
use crate::error::TransportError;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

/// msgFlags bits.
pub const FLAG_AUTH: u8 = 0x01;
pub const FLAG_PRIV: u8 = 0x02;
pub const FLAG_REPORTABLE: u8 = 0x04;

const SNMP_V3: i64 = 3;
const USM_SECURITY_MODEL: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Get,
    GetNext,
    Response,
    GetBulk,
    Report,
}

impl PduType {
    fn tag(self) -> u8 {
        match self {
            PduType::Get => 0xA0,
            PduType::GetNext => 0xA1,
            PduType::Response => 0xA2,
            PduType::GetBulk => 0xA5,
            PduType::Report => 0xA8,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0xA0 => Some(PduType::Get),
            0xA1 => Some(PduType::GetNext),
            0xA2 => Some(PduType::Response),
            0xA5 => Some(PduType::GetBulk),
            0xA8 => Some(PduType::Report),
            _ => None,
        }
    }
}

/// A PDU. For GETBULK, `error_status` carries non-repeaters and
/// `error_index` carries max-repetitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub kind: PduType,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<VarBind>,
}

impl Pdu {
    /// A request carrying `oids` with NULL values.
    pub fn request(kind: PduType, request_id: i32, oids: &[String]) -> Self {
        Self {
            kind,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds: oids.iter().map(|o| VarBind::new(o.clone(), SnmpValue::Null)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 0 = v1, 1 = v2c
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu: Pdu,
}

impl Message {
    /// A request carrying `oids` with NULL values.
    pub fn request(version: i64, community: &[u8], kind: PduType, request_id: i32, oids: &[String]) -> Self {
        Self {
            version,
            community: community.to_vec(),
            pdu: Pdu::request(kind, request_id, oids),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut msg = encode_integer(self.version);
        msg.extend(tlv(TAG_OCTET_STRING, &self.community));
        msg.extend(encode_pdu(&self.pdu)?);
        Ok(tlv(TAG_SEQUENCE, &msg))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        let mut outer = Reader::new(buf);
        let (tag, body) = outer.read()?;
        expect_tag(tag, TAG_SEQUENCE, "message")?;

        let mut r = Reader::new(body);
        let version = r.read_integer()?;
        let community = r.read_octets("community")?;
        let (tag, pdu) = r.read()?;

        Ok(Message {
            version,
            community: community.to_vec(),
            pdu: decode_pdu(tag, pdu)?,
        })
    }
}

/// A PDU with its v3 context.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPdu {
    pub context_engine_id: Vec<u8>,
    pub context_name: Vec<u8>,
    pub pdu: Pdu,
}

impl ScopedPdu {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut body = tlv(TAG_OCTET_STRING, &self.context_engine_id);
        body.extend(tlv(TAG_OCTET_STRING, &self.context_name));
        body.extend(encode_pdu(&self.pdu)?);
        Ok(tlv(TAG_SEQUENCE, &body))
    }

    /// Decode the leading scoped PDU of `buf`. Trailing bytes, such as
    /// cipher padding, are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        let mut outer = Reader::new(buf);
        let (tag, body) = outer.read()?;
        expect_tag(tag, TAG_SEQUENCE, "scoped PDU")?;
        Self::decode_body(body)
    }

    fn decode_body(body: &[u8]) -> Result<Self, TransportError> {
        let mut r = Reader::new(body);
        let context_engine_id = r.read_octets("context engine id")?.to_vec();
        let context_name = r.read_octets("context name")?.to_vec();
        let (tag, pdu) = r.read()?;
        Ok(Self {
            context_engine_id,
            context_name,
            pdu: decode_pdu(tag, pdu)?,
        })
    }
}

/// UsmSecurityParameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsmParams {
    pub engine_id: Vec<u8>,
    pub engine_boots: i64,
    pub engine_time: i64,
    pub user_name: Vec<u8>,
    pub auth_params: Vec<u8>,
    pub priv_params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopedData {
    Plain(ScopedPdu),
    Encrypted(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct V3Message {
    pub msg_id: i32,
    pub max_size: i64,
    pub flags: u8,
    pub usm: UsmParams,
    pub data: ScopedData,
}

impl V3Message {
    /// Encode the message. Also returns the offset of the
    /// authentication parameters inside the packet.
    pub fn encode(&self) -> Result<(Vec<u8>, usize), TransportError> {
        let mut global = encode_integer(self.msg_id as i64);
        global.extend(encode_integer(self.max_size));
        global.extend(tlv(TAG_OCTET_STRING, &[self.flags]));
        global.extend(encode_integer(USM_SECURITY_MODEL));

        let mut head = encode_integer(SNMP_V3);
        head.extend(tlv(TAG_SEQUENCE, &global));

        let mut usm_body = tlv(TAG_OCTET_STRING, &self.usm.engine_id);
        usm_body.extend(encode_integer(self.usm.engine_boots));
        usm_body.extend(encode_integer(self.usm.engine_time));
        usm_body.extend(tlv(TAG_OCTET_STRING, &self.usm.user_name));
        let before_auth = usm_body.len();
        usm_body.extend(tlv(TAG_OCTET_STRING, &self.usm.auth_params));
        usm_body.extend(tlv(TAG_OCTET_STRING, &self.usm.priv_params));
        let usm = tlv(TAG_SEQUENCE, &usm_body);

        let data = match &self.data {
            ScopedData::Plain(scoped) => scoped.encode()?,
            ScopedData::Encrypted(bytes) => tlv(TAG_OCTET_STRING, bytes),
        };

        let mut body = head;
        let security_at = body.len();
        body.extend(tlv(TAG_OCTET_STRING, &usm));
        body.extend(data);

        let auth_at = header_len(body.len())
            + security_at
            + header_len(usm.len())
            + header_len(usm_body.len())
            + before_auth
            + header_len(self.usm.auth_params.len());
        Ok((tlv(TAG_SEQUENCE, &body), auth_at))
    }

    /// Decode a v3 message. Also returns the offset of the authentication
    /// parameters inside `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), TransportError> {
        let mut outer = Reader::new(buf);
        let (tag, body) = outer.read()?;
        expect_tag(tag, TAG_SEQUENCE, "message")?;

        let mut r = Reader::new(body);
        let version = r.read_integer()?;
        if version != SNMP_V3 {
            return Err(TransportError::Decode(format!("expected SNMPv3, found version {}", version)));
        }

        let (tag, global) = r.read()?;
        expect_tag(tag, TAG_SEQUENCE, "global data")?;
        let mut g = Reader::new(global);
        let msg_id = g.read_integer()? as i32;
        let max_size = g.read_integer()?;
        let flags = match g.read_octets("flags")? {
            [flags] => *flags,
            other => return Err(TransportError::Decode(format!("flags must be one byte, found {}", other.len()))),
        };
        let model = g.read_integer()?;
        if model != USM_SECURITY_MODEL {
            return Err(TransportError::Decode(format!("unsupported security model {}", model)));
        }

        let security = r.read_octets("security parameters")?;
        let mut s = Reader::new(security);
        let (tag, params) = s.read()?;
        expect_tag(tag, TAG_SEQUENCE, "USM parameters")?;
        let mut p = Reader::new(params);
        let engine_id = p.read_octets("engine id")?.to_vec();
        let engine_boots = p.read_integer()?;
        let engine_time = p.read_integer()?;
        let user_name = p.read_octets("user name")?.to_vec();
        let auth = p.read_octets("authentication parameters")?;
        let priv_params = p.read_octets("privacy parameters")?.to_vec();
        let auth_at = auth.as_ptr() as usize - buf.as_ptr() as usize;

        let (tag, data) = r.read()?;
        let data = match tag {
            TAG_SEQUENCE => ScopedData::Plain(ScopedPdu::decode_body(data)?),
            TAG_OCTET_STRING => ScopedData::Encrypted(data.to_vec()),
            other => return Err(TransportError::Decode(format!("unexpected scoped data tag 0x{:02x}", other))),
        };

        Ok((
            V3Message {
                msg_id,
                max_size,
                flags,
                usm: UsmParams {
                    engine_id,
                    engine_boots,
                    engine_time,
                    user_name,
                    auth_params: auth.to_vec(),
                    priv_params,
                },
                data,
            },
            auth_at,
        ))
    }
}

/// The id a response is matched on: the PDU request id for v1/v2c and the
/// msgID for v3.
pub fn response_id(buf: &[u8]) -> Result<i32, TransportError> {
    let mut outer = Reader::new(buf);
    let (tag, body) = outer.read()?;
    expect_tag(tag, TAG_SEQUENCE, "message")?;

    let mut r = Reader::new(body);
    if r.read_integer()? == SNMP_V3 {
        let (tag, global) = r.read()?;
        expect_tag(tag, TAG_SEQUENCE, "global data")?;
        return Ok(Reader::new(global).read_integer()? as i32);
    }
    r.read_octets("community")?;
    let (_, pdu) = r.read()?;
    Ok(Reader::new(pdu).read_integer()? as i32)
}

/// Total length of a TLV whose header is at the start of `buf`, once enough
/// of the header is present.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, TransportError> {
    let Some(&first) = buf.get(1) else {
        return Ok(None);
    };
    if first & 0x80 == 0 {
        return Ok(Some(2 + first as usize));
    }
    let n = (first & 0x7f) as usize;
    if n == 0 || n > 4 {
        return Err(TransportError::Decode(format!("unsupported length form 0x{:02x}", first)));
    }
    let Some(bytes) = buf.get(2..2 + n) else {
        return Ok(None);
    };
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok(Some(2 + n + len))
}

fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>, TransportError> {
    let mut varbinds = Vec::new();
    for vb in &pdu.varbinds {
        let mut body = encode_oid(&vb.oid)?;
        body.extend(encode_value(&vb.value)?);
        varbinds.extend(tlv(TAG_SEQUENCE, &body));
    }

    let mut body = encode_integer(pdu.request_id as i64);
    body.extend(encode_integer(pdu.error_status));
    body.extend(encode_integer(pdu.error_index));
    body.extend(tlv(TAG_SEQUENCE, &varbinds));
    Ok(tlv(pdu.kind.tag(), &body))
}

fn decode_pdu(tag: u8, body: &[u8]) -> Result<Pdu, TransportError> {
    let kind = PduType::from_tag(tag)
        .ok_or_else(|| TransportError::Decode(format!("unsupported PDU type 0x{:02x}", tag)))?;

    let mut p = Reader::new(body);
    let request_id = p.read_integer()? as i32;
    let error_status = p.read_integer()?;
    let error_index = p.read_integer()?;
    let (tag, list) = p.read()?;
    expect_tag(tag, TAG_SEQUENCE, "varbind list")?;

    let mut varbinds = Vec::new();
    let mut l = Reader::new(list);
    while !l.is_empty() {
        let (tag, vb) = l.read()?;
        expect_tag(tag, TAG_SEQUENCE, "varbind")?;
        let mut v = Reader::new(vb);
        let (tag, oid) = v.read()?;
        expect_tag(tag, TAG_OID, "varbind name")?;
        let (tag, value) = v.read()?;
        varbinds.push(VarBind {
            oid: decode_oid(oid)?,
            value: decode_value(tag, value)?,
        });
    }

    Ok(Pdu {
        kind,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

fn expect_tag(found: u8, expected: u8, what: &str) -> Result<(), TransportError> {
    if found == expected {
        Ok(())
    } else {
        Err(TransportError::Decode(format!(
            "{}: expected tag 0x{:02x}, found 0x{:02x}",
            what, expected, found
        )))
    }
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn header_len(len: usize) -> usize {
    let mut out = Vec::with_capacity(5);
    encode_length(len, &mut out);
    1 + out.len()
}

fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(tag);
    encode_length(body.len(), &mut out);
    out.extend_from_slice(body);
    out
}

fn integer_bytes(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    // Drop redundant sign octets.
    while start < bytes.len() - 1 {
        let (cur, next) = (bytes[start], bytes[start + 1]);
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn unsigned_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(bytes.len() - 1);
    let mut out = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&bytes[skip..]);
    out
}

fn encode_integer(v: i64) -> Vec<u8> {
    tlv(TAG_INTEGER, &integer_bytes(v))
}

fn encode_oid(oid: &str) -> Result<Vec<u8>, TransportError> {
    let parts = parse_oid(oid)?;
    if parts.len() < 2 {
        return Err(TransportError::Encode(format!("OID '{}' needs two components", oid)));
    }
    if parts[0] > 2 || (parts[0] < 2 && parts[1] >= 40) {
        return Err(TransportError::Encode(format!("invalid OID '{}'", oid)));
    }

    let mut body = Vec::with_capacity(parts.len() + 4);
    push_base128(parts[0] * 40 + parts[1], &mut body);
    for &c in &parts[2..] {
        push_base128(c, &mut body);
    }
    Ok(tlv(TAG_OID, &body))
}

fn push_base128(mut v: u32, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 5];
    let mut n = 0;
    loop {
        tmp[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        out.push(tmp[i] | cont);
    }
}

fn encode_value(value: &SnmpValue) -> Result<Vec<u8>, TransportError> {
    Ok(match value {
        SnmpValue::Integer(v) => encode_integer(*v),
        SnmpValue::OctetString(b) => tlv(TAG_OCTET_STRING, b),
        SnmpValue::Null => tlv(TAG_NULL, &[]),
        SnmpValue::ObjectIdentifier(o) => encode_oid(o)?,
        SnmpValue::IpAddress(ip) => tlv(TAG_IP_ADDRESS, ip),
        SnmpValue::Counter32(v) => tlv(TAG_COUNTER32, &unsigned_bytes(*v as u64)),
        SnmpValue::Gauge32(v) => tlv(TAG_GAUGE32, &unsigned_bytes(*v as u64)),
        SnmpValue::TimeTicks(v) => tlv(TAG_TIMETICKS, &unsigned_bytes(*v as u64)),
        SnmpValue::Opaque(b) => tlv(TAG_OPAQUE, b),
        SnmpValue::Counter64(v) => tlv(TAG_COUNTER64, &unsigned_bytes(*v)),
        SnmpValue::NoSuchObject => tlv(TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => tlv(TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => tlv(TAG_END_OF_MIB_VIEW, &[]),
    })
}

fn decode_oid(body: &[u8]) -> Result<String, TransportError> {
    if body.is_empty() {
        return Err(TransportError::Decode("empty OID".into()));
    }
    let mut parts: Vec<u32> = Vec::with_capacity(body.len() + 1);
    let mut acc: u64 = 0;
    for (i, b) in body.iter().enumerate() {
        acc = (acc << 7) | (b & 0x7f) as u64;
        if acc > u32::MAX as u64 {
            return Err(TransportError::Decode("OID component overflow".into()));
        }
        if b & 0x80 == 0 {
            if parts.is_empty() {
                let first = acc as u32;
                let (a, b) = if first < 80 { (first / 40, first % 40) } else { (2, first - 80) };
                parts.push(a);
                parts.push(b);
            } else {
                parts.push(acc as u32);
            }
            acc = 0;
        } else if i == body.len() - 1 {
            return Err(TransportError::Decode("truncated OID".into()));
        }
    }
    Ok(format_oid(&parts))
}

fn decode_signed(body: &[u8]) -> Result<i64, TransportError> {
    if body.is_empty() || body.len() > 8 {
        return Err(TransportError::Decode(format!("bad integer length {}", body.len())));
    }
    let mut v: i64 = if body[0] & 0x80 != 0 { -1 } else { 0 };
    for b in body {
        v = (v << 8) | *b as i64;
    }
    Ok(v)
}

fn decode_unsigned(body: &[u8]) -> Result<u64, TransportError> {
    let trimmed = match body {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if trimmed.is_empty() || trimmed.len() > 8 {
        return Err(TransportError::Decode(format!("bad unsigned length {}", body.len())));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn decode_value(tag: u8, body: &[u8]) -> Result<SnmpValue, TransportError> {
    let small = |v: u64| -> Result<u32, TransportError> {
        u32::try_from(v).map_err(|_| TransportError::Decode(format!("value {} exceeds 32 bits", v)))
    };
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_signed(body)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(body.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::ObjectIdentifier(decode_oid(body)?),
        TAG_IP_ADDRESS => {
            let ip: [u8; 4] = body
                .try_into()
                .map_err(|_| TransportError::Decode("IpAddress must be 4 bytes".into()))?;
            SnmpValue::IpAddress(ip)
        }
        TAG_COUNTER32 => SnmpValue::Counter32(small(decode_unsigned(body)?)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(small(decode_unsigned(body)?)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(small(decode_unsigned(body)?)?),
        TAG_OPAQUE => SnmpValue::Opaque(body.to_vec()),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(body)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => return Err(TransportError::Decode(format!("unknown value tag 0x{:02x}", other))),
    })
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

    fn byte(&mut self) -> Result<u8, TransportError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| TransportError::Decode("unexpected end of packet".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read(&mut self) -> Result<(u8, &'a [u8]), TransportError> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                return Err(TransportError::Decode(format!("unsupported length form 0x{:02x}", first)));
            }
            let mut len = 0usize;
            for _ in 0..n {
                len = (len << 8) | self.byte()? as usize;
            }
            len
        };
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| TransportError::Decode("length exceeds packet".into()))?;
        let body = &self.buf[self.pos..end];
        self.pos = end;
        Ok((tag, body))
    }

    fn read_octets(&mut self, what: &str) -> Result<&'a [u8], TransportError> {
        let (tag, body) = self.read()?;
        expect_tag(tag, TAG_OCTET_STRING, what)?;
        Ok(body)
    }

    fn read_integer(&mut self) -> Result<i64, TransportError> {
        let (tag, body) = self.read()?;
        expect_tag(tag, TAG_INTEGER, "integer")?;
        decode_signed(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn get_request_bytes() {
        // snmpget -v2c -c public host 1.3.6.1.2.1.1.3.0, request id 1
        let msg = Message::request(1, b"public", PduType::Get, 1, &["1.3.6.1.2.1.1.3.0".to_string()]);
        let expected: Vec<u8> = vec![
            0x30, 0x26, 0x02, 0x01, 0x01, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x19,
            0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
            0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x03, 0x00, 0x05, 0x00,
        ];
        assert_eq!(msg.encode().unwrap(), expected);
    }

    #[test]
    fn response_decodes_every_type() {
        let varbinds = vec![
            VarBind::new("1.3.6.1.2.1.1.3.0", SnmpValue::TimeTicks(123_456)),
            VarBind::new("1.3.6.1.2.1.2.2.1.2.1", SnmpValue::OctetString(b"eth0".to_vec())),
            VarBind::new("1.3.6.1.2.1.2.2.1.10.1", SnmpValue::Counter32(u32::MAX)),
            VarBind::new("1.3.6.1.2.1.31.1.1.1.6.1", SnmpValue::Counter64(u64::MAX)),
            VarBind::new("1.3.6.1.2.1.2.2.1.5.1", SnmpValue::Gauge32(1_000_000_000)),
            VarBind::new("1.3.6.1.2.1.4.20.1.1.1", SnmpValue::IpAddress([10, 0, 0, 1])),
            VarBind::new("1.3.6.1.2.1.1.2.0", SnmpValue::ObjectIdentifier("1.3.6.1.4.1.9.1.516".into())),
            VarBind::new("1.3.6.1.2.1.2.2.1.8.1", SnmpValue::Integer(-129)),
            VarBind::new("1.3.6.1.2.1.99.0", SnmpValue::NoSuchObject),
            VarBind::new("1.3.6.1.2.1.99.1", SnmpValue::EndOfMibView),
        ];
        let msg = Message {
            version: 1,
            community: b"public".to_vec(),
            pdu: Pdu {
                kind: PduType::Response,
                request_id: 0x1234_5678,
                error_status: 0,
                error_index: 0,
                varbinds,
            },
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn long_lengths_and_large_components() {
        let oid = format!("1.3.6.1.4.1.{}.{}", u32::MAX, 200);
        let msg = Message {
            version: 0,
            community: vec![b'x'; 300],
            pdu: Pdu {
                kind: PduType::GetBulk,
                request_id: -5,
                error_status: 0,
                error_index: 10,
                varbinds: vec![VarBind::new(oid.clone(), SnmpValue::OctetString(vec![0xff; 200]))],
            },
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.pdu.varbinds[0].oid, oid);
        assert_eq!(decoded.pdu.request_id, -5);
        assert_eq!(decoded.community.len(), 300);
    }

    #[test]
    fn integers_are_minimal() {
        assert_eq!(integer_bytes(0), vec![0x00]);
        assert_eq!(integer_bytes(127), vec![0x7f]);
        assert_eq!(integer_bytes(128), vec![0x00, 0x80]);
        assert_eq!(integer_bytes(-1), vec![0xff]);
        assert_eq!(integer_bytes(-129), vec![0xff, 0x7f]);
        assert_eq!(unsigned_bytes(0), vec![0x00]);
        assert_eq!(unsigned_bytes(0xff), vec![0x00, 0xff]);
    }

    #[test]
    fn malformed_packets_fail() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[0x30, 0x05, 0x02, 0x01]).is_err());
        assert!(Message::decode(&[0x04, 0x00]).is_err());
        assert!(decode_oid(&[0x2b, 0x86]).is_err());
    }

    fn v3(data: ScopedData, auth_params: Vec<u8>) -> V3Message {
        V3Message {
            msg_id: 77,
            max_size: 65_507,
            flags: FLAG_AUTH | FLAG_REPORTABLE,
            usm: UsmParams {
                engine_id: vec![0x80, 0x00, 0x1f, 0x88, 0x04, 0x01],
                engine_boots: 3,
                engine_time: 1200,
                user_name: b"monitor".to_vec(),
                auth_params,
                priv_params: Vec::new(),
            },
            data,
        }
    }

    #[test]
    fn v3_message_locates_auth_params() {
        let scoped = ScopedPdu {
            context_engine_id: vec![0x80, 0x00, 0x1f, 0x88, 0x04, 0x01],
            context_name: Vec::new(),
            pdu: Pdu::request(PduType::Get, 77, &["1.3.6.1.2.1.1.3.0".to_string()]),
        };
        let marker = vec![0xaa; 12];
        let msg = v3(ScopedData::Plain(scoped.clone()), marker.clone());
        let (packet, at) = msg.encode().unwrap();
        assert_eq!(&packet[at..at + 12], marker.as_slice());

        let (decoded, decoded_at) = V3Message::decode(&packet).unwrap();
        assert_eq!(decoded_at, at);
        assert_eq!(decoded, msg);
        assert_eq!(response_id(&packet).unwrap(), 77);

        // a long encrypted payload moves every length into long form
        let msg = v3(ScopedData::Encrypted(vec![0x55; 400]), marker.clone());
        let (packet, at) = msg.encode().unwrap();
        assert_eq!(&packet[at..at + 12], marker.as_slice());
        assert_eq!(V3Message::decode(&packet).unwrap().0.data, ScopedData::Encrypted(vec![0x55; 400]));
    }

    #[test]
    fn scoped_pdu_ignores_padding() {
        let scoped = ScopedPdu {
            context_engine_id: vec![1, 2, 3],
            context_name: b"vlan-10".to_vec(),
            pdu: Pdu::request(PduType::GetNext, 5, &["1.3.6.1.2.1.2".to_string()]),
        };
        let mut bytes = scoped.encode().unwrap();
        bytes.extend([0, 0, 0]);
        assert_eq!(ScopedPdu::decode(&bytes).unwrap(), scoped);
    }

    #[test]
    fn community_response_id_and_framing() {
        let msg = Message::request(1, b"public", PduType::Get, 4242, &["1.3.6.1.2.1.1.3.0".to_string()]);
        let packet = msg.encode().unwrap();
        assert_eq!(response_id(&packet).unwrap(), 4242);
        assert_eq!(frame_len(&packet).unwrap(), Some(packet.len()));
        assert_eq!(frame_len(&packet[..1]).unwrap(), None);

        let long = tlv(TAG_SEQUENCE, &[0u8; 300]);
        assert_eq!(frame_len(&long[..3]).unwrap(), None);
        assert_eq!(frame_len(&long[..4]).unwrap(), Some(304));
        assert!(frame_len(&[0x30, 0x80]).is_err());
    }
}
