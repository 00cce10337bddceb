use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// PROXY protocol v2 signature.
pub const PP2_SIGNATURE: [u8; 12] =
    [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];
pub const PP2_HEADER_LEN: usize = 16;
const PP2_VERSION: u8 = 0x20;
const PP2_CMD_LOCAL: u8 = 0x00;
const PP2_CMD_PROXY: u8 = 0x01;

const PP2_ADDR_LEN_INET: usize = 12;
const PP2_ADDR_LEN_INET6: usize = 36;

pub const PP2_TYPE_ALPN: u8 = 0x01;
pub const PP2_TYPE_AUTHORITY: u8 = 0x02;
pub const PP2_TYPE_CRC32C: u8 = 0x03;
pub const PP2_TYPE_UNIQUE_ID: u8 = 0x05;
pub const PP2_TYPE_SSL: u8 = 0x20;
pub const PP2_TYPE_NETNS: u8 = 0x30;

/// A v1 line never exceeds this, so it always fits one segment.
pub const PP1_MAX_LEN: usize = 107;
/// UNIQUE_ID TLVs longer than this are rejected.
pub const PP2_UNIQUE_ID_MAX: usize = 128;
/// AUTHORITY TLVs longer than this are rejected.
pub const PP2_AUTHORITY_MAX: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PpError {
    /// Header incomplete and the stream can no longer be polled.
    #[error("truncated proxy header")]
    Truncated,
    /// First bytes match neither v1 nor v2.
    #[error("missing proxy header")]
    NotHeader,
    #[error("malformed proxy header")]
    BadHeader,
    #[error("unsupported proxy protocol")]
    BadProto,
}

/// Successful parse outcome: addresses (absent for LOCAL / UNKNOWN), carried
/// TLVs and the exact byte count to strip from the stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProxyHdr {
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    pub authority: Option<Vec<u8>>,
    pub unique_id: Option<Vec<u8>>,
    pub consumed: usize,
}

/// Parses a PROXY v1 or v2 header at the start of `data`.
/// `Ok(None)` means more bytes are needed (caller keeps peeking).
pub fn parse(data: &[u8]) -> Result<Option<ProxyHdr>, PpError> {
    if data.len() < 6 {
        return Ok(None);
    }
    if &data[..6] == b"PROXY " {
        return parse_v1(data);
    }
    parse_v2(data)
}

fn parse_v1(data: &[u8]) -> Result<Option<ProxyHdr>, PpError> {
    let Some(end) = data.iter().position(|&c| c == b'\n') else {
        if data.len() >= PP1_MAX_LEN {
            return Err(PpError::BadHeader);
        }
        return Ok(None);
    };
    if end < 1 || data[end - 1] != b'\r' || end + 1 > PP1_MAX_LEN {
        return Err(PpError::BadHeader);
    }
    let line = &data[6..end - 1];
    let consumed = end + 1;

    if line == b"UNKNOWN" {
        return Ok(Some(ProxyHdr { consumed, ..Default::default() }));
    }

    let mut fields = line.split(|&c| c == b' ');
    let proto = fields.next().ok_or(PpError::BadHeader)?;
    let v6 = match proto {
        b"TCP4" => false,
        b"TCP6" => true,
        _ => return Err(PpError::BadProto),
    };

    let mut addr = |v6: bool| -> Result<IpAddr, PpError> {
        let f = fields.next().ok_or(PpError::BadHeader)?;
        let s = std::str::from_utf8(f).map_err(|_| PpError::BadHeader)?;
        if v6 {
            s.parse::<Ipv6Addr>().map(IpAddr::V6).map_err(|_| PpError::BadHeader)
        } else {
            s.parse::<Ipv4Addr>().map(IpAddr::V4).map_err(|_| PpError::BadHeader)
        }
    };
    let src_ip = addr(v6)?;
    let dst_ip = addr(v6)?;

    let mut port = || -> Result<u16, PpError> {
        let f = fields.next().ok_or(PpError::BadHeader)?;
        let s = std::str::from_utf8(f).map_err(|_| PpError::BadHeader)?;
        s.parse().map_err(|_| PpError::BadHeader)
    };
    let sport = port()?;
    let dport = port()?;
    if fields.next().is_some() {
        return Err(PpError::BadHeader);
    }

    Ok(Some(ProxyHdr {
        src: Some(SocketAddr::new(src_ip, sport)),
        dst: Some(SocketAddr::new(dst_ip, dport)),
        consumed,
        ..Default::default()
    }))
}

fn parse_v2(data: &[u8]) -> Result<Option<ProxyHdr>, PpError> {
    if data.len() < PP2_HEADER_LEN {
        return Ok(None);
    }
    if data[..12] != PP2_SIGNATURE || data[12] & 0xF0 != PP2_VERSION {
        return Err(PpError::NotHeader);
    }
    let total = PP2_HEADER_LEN + u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < total {
        return Ok(None);
    }

    let mut hdr = ProxyHdr { consumed: total, ..Default::default() };

    match data[12] & 0x0F {
        PP2_CMD_LOCAL => return Ok(Some(hdr)),
        PP2_CMD_PROXY => {}
        _ => return Err(PpError::BadHeader),
    }

    let mut tlv_offset = 0usize;
    match data[13] {
        // TCPv4
        0x11 => {
            if total - PP2_HEADER_LEN < PP2_ADDR_LEN_INET {
                return Err(PpError::BadHeader);
            }
            let a = &data[PP2_HEADER_LEN..];
            let src_ip = Ipv4Addr::new(a[0], a[1], a[2], a[3]);
            let dst_ip = Ipv4Addr::new(a[4], a[5], a[6], a[7]);
            let sport = u16::from_be_bytes([a[8], a[9]]);
            let dport = u16::from_be_bytes([a[10], a[11]]);
            hdr.src = Some(SocketAddr::new(IpAddr::V4(src_ip), sport));
            hdr.dst = Some(SocketAddr::new(IpAddr::V4(dst_ip), dport));
            tlv_offset = PP2_HEADER_LEN + PP2_ADDR_LEN_INET;
        }
        // TCPv6
        0x21 => {
            if total - PP2_HEADER_LEN < PP2_ADDR_LEN_INET6 {
                return Err(PpError::BadHeader);
            }
            let a = &data[PP2_HEADER_LEN..];
            let mut s = [0u8; 16];
            let mut d = [0u8; 16];
            s.copy_from_slice(&a[..16]);
            d.copy_from_slice(&a[16..32]);
            let sport = u16::from_be_bytes([a[32], a[33]]);
            let dport = u16::from_be_bytes([a[34], a[35]]);
            hdr.src = Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(s)), sport));
            hdr.dst = Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(d)), dport));
            tlv_offset = PP2_HEADER_LEN + PP2_ADDR_LEN_INET6;
        }
        // unsupported family: keep local addresses, no TLVs to walk
        _ => return Ok(Some(hdr)),
    }

    while tlv_offset < total {
        if tlv_offset + 3 > total {
            return Err(PpError::BadHeader);
        }
        let typ = data[tlv_offset];
        let len = ((data[tlv_offset + 1] as usize) << 8) | data[tlv_offset + 2] as usize;
        let val_start = tlv_offset + 3;
        tlv_offset = val_start + len;
        if tlv_offset > total {
            return Err(PpError::BadHeader);
        }
        let value = &data[val_start..tlv_offset];

        match typ {
            PP2_TYPE_CRC32C => {
                if len != 4 {
                    return Err(PpError::BadHeader);
                }
                let wire = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                // the digest covers the whole header with this field zeroed
                let mut copy = data[..total].to_vec();
                copy[val_start..val_start + 4].fill(0);
                if crc32c::crc32c(&copy) != wire {
                    return Err(PpError::BadHeader);
                }
            }
            PP2_TYPE_AUTHORITY => {
                if len > PP2_AUTHORITY_MAX {
                    return Err(PpError::BadHeader);
                }
                hdr.authority = Some(value.to_vec());
            }
            PP2_TYPE_UNIQUE_ID => {
                if len > PP2_UNIQUE_ID_MAX {
                    return Err(PpError::BadHeader);
                }
                hdr.unique_id = Some(value.to_vec());
            }
            // SSL and NETNS payloads are carried for layers we don't model
            PP2_TYPE_SSL | PP2_TYPE_NETNS | PP2_TYPE_ALPN => {}
            _ => {}
        }
    }
    if tlv_offset != total {
        return Err(PpError::BadHeader);
    }

    Ok(Some(hdr))
}

/// Formats a v1 line for `src`/`dst`. Mixed or missing families produce the
/// UNKNOWN form.
pub fn make_v1(src: Option<SocketAddr>, dst: Option<SocketAddr>) -> Vec<u8> {
    match (src, dst) {
        (Some(SocketAddr::V4(s)), Some(SocketAddr::V4(d))) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            s.ip(),
            d.ip(),
            s.port(),
            d.port()
        )
        .into_bytes(),
        (Some(SocketAddr::V6(s)), Some(SocketAddr::V6(d))) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            s.ip(),
            d.ip(),
            s.port(),
            d.port()
        )
        .into_bytes(),
        _ => b"PROXY UNKNOWN\r\n".to_vec(),
    }
}

/// Optional TLVs carried by [`make_v2`].
#[derive(Debug, Default)]
pub struct V2Tlvs<'a> {
    pub authority: Option<&'a [u8]>,
    pub unique_id: Option<&'a [u8]>,
    pub alpn: Option<&'a [u8]>,
    /// Append a CRC32C TLV covering the whole header.
    pub crc32c: bool,
}

/// Builds a binary v2 header. Unknown/mismatched families yield the UNSPEC
/// form with no address block.
pub fn make_v2(src: Option<SocketAddr>, dst: Option<SocketAddr>, tlvs: &V2Tlvs) -> Vec<u8> {
    let mut out = Vec::with_capacity(PP2_HEADER_LEN + 64);
    out.extend_from_slice(&PP2_SIGNATURE);
    out.push(PP2_VERSION | PP2_CMD_PROXY);

    match (src, dst) {
        (Some(SocketAddr::V4(s)), Some(SocketAddr::V4(d))) => {
            out.push(0x11);
            out.extend_from_slice(&[0, 0]); // patched below
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&d.ip().octets());
            out.extend_from_slice(&s.port().to_be_bytes());
            out.extend_from_slice(&d.port().to_be_bytes());
        }
        (Some(SocketAddr::V6(s)), Some(SocketAddr::V6(d))) => {
            out.push(0x21);
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&d.ip().octets());
            out.extend_from_slice(&s.port().to_be_bytes());
            out.extend_from_slice(&d.port().to_be_bytes());
        }
        _ => {
            out.push(0x00);
            out.extend_from_slice(&[0, 0]);
        }
    }

    let mut push_tlv = |out: &mut Vec<u8>, typ: u8, val: &[u8]| {
        out.push(typ);
        out.extend_from_slice(&(val.len() as u16).to_be_bytes());
        out.extend_from_slice(val);
    };
    if let Some(a) = tlvs.alpn {
        push_tlv(&mut out, PP2_TYPE_ALPN, a);
    }
    if let Some(a) = tlvs.authority {
        push_tlv(&mut out, PP2_TYPE_AUTHORITY, a);
    }
    if let Some(u) = tlvs.unique_id {
        push_tlv(&mut out, PP2_TYPE_UNIQUE_ID, u);
    }

    let crc_val_at = if tlvs.crc32c {
        push_tlv(&mut out, PP2_TYPE_CRC32C, &[0, 0, 0, 0]);
        Some(out.len() - 4)
    } else {
        None
    };

    let len = (out.len() - PP2_HEADER_LEN) as u16;
    out[14..16].copy_from_slice(&len.to_be_bytes());

    if let Some(at) = crc_val_at {
        let crc = crc32c::crc32c(&out);
        out[at..at + 4].copy_from_slice(&crc.to_be_bytes());
    }
    out
}

/// NetScaler Client-IP insertion header: configurable magic, then a legacy
/// or standard envelope around a raw IPv4/IPv6 + TCP header pair.
pub fn parse_cip(data: &[u8], magic: u32) -> Result<Option<ProxyHdr>, PpError> {
    if data.len() < 12 {
        return Ok(None);
    }
    if u32::from_be_bytes([data[0], data[1], data[2], data[3]]) != magic {
        return Err(PpError::NotHeader);
    }

    let (ofs, hdr_len) = if data[8] & 0xD0 == 0x40 {
        // legacy envelope
        (8usize, u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize)
    } else if data[8] == 0x00 {
        // standard envelope
        (12usize, u16::from_be_bytes([data[10], data[11]]) as usize)
    } else {
        return Err(PpError::BadProto);
    };

    if data.len() < ofs + 20 {
        return Ok(None);
    }
    let ip = &data[ofs..];
    let ip_ver = ip[0] >> 4;

    let (src, dst, need) = if ip_ver == 4 {
        if data.len() < ofs + 40 || data.len() < ofs + hdr_len {
            return Ok(None);
        }
        if ip[9] != libc::IPPROTO_TCP as u8 {
            return Err(PpError::BadProto);
        }
        let ihl = (ip[0] & 0x0F) as usize * 4;
        let tcp = &ip[ihl..];
        let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        let sport = u16::from_be_bytes([tcp[0], tcp[1]]);
        let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
        (
            SocketAddr::new(IpAddr::V4(src_ip), sport),
            SocketAddr::new(IpAddr::V4(dst_ip), dport),
            hdr_len,
        )
    } else if ip_ver == 6 {
        if data.len() < ofs + 60 || data.len() < ofs + hdr_len {
            return Ok(None);
        }
        if ip[6] != libc::IPPROTO_TCP as u8 {
            return Err(PpError::BadProto);
        }
        let mut s = [0u8; 16];
        let mut d = [0u8; 16];
        s.copy_from_slice(&ip[8..24]);
        d.copy_from_slice(&ip[24..40]);
        let tcp = &ip[40..];
        let sport = u16::from_be_bytes([tcp[0], tcp[1]]);
        let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
        (
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(s)), sport),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(d)), dport),
            hdr_len,
        )
    } else {
        return Err(PpError::BadProto);
    };

    Ok(Some(ProxyHdr {
        src: Some(src),
        dst: Some(dst),
        consumed: ofs + need,
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_tcp4() {
        let input = b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 443\r\nGET / HTTP/1.1\r\n";
        let hdr = parse(input).unwrap().unwrap();
        assert_eq!(hdr.src.unwrap(), "192.0.2.1:56324".parse().unwrap());
        assert_eq!(hdr.dst.unwrap(), "198.51.100.2:443".parse().unwrap());
        assert_eq!(&input[hdr.consumed..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn v1_tcp6_and_unknown() {
        let hdr = parse(b"PROXY TCP6 2001:db8::1 2001:db8::2 1000 2000\r\n").unwrap().unwrap();
        assert_eq!(hdr.src.unwrap(), "[2001:db8::1]:1000".parse().unwrap());

        let hdr = parse(b"PROXY UNKNOWN\r\n").unwrap().unwrap();
        assert_eq!(hdr.src, None);
        assert_eq!(hdr.consumed, 15);
    }

    #[test]
    fn v1_needs_full_line() {
        assert_eq!(parse(b"PROXY TCP4 192.0.2.1").unwrap(), None);
        assert_eq!(parse(b"PROX").unwrap(), None);
    }

    #[test]
    fn v1_rejects_garbage() {
        assert_eq!(parse(b"PROXY TCP5 1 2 3 4\r\n").unwrap_err(), PpError::BadProto);
        assert_eq!(parse(b"PROXY TCP4 1 2 3 4 5\r\n").unwrap_err(), PpError::BadHeader);
        assert!(parse(b"GET / HTTP/1.1\r\nHost:x\r\n\r\n").is_err());
    }

    #[test]
    fn v2_roundtrip_with_crc() {
        let src: SocketAddr = "192.0.2.1:56324".parse().unwrap();
        let dst: SocketAddr = "198.51.100.2:443".parse().unwrap();
        let wire = make_v2(
            Some(src),
            Some(dst),
            &V2Tlvs {
                authority: Some(b"example.com"),
                unique_id: Some(b"id-123"),
                crc32c: true,
                ..Default::default()
            },
        );
        let hdr = parse(&wire).unwrap().unwrap();
        assert_eq!(hdr.src.unwrap(), src);
        assert_eq!(hdr.dst.unwrap(), dst);
        assert_eq!(hdr.authority.as_deref(), Some(&b"example.com"[..]));
        assert_eq!(hdr.unique_id.as_deref(), Some(&b"id-123"[..]));
        assert_eq!(hdr.consumed, wire.len());
    }

    #[test]
    fn v2_bad_crc_rejected() {
        let src: SocketAddr = "192.0.2.1:1".parse().unwrap();
        let dst: SocketAddr = "192.0.2.2:2".parse().unwrap();
        let mut wire = make_v2(Some(src), Some(dst), &V2Tlvs { crc32c: true, ..Default::default() });
        let at = wire.len() - 1;
        wire[at] ^= 0xFF;
        assert_eq!(parse(&wire).unwrap_err(), PpError::BadHeader);
    }

    #[test]
    fn v2_local_keeps_addresses_unset() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&PP2_SIGNATURE);
        wire.push(0x20); // LOCAL
        wire.push(0x00);
        wire.extend_from_slice(&0u16.to_be_bytes());
        let hdr = parse(&wire).unwrap().unwrap();
        assert_eq!(hdr.src, None);
        assert_eq!(hdr.consumed, 16);
    }

    #[test]
    fn v2_partial_waits() {
        let src: SocketAddr = "192.0.2.1:1".parse().unwrap();
        let dst: SocketAddr = "192.0.2.2:2".parse().unwrap();
        let wire = make_v2(Some(src), Some(dst), &V2Tlvs::default());
        assert_eq!(parse(&wire[..10]).unwrap(), None);
        assert_eq!(parse(&wire[..20]).unwrap(), None);
    }

    #[test]
    fn v1_emit() {
        let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:80".parse().unwrap();
        assert_eq!(make_v1(Some(src), Some(dst)), b"PROXY TCP4 10.0.0.1 10.0.0.2 4000 80\r\n");
        assert_eq!(make_v1(None, Some(dst)), b"PROXY UNKNOWN\r\n");
    }

    #[test]
    fn cip_standard_ipv4() {
        const MAGIC: u32 = 0x1234_5678;
        let mut wire = Vec::new();
        wire.extend_from_slice(&MAGIC.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]); // reserved in standard form
        wire.push(0x00); // standard envelope
        wire.push(0x00);
        wire.extend_from_slice(&40u16.to_be_bytes()); // ip + tcp headers

        // minimal IPv4 header
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = libc::IPPROTO_TCP as u8;
        ip[12..16].copy_from_slice(&[192, 0, 2, 7]);
        ip[16..20].copy_from_slice(&[198, 51, 100, 9]);
        wire.extend_from_slice(&ip);
        // minimal TCP header
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&56324u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        wire.extend_from_slice(&tcp);
        wire.extend_from_slice(b"GET /");

        let hdr = parse_cip(&wire, MAGIC).unwrap().unwrap();
        assert_eq!(hdr.src.unwrap(), "192.0.2.7:56324".parse().unwrap());
        assert_eq!(hdr.dst.unwrap(), "198.51.100.9:443".parse().unwrap());
        assert_eq!(&wire[hdr.consumed..], b"GET /");
    }

    #[test]
    fn cip_bad_magic() {
        let wire = [0u8; 16];
        assert_eq!(parse_cip(&wire, 0xDEAD_BEEF).unwrap_err(), PpError::NotHeader);
    }
}
