//! Minimal tagged-reader abstraction over the two DER containers the core
//! has to pick fields out of: the image4 `IM4M` and the legacy `SCAB`.
//!
//! A raw pointer-arithmetic walk into a hand-rolled `ASN1DERElement` is
//! replaced here by `read_scab_tag`/`read_im4m_tag`, which make the
//! ECID/nonce/ramdisk offsets auditable instead of scattered through the
//! call sites that need them (spec §9).

use crate::Error;

/// Reads the length octets of a DER TLV starting at `buf[pos]` (which must
/// point at the length byte, i.e. one past the tag byte). Returns the
/// decoded length and the offset of the first content byte.
fn read_length(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *buf.get(pos)?;
    if first & 0x80 == 0 {
        Some((first as usize, pos + 1))
    } else {
        let nbytes = (first & 0x7f) as usize;
        if nbytes == 0 || nbytes > 8 {
            return None;
        }
        let mut len = 0usize;
        for i in 0..nbytes {
            len = (len << 8) | *buf.get(pos + 1 + i)? as usize;
        }
        Some((len, pos + 1 + nbytes))
    }
}

/// One immediate child of a DER SEQUENCE/SET: its tag byte and content.
struct Element<'a> {
    tag: u8,
    content: &'a [u8],
}

/// Parses a buffer that is itself the *content* of a constructed DER
/// element (a SEQUENCE or SET body) into its immediate children.
fn parse_children(content: &[u8]) -> Result<Vec<Element<'_>>, Error> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < content.len() {
        let tag = content[pos];
        let (len, body_start) = read_length(content, pos + 1)
            .ok_or_else(|| Error::ManifestMalformed("truncated ASN.1 child length".into()))?;
        let body_end = body_start
            .checked_add(len)
            .filter(|&e| e <= content.len())
            .ok_or_else(|| Error::ManifestMalformed("ASN.1 child length exceeds parent".into()))?;
        out.push(Element { tag, content: &content[body_start..body_end] });
        pos = body_end;
    }
    Ok(out)
}

/// Parses a complete DER TLV buffer (tag + length + content) into its
/// top-level element's immediate children.
fn top_level_children(buf: &[u8]) -> Result<Vec<Element<'_>>, Error> {
    if buf.is_empty() {
        return Err(Error::ManifestMalformed("empty ASN.1 buffer".into()));
    }
    let (len, content_start) = read_length(buf, 1)
        .ok_or_else(|| Error::ManifestMalformed("truncated ASN.1 length".into()))?;
    let end = content_start
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::ManifestMalformed("ASN.1 length exceeds buffer".into()))?;
    parse_children(&buf[content_start..end])
}

/// Legacy SCAB layout: an outer SEQUENCE whose second element (index 1) is
/// the SET of tagged fields we actually care about (ECID `0x81`, nonce
/// `0x92`, ramdisk digest `0x9A`).
pub fn read_scab_tag<'a>(scab: &'a [u8], tag: u8) -> Result<&'a [u8], Error> {
    let outer = top_level_children(scab)?;
    let main_set = outer
        .get(1)
        .ok_or_else(|| Error::ManifestMalformed("SCAB sequence has fewer than 2 elements".into()))?;
    let inner = parse_children(main_set.content)?;
    inner
        .iter()
        .find(|e| e.tag == tag)
        .map(|e| e.content)
        .ok_or_else(|| Error::ManifestMalformed(format!("SCAB missing tag {:#04x}", tag)))
}

/// Reads a big-endian unsigned integer out of a SCAB tag's payload bytes.
pub fn read_scab_tag_u64(scab: &[u8], tag: u8) -> Result<u64, Error> {
    let payload = read_scab_tag(scab, tag)?;
    if payload.len() > 8 {
        return Err(Error::ManifestMalformed(format!("tag {:#04x} payload too long for u64", tag)));
    }
    let mut value = 0u64;
    for byte in payload {
        value = (value << 8) | *byte as u64;
    }
    Ok(value)
}

/// IM4M layout: an outer SEQUENCE `IM4M`, `<version>`, `<manifest properties
/// SET>`, `<signature>`, `<certificate chain>`. Four-character tags (e.g.
/// `BNCH`, `ECID`) are matched by name rather than a single tag byte, and
/// each property is a nested SEQUENCE of `(tag: IA5String, value)`.
pub fn read_im4m_tag<'a>(im4m: &'a [u8], name: &str) -> Result<&'a [u8], Error> {
    let outer = top_level_children(im4m)?;
    let manifest_props = outer
        .get(2)
        .ok_or_else(|| Error::ManifestMalformed("IM4M sequence has fewer than 3 elements".into()))?;
    let props = parse_children(manifest_props.content)?;

    for prop in &props {
        let fields = match parse_children(prop.content) {
            Ok(f) => f,
            Err(_) => continue,
        };
        if let Some(tag_field) = fields.first() {
            if tag_field.content == name.as_bytes() {
                if let Some(value_field) = fields.get(1) {
                    return Ok(value_field.content);
                }
            }
        }
    }

    Err(Error::ManifestMalformed(format!("IM4M missing property {}", name)))
}

/// Reads a big-endian unsigned integer out of an IM4M property's payload.
pub fn read_im4m_tag_u64(im4m: &[u8], name: &str) -> Result<u64, Error> {
    let payload = read_im4m_tag(im4m, name)?;
    if payload.len() > 8 {
        return Err(Error::ManifestMalformed(format!("property {} payload too long for u64", name)));
    }
    let mut value = 0u64;
    for byte in payload {
        value = (value << 8) | *byte as u64;
    }
    Ok(value)
}
