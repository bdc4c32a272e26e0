use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use tracing::debug;

use crate::error::StubNsError;

/// Longest a name is allowed to be on the wire, RFC 1035 section 2.3.4
const NAME_LENGTH_MAX: usize = 255;
/// Longest a single label is allowed to be
const LABEL_LENGTH_MAX: usize = 63;
/// Application tag mixed into the NSID digest so the machine secret can't be
/// recovered from the identifier
const NSID_APPLICATION_TAG: [u8; 16] = [
    0xed, 0xd3, 0x12, 0x5d, 0x16, 0xb9, 0x41, 0xf9, 0xa1, 0x49, 0x5f, 0xab, 0x15, 0x62, 0xab, 0x27,
];

/// Encode a dotted name into wire format.
///
/// When `compress_target` and `compress_reference` are given, any label suffix
/// shared with the reference name is replaced by a compression pointer into
/// the message at `compress_target` (the reference's own wire offset), per
/// RFC 1035 section 4.1.4.
pub fn name_as_bytes(
    name: &str,
    compress_target: Option<u16>,
    compress_reference: Option<&str>,
) -> Result<Vec<u8>, StubNsError> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        // the root name is a single empty label
        return Ok(vec![0]);
    }

    let labels: Vec<&str> = name.split('.').collect();

    if let (Some(target), Some(reference)) = (compress_target, compress_reference) {
        let reference = reference.trim_end_matches('.');
        let ref_labels: Vec<&str> = reference.split('.').collect();

        let mut common = 0;
        while common < labels.len() && common < ref_labels.len() {
            let ours = labels[labels.len() - 1 - common];
            let theirs = ref_labels[ref_labels.len() - 1 - common];
            if !ours.eq_ignore_ascii_case(theirs) {
                break;
            }
            common += 1;
        }

        if common > 0 && !reference.is_empty() {
            let mut suffix_offset: u16 = 0;
            for label in &ref_labels[..ref_labels.len() - common] {
                suffix_offset += label.len() as u16 + 1;
            }
            let pointer = target + suffix_offset;
            // pointers only have 14 bits to play with
            if pointer <= 0x3FFF {
                let mut retval: Vec<u8> = vec![];
                for label in &labels[..labels.len() - common] {
                    push_label(&mut retval, label)?;
                }
                retval.extend((0xC000u16 | pointer).to_be_bytes());
                return Ok(retval);
            }
        }
    }

    let mut retval: Vec<u8> = vec![];
    for label in &labels {
        push_label(&mut retval, label)?;
    }
    retval.push(0);
    if retval.len() > NAME_LENGTH_MAX {
        return Err(StubNsError::InvalidName(format!(
            "name {name:?} is {} bytes on the wire, maximum is {NAME_LENGTH_MAX}",
            retval.len()
        )));
    }
    Ok(retval)
}

fn push_label(buf: &mut Vec<u8>, label: &str) -> Result<(), StubNsError> {
    if label.is_empty() || label.len() > LABEL_LENGTH_MAX {
        return Err(StubNsError::InvalidName(format!(
            "label {label:?} length {} needs to be 1..={LABEL_LENGTH_MAX}",
            label.len()
        )));
    }
    buf.push(label.len() as u8);
    buf.extend(label.as_bytes());
    Ok(())
}

/// Decode a (possibly compressed) name starting at `offset`, returning the
/// dotted name and the offset just past its first encoded segment.
pub fn parse_name(buf: &[u8], offset: usize) -> Result<(String, usize), StubNsError> {
    let mut labels: Vec<String> = vec![];
    let mut pos = offset;
    let mut next_after: Option<usize> = None;
    let mut name_len = 0usize;

    loop {
        let len_byte = *buf
            .get(pos)
            .ok_or_else(|| StubNsError::PacketParse("name ran off the end".to_string()))?;

        if len_byte == 0 {
            pos += 1;
            break;
        } else if len_byte & 0xC0 == 0xC0 {
            let second = *buf.get(pos + 1).ok_or_else(|| {
                StubNsError::PacketParse("compression pointer ran off the end".to_string())
            })?;
            let target = (((len_byte & 0x3F) as usize) << 8) | second as usize;
            if next_after.is_none() {
                next_after = Some(pos + 2);
            }
            // pointers may only refer backwards, which also rules out loops
            if target >= pos {
                return Err(StubNsError::PacketParse(format!(
                    "compression pointer at {pos} points forward to {target}"
                )));
            }
            pos = target;
        } else if len_byte & 0xC0 != 0 {
            return Err(StubNsError::PacketParse(format!(
                "unsupported label type {:#04x}",
                len_byte & 0xC0
            )));
        } else {
            let len = len_byte as usize;
            let raw = buf.get(pos + 1..pos + 1 + len).ok_or_else(|| {
                StubNsError::PacketParse("label ran off the end".to_string())
            })?;
            name_len += len + 1;
            if name_len > NAME_LENGTH_MAX {
                return Err(StubNsError::PacketParse(
                    "name longer than 255 bytes".to_string(),
                ));
            }
            let label = std::str::from_utf8(raw).map_err(|_| {
                StubNsError::PacketParse("label is not valid UTF-8".to_string())
            })?;
            labels.push(label.to_string());
            pos += len + 1;
        }
    }

    Ok((labels.join("."), next_after.unwrap_or(pos)))
}

static NSID: LazyLock<Option<String>> = LazyLock::new(|| {
    let machine_id = match std::fs::read_to_string("/etc/machine-id") {
        Ok(value) => value,
        Err(error) => {
            debug!("Failed to determine machine ID, not serving NSID: {error:?}");
            return None;
        }
    };
    let machine_id = machine_id.trim();
    if machine_id.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(NSID_APPLICATION_TAG);
    let digest = hasher.finalize();
    Some(format!(
        "{}.resolved.systemd.io",
        hex::encode(&digest[..16])
    ))
});

/// An RFC 5001 NSID identifier: stable per host, identifies us as the local
/// stub without leaking the machine ID itself. Clients use this to tell a
/// locally-originated answer from a proxied one.
pub fn nsid_string() -> Option<&'static str> {
    NSID.as_deref()
}
