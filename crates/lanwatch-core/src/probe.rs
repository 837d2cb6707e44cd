//! Probe codec for the fixed 32-byte discovery datagram
//!
//! Layout (all integers big-endian):
//!
//! | bytes   | outbound probe                  | inbound reply            |
//! |---------|---------------------------------|--------------------------|
//! | 0..2    | magic `21 31`                   | magic `21 31`            |
//! | 2..4    | `00 20`                         | (ignored)                |
//! | 4..12   | `FF` x 8                        | device id (u64)          |
//! | 12..16  | `FF` x 4                        | device timestamp (u32)   |
//! | 16..20  | ASCII `MDID`                    | (ignored)                |
//! | 20..28  | virtual id of this host (u64)   | (ignored)                |
//! | 28..32  | zero                            | (ignored)                |

use thiserror::Error;

/// Magic header every datagram of this protocol starts with
pub const OT_HEADER: [u8; 2] = [0x21, 0x31];

/// Well-known UDP port devices listen and answer on
pub const OT_PORT: u16 = 54321;

/// Length of a probe; only datagrams of exactly this length count as keep-alives
pub const OT_PROBE_LEN: usize = 32;

/// Largest datagram read from a socket
pub const OT_MSG_LEN: usize = 1400;

/// Protocol constants occupying bytes 0..20 of an outbound probe
const PROBE_PREFIX: [u8; 20] = [
    0x21, 0x31, 0x00, 0x20, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, b'M', b'D', b'I', b'D',
];

/// Smallest datagram carrying both id and timestamp
const MIN_DECODE_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Foreign datagram: header mismatch")]
    Foreign,
    #[error("Datagram truncated: {0} bytes")]
    Truncated(usize),
}

/// A decoded inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Raw 64-bit device id
    pub device_id: u64,
    /// Device clock, seconds
    pub timestamp: u32,
    /// Exactly `OT_PROBE_LEN` bytes long
    pub keep_alive: bool,
}

impl Probe {
    /// Decode an inbound datagram
    pub fn decode(data: &[u8]) -> Result<Self, ProbeError> {
        if !has_header(data) {
            return Err(ProbeError::Foreign);
        }
        if data.len() < MIN_DECODE_LEN {
            return Err(ProbeError::Truncated(data.len()));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[4..12]);
        let mut ts = [0u8; 4];
        ts.copy_from_slice(&data[12..16]);

        Ok(Self {
            device_id: u64::from_be_bytes(id),
            timestamp: u32::from_be_bytes(ts),
            keep_alive: data.len() == OT_PROBE_LEN,
        })
    }
}

/// Check the magic header without decoding the rest
pub fn has_header(data: &[u8]) -> bool {
    data.len() >= OT_HEADER.len() && data[..OT_HEADER.len()] == OT_HEADER
}

/// Build the outbound probe announcing `virtual_id`
pub fn encode_probe(virtual_id: u64) -> [u8; OT_PROBE_LEN] {
    let mut probe = [0u8; OT_PROBE_LEN];
    probe[..20].copy_from_slice(&PROBE_PREFIX);
    probe[20..28].copy_from_slice(&virtual_id.to_be_bytes());
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: u64, ts: u32, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[..2].copy_from_slice(&OT_HEADER);
        data[4..12].copy_from_slice(&id.to_be_bytes());
        data[12..16].copy_from_slice(&ts.to_be_bytes());
        data
    }

    #[test]
    fn test_encode_probe_layout() {
        let probe = encode_probe(0x1122334455667788);
        assert_eq!(
            &probe[..20],
            b"!1\x00\x20\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFFMDID"
        );
        assert_eq!(
            &probe[20..28],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
        assert_eq!(&probe[28..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_keep_alive() {
        let probe = Probe::decode(&reply(0x0102030405060708, 1_700_000_000, 32)).unwrap();
        assert_eq!(probe.device_id, 0x0102030405060708);
        assert_eq!(probe.timestamp, 1_700_000_000);
        assert!(probe.keep_alive);
    }

    #[test]
    fn test_decode_longer_datagram_is_not_keep_alive() {
        let probe = Probe::decode(&reply(9, 5, 64)).unwrap();
        assert_eq!(probe.device_id, 9);
        assert!(!probe.keep_alive);
    }

    #[test]
    fn test_decode_foreign_header() {
        let mut data = reply(9, 5, 32);
        data[1] = 0x32;
        assert_eq!(Probe::decode(&data), Err(ProbeError::Foreign));
        assert_eq!(Probe::decode(&[]), Err(ProbeError::Foreign));
        assert_eq!(Probe::decode(&[0x21]), Err(ProbeError::Foreign));
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(Probe::decode(&OT_HEADER), Err(ProbeError::Truncated(2)));
        assert_eq!(
            Probe::decode(&reply(1, 1, 16)[..15]),
            Err(ProbeError::Truncated(15))
        );
    }

    #[test]
    fn test_outbound_probe_decodes_as_keep_alive() {
        // Outbound probes carry all-ones in the device id field.
        let probe = Probe::decode(&encode_probe(1)).unwrap();
        assert_eq!(probe.device_id, u64::MAX);
        assert!(probe.keep_alive);
    }
}
