//! Forwarding datagrams through intermediate nodes.
//!
//! Every datagram starts with a relay id. A relay node maps each relay id it allocated to the
//!  node on the other side of the mapping, and rewrites the id when forwarding, so neither
//!  endpoint needs to know anything but the first hop.

pub mod agent;
pub mod certificate;
pub mod circuit;
pub mod resolver;

/// Length of the relay id that precedes the frame in every datagram
pub const RELAY_HEADER_LEN: usize = size_of::<u16>();

/// Relay id of a datagram sent directly, without relaying
pub const DIRECT: u16 = 0;

pub fn read_relay_id(datagram: &[u8]) -> Option<u16> {
    match datagram {
        [a, b, ..] => Some(u16::from_le_bytes([*a, *b])),
        _ => None,
    }
}

/// Overwrites the relay id of a datagram, which must be at least `RELAY_HEADER_LEN` long
pub fn write_relay_id(datagram: &mut [u8], relay_id: u16) {
    datagram[..RELAY_HEADER_LEN].copy_from_slice(&relay_id.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[], None)]
    #[case::too_short(&[1], None)]
    #[case::direct(&[0, 0, 3, 0], Some(DIRECT))]
    #[case::relayed(&[0x34, 0x12, 3, 0], Some(0x1234))]
    fn test_read_relay_id(#[case] datagram: &[u8], #[case] expected: Option<u16>) {
        assert_eq!(read_relay_id(datagram), expected);
    }

    #[test]
    fn test_write_relay_id() {
        let mut datagram = [0u8, 0, 9, 9];
        write_relay_id(&mut datagram, 0xabcd);
        assert_eq!(datagram, [0xcd, 0xab, 9, 9]);
    }
}
