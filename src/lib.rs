//! A reliable datagram transmission engine on top of UDP. Logical messages (*transmissions*) are
//!  split into datagram-sized fragments called *genes*, which are acknowledged, retransmitted
//!  and reassembled on the receiving side. Sending is paced by a congestion window that is
//!  shared by all transmissions to the same peer, and datagrams can optionally be forwarded
//!  through intermediate relay nodes.
//!
//! ## Design goals
//!
//! * peer-to-peer: every node has a single UDP socket that handles all peers
//! * no handshake - a receiver learns about a transmission from its first gene and starts
//!    reassembling immediately, even if following genes overtake the first one
//! * big payloads are never fragmented at IP level; the engine chunks, buffers and reassembles
//!   * configured maximum frame length since MTU discovery does not work reliably
//! * two kinds of transmission:
//!   * *block*: a payload of known length, delivered to the application in one piece when it is
//!      complete
//!   * *stream*: an open-ended sequence of writes bounded by a maximum length, delivered in
//!      order as data becomes available and terminated by an explicit `Complete`
//! * loss is detected both by the receiver (lost gene reports after a grace tick) and by the
//!    sender (retransmission timeout and packet threshold), with a retransmission budget after
//!    which a transmission times out
//! * buffers come from a pool and are shared rather than copied between the send path, the
//!    retransmission path and the reader
//!
//! ## Datagram
//!
//! All numbers are little endian.
//!
//! ```ascii
//! 0: relay id (u16) - 0 for a direct datagram, otherwise the id of the relay mapping on the
//!     node receiving the datagram
//! 2: frame
//! ```
//!
//! The frame type is the first two bytes of every frame and determines the rest of the layout.
//!
//! *FIRST_GENE* (type 1, 30 bytes header followed by payload)
//! ```ascii
//!  0: frame type (u16)
//!  2: transmission mode (u16): 1 = block, 2 = stream
//!  4: transmission id (u32)
//!  8: transmission control (u16): bit 0 = ack immediately, bit 1 = final gene
//! 10: RTT hint (u32): the sender's smoothed RTT in microseconds
//! 14: total gene count for a block, maximum length in bytes for a stream (u32)
//! 18: data kind (u32)
//! 22: data id (u64)
//! ```
//!
//! *FOLLOWING_GENE* (type 2, 12 bytes header followed by payload)
//! ```ascii
//!  0: frame type (u16)
//!  2: transmission id (u32)
//!  6: transmission control (u16)
//!  8: data position (u32): the gene's serial number
//! ```
//!
//! *ACK* (type 3) - one or more records up to the end of the datagram
//! ```ascii
//!  0: frame type (u16)
//!  *: transmission id (u32)
//!  *: successive received position (u32): all genes below this serial were received
//!  *: receive capacity (u32): number of genes the receiver is able to buffer beyond the
//!      successive received position
//!  *: number of ranges (varint)
//!  *: (repeated) received range: start (u32), end exclusive (u32)
//! ```
//!
//! *LOST_GENE* (type 4, 14 bytes)
//! ```ascii
//!  0: frame type (u16)
//!  2: transmission id (u32)
//!  6: first lost gene (u32)
//! 10: first acked gene after the gap (u32)
//! ```
//!
//! *STREAM* (type 5, 8 bytes)
//! ```ascii
//!  0: frame type (u16)
//!  2: transmission id (u32)
//!  6: stream control (u16): 1 = complete, 2 = cancel; bit 15 set for frames sent by the
//!      receiving side
//! ```
//!
//! ## Relaying
//!
//! A relay node keeps a mapping between two relay ids, one for each side of the relayed
//!  connection. It forwards a datagram by rewriting the leading relay id, never looking at the
//!  frame. Every forwarded datagram costs points from a budget that is credited explicitly, and
//!  mappings expire after a period of inactivity. Creating a mapping requires a certificate
//!  signed for the requesting connection's salt.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod end_point;
pub mod error;
pub mod flow;
pub mod frames;
pub mod gene;
pub mod net_sender;
pub mod relay;
pub mod safe_converter;
pub mod transmission;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
