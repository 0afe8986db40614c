use bytes::Bytes;
use tracing::{trace, warn};
use crate::buffers::gene_buf::GeneOwner;

/// A gene slot on the receiving side. Slots exist for every expected serial before data
///  arrives, and are filled at most once: the first datagram wins, later duplicates are
///  discarded.
#[derive(Debug, Default)]
pub struct ReceiveGene {
    datagram: Option<GeneOwner>,
    payload_offset: usize,
}

impl ReceiveGene {
    pub fn placeholder() -> ReceiveGene {
        ReceiveGene::default()
    }

    /// Stores a share of the received datagram. Returns `true` if the slot was empty.
    pub fn set_recv(&mut self, datagram: &GeneOwner, payload_offset: usize) -> bool {
        if let Some(existing) = &self.datagram {
            if existing[self.payload_offset..] != datagram[payload_offset..] {
                warn!("duplicate gene with differing content - keeping the first one");
            }
            else {
                trace!("discarding duplicate gene");
            }
            return false;
        }

        self.datagram = Some(datagram.share());
        self.payload_offset = payload_offset;
        true
    }

    pub fn is_received(&self) -> bool {
        self.datagram.is_some()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.datagram.as_ref()
            .map(|d| &d[self.payload_offset..])
    }

    pub fn payload_len(&self) -> usize {
        self.payload()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// zero-copy view of the payload, keeping the pooled buffer alive
    pub fn payload_bytes(&self) -> Option<Bytes> {
        self.datagram.as_ref()
            .map(|d| d.to_bytes(self.payload_offset))
    }

    pub fn dispose(&mut self) {
        self.datagram = None;
    }
}
