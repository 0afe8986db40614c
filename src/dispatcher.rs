use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use crate::connection::PeerRoute;
use crate::error::TransmissionError;
use crate::transmission::stream::StreamReceiver;

/// Received transmissions are handed to the application through a dispatcher. The engine does
///  not interpret payloads, `data_kind` and `data_id` are the application's to define.
///
/// This is called from the receive loop, holding it up until it returns. Non-trivial work
///  should be offloaded to some asynchronous processing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GeneDispatcher: Send + Sync + 'static {
    /// A block was received completely
    async fn on_block(&self, from: PeerRoute, data_kind: u32, data_id: u64, payload: Bytes);

    /// A peer opened a stream. Dropping the receiver cancels the stream.
    async fn on_stream(&self, from: PeerRoute, data_kind: u32, data_id: u64, receiver: StreamReceiver);
}

/// A typed payload with its own serialization. Each payload type has its own data kind for
///  dispatch on the receiving side.
pub trait Payload: Sized {
    const DATA_KIND: u32;

    fn ser(&self, buf: &mut BytesMut);

    fn deser(buf: &[u8]) -> anyhow::Result<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Deserializes a received payload, reporting failure as a transmission error
    fn decode(buf: &[u8]) -> Result<Self, TransmissionError> {
        Self::deser(buf)
            .map_err(|e| TransmissionError::DeserializationFailed(e.to_string()))
    }
}
