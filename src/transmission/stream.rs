//! Application handles for stream transmissions.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;
use crate::connection::Connection;
use crate::error::TransmissionError;
use crate::transmission::receive_transmission::ReceiveTransmission;
use crate::transmission::send_transmission::SendTransmission;
use crate::transmission::state::TransmissionState;

/// Writing end of a stream. Data is sent as soon as the gene window and the congestion window
///  allow; writes never wait.
pub struct StreamSender {
    transmission: Arc<SendTransmission>,
    connection: Arc<Connection>,
}

impl StreamSender {
    pub(crate) fn new(transmission: Arc<SendTransmission>, connection: Arc<Connection>) -> StreamSender {
        StreamSender {
            transmission,
            connection,
        }
    }

    pub fn id(&self) -> u32 {
        self.transmission.id()
    }

    pub fn state(&self) -> TransmissionState {
        self.transmission.state()
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), TransmissionError> {
        self.transmission.write(data.into())?;
        self.connection.flush();
        Ok(())
    }

    /// Marks the end of the stream without waiting for the receiver's confirmation
    pub fn complete(&self) -> Result<(), TransmissionError> {
        self.transmission.complete()?;
        self.connection.flush();
        Ok(())
    }

    pub fn cancel(&self) {
        self.transmission.cancel();
    }

    pub async fn wait(&self) -> Result<(), TransmissionError> {
        self.transmission.wait().await
    }

    /// Completes the stream and waits for the receiver to confirm that it has all data
    pub async fn finish(self) -> Result<(), TransmissionError> {
        self.complete()?;
        self.wait().await
    }
}

/// Reading end of a stream. Chunks arrive in order, and they share the received datagrams'
///  pooled buffers rather than copying them.
///
/// Dropping the reader before the stream completed cancels the stream on the sending side.
pub struct StreamReceiver {
    transmission: Arc<ReceiveTransmission>,
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl StreamReceiver {
    pub(crate) fn new(transmission: Arc<ReceiveTransmission>, chunks: mpsc::UnboundedReceiver<Bytes>) -> StreamReceiver {
        StreamReceiver {
            transmission,
            chunks,
        }
    }

    pub fn id(&self) -> u32 {
        self.transmission.id()
    }

    /// The next chunk of data, `Ok(None)` after the sender completed the stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TransmissionError> {
        if let Some(chunk) = self.chunks.recv().await {
            return Ok(Some(chunk));
        }
        match self.transmission.outcome() {
            Some(Ok(())) => Ok(None),
            Some(Err(e)) => Err(e),
            None => Err(TransmissionError::ConnectionClosed),
        }
    }

    /// Reads until the end of the stream
    pub async fn read_to_end(&mut self) -> Result<Bytes, TransmissionError> {
        let mut result = BytesMut::new();
        while let Some(chunk) = self.recv().await? {
            result.extend_from_slice(&chunk);
        }
        Ok(result.freeze())
    }

    pub fn cancel(&self) {
        self.transmission.cancel_by_receiver();
    }
}

impl Debug for StreamReceiver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamReceiver{{id:{}, state:{:?}}}", self.id(), self.transmission.state())
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if !self.transmission.is_terminal() {
            debug!("stream reader for transmission {} dropped before the stream completed", self.id());
            self.transmission.cancel_by_receiver();
        }
    }
}
