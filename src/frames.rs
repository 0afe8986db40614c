//! Fixed-layout binary frames. All numbers are little endian, the frame type is always the
//!  first two bytes (see the crate documentation for the layouts).

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::FrameError;
use crate::safe_converter::SafeCast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FrameType {
    FirstGene = 1,
    FollowingGene = 2,
    Ack = 3,
    LostGene = 4,
    Stream = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum TransmissionMode {
    Block = 1,
    Stream = 2,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransmissionControl: u16 {
        /// the receiver should send an ack right away rather than on its next tick
        const ACK_IMMEDIATELY = 0x0001;
        /// the last gene of a block
        const FINAL_GENE = 0x0002;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum StreamControl {
    Complete = 1,
    Cancel = 2,
}

/// Reads the frame type without consuming anything
pub fn peek_frame_type(buf: &[u8]) -> Result<FrameType, FrameError> {
    if buf.len() < size_of::<u16>() {
        return Err(FrameError::MissingFrameType);
    }
    let raw = u16::from_le_bytes([buf[0], buf[1]]);
    FrameType::try_from(raw)
        .map_err(|_| FrameError::UnknownFrameType(raw))
}

pub trait WireFrame: Sized {
    const FRAME_TYPE: FrameType;

    fn ser(&self, buf: &mut impl BufMut);

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError>;
}

fn check_len(buf: &impl Buf, frame: FrameType, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::TooShort { frame, needed, actual: buf.remaining() });
    }
    Ok(())
}

/// consumes the frame type, which must be present in the buffer
fn consume_frame_type(buf: &mut impl Buf, expected: FrameType) -> Result<(), FrameError> {
    let raw = buf.get_u16_le();
    let actual = FrameType::try_from(raw)
        .map_err(|_| FrameError::UnknownFrameType(raw))?;
    if actual != expected {
        return Err(FrameError::UnexpectedFrameType { expected, actual });
    }
    Ok(())
}

/// Header of the first gene of a transmission. It carries the transmission's metadata, so a
///  receiver can set up a transmission from it without any prior handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstGeneFrame {
    pub mode: TransmissionMode,
    pub transmission_id: u32,
    pub control: TransmissionControl,
    pub rtt_hint_mics: u32,
    /// the total number of genes for a block, the maximum length in bytes for a stream
    pub length: u32,
    pub data_kind: u32,
    pub data_id: u64,
}

impl FirstGeneFrame {
    pub const LEN: usize = 30;
}

impl WireFrame for FirstGeneFrame {
    const FRAME_TYPE: FrameType = FrameType::FirstGene;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::FRAME_TYPE.into());
        buf.put_u16_le(self.mode.into());
        buf.put_u32_le(self.transmission_id);
        buf.put_u16_le(self.control.bits());
        buf.put_u32_le(self.rtt_hint_mics);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.data_kind);
        buf.put_u64_le(self.data_id);
    }

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError> {
        check_len(buf, Self::FRAME_TYPE, Self::LEN)?;
        consume_frame_type(buf, Self::FRAME_TYPE)?;

        let raw_mode = buf.get_u16_le();
        let mode = TransmissionMode::try_from(raw_mode)
            .map_err(|_| FrameError::InvalidTransmissionMode(raw_mode))?;

        Ok(FirstGeneFrame {
            mode,
            transmission_id: buf.get_u32_le(),
            control: TransmissionControl::from_bits_truncate(buf.get_u16_le()),
            rtt_hint_mics: buf.get_u32_le(),
            length: buf.get_u32_le(),
            data_kind: buf.get_u32_le(),
            data_id: buf.get_u64_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowingGeneFrame {
    pub transmission_id: u32,
    pub control: TransmissionControl,
    /// the gene's serial within its transmission
    pub data_position: u32,
}

impl FollowingGeneFrame {
    pub const LEN: usize = 12;
}

impl WireFrame for FollowingGeneFrame {
    const FRAME_TYPE: FrameType = FrameType::FollowingGene;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::FRAME_TYPE.into());
        buf.put_u32_le(self.transmission_id);
        buf.put_u16_le(self.control.bits());
        buf.put_u32_le(self.data_position);
    }

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError> {
        check_len(buf, Self::FRAME_TYPE, Self::LEN)?;
        consume_frame_type(buf, Self::FRAME_TYPE)?;
        Ok(FollowingGeneFrame {
            transmission_id: buf.get_u32_le(),
            control: TransmissionControl::from_bits_truncate(buf.get_u16_le()),
            data_position: buf.get_u32_le(),
        })
    }
}

/// A range of gene serials, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneRange {
    pub start: u32,
    pub end: u32,
}

/// Per-transmission acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub transmission_id: u32,
    /// all genes with a serial below this were received
    pub successive_received_position: u32,
    /// number of genes the receiver can buffer beyond `successive_received_position`
    pub receive_capacity: u32,
    /// genes received beyond `successive_received_position`, in ascending order
    pub received_ranges: Vec<GeneRange>,
}

impl AckRecord {
    const FIXED_LEN: usize = 3 * size_of::<u32>();

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN
            + varint_len(self.received_ranges.len())
            + self.received_ranges.len() * 2 * size_of::<u32>()
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.transmission_id);
        buf.put_u32_le(self.successive_received_position);
        buf.put_u32_le(self.receive_capacity);
        buf.put_usize_varint(self.received_ranges.len());
        for range in &self.received_ranges {
            buf.put_u32_le(range.start);
            buf.put_u32_le(range.end);
        }
    }

    fn deser(buf: &mut impl Buf) -> Result<AckRecord, FrameError> {
        check_len(buf, FrameType::Ack, Self::FIXED_LEN)?;
        let transmission_id = buf.get_u32_le();
        let successive_received_position = buf.get_u32_le();
        let receive_capacity = buf.get_u32_le();

        let num_ranges = buf.try_get_usize_varint()
            .map_err(|_| FrameError::MalformedVarint)?;
        let ranges_len = num_ranges.checked_mul(2 * size_of::<u32>())
            .ok_or(FrameError::MalformedVarint)?;
        check_len(buf, FrameType::Ack, ranges_len)?;

        let mut received_ranges = Vec::with_capacity(num_ranges);
        for _ in 0..num_ranges {
            let start = buf.get_u32_le();
            let end = buf.get_u32_le();
            if start >= end {
                return Err(FrameError::InvalidAckRange { start, end });
            }
            received_ranges.push(GeneRange { start, end });
        }

        Ok(AckRecord {
            transmission_id,
            successive_received_position,
            receive_capacity,
            received_ranges,
        })
    }
}

/// An ack frame carries one or more records, filling the datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub records: Vec<AckRecord>,
}

impl AckFrame {
    pub const HEADER_LEN: usize = size_of::<u16>();
}

impl WireFrame for AckFrame {
    const FRAME_TYPE: FrameType = FrameType::Ack;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::FRAME_TYPE.into());
        for record in &self.records {
            record.ser(buf);
        }
    }

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError> {
        check_len(buf, Self::FRAME_TYPE, Self::HEADER_LEN)?;
        consume_frame_type(buf, Self::FRAME_TYPE)?;

        let mut records = Vec::new();
        while buf.has_remaining() {
            records.push(AckRecord::deser(buf)?);
        }
        Ok(AckFrame { records })
    }
}

/// Sent by a receiver for a gap that persisted for at least one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostGeneFrame {
    pub transmission_id: u32,
    pub first_lost: u32,
    /// the first received gene after the gap, i.e. the gap's exclusive end
    pub first_acked: u32,
}

impl LostGeneFrame {
    pub const LEN: usize = 14;
}

impl WireFrame for LostGeneFrame {
    const FRAME_TYPE: FrameType = FrameType::LostGene;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::FRAME_TYPE.into());
        buf.put_u32_le(self.transmission_id);
        buf.put_u32_le(self.first_lost);
        buf.put_u32_le(self.first_acked);
    }

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError> {
        check_len(buf, Self::FRAME_TYPE, Self::LEN)?;
        consume_frame_type(buf, Self::FRAME_TYPE)?;
        let transmission_id = buf.get_u32_le();
        let first_lost = buf.get_u32_le();
        let first_acked = buf.get_u32_le();
        if first_lost >= first_acked {
            return Err(FrameError::InvalidAckRange { start: first_lost, end: first_acked });
        }
        Ok(LostGeneFrame { transmission_id, first_lost, first_acked })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrame {
    pub transmission_id: u32,
    pub control: StreamControl,
    /// set for frames sent by the stream's receiving side: completion echo or cancel by the reader
    pub from_receiver: bool,
}

impl StreamFrame {
    pub const LEN: usize = 8;

    const FROM_RECEIVER_BIT: u16 = 0x8000;
}

impl WireFrame for StreamFrame {
    const FRAME_TYPE: FrameType = FrameType::Stream;

    fn ser(&self, buf: &mut impl BufMut) {
        let mut control: u16 = self.control.into();
        if self.from_receiver {
            control |= Self::FROM_RECEIVER_BIT;
        }

        buf.put_u16_le(Self::FRAME_TYPE.into());
        buf.put_u32_le(self.transmission_id);
        buf.put_u16_le(control);
    }

    fn deser(buf: &mut impl Buf) -> Result<Self, FrameError> {
        check_len(buf, Self::FRAME_TYPE, Self::LEN)?;
        consume_frame_type(buf, Self::FRAME_TYPE)?;
        let transmission_id = buf.get_u32_le();
        let raw = buf.get_u16_le();
        let control = StreamControl::try_from(raw & !Self::FROM_RECEIVER_BIT)
            .map_err(|_| FrameError::InvalidStreamControl(raw))?;
        Ok(StreamFrame {
            transmission_id,
            control,
            from_receiver: raw & Self::FROM_RECEIVER_BIT != 0,
        })
    }
}

/// number of bytes of a LEB128 style varint
pub fn varint_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    bits.max(1).div_ceil(7).safe_cast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn first_gene() -> FirstGeneFrame {
        FirstGeneFrame {
            mode: TransmissionMode::Block,
            transmission_id: 0x0403_0201,
            control: TransmissionControl::ACK_IMMEDIATELY,
            rtt_hint_mics: 0x0807_0605,
            length: 10,
            data_kind: 7,
            data_id: 0x1122_3344_5566_7788,
        }
    }

    #[test]
    fn test_first_gene_layout() {
        let mut buf = BytesMut::new();
        first_gene().ser(&mut buf);
        assert_eq!(buf.as_ref(), &[
            1, 0,
            1, 0,
            1, 2, 3, 4,
            1, 0,
            5, 6, 7, 8,
            10, 0, 0, 0,
            7, 0, 0, 0,
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
        ]);
        assert_eq!(buf.len(), FirstGeneFrame::LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(FirstGeneFrame::deser(&mut b).unwrap(), first_gene());
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::block(TransmissionMode::Block, TransmissionControl::empty())]
    #[case::stream(TransmissionMode::Stream, TransmissionControl::FINAL_GENE | TransmissionControl::ACK_IMMEDIATELY)]
    fn test_first_gene_ser(#[case] mode: TransmissionMode, #[case] control: TransmissionControl) {
        let frame = FirstGeneFrame { mode, control, ..first_gene() };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        buf.put_slice(b"payload");

        let mut b: &[u8] = &buf;
        assert_eq!(FirstGeneFrame::deser(&mut b).unwrap(), frame);
        assert_eq!(b, b"payload");
    }

    #[test]
    fn test_following_gene_layout() {
        let frame = FollowingGeneFrame {
            transmission_id: 9,
            control: TransmissionControl::FINAL_GENE,
            data_position: 0x0102,
        };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[2, 0, 9, 0, 0, 0, 2, 0, 2, 1, 0, 0]);
        assert_eq!(buf.len(), FollowingGeneFrame::LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(FollowingGeneFrame::deser(&mut b).unwrap(), frame);
    }

    #[test]
    fn test_lost_gene_layout() {
        let frame = LostGeneFrame { transmission_id: 3, first_lost: 4, first_acked: 6 };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[4, 0, 3, 0, 0, 0, 4, 0, 0, 0, 6, 0, 0, 0]);
        assert_eq!(buf.len(), LostGeneFrame::LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(LostGeneFrame::deser(&mut b).unwrap(), frame);
    }

    #[rstest]
    #[case::complete(StreamControl::Complete, false, [5, 0, 8, 0, 0, 0, 1, 0])]
    #[case::cancel(StreamControl::Cancel, false, [5, 0, 8, 0, 0, 0, 2, 0])]
    #[case::complete_echo(StreamControl::Complete, true, [5, 0, 8, 0, 0, 0, 1, 0x80])]
    #[case::receiver_cancel(StreamControl::Cancel, true, [5, 0, 8, 0, 0, 0, 2, 0x80])]
    fn test_stream_frame(#[case] control: StreamControl, #[case] from_receiver: bool, #[case] expected: [u8; 8]) {
        let frame = StreamFrame { transmission_id: 8, control, from_receiver };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), &expected);

        let mut b: &[u8] = &buf;
        assert_eq!(StreamFrame::deser(&mut b).unwrap(), frame);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single_no_ranges(vec![AckRecord { transmission_id: 1, successive_received_position: 5, receive_capacity: 200, received_ranges: vec![] }])]
    #[case::ranges(vec![AckRecord { transmission_id: 1, successive_received_position: 5, receive_capacity: 200, received_ranges: vec![GeneRange { start: 6, end: 8 }, GeneRange { start: 10, end: 11 }] }])]
    #[case::multiple(vec![
        AckRecord { transmission_id: 1, successive_received_position: 5, receive_capacity: 200, received_ranges: vec![GeneRange { start: 6, end: 8 }] },
        AckRecord { transmission_id: 99, successive_received_position: 0, receive_capacity: 1, received_ranges: vec![] },
    ])]
    fn test_ack_frame(#[case] records: Vec<AckRecord>) {
        let frame = AckFrame { records };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.len(), AckFrame::HEADER_LEN + frame.records.iter().map(|r| r.serialized_len()).sum::<usize>());

        let mut b: &[u8] = &buf;
        assert_eq!(AckFrame::deser(&mut b).unwrap(), frame);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::first_gene(FirstGeneFrame::LEN, FrameType::FirstGene)]
    #[case::following_gene(FollowingGeneFrame::LEN, FrameType::FollowingGene)]
    #[case::lost_gene(LostGeneFrame::LEN, FrameType::LostGene)]
    #[case::stream(StreamFrame::LEN, FrameType::Stream)]
    fn test_too_short(#[case] len: usize, #[case] frame_type: FrameType) {
        let mut buf = BytesMut::new();
        buf.put_u16_le(frame_type.into());
        buf.put_bytes(1, len - 3);

        let result = match frame_type {
            FrameType::FirstGene => FirstGeneFrame::deser(&mut buf.as_ref()).map(|_| ()),
            FrameType::FollowingGene => FollowingGeneFrame::deser(&mut buf.as_ref()).map(|_| ()),
            FrameType::LostGene => LostGeneFrame::deser(&mut buf.as_ref()).map(|_| ()),
            FrameType::Stream => StreamFrame::deser(&mut buf.as_ref()).map(|_| ()),
            FrameType::Ack => unreachable!(),
        };
        assert_eq!(result, Err(FrameError::TooShort { frame: frame_type, needed: len, actual: len - 1 }));
    }

    #[test]
    fn test_ack_truncated_ranges() {
        let mut buf = BytesMut::new();
        AckFrame { records: vec![AckRecord { transmission_id: 1, successive_received_position: 0, receive_capacity: 1, received_ranges: vec![GeneRange { start: 1, end: 2 }] }] }
            .ser(&mut buf);
        buf.truncate(buf.len() - 1);

        assert!(matches!(AckFrame::deser(&mut buf.as_ref()), Err(FrameError::TooShort { frame: FrameType::Ack, .. })));
    }

    #[test]
    fn test_ack_inverted_range() {
        let mut buf = BytesMut::new();
        AckFrame { records: vec![AckRecord { transmission_id: 1, successive_received_position: 0, receive_capacity: 1, received_ranges: vec![GeneRange { start: 3, end: 3 }] }] }
            .ser(&mut buf);

        assert_eq!(AckFrame::deser(&mut buf.as_ref()), Err(FrameError::InvalidAckRange { start: 3, end: 3 }));
    }

    #[test]
    fn test_wrong_frame_type() {
        let mut buf = BytesMut::new();
        LostGeneFrame { transmission_id: 1, first_lost: 1, first_acked: 2 }.ser(&mut buf);
        buf.put_bytes(0, 100);

        assert_eq!(
            FollowingGeneFrame::deser(&mut buf.as_ref()),
            Err(FrameError::UnexpectedFrameType { expected: FrameType::FollowingGene, actual: FrameType::LostGene }),
        );
    }

    #[test]
    fn test_invalid_enum_values() {
        let mut buf = BytesMut::new();
        first_gene().ser(&mut buf);
        buf[2] = 9;
        assert_eq!(FirstGeneFrame::deser(&mut buf.as_ref()), Err(FrameError::InvalidTransmissionMode(9)));

        let mut buf = BytesMut::new();
        StreamFrame { transmission_id: 1, control: StreamControl::Cancel, from_receiver: false }.ser(&mut buf);
        buf[6] = 3;
        assert_eq!(StreamFrame::deser(&mut buf.as_ref()), Err(FrameError::InvalidStreamControl(3)));
    }

    #[rstest]
    #[case::empty(&[], Err(FrameError::MissingFrameType))]
    #[case::one_byte(&[1], Err(FrameError::MissingFrameType))]
    #[case::first(&[1, 0], Ok(FrameType::FirstGene))]
    #[case::ack(&[3, 0, 99], Ok(FrameType::Ack))]
    #[case::unknown(&[0, 1], Err(FrameError::UnknownFrameType(256)))]
    fn test_peek_frame_type(#[case] buf: &[u8], #[case] expected: Result<FrameType, FrameError>) {
        assert_eq!(peek_frame_type(buf), expected);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(127, 1)]
    #[case(128, 2)]
    #[case(16383, 2)]
    #[case(16384, 3)]
    fn test_varint_len(#[case] value: usize, #[case] expected: usize) {
        assert_eq!(varint_len(value), expected);
        let mut buf = BytesMut::new();
        buf.put_usize_varint(value);
        assert_eq!(buf.len(), expected);
    }
}
