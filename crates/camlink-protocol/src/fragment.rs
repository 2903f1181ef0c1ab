use crate::error::ProtocolError;

/// Fixed header size of both UDP framings, in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 20;

/// First four bytes of every video datagram emitted by the camera
/// (type 2, reserved 0, then the firmware's fixed block size 0x05AC LE).
/// Datagrams without this prefix are not part of the video channel.
pub const STREAM_SIGNATURE: [u8; 4] = [0x02, 0x00, 0xAC, 0x05];

/// Data type carried in the low 7 bits of the type byte: 2 = JPEG video.
pub const VIDEO_DATA_TYPE: u8 = 2;

/// Top bit of the type byte marks the last fragment of a frame.
pub const LAST_FRAGMENT_FLAG: u8 = 0x80;

/// Check the 4-byte channel prefix. Non-matching datagrams are silently
/// dropped by the receiver, not treated as errors.
pub fn has_stream_signature(datagram: &[u8]) -> bool {
    datagram.len() >= 4 && datagram[..4] == STREAM_SIGNATURE
}

/// One declared-length fragment record (Dialect A).
///
/// Several records may be packed consecutively in a single datagram; each is
/// prefixed by a fixed 20-byte header (little-endian):
/// ```text
/// [1] type (bit7 = last fragment, bits 0-6 = data type; 2 = JPEG video)
/// [1] reserved
/// [2] blockSize
/// [4] sequence / frame id
/// [4] frameSize (total declared JPEG size)
/// [4] fragmentOffset
/// [4] reserved
/// [blockSize] payload
/// ```
#[derive(Debug)]
pub struct FragmentRecord<'a> {
    pub data_type: u8,
    pub last_fragment: bool,
    pub sequence: u32,
    pub frame_size: u32,
    pub offset: u32,
    pub payload: &'a [u8],
}

impl<'a> FragmentRecord<'a> {
    /// Parse one record from the front of `data`.
    ///
    /// Fails when fewer than `header + blockSize` bytes remain; the caller
    /// stops walking the datagram at that point (truncated tail).
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: FRAGMENT_HEADER_SIZE,
                got: data.len(),
            });
        }

        let type_byte = data[0];
        let block_size = u16::from_le_bytes([data[2], data[3]]) as usize;
        let sequence = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let frame_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let offset = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

        if data.len() < FRAGMENT_HEADER_SIZE + block_size {
            return Err(ProtocolError::PacketTooShort {
                expected: FRAGMENT_HEADER_SIZE + block_size,
                got: data.len(),
            });
        }

        Ok(Self {
            data_type: type_byte & 0x7F,
            last_fragment: type_byte & LAST_FRAGMENT_FLAG != 0,
            sequence,
            frame_size,
            offset,
            payload: &data[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + block_size],
        })
    }

    pub fn is_video(&self) -> bool {
        self.data_type == VIDEO_DATA_TYPE
    }

    /// Bytes this record occupies in the datagram (header + payload).
    pub fn wire_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.payload.len()
    }
}

/// One marker-driven fragment (Dialect B, the legacy RTP-style framing).
///
/// A datagram carries exactly one fragment after a fixed 20-byte header:
/// bytes 4-7 frame id, 8-11 timestamp tick, 12-15 fragment offset, all
/// little-endian; the remainder is payload. There is no declared length —
/// completion is detected from the JPEG markers themselves.
#[derive(Debug)]
pub struct MarkerFragment<'a> {
    pub frame_id: u32,
    pub tick: u32,
    pub offset: u32,
    pub payload: &'a [u8],
}

impl<'a> MarkerFragment<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: FRAGMENT_HEADER_SIZE,
                got: datagram.len(),
            });
        }
        Ok(Self {
            frame_id: u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
            tick: u32::from_le_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
            offset: u32::from_le_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]),
            payload: &datagram[FRAGMENT_HEADER_SIZE..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_record(
        type_byte: u8,
        sequence: u32,
        frame_size: u32,
        offset: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + payload.len());
        buf.push(type_byte);
        buf.push(0);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&frame_size.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_single_record() {
        let payload = [0xFF, 0xD8, 0x01, 0x02];
        let bytes = build_record(0x82, 7, 4, 0, &payload);
        let rec = FragmentRecord::parse(&bytes).unwrap();
        assert_eq!(rec.data_type, 2);
        assert!(rec.last_fragment);
        assert!(rec.is_video());
        assert_eq!(rec.sequence, 7);
        assert_eq!(rec.frame_size, 4);
        assert_eq!(rec.offset, 0);
        assert_eq!(rec.payload, &payload);
        assert_eq!(rec.wire_len(), FRAGMENT_HEADER_SIZE + 4);
    }

    #[test]
    fn non_video_type() {
        let bytes = build_record(0x05, 1, 10, 0, &[1, 2, 3]);
        let rec = FragmentRecord::parse(&bytes).unwrap();
        assert_eq!(rec.data_type, 5);
        assert!(!rec.last_fragment);
        assert!(!rec.is_video());
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = [0x02u8; 10];
        assert!(FragmentRecord::parse(&bytes).is_err());
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut bytes = build_record(0x02, 1, 100, 0, &[0u8; 50]);
        bytes.truncate(FRAGMENT_HEADER_SIZE + 30); // blockSize says 50
        assert!(FragmentRecord::parse(&bytes).is_err());
    }

    #[test]
    fn walk_two_packed_records() {
        let mut datagram = build_record(0x02, 9, 8, 0, &[0xFF, 0xD8, 0, 0]);
        datagram.extend_from_slice(&build_record(0x82, 9, 8, 4, &[0, 0, 0xFF, 0xD9]));

        let first = FragmentRecord::parse(&datagram).unwrap();
        assert_eq!(first.offset, 0);
        let second = FragmentRecord::parse(&datagram[first.wire_len()..]).unwrap();
        assert_eq!(second.offset, 4);
        assert!(second.last_fragment);
    }

    #[test]
    fn stream_signature_gate() {
        assert!(has_stream_signature(&[0x02, 0x00, 0xAC, 0x05, 0x99]));
        assert!(!has_stream_signature(&[0x02, 0x00, 0xAC, 0x06]));
        assert!(!has_stream_signature(&[0x02, 0x00]));
    }

    #[test]
    fn parse_marker_fragment() {
        let mut datagram = vec![0u8; FRAGMENT_HEADER_SIZE];
        datagram[4..8].copy_from_slice(&7u32.to_le_bytes());
        datagram[8..12].copy_from_slice(&1001u32.to_le_bytes());
        datagram[12..16].copy_from_slice(&50u32.to_le_bytes());
        datagram.extend_from_slice(&[0xAA, 0xBB]);

        let frag = MarkerFragment::parse(&datagram).unwrap();
        assert_eq!(frag.frame_id, 7);
        assert_eq!(frag.tick, 1001);
        assert_eq!(frag.offset, 50);
        assert_eq!(frag.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn marker_fragment_too_short() {
        assert!(MarkerFragment::parse(&[0u8; 19]).is_err());
    }
}
