use alloc::vec::Vec;
use spacepackets::cfdp::{
    pdu::{
        file_data::{
            FileDataPdu as FileDataPduCodec, RecordContinuationState,
            SegmentMetadata as SegmentMetadataCodec,
        },
        PduHeader,
    },
    SegmentMetadataFlag, TlvLvDataTooLarge,
};

use super::{check_len, fss_len, write_packet, PduError};

/// Optional segment metadata of a file data PDU. It is only present if the segment metadata
/// flag of the PDU header is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    pub record_continuation_state: RecordContinuationState,
    /// At most 63 bytes.
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu {
    pub offset: u64,
    pub segment_metadata: Option<SegmentMetadata>,
    pub data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            segment_metadata: None,
            data,
        }
    }

    /// Offset of the first byte after this segment.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        let segment_metadata = match &self.segment_metadata {
            Some(seg_metadata) => Some(
                SegmentMetadataCodec::new(
                    seg_metadata.record_continuation_state,
                    (!seg_metadata.metadata.is_empty()).then_some(seg_metadata.metadata.as_slice()),
                )
                .ok_or(TlvLvDataTooLarge(seg_metadata.metadata.len()))?,
            ),
            None => None,
        };
        write_packet(&FileDataPduCodec::new_generic(
            header,
            segment_metadata,
            self.offset,
            &self.data,
        ))
    }

    pub(crate) fn from_raw(
        header: &PduHeader,
        raw: &[u8],
        datafield: &[u8],
    ) -> Result<Self, PduError> {
        let mut fixed_len = fss_len(header.common_pdu_conf().file_flag);
        if header.seg_metadata_flag() == SegmentMetadataFlag::Present {
            check_len(datafield, 1)?;
            fixed_len += 1 + (datafield[0] & 0b11_1111) as usize;
        }
        check_len(datafield, fixed_len)?;
        let fd = FileDataPduCodec::from_bytes(raw)?;
        Ok(Self {
            offset: fd.offset(),
            segment_metadata: fd.segment_metadata().map(|seg_metadata| SegmentMetadata {
                record_continuation_state: seg_metadata.record_continuation_state(),
                metadata: seg_metadata.metadata().unwrap_or_default().to_vec(),
            }),
            data: fd.file_data().to_vec(),
        })
    }
}
