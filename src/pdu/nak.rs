use alloc::vec::Vec;
use derive_new::new;
use spacepackets::cfdp::{
    pdu::{
        nak::{NakPduCreator, NakPduReader},
        CommonPduConfig, FileDirectiveType, PduHeader,
    },
    LargeFileFlag,
};

use super::{check_len, encode_directive, fss_len, write_packet, CodecError, PduError};

/// Half-open byte range `[start, end)` of a file.
///
/// Used for the missing ranges reported by the reassembly buffer and for the segment requests
/// of a NAK PDU. The request `(0, 0)` asks for the retransmission of the Metadata PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, new)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentRequest {
    pub start: u64,
    pub end: u64,
}

impl SegmentRequest {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_metadata_request(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// NAK PDU which requests the retransmission of missing file segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    pub start_of_scope: u64,
    pub end_of_scope: u64,
    pub segment_requests: Vec<SegmentRequest>,
}

impl NakPdu {
    pub fn new(start_of_scope: u64, end_of_scope: u64, segment_requests: Vec<SegmentRequest>) -> Self {
        Self {
            start_of_scope,
            end_of_scope,
            segment_requests,
        }
    }

    /// Creates a NAK PDU whose scope spans from the first to the last requested segment.
    pub fn new_from_missing(segment_requests: Vec<SegmentRequest>) -> Self {
        let start_of_scope = segment_requests.first().map(|req| req.start).unwrap_or(0);
        let end_of_scope = segment_requests.last().map(|req| req.end).unwrap_or(0);
        Self::new(start_of_scope, end_of_scope, segment_requests)
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        let conf = *header.common_pdu_conf();
        if conf.file_flag == LargeFileFlag::Large {
            if self.segment_requests.is_empty() {
                // The creator writes the scope of a NAK without requests with 4 bytes.
                let mut params = Vec::with_capacity(16);
                params.extend_from_slice(&self.start_of_scope.to_be_bytes());
                params.extend_from_slice(&self.end_of_scope.to_be_bytes());
                return encode_directive(conf, FileDirectiveType::NakPdu, &params);
            }
            let pairs: Vec<(u64, u64)> = self
                .segment_requests
                .iter()
                .map(|req| (req.start, req.end))
                .collect();
            return write_packet(&NakPduCreator::new_large_file_size(
                header,
                self.start_of_scope,
                self.end_of_scope,
                &pairs,
            )?);
        }
        let to_u32 =
            |value: u64| u32::try_from(value).map_err(|_| CodecError::InvalidStartOrEndOfScopeValue);
        let pairs = self
            .segment_requests
            .iter()
            .map(|req| Ok((to_u32(req.start)?, to_u32(req.end)?)))
            .collect::<Result<Vec<_>, CodecError>>()?;
        write_packet(&NakPduCreator::new(
            header,
            to_u32(self.start_of_scope)?,
            to_u32(self.end_of_scope)?,
            &pairs,
        )?)
    }

    pub(crate) fn from_raw(
        conf: &CommonPduConfig,
        raw: &[u8],
        params: &[u8],
    ) -> Result<Self, PduError> {
        let pair_len = 2 * fss_len(conf.file_flag);
        check_len(params, pair_len)?;
        if (params.len() - pair_len) % pair_len != 0 {
            return Err(PduError::Malformed("incomplete NAK segment request"));
        }
        let nak = NakPduReader::from_bytes(raw)?;
        let segment_requests = match nak.get_large_segment_requests_iterator() {
            Some(iter) => iter
                .map(|(start, end)| SegmentRequest::new(start, end))
                .collect(),
            None => nak
                .get_normal_segment_requests_iterator()
                .into_iter()
                .flatten()
                .map(|(start, end)| SegmentRequest::new(start.into(), end.into()))
                .collect(),
        };
        Ok(Self {
            start_of_scope: nak.start_of_scope(),
            end_of_scope: nak.end_of_scope(),
            segment_requests,
        })
    }
}
