use alloc::vec::Vec;
use spacepackets::{
    cfdp::{
        pdu::{eof::EofPdu as EofPduCodec, CommonPduConfig, PduHeader},
        ConditionCode,
    },
    util::UnsignedByteField,
};

use super::{
    check_len, fss_len,
    tlv::{entity_id_tlv, read_entity_id_tlv, split_tlv},
    write_packet, CodecError, PduError,
};

/// End-of-file PDU. Sent by the file sender after the last file segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub file_checksum: u32,
    pub file_size: u64,
    /// Only serialized if the condition code is not [ConditionCode::NoError].
    pub fault_location: Option<UnsignedByteField>,
}

impl EofPdu {
    pub fn new_no_error(file_checksum: u32, file_size: u64) -> Self {
        Self {
            condition_code: ConditionCode::NoError,
            file_checksum,
            file_size,
            fault_location: None,
        }
    }

    pub fn new_with_error(
        condition_code: ConditionCode,
        file_checksum: u32,
        file_size: u64,
        fault_location: Option<UnsignedByteField>,
    ) -> Self {
        Self {
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        }
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        let fault_location = match (&self.fault_location, self.condition_code) {
            (_, ConditionCode::NoError) | (None, _) => None,
            (Some(entity_id), _) => Some(entity_id_tlv(entity_id)?),
        };
        write_packet(&EofPduCodec::new(
            header,
            self.condition_code,
            self.file_checksum,
            self.file_size,
            fault_location,
        ))
    }

    pub(crate) fn from_raw(
        conf: &CommonPduConfig,
        raw: &[u8],
        params: &[u8],
    ) -> Result<Self, PduError> {
        let fixed_len = 1 + 4 + fss_len(conf.file_flag);
        check_len(params, fixed_len)?;
        let options = &params[fixed_len..];
        let condition_code = ConditionCode::try_from(params[0] >> 4)
            .map_err(|_| CodecError::InvalidConditionCode(params[0] >> 4))?;
        let fault_location = if condition_code != ConditionCode::NoError && !options.is_empty() {
            let (tlv, _, _) = split_tlv(options)?;
            Some(read_entity_id_tlv(tlv)?)
        } else {
            None
        };
        let eof = EofPduCodec::from_bytes(raw)?;
        Ok(Self {
            condition_code: eof.condition_code(),
            file_checksum: eof.file_checksum(),
            file_size: eof.file_size(),
            fault_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::{
        cfdp::{pdu::PduError as CodecError, tlv::TlvType, LargeFileFlag},
        util::UnsignedEnum,
    };

    use super::*;
    use crate::{
        pdu::{Pdu, PduConfigExt, PduPayload},
        tests::{generic_pdu_conf, LOCAL_ID},
    };

    #[test]
    fn test_no_error_layout() {
        let pdu = Pdu::new(generic_pdu_conf(), EofPdu::new_no_error(0x01020304, 25));
        let raw = pdu.to_vec().unwrap();
        let header_len = generic_pdu_conf().header_len();
        assert_eq!(
            &raw[header_len..],
            &[0x04, 0x00, 1, 2, 3, 4, 0, 0, 0, 25]
        );
        assert_eq!(Pdu::from_bytes(&raw).unwrap(), pdu);
    }

    #[test]
    fn test_large_file() {
        let mut conf = generic_pdu_conf();
        conf.file_flag = LargeFileFlag::Large;
        let pdu = Pdu::new(conf, EofPdu::new_no_error(7, u32::MAX as u64 + 5));
        let raw = pdu.to_vec().unwrap();
        assert_eq!(raw.len(), conf.header_len() + 14);
        assert_eq!(Pdu::from_bytes(&raw).unwrap(), pdu);
    }

    #[test]
    fn test_fault_location_only_with_error() {
        let mut eof = EofPdu::new_no_error(0, 0);
        eof.fault_location = Some(LOCAL_ID.into());
        let raw = Pdu::new(generic_pdu_conf(), eof).to_vec().unwrap();
        assert_eq!(raw.len(), generic_pdu_conf().header_len() + 10);

        let eof = EofPdu::new_with_error(
            ConditionCode::CancelRequestReceived,
            0,
            5,
            Some(LOCAL_ID.into()),
        );
        let raw = Pdu::new(generic_pdu_conf(), eof).to_vec().unwrap();
        let header_len = generic_pdu_conf().header_len();
        assert_eq!(raw[header_len + 1], 0xf0);
        assert_eq!(&raw[header_len + 10..], &[TlvType::EntityId as u8, 2, 0, 1]);
        match Pdu::from_bytes(&raw).unwrap().payload() {
            PduPayload::Eof(decoded) => {
                assert_eq!(decoded.condition_code, ConditionCode::CancelRequestReceived);
                assert_eq!(decoded.fault_location.unwrap().value(), 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_truncated_fault_location() {
        let eof = EofPdu::new_with_error(
            ConditionCode::CancelRequestReceived,
            0,
            5,
            Some(LOCAL_ID.into()),
        );
        let mut raw = Pdu::new(generic_pdu_conf(), eof).to_vec().unwrap();
        // Shorten the data field so the TLV value is cut off.
        raw.pop();
        let datafield_len = u16::from_be_bytes([raw[1], raw[2]]) - 1;
        raw[1..3].copy_from_slice(&datafield_len.to_be_bytes());
        assert!(Pdu::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_invalid_condition_code() {
        let mut raw = Pdu::new(generic_pdu_conf(), EofPdu::new_no_error(0, 0))
            .to_vec()
            .unwrap();
        let header_len = generic_pdu_conf().header_len();
        raw[header_len + 1] = 0xc0;
        assert_eq!(
            Pdu::from_bytes(&raw).unwrap_err(),
            PduError::Codec(CodecError::InvalidConditionCode(0x0c))
        );
    }
}
