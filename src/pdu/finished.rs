use alloc::vec::Vec;
use spacepackets::{
    cfdp::{
        pdu::{
            finished::{DeliveryCode, FileStatus, FinishedPduCreator, FinishedPduReader},
            PduHeader,
        },
        tlv::TlvType,
        ConditionCode, TlvLvError,
    },
    util::UnsignedByteField,
};

use super::{
    check_len,
    tlv::{entity_id_tlv, read_entity_id_tlv, split_tlv, standard_type, FilestoreResponse},
    write_packet, CodecError, PduError,
};

/// Finished PDU. Sent by the file receiver once the transaction is complete or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub filestore_responses: Vec<FilestoreResponse>,
    pub fault_location: Option<UnsignedByteField>,
}

impl FinishedPdu {
    pub fn new(
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        Self {
            condition_code,
            delivery_code,
            file_status,
            filestore_responses: Vec::new(),
            fault_location: None,
        }
    }

    pub fn new_no_error(file_status: FileStatus) -> Self {
        Self::new(ConditionCode::NoError, DeliveryCode::Complete, file_status)
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        let responses = self
            .filestore_responses
            .iter()
            .map(FilestoreResponse::as_tlv)
            .collect::<Result<Vec<_>, _>>()?;
        let fault_location = self.fault_location.as_ref().map(entity_id_tlv).transpose()?;
        write_packet(&FinishedPduCreator::new_generic(
            header,
            self.condition_code,
            self.delivery_code,
            self.file_status,
            &responses,
            fault_location,
        ))
    }

    /// Only filestore responses followed by an optional fault location are valid options.
    fn check_options(mut options: &[u8]) -> Result<(), PduError> {
        while !options.is_empty() {
            let (tlv, raw, rest) = split_tlv(options)?;
            match standard_type(&tlv) {
                Some(TlvType::FilestoreResponse) => check_len(raw, 3)?,
                Some(TlvType::EntityId) => {
                    read_entity_id_tlv(tlv)?;
                    if !rest.is_empty() {
                        return Err(CodecError::FormatError.into());
                    }
                }
                _ => {
                    return Err(TlvLvError::InvalidTlvTypeField {
                        found: raw[0],
                        expected: Some(TlvType::FilestoreResponse as u8),
                    }
                    .into())
                }
            }
            options = rest;
        }
        Ok(())
    }

    pub(crate) fn from_raw(raw: &[u8], params: &[u8]) -> Result<Self, PduError> {
        check_len(params, 1)?;
        Self::check_options(&params[1..])?;
        let finished = FinishedPduReader::from_bytes(raw)?;
        let mut filestore_responses = Vec::new();
        let mut responses_raw = finished.fs_responses_raw();
        while !responses_raw.is_empty() {
            let (_, tlv_raw, rest) = split_tlv(responses_raw)?;
            filestore_responses.push(FilestoreResponse::from_tlv(tlv_raw)?);
            responses_raw = rest;
        }
        Ok(Self {
            condition_code: finished.condition_code(),
            delivery_code: finished.delivery_code(),
            file_status: finished.file_status(),
            filestore_responses,
            fault_location: finished.fault_location().map(|tlv| *tlv.entity_id()),
        })
    }
}
