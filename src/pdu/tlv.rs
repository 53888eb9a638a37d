//! Type-length-value (TLV) options as specified in CFDP 5.4.
//!
//! The owned option types are converted from and to the spacepackets TLV types.
use alloc::{string::String, vec::Vec};
use spacepackets::{
    cfdp::{
        lv::Lv,
        tlv::{
            fs_request_has_second_filename, EntityIdTlv, FilestoreActionCode,
            FilestoreRequestTlv, FilestoreResponseTlv, GenericTlv, ReadableTlv, Tlv, TlvType,
            TlvTypeField, WritableTlv,
        },
        ConditionCode, FaultHandlerCode, TlvLvError,
    },
    util::UnsignedByteField,
};

use super::{check_len, lv_to_string, split_lv, validate_ubf, CodecError, PduError};

/// Splits off the next TLV. Returns the TLV, its exact raw bytes and the remaining bytes.
pub(crate) fn split_tlv(buf: &[u8]) -> Result<(Tlv<'_>, &[u8], &[u8]), PduError> {
    let tlv = Tlv::from_bytes(buf)?;
    let (raw, rest) = buf.split_at(tlv.len_full());
    Ok((tlv, raw, rest))
}

/// Type of a TLV, [None] for reserved or custom types.
pub(crate) fn standard_type(tlv: &Tlv) -> Option<TlvType> {
    match tlv.tlv_type_field() {
        TlvTypeField::Standard(tlv_type) => Some(tlv_type),
        TlvTypeField::Custom(_) => None,
    }
}

/// Entity ID TLV which is used for the fault location.
pub(crate) fn entity_id_tlv(entity_id: &UnsignedByteField) -> Result<EntityIdTlv, PduError> {
    validate_ubf(entity_id)?;
    Ok(EntityIdTlv::new(*entity_id))
}

pub(crate) fn read_entity_id_tlv(tlv: Tlv) -> Result<UnsignedByteField, PduError> {
    Ok(*EntityIdTlv::try_from(tlv)?.entity_id())
}

/// Filestore TLVs with an empty value can not be handed to the spacepackets readers.
fn check_filestore_tlv(raw: &[u8]) -> Result<(), PduError> {
    check_len(raw, 3)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilestoreRequest {
    pub action_code: FilestoreActionCode,
    pub first_name: String,
    pub second_name: Option<String>,
}

impl FilestoreRequest {
    pub fn new_create_file(name: impl Into<String>) -> Self {
        Self {
            action_code: FilestoreActionCode::CreateFile,
            first_name: name.into(),
            second_name: None,
        }
    }

    pub(crate) fn to_tlv_vec(&self) -> Result<Vec<u8>, PduError> {
        let first_name = Lv::new_from_str(&self.first_name)?;
        let second_name = if fs_request_has_second_filename(self.action_code) {
            Some(Lv::new_from_str(
                self.second_name.as_deref().ok_or(TlvLvError::SecondNameMissing)?,
            )?)
        } else {
            None
        };
        Ok(FilestoreRequestTlv::new(self.action_code, first_name, second_name)?.to_vec())
    }

    /// Parses the request from the exact raw TLV.
    pub(crate) fn from_tlv(raw: &[u8]) -> Result<Self, PduError> {
        check_filestore_tlv(raw)?;
        let tlv = FilestoreRequestTlv::from_bytes(raw)?;
        Ok(Self {
            action_code: tlv.action_code(),
            first_name: lv_to_string(&tlv.first_name())?,
            second_name: tlv.second_name().as_ref().map(lv_to_string).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilestoreResponse {
    pub action_code: FilestoreActionCode,
    /// Four bit status code, 0 means success.
    pub status_code: u8,
    pub first_name: String,
    pub second_name: Option<String>,
    pub message: Vec<u8>,
}

impl FilestoreResponse {
    /// Borrowed TLV view of the response.
    pub(crate) fn as_tlv(&self) -> Result<FilestoreResponseTlv<'_, '_, '_>, PduError> {
        let first_name = Lv::new_from_str(&self.first_name)?;
        let second_name = if fs_request_has_second_filename(self.action_code) {
            Some(Lv::new_from_str(
                self.second_name.as_deref().ok_or(TlvLvError::SecondNameMissing)?,
            )?)
        } else {
            None
        };
        let tlv = FilestoreResponseTlv::new(
            self.action_code,
            self.status_code & 0b1111,
            first_name,
            second_name,
            Lv::new(&self.message)?,
        )?;
        // The message is not part of the length check of the constructor.
        if tlv.len_value() > u8::MAX as usize {
            return Err(TlvLvError::InvalidValueLength(tlv.len_value()).into());
        }
        Ok(tlv)
    }

    #[cfg(test)]
    pub(crate) fn to_tlv_vec(&self) -> Result<Vec<u8>, PduError> {
        Ok(self.as_tlv()?.to_vec())
    }

    /// Parses the response from the exact raw TLV.
    pub(crate) fn from_tlv(raw: &[u8]) -> Result<Self, PduError> {
        check_filestore_tlv(raw)?;
        let tlv = FilestoreResponseTlv::from_bytes(raw)?;
        let second_name = tlv.second_name();
        let message_offset = 3
            + tlv.first_name().len_full()
            + second_name.as_ref().map_or(0, |name| name.len_full());
        let (message, _) = split_lv(
            raw.get(message_offset..)
                .ok_or(PduError::Malformed("filestore response message missing"))?,
        )?;
        Ok(Self {
            action_code: tlv.action_code(),
            status_code: tlv.status_code(),
            first_name: lv_to_string(&tlv.first_name())?,
            second_name: second_name.as_ref().map(lv_to_string).transpose()?,
            message: message.value().to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultHandlerOverride {
    pub condition_code: ConditionCode,
    pub handler_code: FaultHandlerCode,
}

impl FaultHandlerOverride {
    pub(crate) fn to_tlv_vec(&self) -> Result<Vec<u8>, PduError> {
        let value = [((self.condition_code as u8) << 4) | (self.handler_code as u8)];
        Ok(Tlv::new(TlvType::FaultHandler, &value)?.to_vec())
    }

    pub(crate) fn from_value(value: &[u8]) -> Result<Self, PduError> {
        check_len(value, 1)?;
        let condition_code = ConditionCode::try_from(value[0] >> 4)
            .map_err(|_| CodecError::InvalidConditionCode(value[0] >> 4))?;
        let handler_code = FaultHandlerCode::try_from(value[0] & 0b1111)
            .map_err(|_| PduError::Malformed("invalid fault handler code"))?;
        Ok(Self {
            condition_code,
            handler_code,
        })
    }
}
