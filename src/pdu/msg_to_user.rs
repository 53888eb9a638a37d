//! Messages to user and the reserved CFDP messages as specified in CFDP 6.1.
//!
//! A message to user whose value starts with the ASCII string `cfdp` followed by a one byte
//! message type is a reserved CFDP message. These are used to implement the Proxy Put
//! procedure, where a remote entity is asked to send one of its files.
use alloc::{string::String, vec::Vec};
use spacepackets::{
    cfdp::{
        lv::Lv,
        tlv::{msg_to_user::MsgToUserTlv, WritableTlv},
        TransmissionMode,
    },
    util::{UnsignedByteField, UnsignedEnum},
};

use super::{check_len, lv_to_string, split_lv, ubf_from_raw, validate_ubf, PduError};
use crate::TransactionId;

pub const CFDP_MSG_TAG: &[u8; 4] = b"cfdp";

fn push_lv(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), PduError> {
    let lv = Lv::new(value)?;
    let start = buf.len();
    buf.resize(start + lv.len_full(), 0);
    lv.write_to_be_bytes(&mut buf[start..])?;
    Ok(())
}

fn push_ubf(buf: &mut Vec<u8>, field: &UnsignedByteField) -> Result<(), PduError> {
    validate_ubf(field)?;
    let start = buf.len();
    buf.resize(start + field.size(), 0);
    field.write_to_be_bytes(&mut buf[start..])?;
    Ok(())
}

/// First byte of a one byte content, for example the transmission mode.
fn first_byte(content: &[u8]) -> Result<u8, PduError> {
    check_len(content, 1)?;
    Ok(content[0])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ReservedMessageType {
    ProxyPutRequest = 0x00,
    ProxyMessageToUser = 0x01,
    ProxyFilestoreRequest = 0x02,
    ProxyFaultHandlerOverride = 0x03,
    ProxyTransmissionMode = 0x04,
    ProxyFlowLabel = 0x05,
    ProxySegmentationControl = 0x06,
    ProxyPutResponse = 0x07,
    ProxyFilestoreResponse = 0x08,
    ProxyPutCancel = 0x09,
    OriginatingTransactionId = 0x0A,
    ProxyClosureRequest = 0x0B,
}

impl TryFrom<u8> for ReservedMessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::ProxyPutRequest,
            0x01 => Self::ProxyMessageToUser,
            0x02 => Self::ProxyFilestoreRequest,
            0x03 => Self::ProxyFaultHandlerOverride,
            0x04 => Self::ProxyTransmissionMode,
            0x05 => Self::ProxyFlowLabel,
            0x06 => Self::ProxySegmentationControl,
            0x07 => Self::ProxyPutResponse,
            0x08 => Self::ProxyFilestoreResponse,
            0x09 => Self::ProxyPutCancel,
            0x0A => Self::OriginatingTransactionId,
            0x0B => Self::ProxyClosureRequest,
            _ => return Err(value),
        })
    }
}

/// Proxy Put Request. The receiving entity should send its file `source_file_name` to the
/// entity `dest_entity_id` and store it there as `dest_file_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProxyPutRequest {
    pub dest_entity_id: UnsignedByteField,
    pub source_file_name: String,
    pub dest_file_name: String,
}

impl ProxyPutRequest {
    pub fn new(
        dest_entity_id: impl Into<UnsignedByteField>,
        source_file_name: impl Into<String>,
        dest_file_name: impl Into<String>,
    ) -> Self {
        Self {
            dest_entity_id: dest_entity_id.into(),
            source_file_name: source_file_name.into(),
            dest_file_name: dest_file_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedMessage {
    ProxyPutRequest(ProxyPutRequest),
    ProxyTransmissionMode(TransmissionMode),
    /// Whether the transaction started by the proxy operation should request closure.
    ProxyClosureRequest(bool),
    /// Back reference to the transaction which triggered a proxy operation.
    OriginatingTransactionId(TransactionId),
    /// Any other reserved message. These are retained but not acted upon.
    Other { msg_type: u8, content: Vec<u8> },
}

impl ReservedMessage {
    pub fn msg_type_raw(&self) -> u8 {
        match self {
            ReservedMessage::ProxyPutRequest(_) => ReservedMessageType::ProxyPutRequest as u8,
            ReservedMessage::ProxyTransmissionMode(_) => {
                ReservedMessageType::ProxyTransmissionMode as u8
            }
            ReservedMessage::ProxyClosureRequest(_) => {
                ReservedMessageType::ProxyClosureRequest as u8
            }
            ReservedMessage::OriginatingTransactionId(_) => {
                ReservedMessageType::OriginatingTransactionId as u8
            }
            ReservedMessage::Other { msg_type, .. } => *msg_type,
        }
    }

    /// Returns the message type for messages which are interpreted by the engine. Only these
    /// are subject to the duplicate check when decoding a Metadata PDU.
    pub fn known_type(&self) -> Option<ReservedMessageType> {
        match self {
            ReservedMessage::Other { .. } => None,
            _ => ReservedMessageType::try_from(self.msg_type_raw()).ok(),
        }
    }

    fn write_content(&self, buf: &mut Vec<u8>) -> Result<(), PduError> {
        match self {
            ReservedMessage::ProxyPutRequest(request) => {
                let mut id = Vec::with_capacity(request.dest_entity_id.size());
                push_ubf(&mut id, &request.dest_entity_id)?;
                push_lv(buf, &id)?;
                push_lv(buf, request.source_file_name.as_bytes())?;
                push_lv(buf, request.dest_file_name.as_bytes())?;
            }
            ReservedMessage::ProxyTransmissionMode(mode) => buf.push(*mode as u8),
            ReservedMessage::ProxyClosureRequest(closure) => buf.push(*closure as u8),
            ReservedMessage::OriginatingTransactionId(id) => {
                buf.push(
                    (((id.source_id().size() - 1) as u8) << 4)
                        | ((id.seq_num().size() - 1) as u8),
                );
                push_ubf(buf, id.source_id())?;
                push_ubf(buf, id.seq_num())?;
            }
            ReservedMessage::Other { content, .. } => buf.extend_from_slice(content),
        }
        Ok(())
    }

    fn from_content(msg_type: u8, content: &[u8]) -> Result<Self, PduError> {
        Ok(match ReservedMessageType::try_from(msg_type) {
            Ok(ReservedMessageType::ProxyPutRequest) => {
                let (dest_entity_id, rest) = split_lv(content)?;
                let (source_file_name, rest) = split_lv(rest)?;
                let (dest_file_name, _) = split_lv(rest)?;
                ReservedMessage::ProxyPutRequest(ProxyPutRequest {
                    dest_entity_id: ubf_from_raw(dest_entity_id.value())?,
                    source_file_name: lv_to_string(&source_file_name)?,
                    dest_file_name: lv_to_string(&dest_file_name)?,
                })
            }
            Ok(ReservedMessageType::ProxyTransmissionMode) => {
                let mode = if first_byte(content)? & 0b1 == 0 {
                    TransmissionMode::Acknowledged
                } else {
                    TransmissionMode::Unacknowledged
                };
                ReservedMessage::ProxyTransmissionMode(mode)
            }
            Ok(ReservedMessageType::ProxyClosureRequest) => {
                ReservedMessage::ProxyClosureRequest(first_byte(content)? & 0b1 == 1)
            }
            Ok(ReservedMessageType::OriginatingTransactionId) => {
                let widths = first_byte(content)?;
                let source_id_len = (((widths >> 4) & 0b111) + 1) as usize;
                let seq_num_len = ((widths & 0b111) + 1) as usize;
                check_len(content, 1 + source_id_len + seq_num_len)?;
                let source_id = ubf_from_raw(&content[1..1 + source_id_len])?;
                let seq_num =
                    ubf_from_raw(&content[1 + source_id_len..1 + source_id_len + seq_num_len])?;
                ReservedMessage::OriginatingTransactionId(TransactionId::new(source_id, seq_num))
            }
            _ => ReservedMessage::Other {
                msg_type,
                content: content.to_vec(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageToUser {
    Reserved(ReservedMessage),
    /// Opaque user message.
    User(Vec<u8>),
}

impl MessageToUser {
    pub fn new_proxy_put_request(request: ProxyPutRequest) -> Self {
        Self::Reserved(ReservedMessage::ProxyPutRequest(request))
    }

    pub fn reserved(&self) -> Option<&ReservedMessage> {
        match self {
            MessageToUser::Reserved(msg) => Some(msg),
            MessageToUser::User(_) => None,
        }
    }

    /// Serializes the message as a Message To User TLV.
    pub(crate) fn to_tlv_vec(&self) -> Result<Vec<u8>, PduError> {
        match self {
            MessageToUser::Reserved(msg) => {
                let mut value = Vec::with_capacity(CFDP_MSG_TAG.len() + 1);
                value.extend_from_slice(CFDP_MSG_TAG);
                value.push(msg.msg_type_raw());
                msg.write_content(&mut value)?;
                Ok(MsgToUserTlv::new(&value)?.to_vec())
            }
            MessageToUser::User(value) => Ok(MsgToUserTlv::new(value)?.to_vec()),
        }
    }

    pub(crate) fn from_value(value: &[u8]) -> Result<Self, PduError> {
        if value.len() > CFDP_MSG_TAG.len() && value.starts_with(CFDP_MSG_TAG) {
            let msg_type = value[CFDP_MSG_TAG.len()];
            let content = &value[CFDP_MSG_TAG.len() + 1..];
            return Ok(Self::Reserved(ReservedMessage::from_content(
                msg_type, content,
            )?));
        }
        Ok(Self::User(value.to_vec()))
    }
}
