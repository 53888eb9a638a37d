//! # CFDP Packet Data Unit (PDU) handling
//!
//! Owned views of all PDUs exchanged by the engine. The header and the EOF, Finished, ACK,
//! Metadata, NAK and File Data PDUs are serialized and parsed with the creators and readers of
//! [spacepackets::cfdp::pdu]. Only the Prompt and the Keep Alive PDU and the reserved CFDP
//! messages to the user are encoded here, on top of the spacepackets [PduHeader].
//!
//! Incoming PDUs are length checked field by field before they are handed to the readers, so
//! truncated or inconsistent input surfaces as a [PduError]. Unknown option TLVs are logged and
//! skipped.
use alloc::{string::String, vec::Vec};
use spacepackets::{
    cfdp::{
        lv::Lv,
        pdu::{PduError as CodecError, WritablePduPacket},
        CrcFlag, Direction, LargeFileFlag, PduType, SegmentMetadataFlag, SegmentationControl,
        TlvLvDataTooLarge, TlvLvError,
    },
    util::{UnsignedByteField, UnsignedEnum},
    ByteConversionError,
};

pub use spacepackets::cfdp::pdu::{CommonPduConfig, FileDirectiveType, PduHeader, FIXED_HEADER_LEN};

use crate::{TransactionId, CRC_CCITT_FALSE};

pub mod ack;
pub mod eof;
pub mod file_data;
pub mod finished;
pub mod keep_alive;
pub mod metadata;
pub mod msg_to_user;
pub mod nak;
pub mod prompt;
pub mod tlv;

use ack::AckPdu;
use eof::EofPdu;
use file_data::FileDataPdu;
use finished::FinishedPdu;
use keep_alive::KeepAlivePdu;
use metadata::MetadataPdu;
use msg_to_user::ReservedMessageType;
use nak::NakPdu;
use prompt::PromptPdu;

pub const CRC_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PduError {
    /// Error of the spacepackets PDU codec.
    #[error("{0}")]
    Codec(CodecError),
    #[error("value {value} does not fit into a field of width {width}")]
    ValueTooLargeForWidth { width: usize, value: u64 },
    #[error("file name is not valid UTF-8")]
    InvalidFileName,
    #[error("data field length {0} exceeds the maximum of 65535 bytes")]
    DataFieldTooLarge(usize),
    /// A Metadata PDU contained more than one reserved message of this type.
    #[error("duplicate reserved message {0:?}")]
    DuplicateReservedMessage(ReservedMessageType),
    #[error("malformed PDU: {0}")]
    Malformed(&'static str),
}

impl From<CodecError> for PduError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<ByteConversionError> for PduError {
    fn from(value: ByteConversionError) -> Self {
        Self::Codec(value.into())
    }
}

impl From<TlvLvError> for PduError {
    fn from(value: TlvLvError) -> Self {
        Self::Codec(value.into())
    }
}

impl From<TlvLvDataTooLarge> for PduError {
    fn from(value: TlvLvDataTooLarge) -> Self {
        Self::Codec(TlvLvError::from(value).into())
    }
}

/// Creates an acknowledged mode configuration directed towards the receiver without a CRC for
/// normal file sizes.
///
/// In addition to the width checks of [CommonPduConfig::new_with_byte_fields], all values must
/// fit into their width.
pub fn pdu_config(
    source_id: impl Into<UnsignedByteField>,
    dest_id: impl Into<UnsignedByteField>,
    seq_num: impl Into<UnsignedByteField>,
) -> Result<CommonPduConfig, PduError> {
    let conf = CommonPduConfig::new_with_byte_fields(source_id, dest_id, seq_num)?;
    validate_ubf(&conf.source_id())?;
    validate_ubf(&conf.dest_id())?;
    validate_ubf(&conf.transaction_seq_num)?;
    Ok(conf)
}

/// Transaction level helpers for [CommonPduConfig].
pub trait PduConfigExt {
    fn transaction_id(&self) -> TransactionId;

    /// Same configuration, but directed towards the file sender. The entity IDs are not
    /// swapped because they always identify the transaction source and destination.
    fn for_reply(&self) -> Self;

    fn header_len(&self) -> usize;

    /// Length of a file size sensitive field for this configuration.
    fn fss_len(&self) -> usize;
}

impl PduConfigExt for CommonPduConfig {
    fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id(), self.transaction_seq_num)
    }

    fn for_reply(&self) -> Self {
        let mut conf = *self;
        conf.direction = Direction::TowardsSender;
        conf
    }

    fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + 2 * self.source_id().size() + self.transaction_seq_num.size()
    }

    fn fss_len(&self) -> usize {
        fss_len(self.file_flag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduPayload {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Prompt(PromptPdu),
    KeepAlive(KeepAlivePdu),
}

impl PduPayload {
    pub fn pdu_type(&self) -> PduType {
        match self {
            PduPayload::FileData(_) => PduType::FileData,
            _ => PduType::FileDirective,
        }
    }

    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        Some(match self {
            PduPayload::Metadata(_) => FileDirectiveType::MetadataPdu,
            PduPayload::FileData(_) => return None,
            PduPayload::Eof(_) => FileDirectiveType::EofPdu,
            PduPayload::Finished(_) => FileDirectiveType::FinishedPdu,
            PduPayload::Ack(_) => FileDirectiveType::AckPdu,
            PduPayload::Nak(_) => FileDirectiveType::NakPdu,
            PduPayload::Prompt(_) => FileDirectiveType::PromptPdu,
            PduPayload::KeepAlive(_) => FileDirectiveType::KeepAlivePdu,
        })
    }

    /// Direction implied by the directive. File data PDUs may travel both ways.
    pub fn direction(&self) -> Option<Direction> {
        Some(match self {
            PduPayload::FileData(_) => return None,
            PduPayload::Metadata(_) | PduPayload::Eof(_) | PduPayload::Prompt(_) => {
                Direction::TowardsReceiver
            }
            PduPayload::Finished(_) | PduPayload::Nak(_) | PduPayload::KeepAlive(_) => {
                Direction::TowardsSender
            }
            PduPayload::Ack(ack) => {
                if ack.acked_directive() == FileDirectiveType::EofPdu {
                    Direction::TowardsSender
                } else {
                    Direction::TowardsReceiver
                }
            }
        })
    }
}

macro_rules! payload_from {
    ($($variant:ident => $ty:ty),*) => {
        $(
            impl From<$ty> for PduPayload {
                fn from(value: $ty) -> Self {
                    PduPayload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    Metadata => MetadataPdu,
    FileData => FileDataPdu,
    Eof => EofPdu,
    Finished => FinishedPdu,
    Ack => AckPdu,
    Nak => NakPdu,
    Prompt => PromptPdu,
    KeepAlive => KeepAlivePdu
);

/// A complete PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    conf: CommonPduConfig,
    payload: PduPayload,
}

impl Pdu {
    /// Creates a new PDU. The direction flag of file directives is derived from the payload.
    pub fn new(mut conf: CommonPduConfig, payload: impl Into<PduPayload>) -> Self {
        let payload = payload.into();
        if let Some(direction) = payload.direction() {
            conf.direction = direction;
        }
        Self { conf, payload }
    }

    #[inline]
    pub fn payload(&self) -> &PduPayload {
        &self.payload
    }

    pub fn into_payload(self) -> PduPayload {
        self.payload
    }

    pub fn conf(&self) -> &CommonPduConfig {
        &self.conf
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.conf.transaction_id()
    }

    pub fn pdu_type(&self) -> PduType {
        self.payload.pdu_type()
    }

    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        self.payload.directive_type()
    }

    /// Header without a valid data field length, which is filled in by the creators.
    fn header_template(&self) -> PduHeader {
        match &self.payload {
            PduPayload::FileData(fd) => PduHeader::new_for_file_data(
                self.conf,
                0,
                if fd.segment_metadata.is_some() {
                    SegmentMetadataFlag::Present
                } else {
                    SegmentMetadataFlag::NotPresent
                },
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            PduPayload::Metadata(md) => PduHeader::new_generic(
                PduType::FileDirective,
                self.conf,
                0,
                SegmentMetadataFlag::NotPresent,
                md.seg_ctrl,
            ),
            _ => PduHeader::new_no_file_data(self.conf, 0),
        }
    }

    /// Serializes the PDU. The CRC is appended if the CRC flag is set.
    pub fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        validate_ubf(&self.conf.source_id())?;
        validate_ubf(&self.conf.dest_id())?;
        validate_ubf(&self.conf.transaction_seq_num)?;
        let header = self.header_template();
        let raw = match &self.payload {
            PduPayload::Metadata(pdu) => pdu.to_vec(header)?,
            PduPayload::FileData(pdu) => pdu.to_vec(header)?,
            PduPayload::Eof(pdu) => pdu.to_vec(header)?,
            PduPayload::Finished(pdu) => pdu.to_vec(header)?,
            PduPayload::Ack(pdu) => pdu.to_vec(header)?,
            PduPayload::Nak(pdu) => pdu.to_vec(header)?,
            PduPayload::Prompt(pdu) => pdu.to_vec(self.conf)?,
            PduPayload::KeepAlive(pdu) => pdu.to_vec(self.conf)?,
        };
        // The creators truncate the 16 bit length field silently.
        let datafield_len = raw.len() - self.conf.header_len();
        if datafield_len > u16::MAX as usize {
            return Err(PduError::DataFieldTooLarge(datafield_len));
        }
        Ok(raw)
    }

    /// Serializes the PDU into the given buffer and returns the written length.
    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let raw = self.to_vec()?;
        if buf.len() < raw.len() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: raw.len(),
            }
            .into());
        }
        buf[..raw.len()].copy_from_slice(&raw);
        Ok(raw.len())
    }

    /// Parses a PDU from a raw buffer. The buffer may be larger than the PDU, trailing bytes
    /// are ignored. If the CRC flag is set, the CRC is verified.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, header_len) = PduHeader::from_bytes(buf)?;
        let len_without_crc = header.verify_length_and_checksum(buf)?;
        let datafield = buf
            .get(header_len..len_without_crc)
            .ok_or(PduError::Malformed("data field too short for CRC"))?;
        let raw = &buf[..header.pdu_len()];
        let conf = *header.common_pdu_conf();
        let payload = match header.pdu_type() {
            PduType::FileData => FileDataPdu::from_raw(&header, raw, datafield)?.into(),
            PduType::FileDirective => {
                let (&code, params) = datafield.split_first().ok_or(
                    ByteConversionError::FromSliceTooSmall {
                        found: 0,
                        expected: 1,
                    },
                )?;
                let directive = FileDirectiveType::try_from(code).map_err(|_| {
                    CodecError::InvalidDirectiveType {
                        found: code,
                        expected: None,
                    }
                })?;
                match directive {
                    FileDirectiveType::EofPdu => EofPdu::from_raw(&conf, raw, params)?.into(),
                    FileDirectiveType::FinishedPdu => {
                        FinishedPdu::from_raw(raw, params)?.into()
                    }
                    FileDirectiveType::AckPdu => AckPdu::from_raw(raw, params)?.into(),
                    FileDirectiveType::MetadataPdu => {
                        MetadataPdu::from_raw(&header, raw, params)?.into()
                    }
                    FileDirectiveType::NakPdu => NakPdu::from_raw(&conf, raw, params)?.into(),
                    FileDirectiveType::PromptPdu => PromptPdu::from_params(params)?.into(),
                    FileDirectiveType::KeepAlivePdu => {
                        KeepAlivePdu::from_params(&conf, params)?.into()
                    }
                }
            }
        };
        Ok(Self { conf, payload })
    }
}

/// Checks that the width of a byte field is supported and that its value fits into the width.
pub(crate) fn validate_ubf(field: &UnsignedByteField) -> Result<(), PduError> {
    if !matches!(field.size(), 1 | 2 | 4 | 8) {
        return Err(CodecError::InvalidEntityLen(field.size() as u8).into());
    }
    if field.size() < 8 && field.value() >> (field.size() * 8) != 0 {
        return Err(PduError::ValueTooLargeForWidth {
            width: field.size(),
            value: field.value(),
        });
    }
    Ok(())
}

/// Reads a byte field whose width is implied by the length of the raw value, for example inside
/// the LV of a Proxy Put Request.
pub(crate) fn ubf_from_raw(raw: &[u8]) -> Result<UnsignedByteField, PduError> {
    if !matches!(raw.len(), 1 | 2 | 4 | 8) {
        return Err(TlvLvError::InvalidValueLength(raw.len()).into());
    }
    UnsignedByteField::new_from_be_bytes(raw.len(), raw)
        .map_err(|_| PduError::Malformed("invalid byte field"))
}

pub(crate) fn fss_len(file_flag: LargeFileFlag) -> usize {
    if file_flag == LargeFileFlag::Large {
        core::mem::size_of::<u64>()
    } else {
        core::mem::size_of::<u32>()
    }
}

pub(crate) fn write_fss(
    buf: &mut Vec<u8>,
    file_flag: LargeFileFlag,
    value: u64,
) -> Result<(), PduError> {
    if file_flag == LargeFileFlag::Large {
        buf.extend_from_slice(&value.to_be_bytes());
    } else {
        let value = u32::try_from(value).map_err(|_| CodecError::FileSizeTooLarge(value))?;
        buf.extend_from_slice(&value.to_be_bytes());
    }
    Ok(())
}

/// Reads a file size sensitive field. The caller checks the length.
pub(crate) fn read_fss(file_flag: LargeFileFlag, buf: &[u8]) -> u64 {
    let mut bytes = [0; 8];
    let len = fss_len(file_flag);
    bytes[8 - len..].copy_from_slice(&buf[..len]);
    u64::from_be_bytes(bytes)
}

/// Fails with a short slice error if fewer than `expected` bytes are available.
pub(crate) fn check_len(buf: &[u8], expected: usize) -> Result<(), PduError> {
    if buf.len() < expected {
        return Err(ByteConversionError::FromSliceTooSmall {
            found: buf.len(),
            expected,
        }
        .into());
    }
    Ok(())
}

/// Reads a length-value field from the start of the buffer and returns it with the remaining
/// bytes.
pub(crate) fn split_lv(buf: &[u8]) -> Result<(Lv<'_>, &[u8]), PduError> {
    let lv = Lv::from_bytes(buf)?;
    let rest = &buf[lv.len_full()..];
    Ok((lv, rest))
}

pub(crate) fn lv_to_string(lv: &Lv) -> Result<String, PduError> {
    match lv.value_as_str() {
        None => Ok(String::new()),
        Some(Ok(name)) => Ok(String::from(name)),
        Some(Err(_)) => Err(PduError::InvalidFileName),
    }
}

/// Writes a file directive which has no spacepackets creator.
pub(crate) fn encode_directive(
    conf: CommonPduConfig,
    directive: FileDirectiveType,
    params: &[u8],
) -> Result<Vec<u8>, PduError> {
    let crc_len = if conf.crc_flag == CrcFlag::WithCrc {
        CRC_LEN
    } else {
        0
    };
    let datafield_len = 1 + params.len() + crc_len;
    let header = PduHeader::new_no_file_data(
        conf,
        u16::try_from(datafield_len).map_err(|_| PduError::DataFieldTooLarge(datafield_len))?,
    );
    let mut raw = alloc::vec![0; header.pdu_len()];
    let mut idx = header.write_to_bytes(&mut raw)?;
    raw[idx] = directive as u8;
    idx += 1;
    raw[idx..idx + params.len()].copy_from_slice(params);
    idx += params.len();
    if crc_len > 0 {
        let crc = CRC_CCITT_FALSE.checksum(&raw[..idx]);
        raw[idx..].copy_from_slice(&crc.to_be_bytes());
    }
    Ok(raw)
}

/// Serializes a spacepackets creator.
pub(crate) fn write_packet(packet: &impl WritablePduPacket) -> Result<Vec<u8>, PduError> {
    Ok(packet.to_vec()?)
}
