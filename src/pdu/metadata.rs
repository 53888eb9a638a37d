use alloc::{string::String, vec::Vec};
use hashbrown::HashSet;
use spacepackets::cfdp::{
    lv::Lv,
    pdu::{
        metadata::{MetadataGenericParams, MetadataPduCreator, MetadataPduReader},
        PduHeader,
    },
    tlv::{ReadableTlv, Tlv, TlvType, WritableTlv},
    ChecksumType, SegmentationControl,
};

use super::{
    check_len, fss_len, lv_to_string,
    msg_to_user::MessageToUser,
    split_lv,
    tlv::{split_tlv, standard_type, FaultHandlerOverride, FilestoreRequest},
    write_packet, PduError,
};

/// Metadata PDU. This is the first PDU of every transaction.
///
/// The segmentation control flag is transported inside the PDU header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    pub seg_ctrl: SegmentationControl,
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
    /// Empty for transactions which only carry messages to the user.
    pub source_file_name: String,
    pub dest_file_name: String,
    pub filestore_requests: Vec<FilestoreRequest>,
    pub msgs_to_user: Vec<MessageToUser>,
    pub fault_handler_overrides: Vec<FaultHandlerOverride>,
    pub flow_label: Option<Vec<u8>>,
}

impl MetadataPdu {
    pub fn new(file_size: u64, source_file_name: String, dest_file_name: String) -> Self {
        Self {
            seg_ctrl: SegmentationControl::NoRecordBoundaryPreservation,
            closure_requested: false,
            checksum_type: ChecksumType::Modular,
            file_size,
            source_file_name,
            dest_file_name,
            filestore_requests: Vec::new(),
            msgs_to_user: Vec::new(),
            fault_handler_overrides: Vec::new(),
            flow_label: None,
        }
    }

    /// Metadata PDU without a file, which only transports messages to the user.
    pub fn new_msgs_to_user_only(msgs_to_user: Vec<MessageToUser>) -> Self {
        Self {
            checksum_type: ChecksumType::NullChecksum,
            msgs_to_user,
            ..Self::new(0, String::new(), String::new())
        }
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        let mut options = Vec::new();
        for request in &self.filestore_requests {
            options.extend(request.to_tlv_vec()?);
        }
        for msg in &self.msgs_to_user {
            options.extend(msg.to_tlv_vec()?);
        }
        for fh_override in &self.fault_handler_overrides {
            options.extend(fh_override.to_tlv_vec()?);
        }
        if let Some(flow_label) = &self.flow_label {
            options.extend(Tlv::new(TlvType::FlowLabel, flow_label)?.to_vec());
        }
        write_packet(&MetadataPduCreator::new(
            header,
            MetadataGenericParams::new(self.closure_requested, self.checksum_type, self.file_size),
            Lv::new_from_str(&self.source_file_name)?,
            Lv::new_from_str(&self.dest_file_name)?,
            &options,
        ))
    }

    pub(crate) fn from_raw(
        header: &PduHeader,
        raw: &[u8],
        params: &[u8],
    ) -> Result<Self, PduError> {
        let fixed_len = 1 + fss_len(header.common_pdu_conf().file_flag);
        check_len(params, fixed_len + 2)?;
        // Both file names must lie within the data field.
        let (_, rest) = split_lv(&params[fixed_len..])?;
        split_lv(rest)?;

        let reader = MetadataPduReader::from_bytes(raw)?;
        let md_params = reader.metadata_params();
        let mut pdu = Self {
            seg_ctrl: header.seg_ctrl(),
            closure_requested: md_params.closure_requested,
            checksum_type: md_params.checksum_type,
            file_size: md_params.file_size,
            source_file_name: lv_to_string(&reader.src_file_name())?,
            dest_file_name: lv_to_string(&reader.dest_file_name())?,
            filestore_requests: Vec::new(),
            msgs_to_user: Vec::new(),
            fault_handler_overrides: Vec::new(),
            flow_label: None,
        };
        let mut reserved_types = HashSet::new();
        let mut options = reader.options();
        while !options.is_empty() {
            let (tlv, tlv_raw, rest) = split_tlv(options)?;
            options = rest;
            match standard_type(&tlv) {
                Some(TlvType::FilestoreRequest) => pdu
                    .filestore_requests
                    .push(FilestoreRequest::from_tlv(tlv_raw)?),
                Some(TlvType::MsgToUser) => {
                    let msg = MessageToUser::from_value(tlv.value())?;
                    if let Some(reserved) = msg.reserved() {
                        match reserved.known_type() {
                            Some(msg_type) => {
                                if !reserved_types.insert(msg_type) {
                                    return Err(PduError::DuplicateReservedMessage(msg_type));
                                }
                            }
                            None => log::warn!(
                                "ignoring reserved CFDP message with type {:#04x}",
                                reserved.msg_type_raw()
                            ),
                        }
                    }
                    pdu.msgs_to_user.push(msg);
                }
                Some(TlvType::FaultHandler) => pdu
                    .fault_handler_overrides
                    .push(FaultHandlerOverride::from_value(tlv.value())?),
                Some(TlvType::FlowLabel) => pdu.flow_label = Some(tlv.value().to_vec()),
                _ => log::warn!(
                    "skipping unexpected option TLV with type {:#04x} in metadata PDU",
                    tlv_raw[0]
                ),
            }
        }
        Ok(pdu)
    }

    /// Returns whether this metadata PDU announces a file transfer.
    pub fn has_file(&self) -> bool {
        !self.source_file_name.is_empty() || !self.dest_file_name.is_empty()
    }
}
