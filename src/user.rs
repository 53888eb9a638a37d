//! CFDP user abstraction which receives all indications generated by the engine.
use alloc::{string::String, sync::Arc, vec::Vec};
use parking_lot::Mutex;
use spacepackets::{
    cfdp::{
        pdu::finished::{DeliveryCode, FileStatus},
        ConditionCode,
    },
    util::UnsignedByteField,
};

use crate::{
    pdu::{file_data::SegmentMetadata, msg_to_user::MessageToUser},
    TransactionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

#[derive(Debug)]
pub struct MetadataReceivedParams<'src_file, 'dest_file, 'msgs_to_user> {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: &'src_file str,
    pub dest_file_name: &'dest_file str,
    pub msgs_to_user: &'msgs_to_user [MessageToUser],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMetadataRecvdParams {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: String,
    pub dest_file_name: String,
    pub msgs_to_user: Vec<MessageToUser>,
}

impl From<MetadataReceivedParams<'_, '_, '_>> for OwnedMetadataRecvdParams {
    fn from(value: MetadataReceivedParams) -> Self {
        Self::from(&value)
    }
}

impl From<&MetadataReceivedParams<'_, '_, '_>> for OwnedMetadataRecvdParams {
    fn from(value: &MetadataReceivedParams) -> Self {
        Self {
            id: value.id,
            source_id: value.source_id,
            file_size: value.file_size,
            src_file_name: value.src_file_name.into(),
            dest_file_name: value.dest_file_name.into(),
            msgs_to_user: value.msgs_to_user.to_vec(),
        }
    }
}

#[derive(Debug)]
pub struct FileSegmentRecvdParams<'seg_meta> {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub segment_metadata: Option<&'seg_meta SegmentMetadata>,
}

/// Indications issued by the engine to the CFDP user as specified in chapter 3.4.2 of the CFDP
/// standard. Only indications which are enabled inside the
/// [crate::IndicationConfig] of the local entity are issued, except for the
/// transaction, metadata and fault indications which are always issued.
pub trait CfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId);
    fn eof_sent_indication(&mut self, id: &TransactionId);
    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams);
    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams);
    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams);
    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode);
    fn resumed_indication(&mut self, id: &TransactionId, progress: u64);
    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );
    fn eof_recvd_indication(&mut self, id: &TransactionId);
}

/// The user is shared between the receiver and the threads of all outbound transfers.
pub type SharedUser<U> = Arc<Mutex<U>>;
