use alloc::vec::Vec;
use spacepackets::cfdp::{
    pdu::{ack::AckPdu as AckPduCodec, FileDirectiveType, PduHeader},
    ConditionCode, TransactionStatus,
};

use super::{check_len, write_packet, PduError};

/// ACK PDU. Only the EOF and the Finished PDU are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPdu {
    acked_directive: FileDirectiveType,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    /// Returns [None] if the directive can not be acknowledged.
    pub fn new(
        acked_directive: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Option<Self> {
        if acked_directive != FileDirectiveType::EofPdu
            && acked_directive != FileDirectiveType::FinishedPdu
        {
            return None;
        }
        Some(Self {
            acked_directive,
            condition_code,
            transaction_status,
        })
    }

    /// ACK sent by the receiver for an EOF PDU while the transaction is still active.
    pub fn new_for_eof(condition_code: ConditionCode) -> Self {
        Self {
            acked_directive: FileDirectiveType::EofPdu,
            condition_code,
            transaction_status: TransactionStatus::Active,
        }
    }

    /// ACK sent by the sender for a Finished PDU, which terminates the transaction.
    pub fn new_for_finished(condition_code: ConditionCode) -> Self {
        Self {
            acked_directive: FileDirectiveType::FinishedPdu,
            condition_code,
            transaction_status: TransactionStatus::Terminated,
        }
    }

    pub fn acked_directive(&self) -> FileDirectiveType {
        self.acked_directive
    }

    /// Directive subtype code. It is 1 for acknowledged Finished PDUs and 0 otherwise.
    pub fn directive_subtype(&self) -> u8 {
        if self.acked_directive == FileDirectiveType::FinishedPdu {
            0b0001
        } else {
            0b0000
        }
    }

    pub(crate) fn to_vec(&self, header: PduHeader) -> Result<Vec<u8>, PduError> {
        write_packet(&AckPduCodec::new(
            header,
            self.acked_directive,
            self.condition_code,
            self.transaction_status,
        )?)
    }

    pub(crate) fn from_raw(raw: &[u8], params: &[u8]) -> Result<Self, PduError> {
        check_len(params, 2)?;
        let ack = AckPduCodec::from_bytes(raw)?;
        Ok(Self {
            acked_directive: ack.directive_code_of_acked_pdu(),
            condition_code: ack.condition_code(),
            transaction_status: ack.transaction_status(),
        })
    }
}
