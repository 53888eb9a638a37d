//! # CFDP Source Entity Module
//!
//! The [SourceTransaction] is the sending side of a single transaction. It converts a
//! [PutRequest] into all packet data units (PDUs) which need to be sent to a remote CFDP entity
//! to perform a File Copy operation.
//!
//! Each [SourceTransaction::state_machine] call generates at most one PDU. This allows flow
//! control by the driver of the state machine, which is usually the [run_transfer] function
//! running on a dedicated thread. The state machine performs the following steps:
//!
//! 1. Generate the Metadata PDU.
//! 2. Generate all File Data PDUs, if the transfer contains a non-empty file.
//! 3. Generate the EOF PDU and start the positive ACK procedure for it.
//! 4. Wait for the ACK of the EOF PDU and retransmit all file segments requested with NAK PDUs.
//! 5. Wait for the Finished PDU and acknowledge it.
//!
//! The [TransferControl] is shared between the driver thread and the engine. It is used to
//! pause, resume and cancel the transfer and to pass PDUs received for the transaction to the
//! driver thread.
use core::time::Duration;
use std::{collections::VecDeque, sync::Arc, time::Instant, vec, vec::Vec};

use parking_lot::{Condvar, Mutex};
use spacepackets::{
    cfdp::{
        pdu::{
            finished::{DeliveryCode, FileStatus},
            FileDirectiveType,
        },
        ChecksumType, ConditionCode, CrcFlag, LargeFileFlag, PduType,
    },
    util::UnsignedByteField,
};

use crate::{
    filestore::{FilestoreError, VirtualFilestore},
    pdu::{
        ack::AckPdu,
        eof::EofPdu,
        file_data::FileDataPdu,
        finished::FinishedPdu,
        nak::{NakPdu, SegmentRequest},
        pdu_config, CommonPduConfig, Pdu, PduConfigExt, PduError, PduPayload, CRC_LEN,
    },
    request::{PutRequest, PutRequestError},
    user::{CfdpUser, SharedUser, TransactionFinishedParams},
    CountdownProvider, FailureReason, GenericSendError, LocalEntityConfig, PduSender, RemoteEntityConfig,
    TimerContext, TimerCreatorProvider, TransactionId,
};

/// Wait time of an idle driver thread between two timer checks.
pub const TIMER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// This enumeration models the different states of the source side of a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SourceState {
    Start,
    MetadataSent,
    SendingData,
    /// All file data was sent, the EOF PDU is next.
    SendingFinished,
    EofSent,
    FinishedReceived,
    Completed,
    Failed(FailureReason),
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceState::Completed | SourceState::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unexpected {pdu_type:?} PDU with directive {directive_type:?} in state {state:?}")]
    UnexpectedPdu {
        state: SourceState,
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("PDU with directive {0:?} is not addressed to the file sender")]
    WrongPacketTarget(Option<FileDirectiveType>),
    #[error("invalid put request: {0}")]
    PutRequest(#[from] PutRequestError),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("invalid NAK PDU received")]
    InvalidNakPdu,
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("issue sending PDU: {0}")]
    Send(#[from] GenericSendError),
}

/// Sender side of a single transaction.
#[derive(Debug)]
pub struct SourceTransaction<S: PduSender, V: VirtualFilestore, T: TimerCreatorProvider> {
    id: TransactionId,
    conf: CommonPduConfig,
    local_cfg: LocalEntityConfig,
    remote_cfg: RemoteEntityConfig,
    sender: Arc<S>,
    vfs: Arc<V>,
    timer_creator: T,
    request: PutRequest,
    state: SourceState,
    file_size: u64,
    checksum_type: ChecksumType,
    segment_len: u64,
    /// Offset of the next file segment of the initial transmission.
    progress: u64,
    checksum: Option<u32>,
    eof_acked: bool,
    ack_timer: Option<T::Countdown>,
    ack_counter: u32,
    retransmissions: VecDeque<SegmentRequest>,
    finished: Option<FinishedPdu>,
    file_buf: Vec<u8>,
}

impl<S: PduSender, V: VirtualFilestore, T: TimerCreatorProvider> SourceTransaction<S, V, T> {
    /// Creates a new transaction for a put request. The widths of the local ID and the
    /// sequence number are used for the PDU headers of the transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: UnsignedByteField,
        seq_num: UnsignedByteField,
        request: PutRequest,
        local_cfg: LocalEntityConfig,
        remote_cfg: RemoteEntityConfig,
        sender: Arc<S>,
        vfs: Arc<V>,
        timer_creator: T,
    ) -> Result<Self, SourceError> {
        request.validate()?;
        let (file_size, checksum_type) = match request.source_file() {
            Some(source_file) => {
                if !vfs.exists(source_file)? {
                    return Err(FilestoreError::FileDoesNotExist.into());
                }
                (vfs.file_size(source_file)?, remote_cfg.default_crc_type)
            }
            None => (0, ChecksumType::NullChecksum),
        };
        let mut conf = pdu_config(local_id, remote_cfg.entity_id, seq_num)?;
        if remote_cfg.crc_on_transmission_by_default {
            conf.crc_flag = CrcFlag::WithCrc;
        }
        if file_size > u32::MAX as u64 {
            conf.file_flag = LargeFileFlag::Large;
        }
        let segment_len = calculate_max_file_seg_len(&conf, &remote_cfg);
        Ok(Self {
            id: conf.transaction_id(),
            conf,
            local_cfg,
            remote_cfg,
            sender,
            vfs,
            timer_creator,
            request,
            state: SourceState::Start,
            file_size,
            checksum_type,
            segment_len,
            progress: 0,
            checksum: None,
            eof_acked: false,
            ack_timer: None,
            ack_counter: 0,
            retransmissions: VecDeque::new(),
            finished: None,
            file_buf: vec![0; segment_len as usize],
        })
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Maximum length of the file segment of a single File Data PDU.
    pub fn segment_len(&self) -> u64 {
        self.segment_len
    }

    pub fn remote_cfg(&self) -> &RemoteEntityConfig {
        &self.remote_cfg
    }

    pub fn pdu_conf(&self) -> &CommonPduConfig {
        &self.conf
    }

    pub fn eof_acked(&self) -> bool {
        self.eof_acked
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the next [Self::state_machine] call will generate a PDU without waiting for a
    /// reply or a timer.
    pub fn has_pending_output(&self) -> bool {
        match self.state {
            SourceState::Start
            | SourceState::MetadataSent
            | SourceState::SendingData
            | SourceState::SendingFinished
            | SourceState::FinishedReceived => true,
            SourceState::EofSent => !self.retransmissions.is_empty(),
            SourceState::Completed | SourceState::Failed(_) => false,
        }
    }

    /// Advances the transaction. Returns the number of sent PDUs, which is either 0 or 1.
    pub fn state_machine(&mut self, user: &mut impl CfdpUser) -> Result<u32, SourceError> {
        match self.state {
            SourceState::Start => {
                user.transaction_indication(&self.id);
                self.prepare_and_send_metadata_pdu()?;
                self.state = SourceState::MetadataSent;
                Ok(1)
            }
            SourceState::MetadataSent | SourceState::SendingData => {
                if self.progress < self.file_size {
                    let offset = self.progress;
                    let len = self.segment_len.min(self.file_size - offset);
                    self.prepare_and_send_file_data_pdu(offset, len)?;
                    self.progress += len;
                    self.state = if self.progress >= self.file_size {
                        SourceState::SendingFinished
                    } else {
                        SourceState::SendingData
                    };
                    return Ok(1);
                }
                // Empty file or no file at all.
                self.state = SourceState::SendingFinished;
                self.state_machine(user)
            }
            SourceState::SendingFinished => {
                self.eof_fsm(user)?;
                Ok(1)
            }
            SourceState::EofSent => {
                if let Some(request) = self.retransmissions.pop_front() {
                    if request.is_metadata_request() {
                        self.prepare_and_send_metadata_pdu()?;
                    } else {
                        self.prepare_and_send_file_data_pdu(request.start, request.len())?;
                    }
                    return Ok(1);
                }
                self.handle_positive_ack_procedures(user)
            }
            SourceState::FinishedReceived => {
                let Some(finished) = self.finished.take() else {
                    return Ok(0);
                };
                self.prepare_and_send_ack_pdu(finished.condition_code)?;
                self.state = if finished.condition_code == ConditionCode::NoError {
                    SourceState::Completed
                } else {
                    log::warn!(
                        "transaction {}: remote entity reported condition code {:?}",
                        self.id,
                        finished.condition_code
                    );
                    SourceState::Failed(FailureReason::FinishedFault(finished.condition_code))
                };
                self.notice_of_completion(
                    user,
                    finished.condition_code,
                    finished.delivery_code,
                    finished.file_status,
                );
                self.finished = Some(finished);
                Ok(1)
            }
            SourceState::Completed | SourceState::Failed(_) => Ok(0),
        }
    }

    /// Passes a PDU addressed to the file sender to the transaction. PDUs which trigger
    /// responses only change the state, the responses are generated by the next
    /// [Self::state_machine] calls.
    pub fn insert_packet(&mut self, pdu: Pdu) -> Result<(), SourceError> {
        let pdu_type = pdu.pdu_type();
        let directive_type = pdu.directive_type();
        let unexpected = |state| SourceError::UnexpectedPdu {
            state,
            pdu_type,
            directive_type,
        };
        match pdu.into_payload() {
            PduPayload::Ack(ack) if ack.acked_directive() == FileDirectiveType::EofPdu => {
                match self.state {
                    SourceState::EofSent => {
                        log::debug!("transaction {}: EOF acknowledged", self.id);
                        self.eof_acked = true;
                        self.ack_timer = None;
                        Ok(())
                    }
                    // Late duplicate.
                    SourceState::FinishedReceived
                    | SourceState::Completed
                    | SourceState::Failed(_) => Ok(()),
                    state => Err(unexpected(state)),
                }
            }
            PduPayload::Nak(nak) => {
                if self.state == SourceState::Start || self.state.is_terminal() {
                    return Err(unexpected(self.state));
                }
                self.handle_nak_pdu(&nak)
            }
            PduPayload::Finished(finished) => match self.state {
                SourceState::Start => Err(unexpected(self.state)),
                SourceState::Completed | SourceState::Failed(FailureReason::FinishedFault(_)) => {
                    // Our ACK was lost.
                    self.prepare_and_send_ack_pdu(finished.condition_code)
                }
                SourceState::Failed(_) => Err(unexpected(self.state)),
                _ => {
                    log::debug!(
                        "transaction {}: Finished PDU with condition code {:?} received",
                        self.id,
                        finished.condition_code
                    );
                    self.ack_timer = None;
                    self.retransmissions.clear();
                    self.finished = Some(finished);
                    self.state = SourceState::FinishedReceived;
                    Ok(())
                }
            },
            PduPayload::KeepAlive(keep_alive) => {
                log::debug!(
                    "transaction {}: remote entity received {} bytes",
                    self.id,
                    keep_alive.progress
                );
                Ok(())
            }
            _ => Err(SourceError::WrongPacketTarget(directive_type)),
        }
    }

    /// Cancels the transaction. No PDU is sent to the remote entity.
    pub fn cancel(&mut self, user: &mut impl CfdpUser) {
        if self.state.is_terminal() {
            return;
        }
        log::info!("transaction {}: cancelled", self.id);
        self.state = SourceState::Failed(FailureReason::Cancelled);
        self.ack_timer = None;
        self.notice_of_completion(
            user,
            ConditionCode::CancelRequestReceived,
            DeliveryCode::Incomplete,
            FileStatus::Unreported,
        );
    }

    /// Moves the transaction into the failed state because of a local fault.
    pub fn abandon(&mut self, reason: FailureReason, user: &mut impl CfdpUser) {
        if self.state.is_terminal() {
            return;
        }
        self.declare_fault(reason, user);
    }

    fn handle_nak_pdu(&mut self, nak: &NakPdu) -> Result<(), SourceError> {
        for request in &nak.segment_requests {
            if request.is_metadata_request() {
                self.retransmissions.push_back(*request);
                continue;
            }
            if request.end < request.start || request.end > self.file_size {
                return Err(SourceError::InvalidNakPdu);
            }
            let mut offset = request.start;
            while offset < request.end {
                let end = (offset + self.segment_len).min(request.end);
                self.retransmissions
                    .push_back(SegmentRequest::new(offset, end));
                offset = end;
            }
        }
        log::info!(
            "transaction {}: {} segment(s) scheduled for retransmission",
            self.id,
            self.retransmissions.len()
        );
        Ok(())
    }

    fn eof_fsm(&mut self, user: &mut impl CfdpUser) -> Result<(), SourceError> {
        let checksum = match self.request.source_file() {
            Some(source_file) => {
                let mut buf = vec![0; 4096];
                self.vfs.calculate_checksum(
                    source_file,
                    self.checksum_type,
                    self.file_size,
                    &mut buf,
                )?
            }
            None => 0,
        };
        self.checksum = Some(checksum);
        self.prepare_and_send_eof_pdu(checksum)?;
        if self.local_cfg.indication_cfg.eof_sent {
            user.eof_sent_indication(&self.id);
        }
        self.state = SourceState::EofSent;
        self.start_positive_ack_procedure();
        Ok(())
    }

    fn start_positive_ack_procedure(&mut self) {
        self.ack_counter = 0;
        self.ack_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::PositiveAck {
                    expiry_time: self.remote_cfg.positive_ack_timer_interval,
                }),
        );
    }

    fn handle_positive_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
    ) -> Result<u32, SourceError> {
        let Some(ack_timer) = self.ack_timer.as_mut() else {
            return Ok(0);
        };
        if !ack_timer.has_expired() {
            return Ok(0);
        }
        self.ack_counter += 1;
        if self.ack_counter >= self.remote_cfg.positive_ack_timer_expiration_limit {
            self.declare_fault(FailureReason::PositiveAckLimitReached, user);
            return Ok(0);
        }
        ack_timer.reset();
        log::debug!(
            "transaction {}: EOF not acknowledged, sending it again",
            self.id
        );
        self.prepare_and_send_eof_pdu(self.checksum.unwrap_or_default())?;
        Ok(1)
    }

    fn declare_fault(&mut self, reason: FailureReason, user: &mut impl CfdpUser) {
        let condition_code = reason.condition_code();
        log::warn!("transaction {}: failed with {reason:?}", self.id);
        self.state = SourceState::Failed(reason);
        self.ack_timer = None;
        self.retransmissions.clear();
        user.fault_indication(&self.id, condition_code, self.progress);
        self.notice_of_completion(
            user,
            condition_code,
            DeliveryCode::Incomplete,
            FileStatus::Unreported,
        );
    }

    fn notice_of_completion(
        &self,
        user: &mut impl CfdpUser,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) {
        if self.local_cfg.indication_cfg.transaction_finished {
            user.transaction_finished_indication(&TransactionFinishedParams {
                id: self.id,
                condition_code,
                delivery_code,
                file_status,
            });
        }
    }

    fn prepare_and_send_metadata_pdu(&mut self) -> Result<(), SourceError> {
        let metadata = self
            .request
            .build_metadata(self.file_size, self.checksum_type);
        self.pdu_send_helper(metadata)
    }

    fn prepare_and_send_file_data_pdu(&mut self, offset: u64, len: u64) -> Result<(), SourceError> {
        let Some(source_file) = self.request.source_file() else {
            return Ok(());
        };
        // The length is bounded by the segment length, which is also the buffer length.
        let len_usize = len as usize;
        self.vfs
            .read_data(source_file, offset, len, &mut self.file_buf[..len_usize])?;
        let file_data = FileDataPdu::new(offset, self.file_buf[..len_usize].to_vec());
        self.pdu_send_helper(file_data)
    }

    fn prepare_and_send_eof_pdu(&self, checksum: u32) -> Result<(), SourceError> {
        self.pdu_send_helper(EofPdu::new_no_error(checksum, self.file_size))
    }

    fn prepare_and_send_ack_pdu(&self, condition_code: ConditionCode) -> Result<(), SourceError> {
        self.pdu_send_helper(AckPdu::new_for_finished(condition_code))
    }

    fn pdu_send_helper(&self, payload: impl Into<PduPayload>) -> Result<(), SourceError> {
        let pdu = Pdu::new(self.conf, payload);
        let raw = pdu.to_vec()?;
        self.sender
            .send_pdu(pdu.pdu_type(), pdu.directive_type(), &raw)?;
        Ok(())
    }
}

/// The file segment length is limited by the maximum packet length of the remote entity and
/// optionally by the configured maximum file segment length.
fn calculate_max_file_seg_len(conf: &CommonPduConfig, remote_cfg: &RemoteEntityConfig) -> u64 {
    let crc_len = if conf.crc_flag == CrcFlag::WithCrc {
        CRC_LEN
    } else {
        0
    };
    let mut seg_len = remote_cfg
        .max_packet_len
        .saturating_sub(conf.header_len() + conf.fss_len() + crc_len);
    if let Some(max_file_segment_len) = remote_cfg.max_file_segment_len {
        seg_len = seg_len.min(max_file_segment_len);
    }
    seg_len.max(1) as u64
}

/// Externally visible state of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferState {
    Running,
    Paused,
    Completed,
    Failed(FailureReason),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed(_))
    }
}

#[derive(Debug)]
struct ControlShared {
    paused: bool,
    cancel_requested: bool,
    inbox: VecDeque<Pdu>,
    source_state: SourceState,
}

/// Control block shared between the driver thread of a transfer and the engine.
#[derive(Debug)]
pub struct TransferControl {
    shared: Mutex<ControlShared>,
    cond: Condvar,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self {
            shared: Mutex::new(ControlShared {
                paused: false,
                cancel_requested: false,
                inbox: VecDeque::new(),
                source_state: SourceState::Start,
            }),
            cond: Condvar::new(),
        }
    }
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns [false] if the transfer is already terminated.
    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    /// Returns [false] if the transfer is already terminated.
    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    /// The transfer is cancelled before the next PDU is generated.
    pub fn cancel(&self) {
        self.shared.lock().cancel_requested = true;
        self.cond.notify_all();
    }

    pub fn state(&self) -> TransferState {
        let shared = self.shared.lock();
        match shared.source_state {
            SourceState::Completed => TransferState::Completed,
            SourceState::Failed(reason) => TransferState::Failed(reason),
            _ if shared.paused => TransferState::Paused,
            _ => TransferState::Running,
        }
    }

    pub fn source_state(&self) -> SourceState {
        self.shared.lock().source_state
    }

    /// Passes a received PDU to the driver thread.
    pub fn deliver(&self, pdu: Pdu) {
        self.shared.lock().inbox.push_back(pdu);
        self.cond.notify_all();
    }

    /// Blocks until the transfer is terminated or the timeout elapsed. Returns the last state.
    pub fn wait_until_terminal(&self, timeout: Duration) -> TransferState {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        while !shared.source_state.is_terminal() {
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                break;
            }
        }
        drop(shared);
        self.state()
    }

    fn set_paused(&self, paused: bool) -> bool {
        let mut shared = self.shared.lock();
        if shared.source_state.is_terminal() {
            return false;
        }
        shared.paused = paused;
        drop(shared);
        self.cond.notify_all();
        true
    }

    fn update(&self, source_state: SourceState) {
        self.shared.lock().source_state = source_state;
        self.cond.notify_all();
    }

    /// Waits until the timeout elapsed or the transfer was paused or cancelled. Unless the
    /// driver is pacing file data, a received PDU also ends the wait.
    fn wait_for_event(&self, timeout: Duration, pacing: bool) {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        loop {
            if shared.cancel_requested
                || shared.paused
                || (!pacing && !shared.inbox.is_empty())
            {
                return;
            }
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                return;
            }
        }
    }
}

enum ControlEvent {
    Cancel,
    Suspend,
    Proceed(Vec<Pdu>),
}

/// Drives a transaction until it terminates. This function is usually run on a dedicated
/// thread per transfer.
///
/// The pause and cancel signals of the [TransferControl] are checked before each generated PDU.
/// File data PDUs are paced with the file data pacing of the remote entity configuration.
pub fn run_transfer<S, V, U, T>(
    mut transaction: SourceTransaction<S, V, T>,
    control: Arc<TransferControl>,
    user: SharedUser<U>,
) where
    S: PduSender,
    V: VirtualFilestore,
    U: CfdpUser,
    T: TimerCreatorProvider,
{
    let id = transaction.transaction_id();
    let indication_cfg = transaction.local_cfg.indication_cfg;
    let pacing = transaction.remote_cfg().file_data_pacing;
    let mut suspended = false;
    log::info!(
        "transaction {id}: starting transfer of {} bytes",
        transaction.file_size()
    );
    loop {
        let event = {
            let mut shared = control.shared.lock();
            if shared.cancel_requested {
                ControlEvent::Cancel
            } else if shared.paused {
                if suspended {
                    control.cond.wait(&mut shared);
                    continue;
                }
                ControlEvent::Suspend
            } else {
                ControlEvent::Proceed(shared.inbox.drain(..).collect())
            }
        };
        let inbox = match event {
            ControlEvent::Cancel => {
                transaction.cancel(&mut *user.lock());
                control.update(transaction.state());
                break;
            }
            ControlEvent::Suspend => {
                suspended = true;
                log::info!("transaction {id}: suspended");
                if indication_cfg.suspended {
                    user.lock()
                        .suspended_indication(&id, ConditionCode::SuspendRequestReceived);
                }
                continue;
            }
            ControlEvent::Proceed(inbox) => inbox,
        };
        if suspended {
            suspended = false;
            log::info!("transaction {id}: resumed");
            if indication_cfg.resumed {
                user.lock().resumed_indication(&id, transaction.progress);
            }
        }
        for pdu in inbox {
            if let Err(e) = transaction.insert_packet(pdu) {
                log::warn!("transaction {id}: {e}");
            }
        }
        let result = transaction.state_machine(&mut *user.lock());
        if let Err(e) = result {
            log::error!("transaction {id}: {e}");
            let reason = match e {
                SourceError::Filestore(_) => FailureReason::FilestoreRejection,
                _ => FailureReason::Abandoned,
            };
            transaction.abandon(reason, &mut *user.lock());
        }
        control.update(transaction.state());
        if transaction.is_terminal() {
            break;
        }
        if transaction.has_pending_output() {
            control.wait_for_event(pacing, true);
        } else {
            control.wait_for_event(TIMER_POLL_INTERVAL, false);
        }
    }
    log::info!(
        "transaction {id}: transfer terminated with state {:?}",
        transaction.state()
    );
}

#[cfg(test)]
mod tests {
    use std::{fs, string::String, thread};

    use spacepackets::{
        cfdp::{Direction, TransactionStatus, TransmissionMode},
        util::UnsignedByteFieldU16,
    };
    use tempfile::TempDir;

    use crate::{
        filestore::NativeFilestore,
        pdu::{keep_alive::KeepAlivePdu, msg_to_user::ProxyPutRequest},
        tests::{
            basic_remote_cfg, TestCfdpSender, TestCfdpUser, TestTimerCreator, LOCAL_ID, REMOTE_ID,
        },
        IndicationConfig, CRC_32,
    };

    use super::*;

    type TestTransaction = SourceTransaction<TestCfdpSender, NativeFilestore, TestTimerCreator>;

    struct SourceTestbench {
        transaction: TestTransaction,
        sender: Arc<TestCfdpSender>,
        user: TestCfdpUser,
        timer_creator: TestTimerCreator,
        // Keeps the source file alive.
        _dir: TempDir,
        source_path: String,
        data: Vec<u8>,
    }

    impl SourceTestbench {
        fn new(data: &[u8], max_file_segment_len: Option<usize>) -> Self {
            let mut remote_cfg = basic_remote_cfg(REMOTE_ID);
            remote_cfg.max_file_segment_len = max_file_segment_len;
            Self::new_with_remote_cfg(data, remote_cfg)
        }

        fn new_with_remote_cfg(data: &[u8], remote_cfg: RemoteEntityConfig) -> Self {
            let dir = tempfile::tempdir().expect("creating temporary directory failed");
            let source_path = dir.path().join("source.bin");
            fs::write(&source_path, data).unwrap();
            let source_path = String::from(source_path.to_str().unwrap());
            let request = PutRequest::new_regular_request(
                REMOTE_ID,
                &source_path,
                "dest.bin",
                Some(TransmissionMode::Acknowledged),
                None,
            )
            .unwrap();
            let sender = Arc::new(TestCfdpSender::default());
            let timer_creator = TestTimerCreator::default();
            let transaction = SourceTransaction::new(
                LOCAL_ID.into(),
                UnsignedByteFieldU16::new(7).into(),
                request,
                LocalEntityConfig::new(LOCAL_ID.into(), IndicationConfig::default()),
                remote_cfg,
                sender.clone(),
                Arc::new(NativeFilestore),
                timer_creator.clone(),
            )
            .unwrap();
            Self {
                transaction,
                sender,
                user: TestCfdpUser::default(),
                timer_creator,
                _dir: dir,
                source_path,
                data: data.to_vec(),
            }
        }

        fn step(&mut self) -> u32 {
            self.transaction.state_machine(&mut self.user).unwrap()
        }

        fn reply_conf(&self) -> CommonPduConfig {
            self.transaction.pdu_conf().for_reply()
        }

        fn insert(&mut self, payload: impl Into<PduPayload>) -> Result<(), SourceError> {
            let pdu = Pdu::new(self.reply_conf(), payload);
            self.transaction.insert_packet(pdu)
        }

        fn next_payload(&self) -> PduPayload {
            let pdu = self.sender.retrieve_next_pdu().expect("no PDU was sent").decode();
            assert_eq!(pdu.conf().direction, Direction::TowardsReceiver);
            assert_eq!(pdu.transaction_id(), self.transaction.transaction_id());
            pdu.into_payload()
        }

        fn check_metadata(&self) {
            match self.next_payload() {
                PduPayload::Metadata(metadata) => {
                    assert_eq!(metadata.file_size, self.data.len() as u64);
                    assert_eq!(metadata.source_file_name, self.source_path);
                    assert_eq!(metadata.dest_file_name, "dest.bin");
                    assert_eq!(metadata.checksum_type, ChecksumType::Crc32);
                    assert_eq!(metadata.filestore_requests.len(), 1);
                    assert_eq!(metadata.filestore_requests[0].first_name, "dest.bin");
                }
                other => panic!("expected Metadata PDU, got {other:?}"),
            }
        }

        fn check_file_data(&self, start: usize, end: usize) {
            match self.next_payload() {
                PduPayload::FileData(file_data) => {
                    assert_eq!(file_data.offset, start as u64);
                    assert_eq!(file_data.data, self.data[start..end]);
                }
                other => panic!("expected File Data PDU, got {other:?}"),
            }
        }

        fn check_eof(&self) {
            match self.next_payload() {
                PduPayload::Eof(eof) => {
                    assert_eq!(eof.condition_code, ConditionCode::NoError);
                    assert_eq!(eof.file_size, self.data.len() as u64);
                    assert_eq!(eof.file_checksum, CRC_32.checksum(&self.data));
                }
                other => panic!("expected EOF PDU, got {other:?}"),
            }
        }

        fn check_finished_ack(&self, condition_code: ConditionCode) {
            match self.next_payload() {
                PduPayload::Ack(ack) => {
                    assert_eq!(ack.acked_directive(), FileDirectiveType::FinishedPdu);
                    assert_eq!(ack.condition_code, condition_code);
                    assert_eq!(ack.transaction_status, TransactionStatus::Terminated);
                }
                other => panic!("expected Finished ACK, got {other:?}"),
            }
        }

        /// Sends everything up to and including the EOF PDU with chunks of 10 bytes.
        fn send_until_eof(&mut self) {
            assert_eq!(self.step(), 1);
            self.check_metadata();
            let mut offset = 0;
            while offset < self.data.len() {
                let end = (offset + 10).min(self.data.len());
                assert_eq!(self.step(), 1);
                self.check_file_data(offset, end);
                offset = end;
            }
            assert_eq!(self.step(), 1);
            self.check_eof();
            assert_eq!(self.transaction.state(), SourceState::EofSent);
        }

        fn finish(&mut self, condition_code: ConditionCode) {
            self.insert(FinishedPdu::new(
                condition_code,
                DeliveryCode::Complete,
                FileStatus::Retained,
            ))
            .unwrap();
            assert_eq!(self.transaction.state(), SourceState::FinishedReceived);
            assert_eq!(self.step(), 1);
            self.check_finished_ack(condition_code);
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_segment_len_derivation() {
        let tb = SourceTestbench::new(&test_data(10), None);
        // 1024 byte packet, 4 byte fixed header, 2 * 2 byte IDs, 2 byte sequence number, 4 byte
        // offset.
        assert_eq!(tb.transaction.segment_len(), 1024 - 10 - 4);
        let mut remote_cfg = basic_remote_cfg(REMOTE_ID);
        remote_cfg.crc_on_transmission_by_default = true;
        let tb = SourceTestbench::new_with_remote_cfg(&test_data(10), remote_cfg);
        assert_eq!(tb.transaction.segment_len(), 1024 - 10 - 4 - 2);
        assert_eq!(tb.transaction.pdu_conf().crc_flag, CrcFlag::WithCrc);
        let tb = SourceTestbench::new(&test_data(10), Some(3));
        assert_eq!(tb.transaction.segment_len(), 3);
    }

    #[test]
    fn test_file_transfer_chunking() {
        let mut tb = SourceTestbench::new(&test_data(25), Some(10));
        tb.send_until_eof();
        assert_eq!(tb.user.transaction_indication_call_count, 1);
        assert_eq!(tb.user.eof_sent_call_count, 1);
        tb.insert(AckPdu::new_for_eof(ConditionCode::NoError)).unwrap();
        assert!(tb.transaction.eof_acked());
        assert_eq!(tb.step(), 0);
        tb.finish(ConditionCode::NoError);
        assert_eq!(tb.transaction.state(), SourceState::Completed);
        assert_eq!(tb.user.finished_indic_queue.len(), 1);
        assert_eq!(
            tb.user.finished_indic_queue[0].condition_code,
            ConditionCode::NoError
        );
        assert_eq!(tb.step(), 0);
        assert!(tb.sender.queue_empty());
    }

    #[test]
    fn test_empty_file() {
        let mut tb = SourceTestbench::new(&[], Some(10));
        tb.send_until_eof();
        tb.finish(ConditionCode::NoError);
        assert_eq!(tb.transaction.state(), SourceState::Completed);
    }

    #[test]
    fn test_msgs_to_user_only() {
        let request = PutRequest::new_proxy_put_request(
            REMOTE_ID,
            ProxyPutRequest::new(LOCAL_ID, "a.txt", "b.txt"),
        )
        .unwrap();
        let sender = Arc::new(TestCfdpSender::default());
        let mut transaction = SourceTransaction::new(
            LOCAL_ID.into(),
            UnsignedByteFieldU16::new(1).into(),
            request,
            LocalEntityConfig::new(LOCAL_ID.into(), IndicationConfig::default()),
            basic_remote_cfg(REMOTE_ID),
            sender.clone(),
            Arc::new(NativeFilestore),
            TestTimerCreator::default(),
        )
        .unwrap();
        let mut user = TestCfdpUser::default();
        assert_eq!(transaction.state_machine(&mut user).unwrap(), 1);
        match sender.retrieve_next_pdu().unwrap().decode().into_payload() {
            PduPayload::Metadata(metadata) => {
                assert_eq!(metadata.file_size, 0);
                assert!(!metadata.has_file());
                assert!(metadata.filestore_requests.is_empty());
                assert_eq!(metadata.msgs_to_user.len(), 1);
            }
            other => panic!("expected Metadata PDU, got {other:?}"),
        }
        assert_eq!(transaction.state_machine(&mut user).unwrap(), 1);
        match sender.retrieve_next_pdu().unwrap().decode().into_payload() {
            PduPayload::Eof(eof) => {
                assert_eq!(eof.file_size, 0);
                assert_eq!(eof.file_checksum, 0);
            }
            other => panic!("expected EOF PDU, got {other:?}"),
        }
        assert!(sender.queue_empty());
    }

    #[test]
    fn test_source_file_missing() {
        let request =
            PutRequest::new_regular_request(REMOTE_ID, "/does/not/exist", "b.txt", None, None)
                .unwrap();
        let result = SourceTransaction::new(
            LOCAL_ID.into(),
            UnsignedByteFieldU16::new(1).into(),
            request,
            LocalEntityConfig::new(LOCAL_ID.into(), IndicationConfig::default()),
            basic_remote_cfg(REMOTE_ID),
            Arc::new(TestCfdpSender::default()),
            Arc::new(NativeFilestore),
            TestTimerCreator::default(),
        );
        assert!(matches!(
            result,
            Err(SourceError::Filestore(FilestoreError::FileDoesNotExist))
        ));
    }

    #[test]
    fn test_nak_retransmission_split_into_segments() {
        let mut tb = SourceTestbench::new(&test_data(50), Some(10));
        tb.send_until_eof();
        tb.insert(NakPdu::new_from_missing(std::vec![
            SegmentRequest::new(5, 28),
            SegmentRequest::new(0, 0),
        ]))
        .unwrap();
        assert_eq!(tb.step(), 1);
        tb.check_file_data(5, 15);
        assert_eq!(tb.step(), 1);
        tb.check_file_data(15, 25);
        assert_eq!(tb.step(), 1);
        tb.check_file_data(25, 28);
        assert_eq!(tb.step(), 1);
        tb.check_metadata();
        assert_eq!(tb.step(), 0);
        assert_eq!(tb.transaction.state(), SourceState::EofSent);
    }

    #[test]
    fn test_invalid_nak() {
        let mut tb = SourceTestbench::new(&test_data(20), Some(10));
        tb.send_until_eof();
        let result = tb.insert(NakPdu::new_from_missing(std::vec![SegmentRequest::new(10, 30)]));
        assert!(matches!(result, Err(SourceError::InvalidNakPdu)));
        let result = tb.insert(NakPdu::new(0, 20, std::vec![SegmentRequest::new(15, 10)]));
        assert!(matches!(result, Err(SourceError::InvalidNakPdu)));
    }

    #[test]
    fn test_positive_ack_procedure() {
        let mut tb = SourceTestbench::new(&test_data(5), Some(10));
        tb.send_until_eof();
        assert_eq!(tb.step(), 0);
        tb.timer_creator.expire_all();
        assert_eq!(tb.step(), 1);
        tb.check_eof();
        assert_eq!(tb.step(), 0);
        tb.insert(AckPdu::new_for_eof(ConditionCode::NoError)).unwrap();
        tb.timer_creator.expire_all();
        assert_eq!(tb.step(), 0);
        assert!(tb.sender.queue_empty());
    }

    #[test]
    fn test_positive_ack_limit_reached() {
        let mut tb = SourceTestbench::new(&test_data(5), Some(10));
        tb.send_until_eof();
        tb.timer_creator.expire_all();
        assert_eq!(tb.step(), 1);
        tb.check_eof();
        tb.timer_creator.expire_all();
        assert_eq!(tb.step(), 0);
        assert_eq!(
            tb.transaction.state(),
            SourceState::Failed(FailureReason::PositiveAckLimitReached)
        );
        assert_eq!(
            tb.user.fault_queue[0],
            (
                tb.transaction.transaction_id(),
                ConditionCode::PositiveAckLimitReached,
                5
            )
        );
        assert_eq!(
            tb.user.finished_indic_queue[0].condition_code,
            ConditionCode::PositiveAckLimitReached
        );
        assert!(tb.sender.queue_empty());
    }

    #[test]
    fn test_finished_with_error() {
        let mut tb = SourceTestbench::new(&test_data(5), Some(10));
        tb.send_until_eof();
        tb.finish(ConditionCode::FilestoreRejection);
        assert_eq!(
            tb.transaction.state(),
            SourceState::Failed(FailureReason::FinishedFault(
                ConditionCode::FilestoreRejection
            ))
        );
        assert_eq!(
            tb.user.finished_indic_queue[0].condition_code,
            ConditionCode::FilestoreRejection
        );
    }

    #[test]
    fn test_duplicate_finished_acked_again() {
        let mut tb = SourceTestbench::new(&test_data(5), Some(10));
        tb.send_until_eof();
        tb.finish(ConditionCode::NoError);
        tb.insert(FinishedPdu::new_no_error(FileStatus::Retained))
            .unwrap();
        tb.check_finished_ack(ConditionCode::NoError);
        assert_eq!(tb.user.finished_indic_queue.len(), 1);
    }

    #[test]
    fn test_unexpected_pdus() {
        let mut tb = SourceTestbench::new(&test_data(5), Some(10));
        let result = tb.insert(AckPdu::new_for_eof(ConditionCode::NoError));
        assert!(matches!(
            result,
            Err(SourceError::UnexpectedPdu {
                state: SourceState::Start,
                ..
            })
        ));
        let result = tb.insert(EofPdu::new_no_error(0, 0));
        assert!(matches!(
            result,
            Err(SourceError::WrongPacketTarget(Some(FileDirectiveType::EofPdu)))
        ));
        tb.insert(KeepAlivePdu::new(3)).unwrap();
    }

    #[test]
    fn test_cancel() {
        let mut tb = SourceTestbench::new(&test_data(25), Some(10));
        tb.step();
        tb.transaction.cancel(&mut tb.user);
        assert_eq!(
            tb.transaction.state(),
            SourceState::Failed(FailureReason::Cancelled)
        );
        assert_eq!(tb.step(), 0);
        assert_eq!(
            tb.user.finished_indic_queue[0].condition_code,
            ConditionCode::CancelRequestReceived
        );
        // Cancelling twice has no effect.
        tb.transaction.cancel(&mut tb.user);
        assert_eq!(tb.user.finished_indic_queue.len(), 1);
    }

    #[test]
    fn test_transfer_control_states() {
        let control = TransferControl::new();
        assert_eq!(control.state(), TransferState::Running);
        assert!(control.pause());
        assert_eq!(control.state(), TransferState::Paused);
        assert!(control.resume());
        assert_eq!(control.state(), TransferState::Running);
        control.update(SourceState::Completed);
        assert_eq!(control.state(), TransferState::Completed);
        assert!(!control.pause());
        assert_eq!(
            control.wait_until_terminal(Duration::from_millis(10)),
            TransferState::Completed
        );
    }

    #[test]
    fn test_driver_thread_pause_resume() {
        let tb = SourceTestbench::new(&test_data(25), Some(10));
        let sender = tb.sender.clone();
        let transaction_id = tb.transaction.transaction_id();
        let reply_conf = tb.reply_conf();
        let control = Arc::new(TransferControl::new());
        let user = Arc::new(Mutex::new(TestCfdpUser::default()));
        control.pause();
        let handle = {
            let control = control.clone();
            let user = user.clone();
            thread::spawn(move || run_transfer(tb.transaction, control, user))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(sender.queue_empty());
        assert_eq!(user.lock().suspended_queue.len(), 1);
        control.resume();
        // Metadata, 3 file data PDUs and the EOF PDU.
        let start = Instant::now();
        while sender.queue_len() < 5 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(user.lock().resumed_queue.len(), 1);
        control.deliver(Pdu::new(
            reply_conf,
            FinishedPdu::new_no_error(FileStatus::Retained),
        ));
        assert_eq!(
            control.wait_until_terminal(Duration::from_secs(5)),
            TransferState::Completed
        );
        handle.join().unwrap();
        assert_eq!(sender.queue_len(), 6);
        let finished_params = user.lock().finished_indic_queue[0];
        assert_eq!(finished_params.id, transaction_id);
    }

    #[test]
    fn test_driver_thread_cancel() {
        let mut remote_cfg = basic_remote_cfg(REMOTE_ID);
        remote_cfg.file_data_pacing = Duration::from_secs(10);
        remote_cfg.max_file_segment_len = Some(1);
        let tb = SourceTestbench::new_with_remote_cfg(&test_data(100), remote_cfg);
        let sender = tb.sender.clone();
        let control = Arc::new(TransferControl::new());
        let user = Arc::new(Mutex::new(TestCfdpUser::default()));
        let handle = {
            let control = control.clone();
            let user = user.clone();
            thread::spawn(move || run_transfer(tb.transaction, control, user))
        };
        thread::sleep(Duration::from_millis(50));
        // The long pacing delay is interrupted by the cancel request.
        control.cancel();
        assert_eq!(
            control.wait_until_terminal(Duration::from_secs(5)),
            TransferState::Failed(FailureReason::Cancelled)
        );
        handle.join().unwrap();
        // Only the Metadata PDU was sent.
        assert_eq!(sender.queue_len(), 1);
    }
}
