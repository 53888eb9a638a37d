//! # CFDP Destination Entity Module
//!
//! The [DestinationHandler] is the receiving side of all transactions. It converts the PDUs
//! received from a remote CFDP entity into a file inside the configured data directory.
//!
//! All transactions are stored inside a [TransactionRegistry] and are processed
//! synchronously when a PDU is inserted with [DestinationHandler::insert_pdu]. The handler
//! performs the following steps for a regular acknowledged file transfer:
//!
//! 1. A Metadata PDU opens the transaction and creates a reassembly buffer for the announced
//!    file size. Proxy Put requests contained inside the messages to the user are queued and
//!    can be retrieved with [DestinationHandler::take_proxy_tasks].
//! 2. File Data PDUs are stored inside the reassembly buffer.
//! 3. The EOF PDU is acknowledged. After the configured settle delay, the file is checked for
//!    completeness. Missing segments are requested with a NAK PDU and the handler waits for
//!    the retransmission of all missing segments.
//! 4. The complete file is written to the data directory and its checksum is verified.
//! 5. A Finished PDU is sent and the positive ACK procedure is started for it. The
//!    transaction is removed once the ACK for the Finished PDU arrives.
//!
//! The NAK and positive ACK timers are checked with [DestinationHandler::handle_timers], which
//! should be called periodically.
use std::{
    boxed::Box,
    collections::VecDeque,
    path::{Path, PathBuf},
    string::String,
    vec,
    vec::Vec,
};

use parking_lot::Mutex;
use spacepackets::{
    cfdp::{
        pdu::{
            finished::{DeliveryCode, FileStatus},
            FileDirectiveType,
        },
        ConditionCode, LargeFileFlag, PduType, TransmissionMode,
    },
    util::{UnsignedByteField, UnsignedEnum},
};

use crate::{
    determine_packet_target,
    fault::{FaultInjector, NoFaults},
    filestore::{path_to_str, FilestoreError, VirtualFilestore},
    pdu::{
        ack::AckPdu,
        eof::EofPdu,
        file_data::FileDataPdu,
        finished::FinishedPdu,
        metadata::MetadataPdu,
        msg_to_user::{MessageToUser, ProxyPutRequest, ReservedMessage},
        nak::NakPdu,
        pdu_config, CommonPduConfig, Pdu, PduConfigExt, PduError, PduPayload,
    },
    registry::{RegistryError, TransactionRegistry},
    segments::{DataFile, SegmentError},
    user::{
        CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, SharedUser,
        TransactionFinishedParams,
    },
    CountdownProvider, FailureReason, GenericSendError, LocalEntityConfig, PacketTarget, PduSender,
    RemoteEntityConfig, RemoteEntityConfigProvider, StdRemoteEntityConfigProvider, TimerContext,
    TimerCreatorProvider, TransactionId,
};

const CHECKSUM_BUF_LEN: usize = 4096;

/// Receiver side transaction states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DestState {
    AwaitingMetadata,
    ReceivingData,
    /// The EOF PDU was received and acknowledged. The completeness check follows after the
    /// settle delay.
    CheckingCompleteness,
    SaveAndFinish,
    /// A NAK PDU was sent and the handler waits for the missing segments.
    AwaitingRetransmission,
    /// The Finished PDU was sent. Terminal.
    Finished,
    Failed(FailureReason),
}

impl DestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DestState::Finished | DestState::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DestError {
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("metadata for transaction {0} was already received")]
    MetadataAlreadyReceived(TransactionId),
    #[error("unexpected {pdu_type:?} PDU with directive {directive:?} in state {state:?}")]
    UnexpectedPdu {
        state: DestState,
        pdu_type: PduType,
        directive: Option<FileDirectiveType>,
    },
    #[error("PDU with directive {0:?} is not addressed to the file receiver")]
    WrongPacketTarget(Option<FileDirectiveType>),
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("reassembly error: {0}")]
    Segment(#[from] SegmentError),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("issue sending PDU: {0}")]
    Send(#[from] GenericSendError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outbound transfer requested by a remote entity with a Proxy Put request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPutTask {
    /// The transaction which carried the Proxy Put request.
    pub originating_id: TransactionId,
    pub request: ProxyPutRequest,
}

/// Replaces all path separators so a remote entity can not address files outside of the data
/// directory.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => "_".repeat(sanitized.len().max(1)),
        _ => sanitized,
    }
}

/// State of a single inbound transaction.
#[derive(Debug)]
pub struct DestTransaction<Countdown: CountdownProvider> {
    id: TransactionId,
    /// Configuration used for all replies towards the file sender.
    reply_conf: CommonPduConfig,
    remote_cfg: RemoteEntityConfig,
    metadata: MetadataPdu,
    file: DataFile,
    state: DestState,
    eof: Option<EofPdu>,
    retransmission_active: bool,
    nak_timer: Option<Countdown>,
    nak_counter: u32,
    finished: Option<FinishedPdu>,
    ack_timer: Option<Countdown>,
    ack_counter: u32,
}

impl<Countdown: CountdownProvider> DestTransaction<Countdown> {
    fn new(
        id: TransactionId,
        conf: &CommonPduConfig,
        remote_cfg: RemoteEntityConfig,
        metadata: MetadataPdu,
        file: DataFile,
    ) -> Self {
        Self {
            id,
            reply_conf: conf.for_reply(),
            remote_cfg,
            metadata,
            file,
            state: DestState::AwaitingMetadata,
            eof: None,
            retransmission_active: false,
            nak_timer: None,
            nak_counter: 0,
            finished: None,
            ack_timer: None,
            ack_counter: 0,
        }
    }

    fn needs_persistence(&self) -> bool {
        self.file.file_size() > 0 || self.reply_conf.file_flag == LargeFileFlag::Large
    }

    fn unexpected(&self, pdu_type: PduType, directive: Option<FileDirectiveType>) -> DestError {
        DestError::UnexpectedPdu {
            state: self.state,
            pdu_type,
            directive,
        }
    }
}

enum EofOutcome {
    Done(u32),
    Remove(u32),
    CheckCompleteness(u32),
}

/// Receiver side of the CFDP engine.
///
/// The user callbacks are invoked while the transaction registry is locked, so they must not
/// call back into the handler.
pub struct DestinationHandler<
    S: PduSender,
    V: VirtualFilestore,
    U: CfdpUser,
    T: TimerCreatorProvider,
> {
    local_cfg: LocalEntityConfig,
    remote_cfgs: StdRemoteEntityConfigProvider,
    sender: std::sync::Arc<S>,
    vfs: std::sync::Arc<V>,
    user: SharedUser<U>,
    timer_creator: T,
    fault_injector: Mutex<Box<dyn FaultInjector>>,
    data_dir: PathBuf,
    transactions: TransactionRegistry<DestTransaction<T::Countdown>>,
    proxy_tasks: Mutex<VecDeque<ProxyPutTask>>,
}

impl<S: PduSender, V: VirtualFilestore, U: CfdpUser, T: TimerCreatorProvider>
    DestinationHandler<S, V, U, T>
{
    pub fn new(
        local_cfg: LocalEntityConfig,
        remote_cfgs: StdRemoteEntityConfigProvider,
        sender: std::sync::Arc<S>,
        vfs: std::sync::Arc<V>,
        user: SharedUser<U>,
        timer_creator: T,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_cfg,
            remote_cfgs,
            sender,
            vfs,
            user,
            timer_creator,
            fault_injector: Mutex::new(Box::new(NoFaults)),
            data_dir: data_dir.into(),
            transactions: TransactionRegistry::new(),
            proxy_tasks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_fault_injector(&self, injector: Box<dyn FaultInjector>) {
        *self.fault_injector.lock() = injector;
    }

    pub fn local_cfg(&self) -> &LocalEntityConfig {
        &self.local_cfg
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state(&self, id: &TransactionId) -> Option<DestState> {
        self.transactions.with(id, |t| t.state)
    }

    /// Number of received file bytes of a transaction.
    pub fn progress(&self, id: &TransactionId) -> Option<u64> {
        self.transactions.with(id, |t| t.file.progress())
    }

    pub fn num_active_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.ids()
    }

    /// Removes and returns all Proxy Put requests received so far.
    pub fn take_proxy_tasks(&self) -> Vec<ProxyPutTask> {
        self.proxy_tasks.lock().drain(..).collect()
    }

    /// Processes a PDU addressed to the file receiver. Returns the number of sent PDUs.
    pub fn insert_pdu(&self, pdu: Pdu) -> Result<u32, DestError> {
        if determine_packet_target(&pdu) != PacketTarget::DestEntity {
            return Err(DestError::WrongPacketTarget(pdu.directive_type()));
        }
        let conf = *pdu.conf();
        let id = conf.transaction_id();
        match pdu.into_payload() {
            PduPayload::Metadata(metadata) => self.handle_metadata(&conf, metadata),
            PduPayload::FileData(file_data) => self.handle_file_data(id, file_data),
            PduPayload::Eof(eof) => self.handle_eof(id, eof),
            PduPayload::Ack(ack) => self.handle_finished_ack(id, &ack),
            PduPayload::Prompt(prompt) => {
                if !self.transactions.contains(&id) {
                    return Err(DestError::UnknownTransaction(id));
                }
                log::info!(
                    "transaction {id}: ignoring prompt PDU requesting a {:?} response",
                    prompt.response_required
                );
                Ok(0)
            }
            payload => Err(DestError::WrongPacketTarget(payload.directive_type())),
        }
    }

    /// Checks the NAK and positive ACK timers of all transactions. Returns the number of sent
    /// PDUs. Errors are logged and the first one is returned after all transactions were
    /// checked.
    pub fn handle_timers(&self) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        let mut first_error = None;
        self.transactions
            .retain(|id, transaction| match self.check_timers(transaction) {
                Ok((sent, keep)) => {
                    sent_packets += sent;
                    keep
                }
                Err(e) => {
                    log::error!("transaction {id}: timer handling failed: {e}");
                    first_error.get_or_insert(e);
                    true
                }
            });
        match first_error {
            Some(e) => Err(e),
            None => Ok(sent_packets),
        }
    }

    fn handle_metadata(&self, conf: &CommonPduConfig, metadata: MetadataPdu) -> Result<u32, DestError> {
        let id = conf.transaction_id();
        if self.transactions.contains(&id) {
            return Err(DestError::MetadataAlreadyReceived(id));
        }
        let remote_cfg = *self
            .remote_cfgs
            .get(conf.source_id().value())
            .ok_or(DestError::NoRemoteCfgFound(conf.source_id()))?;
        let file = DataFile::new(metadata.file_size, self.local_cfg.max_file_size)?;
        let proxy_task = scan_msgs_to_user(&id, &metadata.msgs_to_user);
        log::debug!(
            "transaction {id}: metadata received, file size {}, destination file {:?}",
            metadata.file_size,
            metadata.dest_file_name
        );
        self.transactions.insert(
            id,
            DestTransaction::new(id, conf, remote_cfg, metadata, file),
        )?;
        self.transactions.with(&id, |t| {
            self.user
                .lock()
                .metadata_recvd_indication(&MetadataReceivedParams {
                    id,
                    source_id: conf.source_id(),
                    file_size: t.metadata.file_size,
                    src_file_name: &t.metadata.source_file_name,
                    dest_file_name: &t.metadata.dest_file_name,
                    msgs_to_user: &t.metadata.msgs_to_user,
                });
            t.state = DestState::ReceivingData;
        });
        if let Some(task) = proxy_task {
            self.proxy_tasks.lock().push_back(task);
        }
        Ok(0)
    }

    fn handle_file_data(&self, id: TransactionId, file_data: FileDataPdu) -> Result<u32, DestError> {
        self.transactions
            .with(&id, |t| -> Result<u32, DestError> {
                match t.state {
                    DestState::ReceivingData
                    | DestState::CheckingCompleteness
                    | DestState::AwaitingRetransmission => (),
                    _ => return Err(t.unexpected(PduType::FileData, None)),
                }
                if !t.retransmission_active
                    && self
                        .fault_injector
                        .lock()
                        .drop_file_data(&id, file_data.offset)
                {
                    log::debug!(
                        "transaction {id}: dropped file data with offset {}",
                        file_data.offset
                    );
                    return Ok(0);
                }
                t.file.add_segment(file_data.offset, &file_data.data)?;
                if self.local_cfg.indication_cfg.file_segment_recv {
                    self.user
                        .lock()
                        .file_segment_recvd_indication(&FileSegmentRecvdParams {
                            id,
                            offset: file_data.offset,
                            length: file_data.data.len(),
                            segment_metadata: file_data.segment_metadata.as_ref(),
                        });
                }
                if t.state == DestState::AwaitingRetransmission {
                    if let Some(nak_timer) = t.nak_timer.as_mut() {
                        nak_timer.reset();
                    }
                    if t.file.is_complete() {
                        return self.finish(t);
                    }
                }
                Ok(0)
            })
            .ok_or(DestError::UnknownTransaction(id))?
    }

    fn handle_eof(&self, id: TransactionId, eof: EofPdu) -> Result<u32, DestError> {
        let outcome = self
            .transactions
            .with(&id, |t| -> Result<EofOutcome, DestError> {
                match t.state {
                    // The ACK for the EOF PDU was probably lost.
                    DestState::CheckingCompleteness
                    | DestState::SaveAndFinish
                    | DestState::Finished
                    | DestState::Failed(_) => {
                        self.pdu_send_helper(&t.reply_conf, AckPdu::new_for_eof(eof.condition_code))?;
                        return Ok(EofOutcome::Done(1));
                    }
                    _ => (),
                }
                if !t.retransmission_active && self.fault_injector.lock().drop_eof(&id) {
                    log::debug!("transaction {id}: dropped EOF PDU");
                    return Ok(EofOutcome::Done(0));
                }
                self.pdu_send_helper(&t.reply_conf, AckPdu::new_for_eof(eof.condition_code))?;
                if self.local_cfg.indication_cfg.eof_recv {
                    self.user.lock().eof_recvd_indication(&id);
                }
                if eof.file_size != t.file.file_size() {
                    log::warn!(
                        "transaction {id}: EOF file size {} differs from announced size {}",
                        eof.file_size,
                        t.file.file_size()
                    );
                }
                t.eof = Some(eof);
                if eof.condition_code != ConditionCode::NoError {
                    log::warn!(
                        "transaction {id}: EOF with condition code {:?} received",
                        eof.condition_code
                    );
                    t.state = DestState::Failed(FailureReason::EofFault(eof.condition_code));
                    t.nak_timer = None;
                    let delivery_code = if t.file.is_complete() {
                        DeliveryCode::Complete
                    } else {
                        DeliveryCode::Incomplete
                    };
                    self.finished_indication(
                        &id,
                        eof.condition_code,
                        delivery_code,
                        FileStatus::DiscardDeliberately,
                    );
                    return Ok(EofOutcome::Remove(1));
                }
                t.state = DestState::CheckingCompleteness;
                Ok(EofOutcome::CheckCompleteness(1))
            })
            .ok_or(DestError::UnknownTransaction(id))??;
        match outcome {
            EofOutcome::Done(sent) => Ok(sent),
            EofOutcome::Remove(sent) => {
                self.transactions.remove(&id);
                Ok(sent)
            }
            EofOutcome::CheckCompleteness(sent) => {
                if !self.local_cfg.eof_settle_delay.is_zero() {
                    std::thread::sleep(self.local_cfg.eof_settle_delay);
                }
                let sent_after_check = self
                    .transactions
                    .with(&id, |t| self.check_completeness(t))
                    .ok_or(DestError::UnknownTransaction(id))??;
                Ok(sent + sent_after_check)
            }
        }
    }

    fn handle_finished_ack(&self, id: TransactionId, ack: &AckPdu) -> Result<u32, DestError> {
        let finished_sent = self
            .transactions
            .with(&id, |t| {
                if t.finished.is_none() {
                    return Err(t.unexpected(PduType::FileDirective, Some(FileDirectiveType::AckPdu)));
                }
                Ok(())
            })
            .ok_or(DestError::UnknownTransaction(id))?;
        finished_sent?;
        log::debug!(
            "transaction {id}: Finished PDU acknowledged with transaction status {:?}",
            ack.transaction_status
        );
        self.transactions.remove(&id);
        Ok(0)
    }

    fn check_completeness(&self, t: &mut DestTransaction<T::Countdown>) -> Result<u32, DestError> {
        if t.state != DestState::CheckingCompleteness {
            return Ok(0);
        }
        if t.file.is_complete() {
            return self.finish(t);
        }
        self.send_nak(t)?;
        t.retransmission_active = true;
        t.nak_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::NakActivity {
                    expiry_time: t.remote_cfg.nak_timer_interval,
                }),
        );
        t.state = DestState::AwaitingRetransmission;
        Ok(1)
    }

    fn send_nak(&self, t: &DestTransaction<T::Countdown>) -> Result<(), DestError> {
        let missing = t.file.missing_chunks();
        log::info!(
            "transaction {}: requesting {} missing segment(s)",
            t.id,
            missing.len()
        );
        self.pdu_send_helper(&t.reply_conf, NakPdu::new_from_missing(missing))
    }

    fn finish(&self, t: &mut DestTransaction<T::Countdown>) -> Result<u32, DestError> {
        t.state = DestState::SaveAndFinish;
        t.nak_timer = None;
        // Empty and messages-only transfers complete without touching the filestore.
        if !t.needs_persistence() {
            return self.complete(t, FileStatus::Retained);
        }
        let path = match self.persist(t) {
            Ok(path) => path,
            Err(e) => {
                log::error!("transaction {}: persisting the file failed: {e}", t.id);
                return self.fail(
                    t,
                    FailureReason::FilestoreRejection,
                    DeliveryCode::Complete,
                    FileStatus::DiscardedFsRejection,
                );
            }
        };
        match self.verify_checksum(t, &path) {
            Ok(true) => (),
            Ok(false) => {
                log::warn!(
                    "transaction {}: checksum mismatch for file {}",
                    t.id,
                    path.display()
                );
                if self.local_cfg.checksum_failure_is_fault {
                    return self.fail(
                        t,
                        FailureReason::FileChecksumFailure,
                        DeliveryCode::Incomplete,
                        FileStatus::Retained,
                    );
                }
            }
            Err(e) => log::warn!("transaction {}: checksum not verified: {e}", t.id),
        }
        self.complete(t, FileStatus::Retained)
    }

    fn persist(&self, t: &DestTransaction<T::Countdown>) -> Result<PathBuf, FilestoreError> {
        self.vfs.create_dir_all(path_to_str(&self.data_dir)?)?;
        let path = self
            .data_dir
            .join(sanitize_file_name(&t.metadata.dest_file_name));
        self.vfs.write_file(path_to_str(&path)?, t.file.data())?;
        log::info!(
            "transaction {}: stored {} bytes in {}",
            t.id,
            t.file.file_size(),
            path.display()
        );
        Ok(path)
    }

    fn verify_checksum(
        &self,
        t: &DestTransaction<T::Countdown>,
        path: &Path,
    ) -> Result<bool, FilestoreError> {
        let Some(eof) = t.eof else {
            return Ok(true);
        };
        let mut buf = vec![0; CHECKSUM_BUF_LEN];
        self.vfs.checksum_verify(
            eof.file_checksum,
            path_to_str(path)?,
            t.metadata.checksum_type,
            t.file.file_size(),
            &mut buf,
        )
    }

    fn complete(
        &self,
        t: &mut DestTransaction<T::Countdown>,
        file_status: FileStatus,
    ) -> Result<u32, DestError> {
        t.state = DestState::Finished;
        self.send_finished(t, FinishedPdu::new_no_error(file_status))
    }

    fn fail(
        &self,
        t: &mut DestTransaction<T::Countdown>,
        reason: FailureReason,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Result<u32, DestError> {
        let condition_code = reason.condition_code();
        log::warn!("transaction {}: failed with {reason:?}", t.id);
        t.state = DestState::Failed(reason);
        t.nak_timer = None;
        self.user
            .lock()
            .fault_indication(&t.id, condition_code, t.file.progress());
        let mut finished = FinishedPdu::new(condition_code, delivery_code, file_status);
        finished.fault_location = Some(self.local_cfg.id);
        self.send_finished(t, finished)
    }

    fn send_finished(
        &self,
        t: &mut DestTransaction<T::Countdown>,
        finished: FinishedPdu,
    ) -> Result<u32, DestError> {
        self.pdu_send_helper(&t.reply_conf, finished.clone())?;
        self.finished_indication(
            &t.id,
            finished.condition_code,
            finished.delivery_code,
            finished.file_status,
        );
        t.finished = Some(finished);
        t.ack_counter = 0;
        t.ack_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::PositiveAck {
                    expiry_time: t.remote_cfg.positive_ack_timer_interval,
                }),
        );
        Ok(1)
    }

    /// Returns the number of sent PDUs and whether the transaction should be kept.
    fn check_timers(&self, t: &mut DestTransaction<T::Countdown>) -> Result<(u32, bool), DestError> {
        if t.state == DestState::AwaitingRetransmission
            && t.nak_timer.as_ref().is_some_and(|timer| timer.has_expired())
        {
            t.nak_counter += 1;
            if t.nak_counter >= t.remote_cfg.nak_timer_expiration_limit {
                let sent = self.fail(
                    t,
                    FailureReason::NakLimitReached,
                    DeliveryCode::Incomplete,
                    FileStatus::DiscardDeliberately,
                )?;
                return Ok((sent, true));
            }
            self.send_nak(t)?;
            if let Some(nak_timer) = t.nak_timer.as_mut() {
                nak_timer.reset();
            }
            return Ok((1, true));
        }
        if let (Some(finished), Some(ack_timer)) = (&t.finished, t.ack_timer.as_mut()) {
            if !ack_timer.has_expired() {
                return Ok((0, true));
            }
            t.ack_counter += 1;
            if t.ack_counter >= t.remote_cfg.positive_ack_timer_expiration_limit {
                log::warn!(
                    "transaction {}: no ACK for the Finished PDU received, dropping transaction",
                    t.id
                );
                self.user.lock().fault_indication(
                    &t.id,
                    ConditionCode::PositiveAckLimitReached,
                    t.file.progress(),
                );
                return Ok((0, false));
            }
            ack_timer.reset();
            self.pdu_send_helper(&t.reply_conf, finished.clone())?;
            return Ok((1, true));
        }
        Ok((0, true))
    }

    fn finished_indication(
        &self,
        id: &TransactionId,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) {
        if self.local_cfg.indication_cfg.transaction_finished {
            self.user
                .lock()
                .transaction_finished_indication(&TransactionFinishedParams {
                    id: *id,
                    condition_code,
                    delivery_code,
                    file_status,
                });
        }
    }

    fn pdu_send_helper(
        &self,
        conf: &CommonPduConfig,
        payload: impl Into<PduPayload>,
    ) -> Result<(), DestError> {
        let pdu = Pdu::new(*conf, payload);
        let raw = pdu.to_vec()?;
        self.sender
            .send_pdu(pdu.pdu_type(), pdu.directive_type(), &raw)?;
        Ok(())
    }
}

/// Looks for a Proxy Put request inside the messages to the user.
fn scan_msgs_to_user(id: &TransactionId, msgs_to_user: &[MessageToUser]) -> Option<ProxyPutTask> {
    let mut put_request = None;
    let mut trans_mode = None;
    let mut closure_requested = None;
    for msg in msgs_to_user.iter().filter_map(MessageToUser::reserved) {
        match msg {
            ReservedMessage::ProxyPutRequest(request) => put_request = Some(request.clone()),
            ReservedMessage::ProxyTransmissionMode(mode) => trans_mode = Some(*mode),
            ReservedMessage::ProxyClosureRequest(closure) => closure_requested = Some(*closure),
            ReservedMessage::OriginatingTransactionId(originating_id) => {
                log::info!("transaction {id} was triggered by transaction {originating_id}")
            }
            ReservedMessage::Other { msg_type, .. } => {
                log::warn!(
                    "transaction {id}: ignoring reserved message with unsupported type {msg_type:#04x}"
                )
            }
        }
    }
    let Some(request) = put_request else {
        if trans_mode.is_some() || closure_requested.is_some() {
            log::warn!(
                "transaction {id}: proxy transmission mode or closure request without proxy put request, ignoring"
            );
        }
        return None;
    };
    if trans_mode == Some(TransmissionMode::Unacknowledged) {
        log::warn!(
            "transaction {id}: unacknowledged proxy transfers are not supported, using acknowledged mode"
        );
    }
    if closure_requested == Some(true) {
        log::warn!("transaction {id}: proxy closure requests are not supported, ignoring");
    }
    Some(ProxyPutTask {
        originating_id: *id,
        request,
    })
}
