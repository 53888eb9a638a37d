//! # CFDP Engine Module
//!
//! The [CfdpEngine] ties together the sending and the receiving side of a CFDP entity. It owns
//! the configuration, the [DestinationHandler] for all inbound transactions and the registry of
//! all outbound transfers.
//!
//! Every outbound transfer started with [CfdpEngine::put_request] is driven by a dedicated thread
//! running [run_transfer]. Inbound PDUs are passed to [CfdpEngine::insert_raw_pdu] or
//! [CfdpEngine::insert_pdu]. PDUs addressed to the file receiver are processed synchronously,
//! PDUs addressed to the file sender are forwarded to the thread of the corresponding transfer.
//!
//! Proxy Put requests received from remote entities are served automatically: the requested
//! file is read from the data directory and sent to the entity named in the request.
use core::time::Duration;
use std::{
    boxed::Box,
    format,
    path::{Path, PathBuf},
    string::String,
    sync::Arc,
    thread::{self, JoinHandle},
    vec,
    vec::Vec,
};

use spacepackets::{
    seq_count::{SeqCountProviderSyncU16, SequenceCountProvider},
    util::{UnsignedByteField, UnsignedEnum},
};

use crate::{
    dest::{sanitize_file_name, DestError, DestState, DestinationHandler, ProxyPutTask},
    fault::FaultInjector,
    filestore::{path_to_str, FilestoreError, VirtualFilestore},
    pdu::{
        msg_to_user::{MessageToUser, ReservedMessage},
        Pdu, PduError,
    },
    registry::{RegistryError, TransactionRegistry},
    request::{FilePathTooLarge, PutRequest, PutRequestError},
    source::{
        run_transfer, SourceError, SourceState, SourceTransaction, TransferControl, TransferState,
    },
    user::{CfdpUser, SharedUser},
    determine_packet_target, LocalEntityConfig, PacketTarget, PduSender, RemoteEntityConfig,
    RemoteEntityConfigProvider, StdRemoteEntityConfigProvider, TimerCreatorProvider,
    TransactionId,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid put request: {0}")]
    PutRequest(#[from] PutRequestError),
    #[error("file path too large: {0}")]
    FilePathTooLarge(#[from] FilePathTooLarge),
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("source file {0} does not exist")]
    FileDoesNotExist(String),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("destination handler error: {0}")]
    Dest(#[from] DestError),
    #[error("source handler error: {0}")]
    Source(#[from] SourceError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("spawning the transfer thread failed: {0}")]
    ThreadSpawn(std::io::Error),
}

#[derive(Debug)]
struct TransferHandle {
    control: Arc<TransferControl>,
    join: Option<JoinHandle<()>>,
}

/// CFDP entity consisting of a file sender and a file receiver.
///
/// The engine can be shared between threads, for example one thread passing received PDUs to
/// [Self::insert_raw_pdu] and another one calling [Self::handle_timers] periodically.
pub struct CfdpEngine<S, V, U, T>
where
    S: PduSender + Send + Sync + 'static,
    V: VirtualFilestore + Send + Sync + 'static,
    U: CfdpUser + Send + 'static,
    T: TimerCreatorProvider + Clone + Send + 'static,
{
    local_cfg: LocalEntityConfig,
    remote_cfgs: StdRemoteEntityConfigProvider,
    sender: Arc<S>,
    vfs: Arc<V>,
    user: SharedUser<U>,
    timer_creator: T,
    seq_count_provider: SeqCountProviderSyncU16,
    dest: DestinationHandler<S, V, U, T>,
    transfers: TransactionRegistry<TransferHandle>,
}

impl<S, V, U, T> CfdpEngine<S, V, U, T>
where
    S: PduSender + Send + Sync + 'static,
    V: VirtualFilestore + Send + Sync + 'static,
    U: CfdpUser + Send + 'static,
    T: TimerCreatorProvider + Clone + Send + 'static,
{
    /// Creates a new engine.
    ///
    /// # Arguments
    ///
    /// * `local_cfg` - Configuration of the local entity.
    /// * `remote_cfgs` - Configurations of all known remote entities. PDUs of unknown remote
    ///   entities are rejected.
    /// * `sender` - Used to send all generated PDUs.
    /// * `vfs` - Filestore abstraction used by both sides.
    /// * `user` - Receives all indications of both sides.
    /// * `timer_creator` - Creates the NAK and positive ACK timers.
    /// * `data_dir` - Received files are stored inside this directory. Files requested with
    ///   Proxy Put requests are read from it.
    pub fn new(
        local_cfg: LocalEntityConfig,
        remote_cfgs: StdRemoteEntityConfigProvider,
        sender: S,
        vfs: V,
        user: SharedUser<U>,
        timer_creator: T,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let sender = Arc::new(sender);
        let vfs = Arc::new(vfs);
        let dest = DestinationHandler::new(
            local_cfg,
            remote_cfgs.clone(),
            sender.clone(),
            vfs.clone(),
            user.clone(),
            timer_creator.clone(),
            data_dir,
        );
        Self {
            local_cfg,
            remote_cfgs,
            sender,
            vfs,
            user,
            timer_creator,
            seq_count_provider: SeqCountProviderSyncU16::new(),
            dest,
            transfers: TransactionRegistry::new(),
        }
    }

    /// Builder method to install a fault injector for inbound PDUs.
    pub fn with_fault_injector(self, injector: Box<dyn FaultInjector>) -> Self {
        self.dest.set_fault_injector(injector);
        self
    }

    pub fn set_fault_injector(&self, injector: Box<dyn FaultInjector>) {
        self.dest.set_fault_injector(injector);
    }

    pub fn local_id(&self) -> UnsignedByteField {
        self.local_cfg.id
    }

    pub fn local_cfg(&self) -> &LocalEntityConfig {
        &self.local_cfg
    }

    pub fn remote_cfg(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.remote_cfgs.get(remote_id)
    }

    pub fn data_dir(&self) -> &Path {
        self.dest.data_dir()
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn user(&self) -> &SharedUser<U> {
        &self.user
    }

    /// Starts a new outbound transfer. The transaction ID is assigned from the local entity ID
    /// and the sequence counter of the engine. The transfer runs on its own thread.
    pub fn put_request(&self, request: PutRequest) -> Result<TransactionId, EngineError> {
        request.validate()?;
        if let Some(source_file) = request.source_file() {
            if !self.vfs.exists(source_file)? {
                return Err(EngineError::FileDoesNotExist(source_file.into()));
            }
        }
        let remote_cfg = *self
            .remote_cfgs
            .get(request.destination_id.value())
            .ok_or(EngineError::NoRemoteCfgFound(request.destination_id))?;
        let seq_num = self.next_seq_num(remote_cfg.seq_num_width);
        // Both entity IDs of a PDU header share the same width.
        let local_id = UnsignedByteField::new(remote_cfg.entity_id.size(), self.local_cfg.id.value());
        let transaction = SourceTransaction::new(
            local_id,
            seq_num,
            request,
            self.local_cfg,
            remote_cfg,
            self.sender.clone(),
            self.vfs.clone(),
            self.timer_creator.clone(),
        )?;
        let id = transaction.transaction_id();
        let control = Arc::new(TransferControl::new());
        // Registered first so replies arriving immediately can be routed.
        self.transfers.insert(
            id,
            TransferHandle {
                control: control.clone(),
                join: None,
            },
        )?;
        let user = self.user.clone();
        let spawn_result = thread::Builder::new()
            .name(format!("cfdp-src-{id}"))
            .spawn(move || run_transfer(transaction, control, user));
        match spawn_result {
            Ok(join) => {
                self.transfers.with(&id, |handle| handle.join = Some(join));
                log::info!("transaction {id}: transfer started");
                Ok(id)
            }
            Err(e) => {
                self.transfers.remove(&id);
                Err(EngineError::ThreadSpawn(e))
            }
        }
    }

    /// Decodes and processes a raw PDU. Returns the number of PDUs sent by the receiver side
    /// as a direct reaction.
    pub fn insert_raw_pdu(&self, raw_pdu: &[u8]) -> Result<u32, EngineError> {
        let pdu = Pdu::from_bytes(raw_pdu).map_err(|e| {
            log::warn!("discarding malformed PDU: {e}");
            e
        })?;
        self.insert_pdu(pdu)
    }

    /// Routes a decoded PDU to the file receiver or to the file sender.
    pub fn insert_pdu(&self, pdu: Pdu) -> Result<u32, EngineError> {
        match determine_packet_target(&pdu) {
            PacketTarget::DestEntity => {
                let sent_packets = self.dest.insert_pdu(pdu)?;
                self.start_proxy_transfers();
                Ok(sent_packets)
            }
            PacketTarget::SourceEntity => {
                let id = pdu.transaction_id();
                let control = self
                    .transfers
                    .with(&id, |handle| handle.control.clone())
                    .ok_or(EngineError::UnknownTransaction(id))?;
                control.deliver(pdu);
                Ok(0)
            }
        }
    }

    /// Checks the timers of the receiver side and joins the threads of terminated transfers.
    /// Should be called periodically.
    pub fn handle_timers(&self) -> Result<u32, EngineError> {
        let mut join_handles = Vec::new();
        self.transfers.retain(|_, handle| {
            if handle.control.state().is_terminal() {
                if let Some(join) = handle.join.take() {
                    join_handles.push(join);
                }
            }
            true
        });
        for join in join_handles {
            if join.join().is_err() {
                log::error!("transfer thread panicked");
            }
        }
        Ok(self.dest.handle_timers()?)
    }

    /// Removes all terminated transfers from the registry and returns their final states.
    pub fn remove_finished_transfers(&self) -> Vec<(TransactionId, TransferState)> {
        self.transfers
            .extract_if(|_, handle| handle.control.state().is_terminal())
            .into_iter()
            .map(|(id, mut handle)| {
                if let Some(join) = handle.join.take() {
                    if join.join().is_err() {
                        log::error!("transaction {id}: transfer thread panicked");
                    }
                }
                (id, handle.control.state())
            })
            .collect()
    }

    /// Returns [false] if the transfer is unknown or already terminated.
    pub fn pause(&self, id: &TransactionId) -> bool {
        self.control(id).is_some_and(|control| control.pause())
    }

    /// Returns [false] if the transfer is unknown or already terminated.
    pub fn resume(&self, id: &TransactionId) -> bool {
        self.control(id).is_some_and(|control| control.resume())
    }

    /// Cancels an outbound transfer. No PDU is sent to the remote entity.
    pub fn cancel(&self, id: &TransactionId) -> Result<(), EngineError> {
        self.control(id)
            .ok_or(EngineError::UnknownTransaction(*id))?
            .cancel();
        Ok(())
    }

    pub fn transfer_state(&self, id: &TransactionId) -> Option<TransferState> {
        self.control(id).map(|control| control.state())
    }

    pub fn source_state(&self, id: &TransactionId) -> Option<SourceState> {
        self.control(id).map(|control| control.source_state())
    }

    pub fn dest_state(&self, id: &TransactionId) -> Option<DestState> {
        self.dest.state(id)
    }

    pub fn transfer_ids(&self) -> Vec<TransactionId> {
        self.transfers.ids()
    }

    pub fn num_inbound_transactions(&self) -> usize {
        self.dest.num_active_transactions()
    }

    /// Blocks until the outbound transfer terminated or the timeout elapsed.
    pub fn wait_for_transfer(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Option<TransferState> {
        self.control(id)
            .map(|control| control.wait_until_terminal(timeout))
    }

    fn control(&self, id: &TransactionId) -> Option<Arc<TransferControl>> {
        self.transfers.with(id, |handle| handle.control.clone())
    }

    fn next_seq_num(&self, width: usize) -> UnsignedByteField {
        let seq_num = self.seq_count_provider.get_and_increment();
        let value = if width == 1 {
            (seq_num & u8::MAX as u16) as u64
        } else {
            seq_num as u64
        };
        UnsignedByteField::new(width, value)
    }

    fn start_proxy_transfers(&self) {
        for task in self.dest.take_proxy_tasks() {
            match self.start_proxy_transfer(&task) {
                Ok(id) => log::info!(
                    "transaction {id}: serving proxy put request of transaction {}",
                    task.originating_id
                ),
                Err(e) => log::warn!(
                    "proxy put request of transaction {} rejected: {e}",
                    task.originating_id
                ),
            }
        }
    }

    fn start_proxy_transfer(&self, task: &ProxyPutTask) -> Result<TransactionId, EngineError> {
        let source_path = self
            .data_dir()
            .join(sanitize_file_name(&task.request.source_file_name));
        let source_file = path_to_str(&source_path)?;
        let mut request = PutRequest::new_regular_request(
            task.request.dest_entity_id,
            source_file,
            &task.request.dest_file_name,
            None,
            None,
        )?;
        request.msgs_to_user = vec![MessageToUser::Reserved(
            ReservedMessage::OriginatingTransactionId(task.originating_id),
        )];
        self.put_request(request)
    }
}

impl<S, V, U, T> Drop for CfdpEngine<S, V, U, T>
where
    S: PduSender + Send + Sync + 'static,
    V: VirtualFilestore + Send + Sync + 'static,
    U: CfdpUser + Send + 'static,
    T: TimerCreatorProvider + Clone + Send + 'static,
{
    fn drop(&mut self) {
        for (id, mut handle) in self.transfers.extract_if(|_, _| true) {
            handle.control.cancel();
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    log::error!("transaction {id}: transfer thread panicked");
                }
            }
        }
    }
}
