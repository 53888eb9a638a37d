//! End-to-end integration tests which connect two CFDP engines with in-memory channels.
use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Once,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use cfdp::{
    engine::CfdpEngine,
    fault::DropFileDataOffsets,
    filestore::NativeFilestore,
    pdu::msg_to_user::ProxyPutRequest,
    request::PutRequest,
    source::TransferState,
    user::{
        CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, SharedUser,
        TransactionFinishedParams,
    },
    IndicationConfig, LocalEntityConfig, PduOwnedWithInfo, RemoteEntityConfig,
    RemoteEntityConfigProvider, StdRemoteEntityConfigProvider, StdTimerCreator, TransactionId,
};
use parking_lot::Mutex;
use spacepackets::{
    cfdp::{
        pdu::finished::{DeliveryCode, FileStatus},
        ChecksumType, ConditionCode,
    },
    util::{UnsignedByteField, UnsignedByteFieldU16},
};
use tempfile::TempDir;

const LOCAL_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const REMOTE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

const TIMEOUT: Duration = Duration::from_secs(10);

static LOGGER_INIT: Once = Once::new();

fn setup_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    std::thread::current().name().unwrap_or("-"),
                    record.level(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply();
    });
}

#[derive(Debug, Default)]
struct RecordingUser {
    name: &'static str,
    finished: Vec<TransactionFinishedParams>,
    faults: Vec<(TransactionId, ConditionCode)>,
    received_segments: u32,
}

impl RecordingUser {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

impl CfdpUser for RecordingUser {
    fn transaction_indication(&mut self, id: &TransactionId) {
        log::info!("{}: transaction indication for {id}", self.name);
    }

    fn eof_sent_indication(&mut self, id: &TransactionId) {
        log::info!("{}: EOF sent for {id}", self.name);
    }

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
        log::info!("{}: transaction finished: {finished_params:?}", self.name);
        self.finished.push(*finished_params);
    }

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
        log::info!("{}: metadata received: {md_recvd_params:?}", self.name);
    }

    fn file_segment_recvd_indication(&mut self, _segment_recvd_params: &FileSegmentRecvdParams) {
        self.received_segments += 1;
    }

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode) {
        log::info!("{}: {id} suspended with {condition_code:?}", self.name);
    }

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64) {
        log::info!("{}: {id} resumed at progress {progress}", self.name);
    }

    fn fault_indication(&mut self, id: &TransactionId, condition_code: ConditionCode, _progress: u64) {
        log::warn!("{}: fault {condition_code:?} for {id}", self.name);
        self.faults.push((*id, condition_code));
    }

    fn eof_recvd_indication(&mut self, id: &TransactionId) {
        log::info!("{}: EOF received for {id}", self.name);
    }
}

type TestEngine =
    CfdpEngine<mpsc::Sender<PduOwnedWithInfo>, NativeFilestore, RecordingUser, StdTimerCreator>;

fn remote_cfg(remote_id: UnsignedByteFieldU16) -> RemoteEntityConfig {
    let mut cfg = RemoteEntityConfig::new_with_default_values(
        UnsignedByteField::from(remote_id),
        256,
        true,
        ChecksumType::Crc32,
    );
    cfg.file_data_pacing = Duration::from_millis(1);
    cfg.positive_ack_timer_interval = Duration::from_millis(300);
    cfg.positive_ack_timer_expiration_limit = 5;
    cfg.nak_timer_interval = Duration::from_millis(300);
    cfg.nak_timer_expiration_limit = 5;
    cfg
}

struct Entity {
    engine: Arc<TestEngine>,
    user: SharedUser<RecordingUser>,
    data_dir: TempDir,
}

/// Two engines with one pump thread per direction. Each pump forwards the PDUs generated by one
/// engine to the other and periodically drives the timers of the receiving engine.
struct Link {
    local: Entity,
    remote: Entity,
    stop_signal: Arc<AtomicBool>,
    pumps: Vec<JoinHandle<()>>,
}

fn create_entity(
    name: &'static str,
    own_id: UnsignedByteFieldU16,
    peer_id: UnsignedByteFieldU16,
) -> (Entity, mpsc::Receiver<PduOwnedWithInfo>) {
    let data_dir = tempfile::tempdir().expect("creating temporary directory failed");
    let (tx, rx) = mpsc::channel();
    let user = Arc::new(Mutex::new(RecordingUser::new(name)));
    let mut local_cfg = LocalEntityConfig::new(own_id.into(), IndicationConfig::default());
    local_cfg.eof_settle_delay = Duration::from_millis(5);
    let mut remote_cfgs = StdRemoteEntityConfigProvider::default();
    remote_cfgs.add_config(&remote_cfg(peer_id));
    let engine = CfdpEngine::new(
        local_cfg,
        remote_cfgs,
        tx,
        NativeFilestore,
        user.clone(),
        StdTimerCreator,
        data_dir.path(),
    );
    (
        Entity {
            engine: Arc::new(engine),
            user,
            data_dir,
        },
        rx,
    )
}

fn spawn_pump(
    rx: mpsc::Receiver<PduOwnedWithInfo>,
    target: Arc<TestEngine>,
    stop_signal: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop_signal.load(Ordering::Relaxed) {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(pdu) => {
                    if let Err(e) = target.insert_raw_pdu(&pdu.pdu) {
                        log::warn!("inserting PDU failed: {e}");
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if let Err(e) = target.handle_timers() {
                log::warn!("timer handling failed: {e}");
            }
        }
    })
}

impl Link {
    fn new() -> Self {
        setup_logger();
        let (local, local_rx) = create_entity("local", LOCAL_ID, REMOTE_ID);
        let (remote, remote_rx) = create_entity("remote", REMOTE_ID, LOCAL_ID);
        let stop_signal = Arc::new(AtomicBool::new(false));
        let pumps = vec![
            spawn_pump(local_rx, remote.engine.clone(), stop_signal.clone()),
            spawn_pump(remote_rx, local.engine.clone(), stop_signal.clone()),
        ];
        Self {
            local,
            remote,
            stop_signal,
            pumps,
        }
    }

    fn shutdown(self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        for pump in self.pumps {
            pump.join().unwrap();
        }
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source_file(dir: &Path, name: &str, data: &[u8]) -> String {
    let path = dir.join(name);
    fs::write(&path, data).expect("writing source file failed");
    String::from(path.to_str().expect("invalid path string"))
}

fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > TIMEOUT {
            panic!("{description} not reached within {TIMEOUT:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn run_file_transfer(link: &Link, data: &[u8]) {
    let source_dir = tempfile::tempdir().expect("creating temporary directory failed");
    let source_file = write_source_file(source_dir.path(), "telemetry.bin", data);
    let request =
        PutRequest::new_regular_request(REMOTE_ID, &source_file, "downlinked.bin", None, None)
            .expect("put request creation failed");
    let id = link.local.engine.put_request(request).expect("put request failed");
    assert_eq!(
        link.local.engine.wait_for_transfer(&id, TIMEOUT),
        Some(TransferState::Completed)
    );
    let received = fs::read(link.remote.data_dir.path().join("downlinked.bin"))
        .expect("reading received file failed");
    assert_eq!(received, data);

    let expected = TransactionFinishedParams {
        id,
        condition_code: ConditionCode::NoError,
        delivery_code: DeliveryCode::Complete,
        file_status: FileStatus::Retained,
    };
    assert_eq!(link.local.user.lock().finished, [expected]);
    assert_eq!(link.remote.user.lock().finished, [expected]);
    wait_for("removal of the inbound transaction", || {
        link.remote.engine.num_inbound_transactions() == 0
    });
}

#[test]
fn end_to_end_file_transfer() {
    let link = Link::new();
    run_file_transfer(&link, &test_data(2000));
    assert!(link.local.user.lock().faults.is_empty());
    assert!(link.remote.user.lock().faults.is_empty());
    link.shutdown();
}

#[test]
fn end_to_end_empty_file() {
    let link = Link::new();
    let source_dir = tempfile::tempdir().unwrap();
    let source_file = write_source_file(source_dir.path(), "empty.bin", &[]);
    let request = PutRequest::new_regular_request(REMOTE_ID, &source_file, "empty.bin", None, None)
        .unwrap();
    let id = link.local.engine.put_request(request).unwrap();
    assert_eq!(
        link.local.engine.wait_for_transfer(&id, TIMEOUT),
        Some(TransferState::Completed)
    );
    // Empty files are not stored, but still reported as retained.
    assert!(!link.remote.data_dir.path().join("empty.bin").exists());
    let expected = TransactionFinishedParams {
        id,
        condition_code: ConditionCode::NoError,
        delivery_code: DeliveryCode::Complete,
        file_status: FileStatus::Retained,
    };
    assert_eq!(link.local.user.lock().finished, [expected]);
    wait_for("finished indication of the receiver", || {
        link.remote.user.lock().finished == [expected]
    });
    link.shutdown();
}

#[test]
fn end_to_end_with_lost_segments() {
    let link = Link::new();
    let data = test_data(3000);
    let segment_len = 256 - 10 - 4 - 2;
    // Drops the second and the fourth file data PDU once.
    link.remote
        .engine
        .set_fault_injector(Box::new(DropFileDataOffsets::new([
            segment_len as u64,
            3 * segment_len as u64,
        ])));
    run_file_transfer(&link, &data);
    let received_segments = link.remote.user.lock().received_segments;
    assert!(received_segments as usize >= data.len().div_ceil(segment_len));
    link.shutdown();
}

#[test]
fn end_to_end_proxy_put() {
    let link = Link::new();
    let data = test_data(700);
    write_source_file(link.remote.data_dir.path(), "housekeeping.bin", &data);
    let request = PutRequest::new_proxy_put_request(
        REMOTE_ID,
        ProxyPutRequest::new(LOCAL_ID, "housekeeping.bin", "fetched.bin"),
    )
    .unwrap();
    let proxy_id = link.local.engine.put_request(request).unwrap();
    assert_eq!(
        link.local.engine.wait_for_transfer(&proxy_id, TIMEOUT),
        Some(TransferState::Completed)
    );
    // The request itself is a messages-only transfer.
    assert!(link.local.user.lock().finished.contains(&TransactionFinishedParams {
        id: proxy_id,
        condition_code: ConditionCode::NoError,
        delivery_code: DeliveryCode::Complete,
        file_status: FileStatus::Retained,
    }));
    let fetched = link.local.data_dir.path().join("fetched.bin");
    wait_for("reception of the proxied file", || {
        fs::read(&fetched).is_ok_and(|content| content == data)
    });
    wait_for("completion of the proxied transfer", || {
        link.remote
            .engine
            .transfer_ids()
            .iter()
            .all(|id| link.remote.engine.transfer_state(id) == Some(TransferState::Completed))
    });
    let finished = link.remote.engine.remove_finished_transfers();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1, TransferState::Completed);
    link.shutdown();
}

#[test]
fn end_to_end_cancel() {
    let link = Link::new();
    let source_dir = tempfile::tempdir().unwrap();
    let source_file = write_source_file(source_dir.path(), "large.bin", &test_data(50_000));
    let request =
        PutRequest::new_regular_request(REMOTE_ID, &source_file, "large.bin", None, None).unwrap();
    let id = link.local.engine.put_request(request).unwrap();
    link.local.engine.cancel(&id).unwrap();
    assert_eq!(
        link.local.engine.wait_for_transfer(&id, TIMEOUT),
        Some(TransferState::Failed(cfdp::FailureReason::Cancelled))
    );
    let finished = link.local.user.lock().finished.clone();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].condition_code, ConditionCode::CancelRequestReceived);
    link.shutdown();
}
