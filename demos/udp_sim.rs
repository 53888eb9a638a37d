//! Lossy link simulation with two CFDP entities exchanging PDUs over UDP on the loopback
//! interface.
//!
//! The ground entity sends a file to the spacecraft entity. The spacecraft drops file data and
//! EOF PDUs randomly, which exercises the lost segment procedures. Optionally, the ground entity
//! also asks the spacecraft to send the file back with a Proxy Put request.
use std::{
    fs,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use cfdp::{
    engine::CfdpEngine,
    fault::RandomDrop,
    filestore::NativeFilestore,
    pdu::{msg_to_user::ProxyPutRequest, PduError},
    request::PutRequest,
    source::TransferState,
    user::{CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams},
    IndicationConfig, LocalEntityConfig, PduOwnedWithInfo, RemoteEntityConfig,
    RemoteEntityConfigProvider, StdRemoteEntityConfigProvider, StdTimerCreator, TransactionId,
};
use clap::Parser;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use spacepackets::{
    cfdp::{ChecksumType, ConditionCode},
    util::UnsignedByteFieldU16,
};

static KILL_APP: AtomicBool = AtomicBool::new(false);

const GROUND_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const SPACECRAFT_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

const GROUND_PORT: u16 = 5111;
const SPACECRAFT_PORT: u16 = 5222;

#[derive(clap::Parser)]
#[command(about = "Simulates a CFDP file transfer over a lossy UDP link")]
pub struct Cli {
    #[arg(short, long, help = "File to send. A random file is generated if omitted")]
    file: Option<PathBuf>,
    #[arg(short, long, default_value_t = 16384, help = "Size of the generated file")]
    size: usize,
    #[arg(long, default_value_t = 0.1, help = "Drop rate for file data PDUs")]
    drop_rate: f64,
    #[arg(long, default_value_t = 0.0, help = "Drop rate for EOF PDUs")]
    eof_drop_rate: f64,
    #[arg(long, help = "Seed for the drop decisions")]
    seed: Option<u64>,
    #[arg(short, long, help = "Request the file back with a Proxy Put request")]
    proxy: bool,
    #[arg(long, default_value_t = 1, help = "Delay between file data PDUs in milliseconds")]
    pacing_ms: u64,
    #[arg(long, default_value = "info", help = "Log level filter")]
    log_level: String,
}

pub struct ExampleCfdpUser {
    name: &'static str,
}

impl ExampleCfdpUser {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl CfdpUser for ExampleCfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId) {
        info!("{}: transaction indication for {id}", self.name);
    }

    fn eof_sent_indication(&mut self, id: &TransactionId) {
        info!("{}: EOF sent for transaction {id}", self.name);
    }

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
        info!("{}: transaction finished: {finished_params:?}", self.name);
    }

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
        info!(
            "{}: metadata received for {}: {} -> {}, {} bytes",
            self.name,
            md_recvd_params.id,
            md_recvd_params.src_file_name,
            md_recvd_params.dest_file_name,
            md_recvd_params.file_size
        );
    }

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams) {
        debug!(
            "{}: file segment at offset {} with {} bytes received",
            self.name, segment_recvd_params.offset, segment_recvd_params.length
        );
    }

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode) {
        info!("{}: transaction {id} suspended: {condition_code:?}", self.name);
    }

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64) {
        info!("{}: transaction {id} resumed at {progress}", self.name);
    }

    fn fault_indication(&mut self, id: &TransactionId, condition_code: ConditionCode, progress: u64) {
        warn!(
            "{}: fault {condition_code:?} for transaction {id} at progress {progress}",
            self.name
        );
    }

    fn eof_recvd_indication(&mut self, id: &TransactionId) {
        info!("{}: EOF received for transaction {id}", self.name);
    }
}

type SimEngine =
    CfdpEngine<mpsc::Sender<PduOwnedWithInfo>, NativeFilestore, ExampleCfdpUser, StdTimerCreator>;

#[derive(Debug, thiserror::Error)]
pub enum UdpServerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
}

/// Connects one engine to the UDP socket. Received datagrams are passed to the engine and all
/// PDUs generated by the engine are sent to the remote address.
pub struct UdpServer {
    pub socket: UdpSocket,
    recv_buf: Vec<u8>,
    remote_addr: SocketAddr,
    engine: Arc<SimEngine>,
    tm_rx: mpsc::Receiver<PduOwnedWithInfo>,
}

impl UdpServer {
    pub fn new(
        addr: SocketAddr,
        remote_addr: SocketAddr,
        max_recv_size: usize,
        engine: Arc<SimEngine>,
        tm_rx: mpsc::Receiver<PduOwnedWithInfo>,
    ) -> Result<Self, io::Error> {
        let server = Self {
            socket: UdpSocket::bind(addr)?,
            recv_buf: vec![0; max_recv_size],
            remote_addr,
            engine,
            tm_rx,
        };
        server.socket.set_nonblocking(true)?;
        Ok(server)
    }

    /// Returns [true] if a datagram was received.
    pub fn try_recv_pdu(&mut self) -> Result<bool, UdpServerError> {
        let (len, _) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(res) => res,
            Err(e) => {
                return if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut {
                    Ok(false)
                } else {
                    Err(e.into())
                };
            }
        };
        let pdu = PduOwnedWithInfo::new_from_raw_packet(&self.recv_buf[..len])?;
        debug!(
            "received {:?} PDU with directive {:?}",
            pdu.pdu_type, pdu.file_directive_type
        );
        if let Err(e) = self.engine.insert_raw_pdu(&pdu.pdu) {
            warn!("processing received PDU failed: {e}");
        }
        Ok(true)
    }

    pub fn send_pending_pdus(&mut self) {
        while let Ok(pdu) = self.tm_rx.try_recv() {
            if let Err(e) = self.socket.send_to(&pdu.pdu, self.remote_addr) {
                warn!("sending PDU with UDP socket failed: {e}");
            }
        }
    }

    pub fn run(mut self) {
        while !KILL_APP.load(Ordering::Relaxed) {
            let mut idle = true;
            loop {
                match self.try_recv_pdu() {
                    Ok(true) => idle = false,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("UDP server error: {e}");
                        break;
                    }
                }
            }
            if let Err(e) = self.engine.handle_timers() {
                warn!("timer handling failed: {e}");
            }
            self.send_pending_pdus();
            if idle {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

fn create_engine(
    name: &'static str,
    own_id: UnsignedByteFieldU16,
    peer_id: UnsignedByteFieldU16,
    data_dir: PathBuf,
    pacing: Duration,
) -> (Arc<SimEngine>, mpsc::Receiver<PduOwnedWithInfo>) {
    let (tm_tx, tm_rx) = mpsc::channel();
    let mut local_cfg = LocalEntityConfig::new(own_id.into(), IndicationConfig::default());
    local_cfg.eof_settle_delay = Duration::from_millis(20);
    let mut remote_cfg =
        RemoteEntityConfig::new_with_default_values(peer_id.into(), 1024, true, ChecksumType::Crc32C);
    remote_cfg.file_data_pacing = pacing;
    remote_cfg.positive_ack_timer_interval = Duration::from_secs(1);
    remote_cfg.positive_ack_timer_expiration_limit = 5;
    remote_cfg.nak_timer_interval = Duration::from_secs(1);
    remote_cfg.nak_timer_expiration_limit = 10;
    let mut remote_cfgs = StdRemoteEntityConfigProvider::default();
    remote_cfgs.add_config(&remote_cfg);
    let engine = CfdpEngine::new(
        local_cfg,
        remote_cfgs,
        tm_tx,
        NativeFilestore,
        Arc::new(Mutex::new(ExampleCfdpUser::new(name))),
        StdTimerCreator,
        data_dir,
    );
    (Arc::new(engine), tm_rx)
}

fn spawn_server(
    name: &str,
    port: u16,
    remote_port: u16,
    engine: Arc<SimEngine>,
    tm_rx: mpsc::Receiver<PduOwnedWithInfo>,
) -> JoinHandle<()> {
    let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), remote_port);
    let server = UdpServer::new(local_addr, remote_addr, 2048, engine, tm_rx)
        .expect("creating UDP server failed");
    thread::Builder::new()
        .name(format!("{name} udp"))
        .spawn(move || server.run())
        .expect("spawning UDP server thread failed")
}

fn wait_for_transfer(engine: &SimEngine, id: &TransactionId) -> Option<TransferState> {
    let state = engine.wait_for_transfer(id, Duration::from_secs(120));
    info!("transaction {id} terminated with {state:?}");
    state
}

fn main() {
    let cli_args = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                std::thread::current().name().unwrap_or("unnamed"),
                record.level(),
                message
            ))
        })
        .level(
            cli_args
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let workdir = tempfile::tempdir().expect("creating temp directory failed");
    let ground_dir = workdir.path().join("ground");
    let spacecraft_dir = workdir.path().join("spacecraft");
    fs::create_dir_all(&ground_dir).expect("creating ground directory failed");

    let (source_file, data) = match &cli_args.file {
        Some(file) => (
            file.clone(),
            fs::read(file).expect("reading source file failed"),
        ),
        None => {
            let mut data = vec![0; cli_args.size];
            rand::thread_rng().fill_bytes(&mut data);
            let file = ground_dir.join("payload.bin");
            fs::write(&file, &data).expect("writing source file failed");
            (file, data)
        }
    };
    info!(
        "sending {:?} with {} bytes, file data drop rate {}",
        source_file,
        data.len(),
        cli_args.drop_rate
    );

    let pacing = Duration::from_millis(cli_args.pacing_ms);
    let (ground, ground_tm_rx) =
        create_engine("ground", GROUND_ID, SPACECRAFT_ID, ground_dir.clone(), pacing);
    let (spacecraft, spacecraft_tm_rx) = create_engine(
        "spacecraft",
        SPACECRAFT_ID,
        GROUND_ID,
        spacecraft_dir.clone(),
        pacing,
    );
    let injector = match cli_args.seed {
        Some(seed) => RandomDrop::new_with_seed(cli_args.drop_rate, cli_args.eof_drop_rate, seed),
        None => RandomDrop::new(cli_args.drop_rate, cli_args.eof_drop_rate),
    };
    spacecraft.set_fault_injector(Box::new(injector));

    let servers = [
        spawn_server(
            "ground",
            GROUND_PORT,
            SPACECRAFT_PORT,
            ground.clone(),
            ground_tm_rx,
        ),
        spawn_server(
            "spacecraft",
            SPACECRAFT_PORT,
            GROUND_PORT,
            spacecraft.clone(),
            spacecraft_tm_rx,
        ),
    ];

    let start = Instant::now();
    let request = PutRequest::new_regular_request(
        SPACECRAFT_ID,
        source_file.to_str().expect("invalid path string"),
        "uplinked.bin",
        None,
        None,
    )
    .expect("put request creation failed");
    let id = ground.put_request(request).expect("put request failed");
    let state = wait_for_transfer(&ground, &id);
    let received = fs::read(spacecraft_dir.join("uplinked.bin"));
    match received {
        Ok(received) if received == data => info!(
            "file transfer successful after {} ms",
            start.elapsed().as_millis()
        ),
        Ok(_) => warn!("received file differs from the source file"),
        Err(e) => warn!("reading received file failed: {e}"),
    }

    if cli_args.proxy && state == Some(TransferState::Completed) {
        let request = PutRequest::new_proxy_put_request(
            SPACECRAFT_ID,
            ProxyPutRequest::new(GROUND_ID, "uplinked.bin", "downlinked.bin"),
        )
        .expect("proxy put request creation failed");
        let proxy_id = ground.put_request(request).expect("put request failed");
        wait_for_transfer(&ground, &proxy_id);
        let downlinked = ground_dir.join("downlinked.bin");
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(120) {
            if fs::read(&downlinked).is_ok_and(|content| content == data) {
                info!("proxied file transfer successful");
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    KILL_APP.store(true, Ordering::Relaxed);
    for server in servers {
        server.join().expect("joining UDP server thread failed");
    }
}
