//! This crate contains a CCSDS File Delivery Protocol (CFDP) transaction engine for ground segment
//! file transfers as specified in CCSDS 727.0-B-5.
//!
//! CFDP converts files of any size into a stream of packet data units (PDU) which are exchanged
//! between two CFDP entities over an unreliable, possibly half-duplex link. This crate implements
//! the acknowledged transmission mode, which includes lost segment detection with NAK driven
//! retransmission and positive acknowledgement procedures for the EOF and Finished PDUs. As such,
//! it can be compared to a specialized TCP for file transfers with remote systems.
//!
//! The crate is split into the following components:
//!
//! * [pdu]: Binary codec for all PDUs, including the TLV options and the reserved CFDP messages
//!   used for the Proxy Put procedure.
//! * [segments]: Reassembly buffer which tracks the received byte ranges of a file and computes
//!   the missing ranges which need to be requested with a NAK PDU.
//! * [dest::DestinationHandler]: Receiver side transaction state machine.
//! * [source::SourceTransaction]: Sender side transaction state machine, driven by one thread
//!   per outbound transfer.
//! * [engine::CfdpEngine]: Owns the configuration, the transaction registries and routes
//!   inbound PDUs to the correct state machine.
//!
//! The engine does not do any I/O on its own. Outbound PDUs are passed to a user supplied
//! [PduSender], inbound PDUs are passed to [engine::CfdpEngine::insert_raw_pdu].
//!
//! # Examples
//!
//! The [end-to-end test](https://egit.irs.uni-stuttgart.de/rust/cfdp/src/branch/main/tests/end-to-end.rs)
//! spawns two engines connected by message queues and performs file copy operations, including
//! transfers with injected packet loss and a Proxy Put operation. You can run it with printout
//! to the standard console by running:
//!
//! ```sh
//! cargo test --test end-to-end -- --nocapture
//! ```
//!
//! The UDP simulation demo inside the `demos` folder runs two entities over a UDP loopback link
//! with random packet loss:
//!
//! ```sh
//! cargo run --example udp-sim --features sim -- --help
//! ```
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "std")]
pub mod dest;
#[cfg(feature = "std")]
pub mod engine;
#[cfg(feature = "alloc")]
pub mod fault;
#[cfg(feature = "alloc")]
pub mod filestore;
#[cfg(feature = "alloc")]
pub mod pdu;
#[cfg(feature = "std")]
pub mod registry;
#[cfg(feature = "alloc")]
pub mod request;
#[cfg(feature = "alloc")]
pub mod segments;
#[cfg(feature = "std")]
pub mod source;
#[cfg(feature = "std")]
pub mod user;

use core::{fmt::Debug, hash::Hash, time::Duration};
use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISCSI, CRC_32_ISO_HDLC};
#[cfg(feature = "std")]
use hashbrown::HashMap;

#[cfg(feature = "alloc")]
pub use alloc_mod::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::{
    cfdp::{ChecksumType, ConditionCode, PduType},
    cfdp::pdu::FileDirectiveType,
    util::{UnsignedByteField, UnsignedEnum},
};
#[cfg(feature = "std")]
pub use std_mod::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimerContext {
    NakActivity { expiry_time: Duration },
    PositiveAck { expiry_time: Duration },
}

/// Countdown timer polled by the transaction state machines. Outbound transactions move their
/// timers into a dedicated thread.
pub trait CountdownProvider: Debug + Send {
    fn has_expired(&self) -> bool;
    fn reset(&mut self);
}

/// A generic trait which allows CFDP entities to create the countdown timers required by the
/// acknowledged transmission mode.
///
/// This allows the creation of different timers depending on context and purpose of the timer,
/// the runtime environment (e.g. standard clock timer vs. timer using a RTC) or other factors.
/// Tests use it to control timer expiry deterministically.
///
/// The countdown timer is used by 2 mechanisms of the CFDP protocol.
///
/// ## 1. NAK activity limit
///
/// The timer will be used to perform the NAK activity check as specified in 4.6.4.7 of the CFDP
/// standard. The expiration period will be provided by the NAK timer interval of the remote
/// entity configuration.
///
/// ## 2. Positive ACK procedures
///
/// The timer will be used to perform the Positive Acknowledgement Procedures as specified in
/// 4.7.1 of the CFDP standard. The expiration period will be provided by the Positive ACK timer
/// interval of the remote entity configuration.
pub trait TimerCreatorProvider {
    type Countdown: CountdownProvider;

    fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown;
}

/// This structure models the remote entity configuration information as specified in chapter 8.3
/// of the CFDP standard.
///
/// Some of the fields which were not considered necessary for the acknowledged-only
/// implementation were omitted. Some other fields which are not contained inside the standard but
/// are required by this implementation are included.
///
/// ## Notes on Positive Acknowledgment Procedures
///
/// The `positive_ack_timer_interval` and `positive_ack_timer_expiration_limit` will be used for
/// positive acknowledgement procedures as specified in CFDP chapter 4.7. The sending entity will
/// start the timer after sending the EOF PDU, and the receiving entity will start the timer after
/// sending the Finished PDU. Once the expected ACK response has not been received for that
/// interval, the PDU is re-sent and a counter is incremented. Once the counter reaches the
/// `positive_ack_timer_expiration_limit`, a Positive ACK Limit Reached fault will be declared.
///
/// ## Notes on Deferred Lost Segment Procedures
///
/// This procedure will be active if an EOF (No Error) PDU is received for an incomplete file.
/// After issuing the NAK sequence, a timer will be started. The timer is reset when missing
/// segments are received. If the timer expires, a new NAK sequence will be issued and a counter
/// will be incremented, which can lead to a NAK Limit Reached fault being declared.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity. Its width also determines the width of the
///   entity IDs inside all PDU headers exchanged with this entity.
/// * `seq_num_width` - Width of the transaction sequence number in bytes for transfers to this
///   entity. Defaults to 2.
/// * `max_packet_len` - This determines the maximum size of all PDUs generated for that remote
///   entity in addition to the `max_file_segment_len` attribute which also determines the size
///   of file data PDUs.
/// * `max_file_segment_len` The maximum file segment length which determines the maximum size
///   of file data PDUs in addition to the `max_packet_len` attribute. If this field is set
///   to None, the maximum file segment length will be derived from the maximum packet length.
///   If this has some value which is smaller than the segment value derived from
///   `max_packet_len`, this value will be picked.
/// * `crc_on_transmission_by_default` - Whether a CRC is appended to all PDUs sent to this
///   entity.
/// * `default_crc_type` - Default checksum type used to calculate for all file transmissions to
///   this remote entity.
/// * `file_data_pacing` - Delay between two consecutive file data PDUs. Defaults to 500 ms.
/// * `positive_ack_timer_interval`- See the notes on the Positive Acknowledgment
///   Procedures inside the class documentation. Defaults to 10 seconds.
/// * `positive_ack_timer_expiration_limit` - See the notes on the Positive Acknowledgment
///   Procedures inside the class documentation. Defaults to 2, so the timer may expire twice.
/// * `nak_timer_interval` -  See the notes on the Deferred Lost Segment Procedure inside
///   the class documentation. Defaults to 10 seconds.
/// * `nak_timer_expiration_limit` - See the notes on the Deferred Lost Segment Procedure inside
///   the class documentation. Defaults to 2, so the timer may expire two times.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub seq_num_width: usize,
    pub max_packet_len: usize,
    pub max_file_segment_len: Option<usize>,
    pub crc_on_transmission_by_default: bool,
    pub default_crc_type: ChecksumType,
    pub file_data_pacing: Duration,
    pub positive_ack_timer_interval: Duration,
    pub positive_ack_timer_expiration_limit: u32,
    pub nak_timer_interval: Duration,
    pub nak_timer_expiration_limit: u32,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_packet_len: usize,
        crc_on_transmission_by_default: bool,
        default_crc_type: ChecksumType,
    ) -> Self {
        Self {
            entity_id,
            seq_num_width: 2,
            max_packet_len,
            max_file_segment_len: None,
            crc_on_transmission_by_default,
            default_crc_type,
            file_data_pacing: Duration::from_millis(500),
            positive_ack_timer_interval: Duration::from_secs(10),
            positive_ack_timer_expiration_limit: 2,
            nak_timer_interval: Duration::from_secs(10),
            nak_timer_expiration_limit: 2,
        }
    }
}

pub trait RemoteEntityConfigProvider {
    /// Retrieve the remote entity configuration for the given remote ID.
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;
    /// Add a new remote configuration. Return [true] if the configuration was
    /// inserted successfully, and [false] if a configuration already existed and was replaced.
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool;
}

/// This is a thin wrapper around a [HashMap] to store remote entity configurations.
#[cfg(feature = "std")]
#[derive(Default, Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StdRemoteEntityConfigProvider(pub HashMap<u64, RemoteEntityConfig>);

#[cfg(feature = "std")]
impl RemoteEntityConfigProvider for StdRemoteEntityConfigProvider {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        self.0.insert(cfg.entity_id.value(), *cfg).is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
        }
    }
}

/// Each CFDP engine has a [LocalEntityConfig]uration.
///
/// * `eof_settle_delay` - Delay between acknowledging an EOF PDU and checking the file for
///   completeness. File data PDUs which were overtaken by the EOF PDU can still arrive during
///   this time. Defaults to zero.
/// * `checksum_failure_is_fault` - If set, a file checksum mismatch fails the transaction with
///   [ConditionCode::FileChecksumFailure]. Otherwise, the mismatch is only logged and the file is
///   retained. Defaults to [false].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalEntityConfig {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub eof_settle_delay: Duration,
    pub checksum_failure_is_fault: bool,
    /// Metadata PDUs announcing a larger file are rejected.
    pub max_file_size: u64,
}

impl LocalEntityConfig {
    pub fn new(id: UnsignedByteField, indication_cfg: IndicationConfig) -> Self {
        Self {
            id,
            indication_cfg,
            eof_settle_delay: Duration::ZERO,
            checksum_failure_is_fault: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Reason stored inside the terminal failed state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FailureReason {
    /// The sender reported a fault inside the EOF PDU.
    EofFault(ConditionCode),
    /// The receiver reported a fault inside the Finished PDU.
    FinishedFault(ConditionCode),
    FilestoreRejection,
    FileChecksumFailure,
    NakLimitReached,
    PositiveAckLimitReached,
    Cancelled,
    /// The transaction was abandoned because of a local error, for example a broken link to the
    /// PDU sink.
    Abandoned,
}

impl FailureReason {
    /// Condition code which is reported to the peer entity and the user for this failure.
    pub fn condition_code(&self) -> ConditionCode {
        match self {
            FailureReason::EofFault(cond) | FailureReason::FinishedFault(cond) => *cond,
            FailureReason::FilestoreRejection => ConditionCode::FilestoreRejection,
            FailureReason::FileChecksumFailure => ConditionCode::FileChecksumFailure,
            FailureReason::NakLimitReached => ConditionCode::NakLimitReached,
            FailureReason::PositiveAckLimitReached => ConditionCode::PositiveAckLimitReached,
            FailureReason::Cancelled | FailureReason::Abandoned => {
                ConditionCode::CancelRequestReceived
            }
        }
    }
}

/// Generic error type for sending a PDU via a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
}

/// Generic trait to send raw PDUs to a remote entity. All PDUs generated by the engine are passed
/// to an implementation of this trait, which usually forwards them to the transport layer.
pub trait PduSender {
    fn send_pdu(
        &self,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;
}

#[cfg(feature = "std")]
pub mod std_mod {
    use std::sync::mpsc;

    use super::*;

    impl PduSender for mpsc::Sender<PduOwnedWithInfo> {
        fn send_pdu(
            &self,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.send(PduOwnedWithInfo::new(
                pdu_type,
                file_directive_type,
                raw_pdu.to_vec(),
            ))
            .map_err(|_| GenericSendError::RxDisconnected)?;
            Ok(())
        }
    }

    /// Simple implementation of the [CountdownProvider] trait assuming a standard runtime.
    #[derive(Debug)]
    pub struct StdCountdown {
        expiry_time: Duration,
        start_time: std::time::Instant,
    }

    impl StdCountdown {
        pub fn new(expiry_time: Duration) -> Self {
            Self {
                expiry_time,
                start_time: std::time::Instant::now(),
            }
        }

        pub fn expiry_time_seconds(&self) -> u64 {
            self.expiry_time.as_secs()
        }
    }

    impl CountdownProvider for StdCountdown {
        fn has_expired(&self) -> bool {
            if self.start_time.elapsed() > self.expiry_time {
                return true;
            }
            false
        }

        fn reset(&mut self) {
            self.start_time = std::time::Instant::now();
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct StdTimerCreator;

    impl TimerCreatorProvider for StdTimerCreator {
        type Countdown = StdCountdown;

        fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown {
            match timer_context {
                TimerContext::NakActivity { expiry_time } => StdCountdown::new(expiry_time),
                TimerContext::PositiveAck { expiry_time } => StdCountdown::new(expiry_time),
            }
        }
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the sequence
/// number of that transfer which is also determined by the CFDP source entity.
///
/// Only the values of the two fields are compared and hashed, so the same transaction is found
/// even if the field widths differ.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.source_id.value(), self.seq_num.value())
    }
}

/// Default upper bound for the size of a reassembled inbound file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
/// CRC-16/CCITT-FALSE which protects a PDU if the CRC flag of the PDU header is set.
pub const CRC_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

#[cfg(feature = "alloc")]
pub mod alloc_mod {
    use spacepackets::{
        cfdp::{
            pdu::{FileDirectiveType, PduError as CodecError},
            PduType,
        },
        ByteConversionError,
    };

    use crate::{
        pdu::{Pdu, PduError, PduHeader, PduPayload},
        PacketTarget,
    };

    /// Determine whether a PDU is addressed to the file sender (source entity) or to the file
    /// receiver (destination entity), following the PDU forwarding procedure of section 4.5 of
    /// the CFDP standard.
    pub fn determine_packet_target(pdu: &Pdu) -> PacketTarget {
        match pdu.payload() {
            // Section c) of 4.5.3: These PDUs should always be targeted towards the file sender
            PduPayload::Nak(_) | PduPayload::Finished(_) | PduPayload::KeepAlive(_) => {
                PacketTarget::SourceEntity
            }
            // Section b) of 4.5.3: These PDUs should always be targeted towards the file receiver
            PduPayload::Metadata(_)
            | PduPayload::FileData(_)
            | PduPayload::Eof(_)
            | PduPayload::Prompt(_) => PacketTarget::DestEntity,
            // Section a): Recipient depends of the type of PDU that is being acknowledged.
            PduPayload::Ack(ack) => {
                if ack.acked_directive() == FileDirectiveType::EofPdu {
                    PacketTarget::SourceEntity
                } else {
                    PacketTarget::DestEntity
                }
            }
        }
    }

    /// Owned raw PDU with some additional context information which is useful for routing
    /// and logging without decoding the full PDU.
    #[derive(Debug, PartialEq, Eq, Clone)]
    pub struct PduOwnedWithInfo {
        pub pdu_type: PduType,
        pub file_directive_type: Option<FileDirectiveType>,
        pub pdu: alloc::vec::Vec<u8>,
    }

    impl PduOwnedWithInfo {
        pub fn new_from_raw_packet(raw_packet: &[u8]) -> Result<Self, PduError> {
            let (header, header_len) = PduHeader::from_bytes(raw_packet)?;
            let pdu_len = header.pdu_len();
            if raw_packet.len() < pdu_len {
                return Err(ByteConversionError::FromSliceTooSmall {
                    found: raw_packet.len(),
                    expected: pdu_len,
                }
                .into());
            }
            let file_directive_type = if header.pdu_type() == PduType::FileDirective {
                let code = *raw_packet[..pdu_len]
                    .get(header_len)
                    .ok_or(PduError::Malformed("file directive code missing"))?;
                Some(FileDirectiveType::try_from(code).map_err(|_| {
                    CodecError::InvalidDirectiveType {
                        found: code,
                        expected: None,
                    }
                })?)
            } else {
                None
            };
            Ok(Self::new(
                header.pdu_type(),
                file_directive_type,
                raw_packet[..pdu_len].to_vec(),
            ))
        }

        pub fn new(
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            pdu: alloc::vec::Vec<u8>,
        ) -> Self {
            Self {
                pdu_type,
                file_directive_type,
                pdu,
            }
        }

        /// Decode the full PDU.
        pub fn decode(&self) -> Result<Pdu, PduError> {
            Pdu::from_bytes(&self.pdu)
        }

        pub fn packet_target(&self) -> Result<PacketTarget, PduError> {
            Ok(determine_packet_target(&self.decode()?))
        }
    }
}
