//! Fault injection for inbound PDUs.
//!
//! The receiver consults a [FaultInjector] for every file data and EOF PDU which arrives while
//! no retransmission is active yet. This allows exercising the lost segment procedures without
//! a lossy link.
use alloc::vec::Vec;

use crate::TransactionId;

pub trait FaultInjector: Send {
    /// Returns [true] if the file data PDU with the given offset should be dropped.
    fn drop_file_data(&mut self, id: &TransactionId, offset: u64) -> bool;

    /// Returns [true] if the EOF PDU should be dropped.
    fn drop_eof(&mut self, _id: &TransactionId) -> bool {
        false
    }
}

/// Never drops anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn drop_file_data(&mut self, _id: &TransactionId, _offset: u64) -> bool {
        false
    }
}

/// Drops the first file data PDU for each of the configured offsets. Deterministic, so it is
/// well suited for tests.
#[derive(Debug, Default, Clone)]
pub struct DropFileDataOffsets {
    offsets: Vec<u64>,
}

impl DropFileDataOffsets {
    pub fn new(offsets: impl IntoIterator<Item = u64>) -> Self {
        Self {
            offsets: offsets.into_iter().collect(),
        }
    }

    /// Offsets which were not hit yet.
    pub fn remaining(&self) -> &[u64] {
        &self.offsets
    }
}

impl FaultInjector for DropFileDataOffsets {
    fn drop_file_data(&mut self, _id: &TransactionId, offset: u64) -> bool {
        if let Some(pos) = self.offsets.iter().position(|o| *o == offset) {
            self.offsets.swap_remove(pos);
            return true;
        }
        false
    }
}

#[cfg(feature = "sim")]
pub use sim::*;

#[cfg(feature = "sim")]
mod sim {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Drops file data and EOF PDUs randomly to simulate a lossy link.
    #[derive(Debug)]
    pub struct RandomDrop {
        file_data_drop_rate: f64,
        eof_drop_rate: f64,
        rng: StdRng,
    }

    impl RandomDrop {
        pub fn new(file_data_drop_rate: f64, eof_drop_rate: f64) -> Self {
            Self::new_with_rng(file_data_drop_rate, eof_drop_rate, StdRng::from_entropy())
        }

        pub fn new_with_seed(file_data_drop_rate: f64, eof_drop_rate: f64, seed: u64) -> Self {
            Self::new_with_rng(
                file_data_drop_rate,
                eof_drop_rate,
                StdRng::seed_from_u64(seed),
            )
        }

        fn new_with_rng(file_data_drop_rate: f64, eof_drop_rate: f64, rng: StdRng) -> Self {
            Self {
                file_data_drop_rate: file_data_drop_rate.clamp(0.0, 1.0),
                eof_drop_rate: eof_drop_rate.clamp(0.0, 1.0),
                rng,
            }
        }
    }

    impl FaultInjector for RandomDrop {
        fn drop_file_data(&mut self, id: &TransactionId, offset: u64) -> bool {
            let drop = self.rng.gen_bool(self.file_data_drop_rate);
            if drop {
                log::info!("transaction {id}: dropping file data PDU with offset {offset}");
            }
            drop
        }

        fn drop_eof(&mut self, id: &TransactionId) -> bool {
            let drop = self.rng.gen_bool(self.eof_drop_rate);
            if drop {
                log::info!("transaction {id}: dropping EOF PDU");
            }
            drop
        }
    }

}
