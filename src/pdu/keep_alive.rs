use alloc::vec::Vec;
use spacepackets::cfdp::pdu::{CommonPduConfig, FileDirectiveType};

use super::{check_len, encode_directive, fss_len, read_fss, write_fss, PduError};

/// Keep Alive PDU which reports the reception progress of the file receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlivePdu {
    pub progress: u64,
}

impl KeepAlivePdu {
    pub fn new(progress: u64) -> Self {
        Self { progress }
    }

    pub(crate) fn to_vec(&self, conf: CommonPduConfig) -> Result<Vec<u8>, PduError> {
        let mut params = Vec::with_capacity(fss_len(conf.file_flag));
        write_fss(&mut params, conf.file_flag, self.progress)?;
        encode_directive(conf, FileDirectiveType::KeepAlivePdu, &params)
    }

    pub(crate) fn from_params(conf: &CommonPduConfig, params: &[u8]) -> Result<Self, PduError> {
        check_len(params, fss_len(conf.file_flag))?;
        Ok(Self {
            progress: read_fss(conf.file_flag, params),
        })
    }
}
