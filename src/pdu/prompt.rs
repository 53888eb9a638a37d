use alloc::vec::Vec;
use spacepackets::cfdp::pdu::{CommonPduConfig, FileDirectiveType};

use super::{check_len, encode_directive, PduError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PromptResponse {
    Nak = 0,
    KeepAlive = 1,
}

/// Prompt PDU which asks the receiver for a NAK or a Keep Alive PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptPdu {
    pub response_required: PromptResponse,
}

impl PromptPdu {
    pub fn new(response_required: PromptResponse) -> Self {
        Self { response_required }
    }

    pub(crate) fn to_vec(&self, conf: CommonPduConfig) -> Result<Vec<u8>, PduError> {
        encode_directive(
            conf,
            FileDirectiveType::PromptPdu,
            &[(self.response_required as u8) << 7],
        )
    }

    pub(crate) fn from_params(params: &[u8]) -> Result<Self, PduError> {
        check_len(params, 1)?;
        let response_required = if params[0] >> 7 == 0 {
            PromptResponse::Nak
        } else {
            PromptResponse::KeepAlive
        };
        Ok(Self { response_required })
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::cfdp::{CrcFlag, Direction};

    use super::*;
    use crate::{
        pdu::{Pdu, PduConfigExt},
        tests::generic_pdu_conf,
    };

    #[test]
    fn test_prompt() {
        let conf = generic_pdu_conf();
        let pdu = Pdu::new(conf, PromptPdu::new(PromptResponse::KeepAlive));
        let raw = pdu.to_vec().unwrap();
        assert_eq!(&raw[conf.header_len()..], &[0x09, 0x80]);
        assert_eq!(Pdu::from_bytes(&raw).unwrap(), pdu);
    }

    #[test]
    fn test_prompt_with_crc() {
        let mut conf = generic_pdu_conf().for_reply();
        conf.crc_flag = CrcFlag::WithCrc;
        let pdu = Pdu::new(conf, PromptPdu::new(PromptResponse::Nak));
        assert_eq!(pdu.conf().direction, Direction::TowardsReceiver);
        let raw = pdu.to_vec().unwrap();
        assert_eq!(raw.len(), conf.header_len() + 4);
        assert_eq!(Pdu::from_bytes(&raw).unwrap(), pdu);
    }

    #[test]
    fn test_missing_response_field() {
        assert!(PromptPdu::from_params(&[]).is_err());
    }
}
