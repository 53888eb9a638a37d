//! # Put Request Module
//!
//! A [PutRequest] is the service primitive used by a CFDP user to start a new outbound
//! transaction as specified in chapter 3.4.1 of the CFDP standard.
use alloc::{string::String, vec::Vec};
use spacepackets::{
    cfdp::{tlv::FilestoreActionCode, ChecksumType, SegmentationControl, TransmissionMode},
    util::UnsignedByteField,
};

use crate::pdu::{
    metadata::MetadataPdu,
    msg_to_user::{MessageToUser, ProxyPutRequest},
    tlv::{FaultHandlerOverride, FilestoreRequest},
};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("file path with {0} bytes is too large, the maximum length is 255 bytes")]
pub struct FilePathTooLarge(pub usize);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PutRequestError {
    #[error(transparent)]
    FilePathTooLarge(#[from] FilePathTooLarge),
    #[error("transmission mode {0:?} is not supported")]
    UnsupportedTransmissionMode(TransmissionMode),
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    #[error("put request without a destination file name")]
    MissingDestFile,
    #[error("put request without a file and without messages to the user")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub destination_id: UnsignedByteField,
    source_file: Option<String>,
    dest_file: Option<String>,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
    pub seg_ctrl: Option<SegmentationControl>,
    pub msgs_to_user: Vec<MessageToUser>,
    pub fault_handler_overrides: Vec<FaultHandlerOverride>,
    pub flow_label: Option<Vec<u8>>,
    pub fs_requests: Vec<FilestoreRequest>,
}

impl PutRequest {
    /// Request to copy the file `source_file` to the remote entity `destination_id`, which
    /// stores it as `dest_file`.
    pub fn new_regular_request(
        dest_id: impl Into<UnsignedByteField>,
        source_file: &str,
        dest_file: &str,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(Some(source_file), Some(dest_file))?;
        Ok(Self {
            destination_id: dest_id.into(),
            source_file: Some(String::from(source_file)),
            dest_file: Some(String::from(dest_file)),
            trans_mode,
            closure_requested,
            seg_ctrl: None,
            msgs_to_user: Vec::new(),
            fault_handler_overrides: Vec::new(),
            flow_label: None,
            fs_requests: Vec::new(),
        })
    }

    /// Request which does not transfer a file, but only transports messages to the user.
    pub fn new_msgs_to_user_only(
        dest_id: impl Into<UnsignedByteField>,
        msgs_to_user: Vec<MessageToUser>,
    ) -> Self {
        Self {
            destination_id: dest_id.into(),
            source_file: None,
            dest_file: None,
            trans_mode: None,
            closure_requested: None,
            seg_ctrl: None,
            msgs_to_user,
            fault_handler_overrides: Vec::new(),
            flow_label: None,
            fs_requests: Vec::new(),
        }
    }

    /// Asks the remote entity `remote_id` to send its file to the entity named inside the
    /// [ProxyPutRequest].
    pub fn new_proxy_put_request(
        remote_id: impl Into<UnsignedByteField>,
        proxy_request: ProxyPutRequest,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(
            Some(&proxy_request.source_file_name),
            Some(&proxy_request.dest_file_name),
        )?;
        Ok(Self::new_msgs_to_user_only(
            remote_id,
            alloc::vec![MessageToUser::new_proxy_put_request(proxy_request)],
        ))
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    pub fn dest_file(&self) -> Option<&str> {
        self.dest_file.as_deref()
    }

    /// Whether no file is transferred.
    pub fn metadata_only(&self) -> bool {
        self.source_file.is_none()
    }

    /// Checks that the request only uses features supported by this implementation.
    pub fn validate(&self) -> Result<(), PutRequestError> {
        generic_path_checks(self.source_file(), self.dest_file())?;
        if let Some(TransmissionMode::Unacknowledged) = self.trans_mode {
            return Err(PutRequestError::UnsupportedTransmissionMode(
                TransmissionMode::Unacknowledged,
            ));
        }
        if self.closure_requested == Some(true) {
            return Err(PutRequestError::NotSupported("closure request"));
        }
        if !self.fault_handler_overrides.is_empty() {
            return Err(PutRequestError::NotSupported("fault handler override"));
        }
        if self
            .fs_requests
            .iter()
            .any(|req| req.action_code != FilestoreActionCode::CreateFile)
        {
            return Err(PutRequestError::NotSupported(
                "filestore request other than create file",
            ));
        }
        if self.source_file.is_some() && self.dest_file.is_none() {
            return Err(PutRequestError::MissingDestFile);
        }
        if self.source_file.is_none() && self.msgs_to_user.is_empty() {
            return Err(PutRequestError::Empty);
        }
        Ok(())
    }

    /// Builds the Metadata PDU which opens the transaction. File transfers always carry a
    /// create file filestore request for the destination file.
    pub fn build_metadata(&self, file_size: u64, checksum_type: ChecksumType) -> MetadataPdu {
        let mut metadata = match (&self.source_file, &self.dest_file) {
            (Some(source_file), Some(dest_file)) => {
                let mut metadata =
                    MetadataPdu::new(file_size, source_file.clone(), dest_file.clone());
                metadata.checksum_type = checksum_type;
                metadata.filestore_requests = self.fs_requests.clone();
                let has_create_request = metadata.filestore_requests.iter().any(|req| {
                    req.action_code == FilestoreActionCode::CreateFile
                        && req.first_name == *dest_file
                });
                if !has_create_request {
                    metadata
                        .filestore_requests
                        .push(FilestoreRequest::new_create_file(dest_file.clone()));
                }
                metadata
            }
            _ => MetadataPdu::new_msgs_to_user_only(Vec::new()),
        };
        if let Some(seg_ctrl) = self.seg_ctrl {
            metadata.seg_ctrl = seg_ctrl;
        }
        metadata.msgs_to_user = self.msgs_to_user.clone();
        metadata.flow_label = self.flow_label.clone();
        metadata
    }
}

pub fn generic_path_checks(
    source_file: Option<&str>,
    dest_file: Option<&str>,
) -> Result<(), FilePathTooLarge> {
    if let Some(src_file) = source_file {
        if src_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(src_file.len()));
        }
    }
    if let Some(dest_file) = dest_file {
        if dest_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(dest_file.len()));
        }
    }
    Ok(())
}
