//! Operation codes and statuses shared by clients, the proxy, and storage
//! servers.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// OpCode
// ---------------------------------------------------------------------------

/// Operation carried by a [`Message`](crate::Message).
///
/// Values below `0x80` are client operations; values at or above `0x80` are
/// only ever sent from the proxy to a storage server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    #[default]
    Nop = 0,
    Create = 1,
    Get = 2,
    Update = 3,
    Set = 4,
    Destroy = 5,
    UdfGet = 6,
    UdfSet = 7,

    PrepareCreate = 0x81,
    Read = 0x82,
    PrepareUpdate = 0x83,
    PrepareSet = 0x84,
    PrepareDelete = 0x85,
    Delete = 0x86,
    Commit = 0xC1,
    Abort = 0xC2,
    Repair = 0xC3,
    MarkDelete = 0xC4,
}

impl OpCode {
    /// Client operations the proxy accepts.
    pub const CLIENT_OPS: [OpCode; 7] = [
        OpCode::Create,
        OpCode::Get,
        OpCode::Update,
        OpCode::Set,
        OpCode::Destroy,
        OpCode::UdfGet,
        OpCode::UdfSet,
    ];

    /// Whether this op may be sent to a storage server.
    pub fn is_for_storage(self) -> bool {
        (self as u8) >= 0x80
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Nop => "Nop",
            OpCode::Create => "Create",
            OpCode::Get => "Get",
            OpCode::Update => "Update",
            OpCode::Set => "Set",
            OpCode::Destroy => "Destroy",
            OpCode::UdfGet => "UDFGet",
            OpCode::UdfSet => "UDFSet",
            OpCode::PrepareCreate => "PrepareCreate",
            OpCode::Read => "Read",
            OpCode::PrepareUpdate => "PrepareUpdate",
            OpCode::PrepareSet => "PrepareSet",
            OpCode::PrepareDelete => "PrepareDelete",
            OpCode::Delete => "Delete",
            OpCode::Commit => "Commit",
            OpCode::Abort => "Abort",
            OpCode::Repair => "Repair",
            OpCode::MarkDelete => "MarkDelete",
        }
    }

    /// Compact name used in log lines.
    pub fn short_name(self) -> &'static str {
        match self {
            OpCode::Nop => "N",
            OpCode::Create | OpCode::Commit => "C",
            OpCode::Get => "G",
            OpCode::Update => "U",
            OpCode::Set => "S",
            OpCode::Destroy | OpCode::Delete => "D",
            OpCode::UdfGet => "UG",
            OpCode::UdfSet => "US",
            OpCode::PrepareCreate
            | OpCode::PrepareUpdate
            | OpCode::PrepareSet
            | OpCode::PrepareDelete => "P",
            OpCode::Read => "R",
            OpCode::Abort => "A",
            OpCode::Repair => "RR",
            OpCode::MarkDelete => "MD",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// OpStatus
// ---------------------------------------------------------------------------

/// Result status of an operation, in client replies and storage responses.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    #[default]
    NoError = 0,
    BadMsg = 1,
    ServiceDenied = 2,
    NoKey = 3,
    DupKey = 4,
    BadParam = 7,
    RecordLocked = 8,
    NoUncommitted = 10,
    NoStorageServer = 12,
    Busy = 14,
    Inserting = 15,
    AlreadyFulfilled = 17,
    VersionConflict = 19,
    SsError = 21,
    SsOutOfResource = 22,
    SsReadTtlExtendErr = 23,
    ReqProcTimeout = 24,
    CommitFailure = 25,
    Inconsistent = 26,
    KeyMarkedDelete = 27,
    NotSupported = 28,
    Internal = 255,
}

impl OpStatus {
    pub fn name(self) -> &'static str {
        match self {
            OpStatus::NoError => "Ok",
            OpStatus::BadMsg => "BadMsg",
            OpStatus::ServiceDenied => "ServiceDenied",
            OpStatus::NoKey => "NoKey",
            OpStatus::DupKey => "DupKey",
            OpStatus::BadParam => "BadParam",
            OpStatus::RecordLocked => "RecordLocked",
            OpStatus::NoUncommitted => "NoUncommitted",
            OpStatus::NoStorageServer => "NoStorageServer",
            OpStatus::Busy => "Busy",
            OpStatus::Inserting => "Inserting",
            OpStatus::AlreadyFulfilled => "AlreadyFulfilled",
            OpStatus::VersionConflict => "VersionConflict",
            OpStatus::SsError => "StorageServerErr",
            OpStatus::SsOutOfResource => "SSOutofResource",
            OpStatus::SsReadTtlExtendErr => "SSReadTTLExtendErr",
            OpStatus::ReqProcTimeout => "RequestProcTimeout",
            OpStatus::CommitFailure => "CommitFailure",
            OpStatus::Inconsistent => "InconsistentState",
            OpStatus::KeyMarkedDelete => "MarkedDelete",
            OpStatus::NotSupported => "OpNotSupported",
            OpStatus::Internal => "Internal",
        }
    }

    /// Compact name used in log lines and metric labels.
    pub fn short_name(self) -> &'static str {
        match self {
            OpStatus::NoError => "Ok",
            OpStatus::BadMsg => "BadMsg",
            OpStatus::ServiceDenied => "DoS",
            OpStatus::NoKey => "NoKey",
            OpStatus::DupKey => "DupKey",
            OpStatus::BadParam => "BadPar",
            OpStatus::RecordLocked => "RecLck",
            OpStatus::NoUncommitted => "NoUnc",
            OpStatus::NoStorageServer => "NoSS",
            OpStatus::Busy => "Busy",
            OpStatus::Inserting => "Insr",
            OpStatus::AlreadyFulfilled => "Done",
            OpStatus::VersionConflict => "CoV",
            OpStatus::SsError => "SSErr",
            OpStatus::SsOutOfResource => "SSNoRes",
            OpStatus::SsReadTtlExtendErr => "TTLErr",
            OpStatus::ReqProcTimeout => "Rtot",
            OpStatus::CommitFailure => "CmtF",
            OpStatus::Inconsistent => "InConst",
            OpStatus::KeyMarkedDelete => "MDel",
            OpStatus::NotSupported => "BadOp",
            OpStatus::Internal => "Intl",
        }
    }

    /// `NoError` or `AlreadyFulfilled`.
    pub fn is_ok(self) -> bool {
        matches!(self, OpStatus::NoError | OpStatus::AlreadyFulfilled)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
