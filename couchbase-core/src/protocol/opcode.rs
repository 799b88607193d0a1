//! Opcodes of the memcached binary protocol used by the client.

use std::fmt;

/// The command byte of a request or response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a document by key.
    Get = 0x00,
    /// Store a document unconditionally.
    Set = 0x01,
    /// Store a document only if the key does not exist.
    Add = 0x02,
    /// Store a document only if the key exists.
    Replace = 0x03,
    /// Remove a document.
    Delete = 0x04,
    /// Atomically add to a counter document.
    Increment = 0x05,
    /// Atomically subtract from a counter document.
    Decrement = 0x06,
    /// Liveness probe; also used to flush pipelines.
    NoOp = 0x0a,
    /// Fetch a document, echoing the key in the response.
    GetK = 0x0c,
    /// Append bytes to an existing value.
    Append = 0x0e,
    /// Prepend bytes to an existing value.
    Prepend = 0x0f,
    /// Update a document's expiry without touching the value.
    Touch = 0x1c,
    /// Fetch a document and update its expiry.
    GetAndTouch = 0x1d,
    /// Negotiate optional connection features.
    Hello = 0x1f,
    /// List the SASL mechanisms the server accepts.
    SaslList = 0x20,
    /// Begin SASL authentication.
    SaslAuth = 0x21,
    /// Continue a multi-step SASL exchange.
    SaslStep = 0x22,
    /// Bind the authenticated connection to a bucket.
    SelectBucket = 0x89,
    /// Query the persistence/replication sequence state of a partition.
    ObserveSeqno = 0x91,
    /// Query the keystate of documents.
    Observe = 0x92,
    /// Fetch a document and lock it against writes.
    GetLocked = 0x94,
    /// Fetch the current topology over the data channel (CCCP).
    GetClusterConfig = 0xb5,
    /// Read a subdocument path.
    SubdocGet = 0xc5,
    /// Test a subdocument path for existence.
    SubdocExists = 0xc6,
    /// Add a dictionary entry at a path; fails if the path exists.
    SubdocDictAdd = 0xc7,
    /// Insert or replace a dictionary entry at a path.
    SubdocDictUpsert = 0xc8,
    /// Delete the entry at a path.
    SubdocDelete = 0xc9,
    /// Replace the entry at a path; fails if the path is missing.
    SubdocReplace = 0xca,
    /// Push onto the end of an array.
    SubdocArrayPushLast = 0xcb,
    /// Push onto the front of an array.
    SubdocArrayPushFirst = 0xcc,
    /// Insert into an array at an index path.
    SubdocArrayInsert = 0xcd,
    /// Add to an array only if the value is not already present.
    SubdocArrayAddUnique = 0xce,
    /// Atomically add to a numeric subdocument path.
    SubdocCounter = 0xcf,
    /// Multiple subdocument reads against one document.
    MultiLookup = 0xd0,
    /// Multiple subdocument mutations against one document.
    MultiMutation = 0xd1,
    /// Fetch the server's error map document.
    GetErrorMap = 0xfe,
}

impl Opcode {
    /// Creates an `Opcode` from its wire value.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Get),
            0x01 => Some(Self::Set),
            0x02 => Some(Self::Add),
            0x03 => Some(Self::Replace),
            0x04 => Some(Self::Delete),
            0x05 => Some(Self::Increment),
            0x06 => Some(Self::Decrement),
            0x0a => Some(Self::NoOp),
            0x0c => Some(Self::GetK),
            0x0e => Some(Self::Append),
            0x0f => Some(Self::Prepend),
            0x1c => Some(Self::Touch),
            0x1d => Some(Self::GetAndTouch),
            0x1f => Some(Self::Hello),
            0x20 => Some(Self::SaslList),
            0x21 => Some(Self::SaslAuth),
            0x22 => Some(Self::SaslStep),
            0x89 => Some(Self::SelectBucket),
            0x91 => Some(Self::ObserveSeqno),
            0x92 => Some(Self::Observe),
            0x94 => Some(Self::GetLocked),
            0xb5 => Some(Self::GetClusterConfig),
            0xc5 => Some(Self::SubdocGet),
            0xc6 => Some(Self::SubdocExists),
            0xc7 => Some(Self::SubdocDictAdd),
            0xc8 => Some(Self::SubdocDictUpsert),
            0xc9 => Some(Self::SubdocDelete),
            0xca => Some(Self::SubdocReplace),
            0xcb => Some(Self::SubdocArrayPushLast),
            0xcc => Some(Self::SubdocArrayPushFirst),
            0xcd => Some(Self::SubdocArrayInsert),
            0xce => Some(Self::SubdocArrayAddUnique),
            0xcf => Some(Self::SubdocCounter),
            0xd0 => Some(Self::MultiLookup),
            0xd1 => Some(Self::MultiMutation),
            0xfe => Some(Self::GetErrorMap),
            _ => None,
        }
    }

    /// Returns the numeric wire value.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Returns `true` if this opcode changes document state.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Set
                | Self::Add
                | Self::Replace
                | Self::Delete
                | Self::Increment
                | Self::Decrement
                | Self::Append
                | Self::Prepend
                | Self::Touch
                | Self::SubdocDictAdd
                | Self::SubdocDictUpsert
                | Self::SubdocDelete
                | Self::SubdocReplace
                | Self::SubdocArrayPushLast
                | Self::SubdocArrayPushFirst
                | Self::SubdocArrayInsert
                | Self::SubdocArrayAddUnique
                | Self::SubdocCounter
                | Self::MultiMutation
        )
    }

    /// Returns `true` for the connection bring-up and control opcodes that
    /// are never routed by key.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::SaslList
                | Self::SaslAuth
                | Self::SaslStep
                | Self::SelectBucket
                | Self::GetClusterConfig
                | Self::GetErrorMap
                | Self::NoOp
        )
    }

    /// All opcodes the client can emit; used by encode/decode coverage tests.
    pub fn all() -> &'static [Opcode] {
        &[
            Self::Get,
            Self::Set,
            Self::Add,
            Self::Replace,
            Self::Delete,
            Self::Increment,
            Self::Decrement,
            Self::NoOp,
            Self::GetK,
            Self::Append,
            Self::Prepend,
            Self::Touch,
            Self::GetAndTouch,
            Self::Hello,
            Self::SaslList,
            Self::SaslAuth,
            Self::SaslStep,
            Self::SelectBucket,
            Self::ObserveSeqno,
            Self::Observe,
            Self::GetLocked,
            Self::GetClusterConfig,
            Self::SubdocGet,
            Self::SubdocExists,
            Self::SubdocDictAdd,
            Self::SubdocDictUpsert,
            Self::SubdocDelete,
            Self::SubdocReplace,
            Self::SubdocArrayPushLast,
            Self::SubdocArrayPushFirst,
            Self::SubdocArrayInsert,
            Self::SubdocArrayAddUnique,
            Self::SubdocCounter,
            Self::MultiLookup,
            Self::MultiMutation,
            Self::GetErrorMap,
        ]
    }
}

impl fmt::Display for Opcode {
    /// Opcodes display as their variant name; the wire value is available
    /// through [`Opcode::value`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
