//! Request frame builders for the key/value operations.
//!
//! Builders fill in opcode, extras, key and value; the partition id and
//! opaque are stamped later, at dispatch time.

use bytes::{BufMut, Bytes, BytesMut};

use couchbase_core::protocol::Opcode;
use couchbase_core::OperationFrame;

/// Subdocument flag: create intermediate path components.
const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;
/// Subdocument flag: operate on extended attributes.
const SUBDOC_FLAG_XATTR: u8 = 0x04;

/// Builds a plain fetch.
pub(crate) fn get(key: &[u8]) -> OperationFrame {
    OperationFrame::request(Opcode::Get, 0).with_key(Bytes::copy_from_slice(key))
}

/// Builds a fetch that echoes the key.
pub(crate) fn get_k(key: &[u8]) -> OperationFrame {
    OperationFrame::request(Opcode::GetK, 0).with_key(Bytes::copy_from_slice(key))
}

/// Builds a fetch that also bumps the expiry.
pub(crate) fn get_and_touch(key: &[u8], expiry: u32) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(expiry);
    OperationFrame::request(Opcode::GetAndTouch, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
}

/// Builds a fetch that locks the document for `lock_time` seconds.
pub(crate) fn get_and_lock(key: &[u8], lock_time: u32) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(lock_time);
    OperationFrame::request(Opcode::GetLocked, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
}

/// Builds a store (`Set`, `Add` or `Replace`).
pub(crate) fn store(
    opcode: Opcode,
    key: &[u8],
    value: Bytes,
    flags: u32,
    expiry: u32,
    cas: u64,
) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(flags);
    extras.put_u32(expiry);
    OperationFrame::request(opcode, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
        .with_value(value)
        .with_cas(cas)
}

/// Builds a delete.
pub(crate) fn delete(key: &[u8], cas: u64) -> OperationFrame {
    OperationFrame::request(Opcode::Delete, 0)
        .with_key(Bytes::copy_from_slice(key))
        .with_cas(cas)
}

/// Builds an `Increment` or `Decrement`.
pub(crate) fn arithmetic(
    opcode: Opcode,
    key: &[u8],
    delta: u64,
    initial: u64,
    expiry: u32,
) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    extras.put_u64(initial);
    extras.put_u32(expiry);
    OperationFrame::request(opcode, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
}

/// Builds an `Append` or `Prepend`.
pub(crate) fn concat(opcode: Opcode, key: &[u8], value: Bytes, cas: u64) -> OperationFrame {
    OperationFrame::request(opcode, 0)
        .with_key(Bytes::copy_from_slice(key))
        .with_value(value)
        .with_cas(cas)
}

/// Builds a `Touch`.
pub(crate) fn touch(key: &[u8], expiry: u32) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(expiry);
    OperationFrame::request(Opcode::Touch, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
}

/// Builds an `Observe` for one key in one partition.
///
/// The keys under observation travel in the body as
/// `partition(2) | key_length(2) | key`.
pub(crate) fn observe(partition: u16, key: &[u8]) -> OperationFrame {
    let mut value = BytesMut::with_capacity(4 + key.len());
    value.put_u16(partition);
    value.put_u16(key.len() as u16);
    value.put_slice(key);
    OperationFrame::request(Opcode::Observe, 0).with_value(value.freeze())
}

/// Builds an `ObserveSeqno` for a partition's current UUID.
pub(crate) fn observe_seqno(partition_uuid: u64) -> OperationFrame {
    let mut value = BytesMut::with_capacity(8);
    value.put_u64(partition_uuid);
    OperationFrame::request(Opcode::ObserveSeqno, 0).with_value(value.freeze())
}

/// Builds a `NoOp`.
pub(crate) fn noop() -> OperationFrame {
    OperationFrame::request(Opcode::NoOp, 0)
}

/// One path read inside a subdocument lookup.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    opcode: Opcode,
    path: String,
    xattr: bool,
}

impl LookupInSpec {
    /// Reads the value at a path.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            opcode: Opcode::SubdocGet,
            path: path.into(),
            xattr: false,
        }
    }

    /// Tests a path for existence.
    pub fn exists(path: impl Into<String>) -> Self {
        Self {
            opcode: Opcode::SubdocExists,
            path: path.into(),
            xattr: false,
        }
    }

    /// Targets the document's extended attributes.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    fn flags(&self) -> u8 {
        if self.xattr {
            SUBDOC_FLAG_XATTR
        } else {
            0
        }
    }
}

/// One path mutation inside a subdocument mutation.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    opcode: Opcode,
    path: String,
    value: Bytes,
    create_path: bool,
    xattr: bool,
}

impl MutateInSpec {
    fn new(opcode: Opcode, path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            path: path.into(),
            value: value.into(),
            create_path: false,
            xattr: false,
        }
    }

    /// Adds a dictionary entry; fails if the path exists.
    pub fn dict_add(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocDictAdd, path, value)
    }

    /// Inserts or replaces a dictionary entry.
    pub fn dict_upsert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocDictUpsert, path, value)
    }

    /// Deletes the entry at a path.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Opcode::SubdocDelete, path, Bytes::new())
    }

    /// Replaces the entry at a path; fails if the path is missing.
    pub fn replace(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocReplace, path, value)
    }

    /// Pushes onto the front of an array.
    pub fn array_push_first(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocArrayPushFirst, path, value)
    }

    /// Pushes onto the end of an array.
    pub fn array_push_last(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocArrayPushLast, path, value)
    }

    /// Inserts into an array at an index path.
    pub fn array_insert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocArrayInsert, path, value)
    }

    /// Adds to an array only if the value is not already present.
    pub fn array_add_unique(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Opcode::SubdocArrayAddUnique, path, value)
    }

    /// Atomically adds to a numeric path.
    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self::new(
            Opcode::SubdocCounter,
            path,
            delta.to_string().into_bytes(),
        )
    }

    /// Creates missing intermediate path components.
    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }

    /// Targets the document's extended attributes.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.create_path {
            flags |= SUBDOC_FLAG_MKDIR_P;
        }
        if self.xattr {
            flags |= SUBDOC_FLAG_XATTR;
        }
        flags
    }
}

/// Builds a single-path subdocument lookup.
pub(crate) fn subdoc_lookup(key: &[u8], spec: &LookupInSpec) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(3);
    extras.put_u16(spec.path.len() as u16);
    extras.put_u8(spec.flags());
    OperationFrame::request(spec.opcode, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
        .with_value(Bytes::copy_from_slice(spec.path.as_bytes()))
}

/// Builds a single-path subdocument mutation.
pub(crate) fn subdoc_mutate(key: &[u8], spec: &MutateInSpec, expiry: u32, cas: u64) -> OperationFrame {
    let mut extras = BytesMut::with_capacity(7);
    extras.put_u16(spec.path.len() as u16);
    extras.put_u8(spec.flags());
    if expiry != 0 {
        extras.put_u32(expiry);
    }

    let mut value = BytesMut::with_capacity(spec.path.len() + spec.value.len());
    value.put_slice(spec.path.as_bytes());
    value.put_slice(&spec.value);

    OperationFrame::request(spec.opcode, 0)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key))
        .with_value(value.freeze())
        .with_cas(cas)
}

/// Builds a `MultiLookup`: each spec is
/// `opcode(1) | flags(1) | path_length(2) | path`.
pub(crate) fn multi_lookup(key: &[u8], specs: &[LookupInSpec]) -> OperationFrame {
    let mut value = BytesMut::new();
    for spec in specs {
        value.put_u8(spec.opcode.value());
        value.put_u8(spec.flags());
        value.put_u16(spec.path.len() as u16);
        value.put_slice(spec.path.as_bytes());
    }
    OperationFrame::request(Opcode::MultiLookup, 0)
        .with_key(Bytes::copy_from_slice(key))
        .with_value(value.freeze())
}

/// Builds a `MultiMutation`: each spec is
/// `opcode(1) | flags(1) | path_length(2) | value_length(4) | path | value`.
pub(crate) fn multi_mutation(
    key: &[u8],
    specs: &[MutateInSpec],
    expiry: u32,
    cas: u64,
) -> OperationFrame {
    let mut value = BytesMut::new();
    for spec in specs {
        value.put_u8(spec.opcode.value());
        value.put_u8(spec.flags());
        value.put_u16(spec.path.len() as u16);
        value.put_u32(spec.value.len() as u32);
        value.put_slice(spec.path.as_bytes());
        value.put_slice(&spec.value);
    }

    let mut frame = OperationFrame::request(Opcode::MultiMutation, 0)
        .with_key(Bytes::copy_from_slice(key))
        .with_value(value.freeze())
        .with_cas(cas);
    if expiry != 0 {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry);
        frame = frame.with_extras(extras.freeze());
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_extras_layout() {
        let frame = store(Opcode::Set, b"k", Bytes::from_static(b"v"), 0x01020304, 60, 0);
        assert_eq!(frame.opcode, Opcode::Set);
        assert_eq!(&frame.extras[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&frame.extras[4..], &[0, 0, 0, 60]);
        assert_eq!(frame.key, Bytes::from_static(b"k"));
        assert_eq!(frame.value, Bytes::from_static(b"v"));
    }

    #[test]
    fn test_arithmetic_extras_layout() {
        let frame = arithmetic(Opcode::Increment, b"counter", 2, 10, 0);
        assert_eq!(frame.extras.len(), 20);
        assert_eq!(&frame.extras[..8], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&frame.extras[8..16], &[0, 0, 0, 0, 0, 0, 0, 10]);
    }

    #[test]
    fn test_get_has_no_extras() {
        let frame = get(b"k");
        assert!(frame.extras.is_empty());
        assert!(frame.value.is_empty());
    }

    #[test]
    fn test_touch_expiry() {
        let frame = touch(b"k", 300);
        assert_eq!(&frame.extras[..], &[0, 0, 1, 44]);
    }

    #[test]
    fn test_observe_value_layout() {
        let frame = observe(513, b"doc");
        assert_eq!(&frame.value[..2], &[0x02, 0x01]);
        assert_eq!(&frame.value[2..4], &[0x00, 0x03]);
        assert_eq!(&frame.value[4..], b"doc");
        assert!(frame.key.is_empty());
    }

    #[test]
    fn test_delete_carries_cas() {
        let frame = delete(b"k", 99);
        assert_eq!(frame.opcode, Opcode::Delete);
        assert_eq!(frame.cas, 99);
    }

    #[test]
    fn test_subdoc_lookup_layout() {
        let spec = LookupInSpec::get("address.city");
        let frame = subdoc_lookup(b"doc", &spec);
        assert_eq!(frame.opcode, Opcode::SubdocGet);
        assert_eq!(frame.extras.len(), 3);
        assert_eq!(
            u16::from_be_bytes([frame.extras[0], frame.extras[1]]),
            "address.city".len() as u16
        );
        assert_eq!(frame.value, Bytes::from_static(b"address.city"));
    }

    #[test]
    fn test_subdoc_xattr_flag() {
        let spec = LookupInSpec::exists("meta").xattr();
        let frame = subdoc_lookup(b"doc", &spec);
        assert_eq!(frame.extras[2], SUBDOC_FLAG_XATTR);
    }

    #[test]
    fn test_multi_lookup_layout() {
        let specs = vec![LookupInSpec::get("a"), LookupInSpec::exists("bb")];
        let frame = multi_lookup(b"doc", &specs);

        assert_eq!(frame.value[0], Opcode::SubdocGet.value());
        assert_eq!(&frame.value[2..4], &[0, 1]);
        assert_eq!(frame.value[4], b'a');
        assert_eq!(frame.value[5], Opcode::SubdocExists.value());
        assert_eq!(&frame.value[7..9], &[0, 2]);
    }

    #[test]
    fn test_multi_mutation_layout() {
        let specs = vec![MutateInSpec::dict_upsert("p", &b"1"[..]).create_path()];
        let frame = multi_mutation(b"doc", &specs, 0, 7);

        assert_eq!(frame.cas, 7);
        assert!(frame.extras.is_empty());
        assert_eq!(frame.value[0], Opcode::SubdocDictUpsert.value());
        assert_eq!(frame.value[1], SUBDOC_FLAG_MKDIR_P);
        assert_eq!(&frame.value[2..4], &[0, 1]);
        assert_eq!(&frame.value[4..8], &[0, 0, 0, 1]);
        assert_eq!(&frame.value[8..], b"p1");
    }

    #[test]
    fn test_mutation_expiry_in_extras() {
        let specs = vec![MutateInSpec::delete("p")];
        let frame = multi_mutation(b"doc", &specs, 120, 0);
        assert_eq!(&frame.extras[..], &[0, 0, 0, 120]);
    }

    #[test]
    fn test_counter_spec_renders_delta() {
        let spec = MutateInSpec::counter("hits", -3);
        assert_eq!(&spec.value[..], b"-3");
    }
}
