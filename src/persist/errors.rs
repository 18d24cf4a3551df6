#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    foreign_links {
        VdevError(crate::vdev::Error);
        SerializationError(bincode::Error);
        ChecksumError(crate::checksum::ChecksumError);
    }
    errors {
        /// A second transaction or overlapping sector read was admitted
        /// while one is in flight. Retry later.
        Busy {
            description("another operation is in flight")
        }
        /// No backing LUN has been set.
        NotInitialized {
            description("no backing store configured")
        }
        /// The free-space bitmap has no free slot for the sector.
        InsufficientResources(sector: String) {
            display("no free entry slot in sector {}", sector)
        }
        /// The transaction buffer holds its maximum number of elements.
        TransactionFull {
            description("transaction element capacity exhausted")
        }
        /// The entry id names no live entry.
        DoesNotExist(id: u64) {
            display("entry {:#x} does not exist", id)
        }
        /// The supplied handle does not belong to the open transaction.
        WrongTransaction {
            description("handle does not match the open transaction")
        }
        /// The operation is illegal in the transaction's current state.
        InvalidState(msg: String) {
            display("invalid transaction state: {}", msg)
        }
        /// The on-disk header failed validation.
        InvalidHeader {
            description("persist header failed validation")
        }
        /// A caller bug: malformed ids, oversized payloads, wrong call
        /// order. Never retried.
        ContractViolation(msg: String) {
            display("programming contract violated: {}", msg)
        }
    }
}
