#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    foreign_links {
        VdevError(crate::vdev::Error);
    }
    errors {
        /// A caller bug: impossible geometry, out-of-order phase calls,
        /// ranges that leave the parity region. Never retried.
        ContractViolation(msg: String) {
            description("programming contract violated")
            display("programming contract violated: {}", msg)
        }
        InsufficientResources {
            description("buffer or scatter/gather budget exhausted")
        }
        TooManyDeadPositions(dead: usize, parity_drives: usize) {
            display("{} dead positions exceed parity budget {}", dead, parity_drives)
        }
    }
}
