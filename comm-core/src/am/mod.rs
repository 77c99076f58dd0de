//! Active messages: `spec.md` §4.7. `protocol` is the wire format,
//! `request` is the initiator side (`executeOn`, and the AM-proxy fallback
//! `rdma.rs`/`amo.rs` reach for when a target isn't locally MR-resolvable),
//! `handler` is the receiving side (the dedicated handler thread(s)
//! `init.rs` spins up), `liveness` is `SPEC_FULL.md`'s self-tuning
//! liveness probe.

pub mod handler;
pub mod liveness;
pub mod protocol;
pub mod request;
