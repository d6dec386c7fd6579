//! Append-only ledger: storage backends, the sequencing journal with its
//! broadcast hub, and the provenance arena built on top.

pub mod journal;
pub mod provenance;
pub mod store;

pub use journal::{LedgerJournal, LedgerStreamHub};
pub use provenance::ProvenanceStore;
pub use store::{FileLedger, MemoryLedger};
