pub mod fixtures;
pub mod ledger;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{module_config, seeded_bytes, sha256_hash, storage_config};
#[allow(unused_imports)]
pub use ledger::MemoryQuotaController;
#[allow(unused_imports)]
pub use mocks::{Fault, FaultyBackend};
