// chronicle-common: history model, coalescing, checksums and wire framing
// shared by the chronicle server and its clients.

pub mod history;
pub mod protocol;
pub mod types;
