/// Rank state machines for the distributed ordering pass
pub mod assembly;
/// Bounded links between ranks
pub mod network;
/// Collecting and ordering sons owned by other ranks
pub mod remote_sons;
/// Fixed-size message slots
pub mod slot;

pub use assembly::{drive, run_blocking, Rank};
pub use network::{Endpoint, Network};
