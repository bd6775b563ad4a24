//! End-of-run state extracted from a pairing scenario.

use tether_core::EngineSnapshot;

/// Observable state of both sides plus the collaborators they touched.
#[derive(Debug, Clone)]
pub struct PairingSnapshot {
    /// Existing device's engine
    pub provisioner: EngineSnapshot,
    /// New device's engine
    pub provisionee: EngineSnapshot,
    /// Pushes the publishing service received
    pub publish_calls: usize,
    /// Secret-key fetches the provisioner's key store served
    pub secret_fetches: usize,
}

impl PairingSnapshot {
    /// Both engines' snapshots.
    pub fn engines(&self) -> [&EngineSnapshot; 2] {
        [&self.provisioner, &self.provisionee]
    }
}
