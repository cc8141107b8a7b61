use std::path::{Path, PathBuf};

mod simulated;

pub use simulated::{
    EndpointRecord, MBR_SIZE, PluginInvocation, SimulatedDisk, SimulatedHost, SimulatedInitiator,
    SimulatedLun, SimulatedSession,
};

/// Image file that backs `vdi_uuid` in a simulation directory.
pub fn image_path(simulation_dir: &Path, vdi_uuid: &str) -> PathBuf {
    simulation_dir.join(format!("{}.img", vdi_uuid))
}

/// Initiator serving the image of `vdi_uuid` from `simulation_dir` as LUN 0.
pub fn simulated_initiator(simulation_dir: &Path, vdi_uuid: &str) -> SimulatedInitiator {
    SimulatedInitiator::new(vec![SimulatedLun::file(
        0,
        image_path(simulation_dir, vdi_uuid),
    )])
}
