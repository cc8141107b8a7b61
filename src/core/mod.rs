pub mod copy_engine;
pub mod events;
pub mod iscsi;
pub mod network;
pub mod plugin;
pub mod record;
pub mod session;
pub mod verifier;

pub use copy_engine::{BLOCK_SIZE, Digest, StreamCopier};
pub use events::{EventDetail, TransferEvent};
pub use iscsi::{
    BlockDevice, Credentials, DiskAccess, Initiator, IscsiSession, LunClass, LunInfo,
    TargetAddress, TargetInfo,
};
pub use network::{NetworkConfig, NetworkMode};
pub use plugin::{PluginArgs, PluginCall, PluginFunction, PluginHost, TRANSFER_PLUGIN};
pub use record::ConnectionParameters;
pub use session::{ProvisioningKind, SessionSettings, TransferSession};
