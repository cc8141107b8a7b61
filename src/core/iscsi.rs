use std::io::{self, Read, Seek, Write};

use async_trait::async_trait;

/// Where to look for iSCSI targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
    /// Selects among several targets served at the same address.
    pub target_group_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub address: TargetAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// SCSI peripheral device class reported for a LUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunClass {
    BlockStorage,
    TapeStorage,
    OpticalDisc,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunInfo {
    pub lun: u64,
    pub device_type: LunClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskAccess {
    Read,
    ReadWrite,
}

impl DiskAccess {
    pub fn for_read_only(read_only: bool) -> Self {
        if read_only { Self::Read } else { Self::ReadWrite }
    }
}

/// An opened LUN, usable as a random-access stream.
pub trait BlockDevice: Read + Write + Seek + Send {
    /// Replace the master boot record of the disk.
    fn set_master_boot_record(&mut self, mbr: &[u8]) -> io::Result<()>;

    /// Release the device. Called once, before the session is closed.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Client side of the iSCSI protocol.
#[async_trait]
pub trait Initiator: Send + Sync {
    type Session: IscsiSession;

    /// Ask the portal at `address` for the targets it serves.
    async fn discover(
        &self,
        address: &TargetAddress,
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<Vec<TargetInfo>>;

    /// Log in to `target`.
    async fn connect(
        &self,
        target: &TargetInfo,
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<Self::Session>;
}

/// A logged-in iSCSI session.
#[async_trait]
pub trait IscsiSession: Send {
    type Disk: BlockDevice;

    async fn list_luns(&mut self) -> anyhow::Result<Vec<LunInfo>>;

    async fn open_disk(&mut self, lun: u64, access: DiskAccess) -> anyhow::Result<Self::Disk>;

    /// Log out. Called once at teardown.
    async fn close(&mut self) -> anyhow::Result<()>;
}
