//! Lifecycle of one iSCSI transfer session.
//!
//! A session moves through: expose the disk on the host → fetch and parse the
//! transfer record → connect to the target (with retries) → pick the
//! block-storage LUN → open it. `disconnect` undoes all of it and leaves the
//! manager ready for another `connect`.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::iscsi::{
    BlockDevice, Credentials, DiskAccess, Initiator, IscsiSession, LunClass, LunInfo,
    TargetAddress,
};
use crate::core::network::NetworkConfig;
use crate::core::plugin::{PluginCall, PluginHost};
use crate::core::record::ConnectionParameters;
use crate::error::{Result, TransferError};

/// The disk type opened by an initiator's sessions.
pub type DiskOf<I> = <<I as Initiator>::Session as IscsiSession>::Disk;

/// Delay between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Number of connect attempts before giving up.
pub const DEFAULT_CONNECT_RETRY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect_retry: u32,
    pub retry_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_retry: DEFAULT_CONNECT_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// What the provisioning record told us about LUN addressing.
///
/// Decided once per `connect` from the record and never changed afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningKind {
    /// The record names no LUN; the first block-storage LUN is used.
    Legacy,
    /// The record carries a positional LUN index.
    Indexed { lun_index: u64 },
}

impl ProvisioningKind {
    fn from_parameters(params: &ConnectionParameters) -> Self {
        match params.lun_index {
            Some(lun_index) => Self::Indexed { lun_index },
            None => Self::Legacy,
        }
    }
}

/// Owns the provisioned endpoint, the iSCSI session and the opened disk.
///
/// Only this type opens and closes those handles. Callers borrow the disk
/// through [`TransferSession::connect`] or [`TransferSession::disk`].
pub struct TransferSession<I: Initiator> {
    initiator: I,
    settings: SessionSettings,
    cancel: CancellationToken,
    network: Option<NetworkConfig>,
    session: Option<I::Session>,
    disk: Option<DiskOf<I>>,
    record_handle: Option<String>,
    params: Option<ConnectionParameters>,
    provisioning: Option<ProvisioningKind>,
}

impl<I: Initiator> TransferSession<I> {
    pub fn new(initiator: I, settings: SessionSettings, cancel: CancellationToken) -> Self {
        Self {
            initiator,
            settings,
            cancel,
            network: None,
            session: None,
            disk: None,
            record_handle: None,
            params: None,
            provisioning: None,
        }
    }

    /// Network settings to send with the next `connect`.
    pub fn configure_network(&mut self, config: NetworkConfig) {
        debug!(network = %config.network_id, "Configured transfer endpoint network");
        self.network = Some(config);
    }

    pub fn is_provisioned(&self) -> bool {
        self.record_handle.is_some()
    }

    pub fn connection_parameters(&self) -> Option<&ConnectionParameters> {
        self.params.as_ref()
    }

    pub fn provisioning_kind(&self) -> Option<ProvisioningKind> {
        self.provisioning
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn initiator(&self) -> &I {
        &self.initiator
    }

    /// The opened disk, if `connect` succeeded.
    pub fn disk(&mut self) -> Option<&mut DiskOf<I>> {
        self.disk.as_mut()
    }

    /// Expose `vdi_uuid` on the host and open it over iSCSI.
    pub async fn connect<H: PluginHost + ?Sized>(
        &mut self,
        host: &H,
        vdi_uuid: &str,
        read_only: bool,
    ) -> Result<&mut DiskOf<I>> {
        if self.is_provisioned() {
            return Err(TransferError::AlreadyConnected);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let record = self.provision(host, vdi_uuid, read_only).await?;

        let params = ConnectionParameters::from_record(&record)?;
        let kind = ProvisioningKind::from_parameters(&params);
        self.provisioning = Some(kind);

        let address = TargetAddress {
            host: params.ip.clone(),
            port: params.port,
            target_group_tag: params.target_group_tag.clone(),
        };
        let credentials = params.credentials().map(|(username, password)| Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.params = Some(params);

        let mut session = self
            .connect_with_retry(&address, credentials.as_ref(), vdi_uuid)
            .await?;
        let opened =
            open_block_storage(&mut session, kind, DiskAccess::for_read_only(read_only)).await;
        self.session = Some(session);

        let disk = opened?;
        Ok(self.disk.insert(disk))
    }

    /// Close the disk and session, then release the endpoint on the host.
    ///
    /// Local handles are closed on a best-effort basis. A failure to release
    /// the endpoint is returned as [`TransferError::Teardown`]. Either way the
    /// manager is reset and can be connected again.
    pub async fn disconnect<H: PluginHost + ?Sized>(&mut self, host: &H) -> Result<()> {
        if let Some(mut disk) = self.disk.take() {
            if let Err(e) = disk.close() {
                warn!(error = %e, "Failed to close iSCSI disk, continuing");
            }
        }

        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close iSCSI session, continuing");
            }
        }

        let handle = self
            .params
            .as_ref()
            .and_then(|p| p.record_handle.clone())
            .or_else(|| self.record_handle.clone());

        let result = match handle {
            Some(handle) => unexpose(host, &handle).await,
            None => {
                debug!("No transfer endpoint provisioned, nothing to release");
                Ok(())
            }
        };

        self.reset();
        if result.is_ok() {
            debug!("iSCSI target destroyed");
        }
        result
    }

    /// Write a master boot record to the opened disk.
    ///
    /// The source is rewound and read whole.
    pub fn write_mbr<R: Read + Seek + ?Sized>(&mut self, source: &mut R) -> Result<()> {
        let disk = self.disk.as_mut().ok_or(TransferError::NotConnected)?;

        let mut mbr = Vec::new();
        source
            .seek(SeekFrom::Start(0))
            .and_then(|_| source.read_to_end(&mut mbr))
            .map_err(|e| TransferError::copy("master boot record", e))?;

        disk.set_master_boot_record(&mbr)
            .map_err(|e| TransferError::copy("master boot record", e))?;

        info!(bytes = mbr.len(), "Wrote master boot record");
        Ok(())
    }

    async fn provision<H: PluginHost + ?Sized>(
        &mut self,
        host: &H,
        vdi_uuid: &str,
        read_only: bool,
    ) -> Result<String> {
        let expose = PluginCall::expose(vdi_uuid, read_only, self.network.as_ref())?;
        let handle = expose.send(host).await.map_err(|e| {
            error!(vdi = %vdi_uuid, error = %e, "Failed to expose disk for transfer");
            TransferError::Provision(e)
        })?;

        let handle = handle.trim().to_string();
        if handle.is_empty() {
            return Err(TransferError::Provision(anyhow!(
                "expose returned an empty record handle"
            )));
        }
        self.record_handle = Some(handle.clone());
        info!(vdi = %vdi_uuid, record_handle = %handle, read_only, "Exposed disk for transfer");

        PluginCall::get_record(&handle)?
            .send(host)
            .await
            .map_err(|e| {
                error!(record_handle = %handle, error = %e, "Failed to fetch transfer record");
                TransferError::Provision(e)
            })
    }

    async fn connect_with_retry(
        &self,
        address: &TargetAddress,
        credentials: Option<&Credentials>,
        vdi_uuid: &str,
    ) -> Result<I::Session> {
        let attempts = self.settings.connect_retry.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            debug!(vdi = %vdi_uuid, attempt, "Setting up iSCSI transport");
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                result = attempt_connect(&self.initiator, address, credentials) => result,
            };

            match result {
                Ok(session) => return Ok(session),
                Err(e) => {
                    error!(attempt, attempts, error = %e, "iSCSI connect attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }
        }

        Err(TransferError::ExhaustedRetries {
            attempts,
            last_error: last_error.unwrap_or_else(|| anyhow!("no connect attempt was made")),
        })
    }

    fn reset(&mut self) {
        self.session = None;
        self.disk = None;
        self.record_handle = None;
        self.params = None;
        self.provisioning = None;
    }
}

async fn attempt_connect<I: Initiator>(
    initiator: &I,
    address: &TargetAddress,
    credentials: Option<&Credentials>,
) -> anyhow::Result<I::Session> {
    let targets = initiator.discover(address, credentials).await?;
    let target = targets.first().ok_or_else(|| {
        anyhow!(
            "no iSCSI targets found at {}:{} ({})",
            address.host,
            address.port,
            address.target_group_tag
        )
    })?;

    info!(targets = targets.len(), target = %target.name, "Found iSCSI targets, connecting");
    initiator.connect(target, credentials).await
}

async fn open_block_storage<S: IscsiSession>(
    session: &mut S,
    kind: ProvisioningKind,
    access: DiskAccess,
) -> Result<S::Disk> {
    let luns = session
        .list_luns()
        .await
        .map_err(|e| TransferError::DiskOpen {
            message: "could not determine LUN".to_string(),
            source: Some(e),
        })?;
    info!(luns = luns.len(), "Found LUNs, looking for block storage");

    let lun = pick_lun(&luns, kind)?;
    info!(lun, "Opening disk on LUN");

    session
        .open_disk(lun, access)
        .await
        .map_err(|e| TransferError::DiskOpen {
            message: format!("cannot open disk on LUN {}", lun),
            source: Some(e),
        })
}

/// Choose the LUN to open.
///
/// The first block-storage LUN in enumeration order wins. A LUN index from
/// the record is only compared against it for diagnostics.
pub(crate) fn pick_lun(luns: &[LunInfo], kind: ProvisioningKind) -> Result<u64> {
    let first = luns
        .iter()
        .find(|l| l.device_type == LunClass::BlockStorage)
        .ok_or_else(|| TransferError::disk_open("no block storage LUN found"))?;

    if let ProvisioningKind::Indexed { lun_index } = kind {
        match luns.get(lun_index as usize) {
            Some(preferred) if preferred.lun != first.lun => {
                debug!(
                    preferred = preferred.lun,
                    selected = first.lun,
                    "Record LUN differs from first block storage LUN"
                );
            }
            Some(_) => {}
            None => warn!(lun_index, luns = luns.len(), "Record LUN index out of range"),
        }
    }

    Ok(first.lun)
}

async fn unexpose<H: PluginHost + ?Sized>(host: &H, record_handle: &str) -> Result<()> {
    let call = PluginCall::unexpose(record_handle)?;
    match call.send(host).await {
        Ok(status) => {
            debug!(record_handle, status = %status.trim(), "Released transfer endpoint");
            Ok(())
        }
        Err(e) => {
            warn!(record_handle, error = %e, "Failed to shut down transfer endpoint");
            Err(TransferError::Teardown(e))
        }
    }
}
