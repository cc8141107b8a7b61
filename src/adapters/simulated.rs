//! In-process stand-ins for the host plugin and the iSCSI initiator.
//!
//! The simulated host hands out record handles and renders transfer records;
//! the simulated initiator serves a fixed set of LUNs backed either by memory
//! or by local image files. Both can be told to fail so the retry and teardown
//! paths can be exercised without a network.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use quick_xml::escape::escape;
use tracing::debug;
use uuid::Uuid;

use crate::core::iscsi::{
    BlockDevice, Credentials, DiskAccess, Initiator, IscsiSession, LunClass, LunInfo,
    TargetAddress, TargetInfo,
};
use crate::core::plugin::{PluginArgs, PluginFunction, PluginHost, TRANSFER_PLUGIN};
use crate::core::record::RECORD_TAG;

/// Size of a master boot record sector.
pub const MBR_SIZE: usize = 512;

const IQN_PREFIX: &str = "iqn.2026-10.local.vdxfer";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Attributes the simulated host publishes for every exposed disk.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub ip: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub lun_index: Option<u64>,
}

impl Default for EndpointRecord {
    fn default() -> Self {
        Self {
            ip: Some("127.0.0.1".to_string()),
            port: 3260,
            username: None,
            password: None,
            lun_index: None,
        }
    }
}

impl EndpointRecord {
    fn render(&self, vdi_uuid: &str, record_handle: &str) -> String {
        let mut attrs = Vec::new();
        if let Some(ip) = &self.ip {
            attrs.push(("ip", ip.clone()));
        }
        attrs.push(("port", self.port.to_string()));
        attrs.push(("isci_lun", format!("{}:{}", IQN_PREFIX, vdi_uuid)));
        if let Some(username) = &self.username {
            attrs.push(("username", username.clone()));
        }
        if let Some(password) = &self.password {
            attrs.push(("password", password.clone()));
        }
        if let Some(lun_index) = self.lun_index {
            attrs.push(("iscsi_lun", lun_index.to_string()));
        }
        attrs.push(("record_handle", record_handle.to_string()));

        let body: Vec<String> = attrs
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape(v.as_str())))
            .collect();
        format!("<{} {}/>", RECORD_TAG, body.join(" "))
    }
}

enum RecordSource {
    Endpoint(EndpointRecord),
    Raw(String),
}

/// One call received by the simulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInvocation {
    pub plugin: String,
    pub function: String,
    pub args: PluginArgs,
}

struct HostState {
    /// record handle -> exposed vdi
    exposed: HashMap<String, String>,
    calls: Vec<PluginInvocation>,
}

/// Host plugin that exposes disks locally.
pub struct SimulatedHost {
    record: RecordSource,
    state: Mutex<HostState>,
    fail_expose: AtomicBool,
    fail_unexpose: AtomicBool,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new(EndpointRecord::default())
    }
}

impl SimulatedHost {
    pub fn new(endpoint: EndpointRecord) -> Self {
        Self::from_source(RecordSource::Endpoint(endpoint))
    }

    /// Serve `record` verbatim from `get_record`.
    pub fn with_record(record: impl Into<String>) -> Self {
        Self::from_source(RecordSource::Raw(record.into()))
    }

    fn from_source(record: RecordSource) -> Self {
        Self {
            record,
            state: Mutex::new(HostState {
                exposed: HashMap::new(),
                calls: Vec::new(),
            }),
            fail_expose: AtomicBool::new(false),
            fail_unexpose: AtomicBool::new(false),
        }
    }

    pub fn set_fail_expose(&self, fail: bool) {
        self.fail_expose.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unexpose(&self, fail: bool) {
        self.fail_unexpose.store(fail, Ordering::SeqCst);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<PluginInvocation> {
        lock(&self.state).calls.clone()
    }

    /// Number of disks currently exposed.
    pub fn exposed_count(&self) -> usize {
        lock(&self.state).exposed.len()
    }

    fn required<'a>(args: &'a PluginArgs, key: &str) -> anyhow::Result<&'a str> {
        args.get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing argument '{}'", key))
    }
}

#[async_trait]
impl PluginHost for SimulatedHost {
    async fn call_plugin(
        &self,
        plugin: &str,
        function: &str,
        args: &PluginArgs,
    ) -> anyhow::Result<String> {
        let mut state = lock(&self.state);
        state.calls.push(PluginInvocation {
            plugin: plugin.to_string(),
            function: function.to_string(),
            args: args.clone(),
        });

        if plugin != TRANSFER_PLUGIN {
            bail!("unknown plugin '{}'", plugin);
        }

        match PluginFunction::from_str(function) {
            Some(PluginFunction::Expose) => {
                if self.fail_expose.load(Ordering::SeqCst) {
                    bail!("VDI is in use");
                }
                let vdi = Self::required(args, "vdi_uuid")?.to_string();
                let handle = Uuid::now_v7().to_string();
                debug!(vdi = %vdi, record_handle = %handle, "(SimulatedHost) Exposed disk");
                state.exposed.insert(handle.clone(), vdi);
                Ok(handle)
            }
            Some(PluginFunction::GetRecord) => {
                let handle = Self::required(args, "record_handle")?;
                let vdi = state
                    .exposed
                    .get(handle)
                    .ok_or_else(|| anyhow!("unknown record handle '{}'", handle))?;
                Ok(match &self.record {
                    RecordSource::Endpoint(endpoint) => endpoint.render(vdi, handle),
                    RecordSource::Raw(record) => record.clone(),
                })
            }
            Some(PluginFunction::Unexpose) => {
                if self.fail_unexpose.load(Ordering::SeqCst) {
                    bail!("transfer VM did not shut down");
                }
                let handle = Self::required(args, "record_handle")?;
                state
                    .exposed
                    .remove(handle)
                    .ok_or_else(|| anyhow!("unknown record handle '{}'", handle))?;
                debug!(record_handle = %handle, "(SimulatedHost) Unexposed disk");
                Ok("OK".to_string())
            }
            None => bail!("unknown function '{}'", function),
        }
    }
}

#[derive(Debug, Clone)]
enum LunBacking {
    Memory(Arc<Mutex<Vec<u8>>>),
    File(PathBuf),
}

/// A LUN served by the simulated initiator.
#[derive(Debug, Clone)]
pub struct SimulatedLun {
    info: LunInfo,
    backing: LunBacking,
}

impl SimulatedLun {
    /// A zero-filled block-storage LUN of `capacity` bytes.
    pub fn memory(lun: u64, capacity: usize) -> Self {
        Self::with_class(lun, LunClass::BlockStorage, capacity)
    }

    pub fn with_class(lun: u64, device_type: LunClass, capacity: usize) -> Self {
        Self {
            info: LunInfo { lun, device_type },
            backing: LunBacking::Memory(Arc::new(Mutex::new(vec![0u8; capacity]))),
        }
    }

    /// A block-storage LUN backed by an existing image file.
    pub fn file(lun: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            info: LunInfo {
                lun,
                device_type: LunClass::BlockStorage,
            },
            backing: LunBacking::File(path.into()),
        }
    }

    pub fn info(&self) -> LunInfo {
        self.info
    }

    /// Current contents of the LUN.
    pub fn contents(&self) -> io::Result<Vec<u8>> {
        match &self.backing {
            LunBacking::Memory(image) => Ok(lock(&**image).clone()),
            LunBacking::File(path) => std::fs::read(path),
        }
    }

    fn open(&self, access: DiskAccess, fail_close: bool) -> io::Result<SimulatedDisk> {
        let backend = match &self.backing {
            LunBacking::Memory(image) => DiskBackend::Memory {
                image: Arc::clone(image),
                position: 0,
            },
            LunBacking::File(path) => DiskBackend::File(open_image(path, access)?),
        };
        Ok(SimulatedDisk {
            backend,
            access,
            fail_close,
        })
    }
}

fn open_image(path: &Path, access: DiskAccess) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(access == DiskAccess::ReadWrite)
        .open(path)
}

struct InitiatorState {
    luns: Vec<SimulatedLun>,
    failures_remaining: AtomicU32,
    discover_calls: AtomicU32,
    connect_calls: AtomicU32,
    fail_close: AtomicBool,
    last_address: Mutex<Option<TargetAddress>>,
    last_credentials: Mutex<Option<Credentials>>,
}

/// Initiator that serves a fixed set of LUNs for any target address.
#[derive(Clone)]
pub struct SimulatedInitiator {
    inner: Arc<InitiatorState>,
}

impl SimulatedInitiator {
    pub fn new(luns: Vec<SimulatedLun>) -> Self {
        Self {
            inner: Arc::new(InitiatorState {
                luns,
                failures_remaining: AtomicU32::new(0),
                discover_calls: AtomicU32::new(0),
                connect_calls: AtomicU32::new(0),
                fail_close: AtomicBool::new(false),
                last_address: Mutex::new(None),
                last_credentials: Mutex::new(None),
            }),
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_attempts(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Make sessions and disks opened from now on fail to close.
    pub fn set_fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Number of connection attempts (target discoveries) made.
    pub fn attempts(&self) -> u32 {
        self.inner.discover_calls.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> u32 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn last_address(&self) -> Option<TargetAddress> {
        lock(&self.inner.last_address).clone()
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        lock(&self.inner.last_credentials).clone()
    }

    pub fn lun(&self, lun: u64) -> Option<&SimulatedLun> {
        self.inner.luns.iter().find(|l| l.info.lun == lun)
    }
}

#[async_trait]
impl Initiator for SimulatedInitiator {
    type Session = SimulatedSession;

    async fn discover(
        &self,
        address: &TargetAddress,
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<Vec<TargetInfo>> {
        self.inner.discover_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.last_address) = Some(address.clone());
        *lock(&self.inner.last_credentials) = credentials.cloned();

        let failing = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("connection refused by {}:{}", address.host, address.port);
        }

        let name = if address.target_group_tag.is_empty() {
            format!("{}:disk", IQN_PREFIX)
        } else {
            address.target_group_tag.clone()
        };
        Ok(vec![TargetInfo {
            name,
            address: address.clone(),
        }])
    }

    async fn connect(
        &self,
        target: &TargetInfo,
        _credentials: Option<&Credentials>,
    ) -> anyhow::Result<SimulatedSession> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        debug!(target = %target.name, "(SimulatedInitiator) Logged in");
        Ok(SimulatedSession {
            luns: self.inner.luns.clone(),
            fail_close: self.inner.fail_close.load(Ordering::SeqCst),
        })
    }
}

pub struct SimulatedSession {
    luns: Vec<SimulatedLun>,
    fail_close: bool,
}

#[async_trait]
impl IscsiSession for SimulatedSession {
    type Disk = SimulatedDisk;

    async fn list_luns(&mut self) -> anyhow::Result<Vec<LunInfo>> {
        Ok(self.luns.iter().map(SimulatedLun::info).collect())
    }

    async fn open_disk(&mut self, lun: u64, access: DiskAccess) -> anyhow::Result<SimulatedDisk> {
        let entry = self
            .luns
            .iter()
            .find(|l| l.info.lun == lun)
            .ok_or_else(|| anyhow!("LUN {} does not exist", lun))?;
        Ok(entry.open(access, self.fail_close)?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.fail_close {
            bail!("logout timed out");
        }
        debug!("(SimulatedInitiator) Logged out");
        Ok(())
    }
}

#[derive(Debug)]
enum DiskBackend {
    Memory {
        image: Arc<Mutex<Vec<u8>>>,
        position: u64,
    },
    File(File),
}

/// An opened simulated LUN.
#[derive(Debug)]
pub struct SimulatedDisk {
    backend: DiskBackend,
    access: DiskAccess,
    fail_close: bool,
}

impl SimulatedDisk {
    fn check_writable(&self) -> io::Result<()> {
        match self.access {
            DiskAccess::ReadWrite => Ok(()),
            DiskAccess::Read => Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "disk is opened read-only",
            )),
        }
    }
}

impl Read for SimulatedDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.backend {
            DiskBackend::Memory { image, position } => {
                let image = lock(&**image);
                let start = (*position as usize).min(image.len());
                let n = buf.len().min(image.len() - start);
                buf[..n].copy_from_slice(&image[start..start + n]);
                *position += n as u64;
                Ok(n)
            }
            DiskBackend::File(file) => file.read(buf),
        }
    }
}

impl Write for SimulatedDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        match &mut self.backend {
            DiskBackend::Memory { image, position } => {
                let mut image = lock(&**image);
                let start = *position as usize;
                let end = start + buf.len();
                if end > image.len() {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("write of {} bytes at {} runs past end of disk", buf.len(), start),
                    ));
                }
                image[start..end].copy_from_slice(buf);
                *position = end as u64;
                Ok(buf.len())
            }
            DiskBackend::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backend {
            DiskBackend::Memory { .. } => Ok(()),
            DiskBackend::File(file) => file.flush(),
        }
    }
}

impl Seek for SimulatedDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.backend {
            DiskBackend::Memory { image, position } => {
                let len = lock(&**image).len() as i64;
                let target = match pos {
                    SeekFrom::Start(n) => n as i64,
                    SeekFrom::End(n) => len + n,
                    SeekFrom::Current(n) => *position as i64 + n,
                };
                if target < 0 {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        "seek before start of disk",
                    ));
                }
                *position = target as u64;
                Ok(*position)
            }
            DiskBackend::File(file) => file.seek(pos),
        }
    }
}

impl BlockDevice for SimulatedDisk {
    fn set_master_boot_record(&mut self, mbr: &[u8]) -> io::Result<()> {
        if mbr.len() != MBR_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("master boot record must be {} bytes, got {}", MBR_SIZE, mbr.len()),
            ));
        }
        let position = self.stream_position()?;
        self.seek(SeekFrom::Start(0))?;
        self.write_all(mbr)?;
        self.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.fail_close {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device went away"));
        }
        match &mut self.backend {
            DiskBackend::Memory { .. } => Ok(()),
            DiskBackend::File(file) if self.access == DiskAccess::ReadWrite => file.sync_all(),
            DiskBackend::File(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_record_renders_parseable_xml() {
        let endpoint = EndpointRecord {
            username: Some("admin".to_string()),
            password: Some("p<w>".to_string()),
            lun_index: Some(0),
            ..Default::default()
        };
        let xml = endpoint.render("vdi-1", "handle-1");
        let params = crate::core::record::ConnectionParameters::from_record(&xml).unwrap();
        assert_eq!(params.ip, "127.0.0.1");
        assert_eq!(params.target_group_tag, "iqn.2026-10.local.vdxfer:vdi-1");
        assert_eq!(params.credentials(), Some(("admin", "p<w>")));
        assert_eq!(params.record_handle.as_deref(), Some("handle-1"));
    }

    #[test]
    fn test_memory_disk_read_write_seek() {
        let lun = SimulatedLun::memory(0, 16);
        let mut disk = lun.open(DiskAccess::ReadWrite, false).unwrap();

        disk.seek(SeekFrom::Start(4)).unwrap();
        disk.write_all(&[1, 2, 3]).unwrap();
        assert!(disk.write_all(&[0u8; 10]).is_err());

        disk.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = Vec::new();
        disk.read_to_end(&mut contents).unwrap();
        assert_eq!(&contents[..8], &[0, 0, 0, 0, 1, 2, 3, 0]);
        assert_eq!(lun.contents().unwrap(), contents);
    }

    #[test]
    fn test_read_only_disk_rejects_writes() {
        let lun = SimulatedLun::memory(0, 16);
        let mut disk = lun.open(DiskAccess::Read, false).unwrap();
        let err = disk.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_master_boot_record_size_is_checked() {
        let lun = SimulatedLun::memory(0, 4096);
        let mut disk = lun.open(DiskAccess::ReadWrite, false).unwrap();
        assert!(disk.set_master_boot_record(&[0xAA; 100]).is_err());

        disk.seek(SeekFrom::Start(1000)).unwrap();
        disk.set_master_boot_record(&[0x55; MBR_SIZE]).unwrap();
        assert_eq!(disk.stream_position().unwrap(), 1000);
        assert_eq!(&lun.contents().unwrap()[..MBR_SIZE], &[0x55; MBR_SIZE][..]);
    }

    #[tokio::test]
    async fn test_initiator_fails_requested_attempts() {
        let initiator = SimulatedInitiator::new(vec![SimulatedLun::memory(0, 16)]);
        initiator.fail_next_attempts(1);

        let address = TargetAddress {
            host: "10.0.0.5".to_string(),
            port: 3260,
            target_group_tag: "iqn.test".to_string(),
        };
        assert!(initiator.discover(&address, None).await.is_err());
        let targets = initiator.discover(&address, None).await.unwrap();
        assert_eq!(targets[0].name, "iqn.test");
        assert_eq!(initiator.attempts(), 2);
    }

    #[tokio::test]
    async fn test_host_expose_and_unexpose() {
        let host = SimulatedHost::default();
        let mut args = PluginArgs::new();
        args.insert("vdi_uuid".to_string(), "vdi-9".to_string());

        let handle = host.call_plugin("transfer", "expose", &args).await.unwrap();
        assert_eq!(host.exposed_count(), 1);

        let mut args = PluginArgs::new();
        args.insert("record_handle".to_string(), handle);
        let record = host.call_plugin("transfer", "get_record", &args).await.unwrap();
        assert!(record.contains("vdi-9"));

        host.call_plugin("transfer", "unexpose", &args).await.unwrap();
        assert_eq!(host.exposed_count(), 0);
        assert!(host.call_plugin("transfer", "unexpose", &args).await.is_err());
        assert!(host.call_plugin("other", "expose", &args).await.is_err());
        assert_eq!(host.calls().len(), 5);
    }
}
