use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vdxfer::TransferError;
use vdxfer::adapters::{EndpointRecord, MBR_SIZE, SimulatedHost, SimulatedInitiator, SimulatedLun};
use vdxfer::core::{
    LunClass, NetworkConfig, ProvisioningKind, SessionSettings, StreamCopier, TransferSession,
};

const CAPACITY: usize = 64 * 1024;

fn session(initiator: &SimulatedInitiator) -> TransferSession<SimulatedInitiator> {
    TransferSession::new(
        initiator.clone(),
        SessionSettings::default(),
        CancellationToken::new(),
    )
}

fn single_lun() -> SimulatedInitiator {
    SimulatedInitiator::new(vec![SimulatedLun::memory(0, CAPACITY)])
}

#[tokio::test]
async fn test_upload_verify_and_disconnect() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);

    let mut data: Vec<u8> = (0..CAPACITY / 2).map(|i| (i % 200) as u8 + 1).collect();
    data[4096..8192].fill(0);

    let disk = session.connect(&host, "vdi-1", false).await.unwrap();
    assert_eq!(host.exposed_count(), 1);

    let mut copier =
        StreamCopier::with_block_size(NonZeroUsize::new(4096).unwrap(), CancellationToken::new());
    let digest = copier
        .copy(&mut Cursor::new(data.clone()), disk, "disk.vhd", true, |_| {})
        .unwrap()
        .unwrap();
    copier.verify(disk, "disk.vhd", &digest, |_| {}).unwrap();

    session.disconnect(&host).await.unwrap();
    assert!(!session.is_provisioned());
    assert!(session.disk().is_none());
    assert_eq!(host.exposed_count(), 0);

    let contents = initiator.lun(0).unwrap().contents().unwrap();
    assert_eq!(&contents[..data.len()], &data[..]);

    let functions: Vec<String> = host.calls().into_iter().map(|c| c.function).collect();
    assert_eq!(functions, ["expose", "get_record", "unexpose"]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ip_fails_without_connect_attempt() {
    let host = SimulatedHost::new(EndpointRecord {
        ip: None,
        ..Default::default()
    });
    let initiator = single_lun();
    let mut session = session(&initiator);

    let started = Instant::now();
    let err = session.connect(&host, "vdi-1", false).await.unwrap_err();

    assert!(matches!(err, TransferError::Connection(_)), "{err:?}");
    assert_eq!(initiator.attempts(), 0);
    assert_eq!(started.elapsed(), Duration::ZERO);

    // The endpoint was exposed before the record was read; release it.
    assert!(session.is_provisioned());
    session.disconnect(&host).await.unwrap();
    assert_eq!(host.exposed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausts_retries_with_fixed_delay() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    initiator.fail_next_attempts(10);
    let mut session = session(&initiator);

    let started = Instant::now();
    let err = session.connect(&host, "vdi-1", false).await.unwrap_err();

    assert!(
        matches!(err, TransferError::ExhaustedRetries { attempts: 3, .. }),
        "{err:?}"
    );
    assert_eq!(initiator.attempts(), 3);
    assert_eq!(initiator.logins(), 0);
    assert_eq!(started.elapsed(), Duration::from_secs(10));

    session.disconnect(&host).await.unwrap();
    assert_eq!(host.exposed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connects_after_transient_failures() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    initiator.fail_next_attempts(2);
    let mut session = session(&initiator);

    let started = Instant::now();
    session.connect(&host, "vdi-1", true).await.unwrap();

    assert_eq!(initiator.attempts(), 3);
    assert_eq!(initiator.logins(), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    session.disconnect(&host).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    initiator.fail_next_attempts(10);
    let cancel = CancellationToken::new();
    let mut session = TransferSession::new(
        initiator.clone(),
        SessionSettings::default(),
        cancel.clone(),
    );

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = session.connect(&host, "vdi-1", false).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(initiator.attempts(), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    session.disconnect(&host).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_before_connect_does_not_provision() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);
    session.cancellation_token().cancel();

    let err = session.connect(&host, "vdi-1", false).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_raw_record_selects_first_block_storage_lun() {
    let host = SimulatedHost::with_record(
        r#"<transfer_record ip="10.0.0.5" port="3261" isci_lun="iqn.2026-10.test:tgt" username="admin" password="s&amp;cret" iscsi_lun="0"/>"#,
    );
    let initiator = SimulatedInitiator::new(vec![
        SimulatedLun::with_class(0, LunClass::TapeStorage, 512),
        SimulatedLun::memory(2, CAPACITY),
        SimulatedLun::memory(1, CAPACITY),
    ]);
    let mut session = session(&initiator);

    let disk = session.connect(&host, "vdi-1", false).await.unwrap();
    disk.write_all(b"hello").unwrap();

    assert_eq!(
        session.provisioning_kind(),
        Some(ProvisioningKind::Indexed { lun_index: 0 })
    );
    let address = initiator.last_address().unwrap();
    assert_eq!(address.host, "10.0.0.5");
    assert_eq!(address.port, 3261);
    assert_eq!(address.target_group_tag, "iqn.2026-10.test:tgt");
    let credentials = initiator.last_credentials().unwrap();
    assert_eq!(credentials.username, "admin");
    assert_eq!(credentials.password, "s&cret");

    session.disconnect(&host).await.unwrap();

    assert_eq!(&initiator.lun(2).unwrap().contents().unwrap()[..5], b"hello");
    assert!(initiator.lun(1).unwrap().contents().unwrap().iter().all(|&b| b == 0));
}

#[tokio::test]
async fn test_no_block_storage_lun_fails_to_open() {
    let host = SimulatedHost::default();
    let initiator =
        SimulatedInitiator::new(vec![SimulatedLun::with_class(0, LunClass::OpticalDisc, 512)]);
    let mut session = session(&initiator);

    let err = session.connect(&host, "vdi-1", true).await.unwrap_err();
    assert!(matches!(err, TransferError::DiskOpen { .. }), "{err:?}");

    session.disconnect(&host).await.unwrap();
    assert_eq!(host.exposed_count(), 0);
}

#[tokio::test]
async fn test_expose_failure_is_a_provision_error() {
    let host = SimulatedHost::default();
    host.set_fail_expose(true);
    let initiator = single_lun();
    let mut session = session(&initiator);

    let err = session.connect(&host, "vdi-1", false).await.unwrap_err();
    assert!(matches!(err, TransferError::Provision(_)), "{err:?}");
    assert!(!session.is_provisioned());
    assert_eq!(initiator.attempts(), 0);
}

#[tokio::test]
async fn test_teardown_failure_still_resets_session() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);

    session.connect(&host, "vdi-1", false).await.unwrap();
    assert!(matches!(
        session.connect(&host, "vdi-1", false).await,
        Err(TransferError::AlreadyConnected)
    ));

    host.set_fail_unexpose(true);
    let err = session.disconnect(&host).await.unwrap_err();
    assert!(matches!(err, TransferError::Teardown(_)), "{err:?}");
    assert!(!session.is_provisioned());
    assert!(session.connection_parameters().is_none());

    host.set_fail_unexpose(false);
    session.connect(&host, "vdi-1", false).await.unwrap();
    session.disconnect(&host).await.unwrap();
    // The endpoint whose release failed is still exposed on the host.
    assert_eq!(host.exposed_count(), 1);
}

#[tokio::test]
async fn test_network_settings_are_sent_with_expose() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);
    session.configure_network(NetworkConfig::static_ip(
        "net-9",
        "192.168.5.20",
        "255.255.255.0",
        "192.168.5.1",
    ));

    session.connect(&host, "vdi-1", true).await.unwrap();
    session.disconnect(&host).await.unwrap();

    let expose = &host.calls()[0];
    assert_eq!(expose.plugin, "transfer");
    assert_eq!(expose.function, "expose");
    assert_eq!(expose.args["vdi_uuid"], "vdi-1");
    assert_eq!(expose.args["read_only"], "true");
    assert_eq!(expose.args["network_uuid"], "net-9");
    assert_eq!(expose.args["network_mode"], "manual");
    assert_eq!(expose.args["network_ip"], "192.168.5.20");
}

#[tokio::test]
async fn test_write_mbr_replaces_first_sector() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);

    let mut mbr = Cursor::new(vec![0xAAu8; MBR_SIZE]);
    assert!(matches!(
        session.write_mbr(&mut mbr),
        Err(TransferError::NotConnected)
    ));

    session.connect(&host, "vdi-1", false).await.unwrap();
    // The source is rewound before it is read.
    mbr.seek(SeekFrom::End(0)).unwrap();
    session.write_mbr(&mut mbr).unwrap();

    let disk = session.disk().unwrap();
    let mut sector = vec![0u8; MBR_SIZE + 1];
    disk.seek(SeekFrom::Start(0)).unwrap();
    disk.read_exact(&mut sector).unwrap();
    assert!(sector[..MBR_SIZE].iter().all(|&b| b == 0xAA));
    assert_eq!(sector[MBR_SIZE], 0);

    session.disconnect(&host).await.unwrap();
}

#[tokio::test]
async fn test_read_only_disk_refuses_writes() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    let mut session = session(&initiator);

    let disk = session.connect(&host, "vdi-1", true).await.unwrap();
    assert!(disk.write_all(b"data").is_err());
    session.disconnect(&host).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_tolerates_failed_disk_and_session_close() {
    let host = SimulatedHost::default();
    let initiator = single_lun();
    initiator.set_fail_close(true);
    let mut session = session(&initiator);

    session.connect(&host, "vdi-1", false).await.unwrap();
    session.disconnect(&host).await.unwrap();

    assert!(!session.is_provisioned());
    assert!(session.disk().is_none());
    assert_eq!(host.exposed_count(), 0);
    let functions: Vec<String> = host.calls().into_iter().map(|c| c.function).collect();
    assert_eq!(functions, ["expose", "get_record", "unexpose"]);
}

#[tokio::test]
async fn test_blank_credentials_without_lun_index_use_first_block_storage() {
    let host = SimulatedHost::with_record(
        r#"<transfer_record ip="10.0.0.5" port="3260" isci_lun="iqn.2026-10.test:tgt" username="" password=""/>"#,
    );
    let initiator = SimulatedInitiator::new(vec![
        SimulatedLun::with_class(0, LunClass::OpticalDisc, 512),
        SimulatedLun::memory(5, CAPACITY),
        SimulatedLun::memory(1, CAPACITY),
    ]);
    let mut session = session(&initiator);

    let disk = session.connect(&host, "vdi-1", false).await.unwrap();
    disk.write_all(b"first").unwrap();

    assert_eq!(session.provisioning_kind(), Some(ProvisioningKind::Legacy));
    assert_eq!(initiator.attempts(), 1);
    assert!(initiator.last_credentials().is_none());

    session.disconnect(&host).await.unwrap();
    assert_eq!(&initiator.lun(5).unwrap().contents().unwrap()[..5], b"first");
    assert!(initiator.lun(1).unwrap().contents().unwrap().iter().all(|&b| b == 0));
}
