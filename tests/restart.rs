use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta};
use rangelease::{
    Config, Error, HardwareAddress, JsonLeaseStore, LeaseRequest, LeaseResponse, LeaseService,
    LeaseStore,
};

struct TestGuard(PathBuf);
impl Drop for TestGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn test_config(name: &str, end: &str, excluded: Option<&str>) -> (Config, TestGuard) {
    let dir = std::env::temp_dir().join(format!("rangelease_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let config = Config {
        leases_file: dir.join("leases.json").to_string_lossy().into_owned(),
        range_start: "10.0.0.10".to_string(),
        range_end: end.to_string(),
        lease_time: "1h".to_string(),
        excluded_addresses: excluded.map(str::to_string),
    };
    (config, TestGuard(dir))
}

fn mac(last: u8) -> HardwareAddress {
    HardwareAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
}

#[tokio::test]
async fn test_exclusion_scenario() {
    let (config, _guard) = test_config("scenario", "10.0.0.12", Some("10.0.0.11"));
    let service = LeaseService::open(&config).await.unwrap();

    let request = |last: u8| LeaseRequest {
        hardware_address: mac(last),
        hostname: format!("host-{}", last),
    };

    let first = service
        .respond(&request(1), LeaseResponse::default())
        .await
        .unwrap();
    assert_eq!(first.your_ip_address, Ipv4Addr::new(10, 0, 0, 10));
    assert_eq!(first.lease_time_seconds, Some(3600));

    let second = service
        .respond(&request(2), LeaseResponse::default())
        .await
        .unwrap();
    assert_eq!(second.your_ip_address, Ipv4Addr::new(10, 0, 0, 12));

    assert!(service.respond(&request(3), LeaseResponse::default()).await.is_none());
}

#[tokio::test]
async fn test_restart_restores_leases() {
    let (config, _guard) = test_config("restart", "10.0.0.20", Some("10.0.0.10"));

    let ip = {
        let service = LeaseService::open(&config).await.unwrap();
        service.handle_request(mac(1), "one").await.unwrap();
        service.handle_request(mac(2), "two").await.unwrap().ip
    };
    assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 12));

    let service = LeaseService::open(&config).await.unwrap();
    assert!(service.is_taken(ip).await);
    assert!(service.is_taken(Ipv4Addr::new(10, 0, 0, 10)).await);

    let restored = service.lease_for(&mac(2)).await.unwrap();
    assert_eq!(restored.ip, ip);
    assert_eq!(restored.hostname, "two");
    assert_eq!(service.handle_request(mac(2), "two").await.unwrap().ip, ip);

    let newcomer = service.handle_request(mac(3), "three").await.unwrap();
    assert_eq!(newcomer.ip, Ipv4Addr::new(10, 0, 0, 13));
}

#[tokio::test]
async fn test_exhausted_range_survives_restart() {
    let (config, _guard) = test_config("exhausted", "10.0.0.11", None);
    {
        let service = LeaseService::open(&config).await.unwrap();
        service.handle_request(mac(1), "").await.unwrap();
        service.handle_request(mac(2), "").await.unwrap();
    }

    let service = LeaseService::open(&config).await.unwrap();
    assert!(matches!(
        service.handle_request(mac(3), "").await,
        Err(Error::PoolExhausted)
    ));
    assert_eq!(service.leases().await.len(), 2);
}

#[tokio::test]
async fn test_renewal_only_writes_when_extending() {
    let (config, _guard) = test_config("renewal", "10.0.0.20", None);
    let settings = config.validate().unwrap();
    let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

    {
        let store = JsonLeaseStore::open(&settings.leases_file).await.unwrap();
        let service = LeaseService::new(&settings, store).await.unwrap();
        service.handle_request_at(mac(1), "first", now).await.unwrap();
    }

    // Reported lease time stays the full window even when the stored lease
    // already reaches further than a fresh one would.
    let store = JsonLeaseStore::open(&settings.leases_file).await.unwrap();
    let service = LeaseService::new(&settings, store).await.unwrap();
    let earlier = now - TimeDelta::minutes(10);
    let assignment = service
        .handle_request_at(mac(1), "second", earlier)
        .await
        .unwrap();
    assert_eq!(assignment.lease_time_seconds, 3600);

    let persisted = service.store().load_all().await.unwrap();
    assert_eq!(persisted[&mac(1)].expires_at, 1_700_003_600);
    assert_eq!(persisted[&mac(1)].hostname, "first");

    let later = now + TimeDelta::minutes(30);
    service.handle_request_at(mac(1), "third", later).await.unwrap();
    let persisted = service.store().load_all().await.unwrap();
    assert_eq!(persisted[&mac(1)].expires_at, 1_700_005_400);
    assert_eq!(persisted[&mac(1)].hostname, "third");
}

#[tokio::test]
async fn test_conflicting_lease_file_refuses_to_start() {
    let (config, _guard) = test_config("conflict", "10.0.0.20", Some("10.0.0.15"));
    let settings = config.validate().unwrap();
    std::fs::create_dir_all(settings.leases_file.parent().unwrap()).unwrap();
    std::fs::write(
        &settings.leases_file,
        r#"{"leases": {"aa:bb:cc:dd:ee:01": {"ip": "10.0.0.15", "expires": 1, "hostname": ""}}}"#,
    )
    .unwrap();

    assert!(matches!(
        LeaseService::open(&config).await,
        Err(Error::Reconciliation { ip, .. }) if ip == Ipv4Addr::new(10, 0, 0, 15)
    ));

    std::fs::write(&settings.leases_file, "garbage").unwrap();
    assert!(matches!(
        LeaseService::open(&config).await,
        Err(Error::StorageRead(_))
    ));
}

#[tokio::test]
async fn test_invalid_config_refuses_to_start() {
    let (config, _guard) = test_config("invalid", "10.0.0.20", Some("10.0.0.99"));
    assert!(matches!(
        LeaseService::open(&config).await,
        Err(Error::InvalidConfig(_))
    ));
    assert!(!PathBuf::from(&config.leases_file).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_persist_distinct_addresses() {
    let (config, _guard) = test_config("concurrent", "10.0.0.41", None);
    let service = Arc::new(LeaseService::open(&config).await.unwrap());

    let mut handles = vec![];
    for index in 0..32u8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service.handle_request(mac(index), "").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    drop(service);

    let service = LeaseService::open(&config).await.unwrap();
    let leases = service.leases().await;
    assert_eq!(leases.len(), 32);
    let mut ips: Vec<_> = leases.iter().map(|lease| lease.ip).collect();
    ips.dedup();
    assert_eq!(ips.len(), 32);
    assert_eq!(service.free_count().await, 0);
}
