//! Health hysteresis through the coordinator, configuration loading and reload

mod common;

use cfdi_coord::collab::{Notification, StoreState};
use cfdi_coord::{Config, Error, StampRequest};
use common::*;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_probe_hysteresis() {
    let mut h = Harness::new(
        config_with(vec![ordered_group("norte", "MTY", &["SAL"])]),
        state_with(&["MTY", "SAL"]),
    );
    assert!(!h.coord.health().is_available("MTY"));

    h.probe().await;
    assert!(h.coord.health().is_available("MTY"));

    h.prober.set_down("MTY");
    h.probe().await;
    h.probe().await;
    assert!(h.coord.health().is_available("MTY"), "two failures must not flip");
    h.probe().await;
    assert!(!h.coord.health().is_available("MTY"));

    h.prober.set_up("MTY");
    h.probe().await;
    assert!(!h.coord.health().is_available("MTY"), "one success must not flip");
    h.probe().await;
    assert!(h.coord.health().is_available("MTY"));

    let mty_events: Vec<Notification> = h
        .drain_events()
        .into_iter()
        .filter(|e| e.branch() == "MTY")
        .collect();
    assert_eq!(
        mty_events,
        vec![
            Notification::BranchUnavailable {
                branch: "MTY".into(),
                consecutive_failures: 3
            },
            Notification::BranchRecovered {
                branch: "MTY".into()
            },
        ]
    );
    assert_eq!(h.coord.metrics().available_branches.get(), 2);
}

#[tokio::test]
async fn test_background_probes_run_until_shutdown() {
    let mut config = config_with(vec![ordered_group("norte", "MTY", &["SAL"])]);
    config.health.interval = Duration::from_millis(20);
    config.health.startup_jitter = Duration::ZERO;
    let h = Harness::new(config, state_with(&["MTY", "SAL"]));

    h.coord.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.coord.shutdown().await;

    let snapshot = h.coord.health_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|r| r.available));
    assert!(h.coord.metrics().probe_successes.get() >= 4);

    let probes = h.coord.metrics().probe_successes.get();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.coord.metrics().probe_successes.get(), probes);
}

#[tokio::test]
async fn test_expiring_certificate_is_reported_once() {
    let mut config = config_with(vec![ordered_group("norte", "MTY", &["SAL"])]);
    config.health.interval = Duration::from_millis(20);
    config.health.startup_jitter = Duration::ZERO;
    let state = state_with(&["MTY"])
        .with_branch(branch("SAL"))
        .with_certificate(cert("00001000000505123456", "SAL", 3));
    let mut h = Harness::new(config, state);

    h.coord.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.coord.shutdown().await;

    let expiring: Vec<Notification> = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Notification::CertificateExpiring { .. }))
        .collect();
    assert_eq!(expiring.len(), 1);
    assert_eq!(expiring[0].branch(), "SAL");
}

#[tokio::test]
async fn test_reload_extends_group() {
    let h = Harness::new(
        config_with(vec![ordered_group("norte", "MTY", &["SAL"])]),
        state_with(&["MTY", "SAL", "CHI"]),
    );
    h.prober.set_down("MTY");
    h.prober.set_down("SAL");
    h.probe().await;
    let req = StampRequest::new("r-1", "norte", "A", "doc");
    assert!(matches!(
        h.coord.stamp(&req).await,
        Err(Error::NoEligibleBranch { .. })
    ));

    h.coord
        .reload(config_with(vec![ordered_group("norte", "MTY", &["SAL", "CHI"])]))
        .unwrap();
    assert!(h.coord.topology().branch("CHI").is_some());
    h.probe().await;

    let result = h.coord.stamp(&req).await.unwrap();
    assert_eq!(result.branch, "CHI");
}

#[tokio::test]
async fn test_reload_picks_up_rotated_certificate() {
    let state = StoreState::default()
        .with_branch(branch("MTY"))
        .with_certificate(cert("00001000000505000001", "MTY", -1));
    let h = Harness::new(config_with(vec![ordered_group("norte", "MTY", &[])]), state);
    h.probe().await;
    let req = StampRequest::new("r-1", "norte", "A", "doc");
    assert!(matches!(
        h.coord.stamp(&req).await,
        Err(Error::NoEligibleBranch { .. })
    ));

    h.store
        .put_certificates("MTY", vec![cert("00001000000505000002", "MTY", 365)]);
    h.coord.reload(h.coord.config()).unwrap();

    let result = h.coord.stamp(&req).await.unwrap();
    assert_eq!(result.certificate_serial, "00001000000505000002");
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_state() {
    let h = Harness::new(
        config_with(vec![ordered_group("norte", "MTY", &["SAL"])]),
        state_with(&["MTY", "SAL"]),
    );

    let mut bad = ordered_group("norte", "MTY", &["SAL"]);
    bad.backups.push("MTY".into());
    assert!(matches!(
        h.coord.reload(config_with(vec![bad])),
        Err(Error::InvalidConfig(_))
    ));

    // a branch missing from the store is also fatal
    assert!(h
        .coord
        .reload(config_with(vec![ordered_group("norte", "MTY", &["GDL"])]))
        .is_err());

    assert_eq!(h.coord.topology().branch_codes(), vec!["MTY", "SAL"]);
    assert_eq!(h.coord.config().groups[0].backups, vec!["SAL"]);
}

#[test]
fn test_load_toml_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
log_level = "debug"

[health]
interval = "15s"
probe_timeout = "7s"

[failover]
max_attempts = 2
stamp_timeout = "8s"

[[groups]]
id = "bajio"
members = ["LEO", "QRO", "AGS"]
balancing = "weighted"
weights = [{{ branch = "LEO", weight = 2 }}, {{ branch = "QRO", weight = 1 }}]

[[groups]]
id = "norte"
members = ["MTY", "SAL"]
primary = "MTY"
backups = ["SAL"]

[[customers]]
id = "XAXX010101000"
preferred_branch = "QRO"
region = "GTO"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.health.interval, Duration::from_secs(15));
    assert_eq!(config.health.failure_threshold, 3);
    assert_eq!(config.failover.max_attempts, 2);
    assert_eq!(config.group("bajio").unwrap().weight_of("LEO"), 2);
    assert_eq!(config.group("bajio").unwrap().weight_of("AGS"), 1);
    assert_eq!(config.customer("XAXX010101000").unwrap().region.as_deref(), Some("GTO"));
}

#[test]
fn test_load_rejects_branch_in_two_groups() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[groups]]
id = "a"
members = ["MTY"]

[[groups]]
id = "b"
members = ["MTY"]
"#
    )
    .unwrap();
    assert!(matches!(Config::load(file.path()), Err(Error::InvalidConfig(_))));
}
