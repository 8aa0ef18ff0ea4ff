//! Registry behaviour every backend must honour, exercised on the simulated ledger.

use std::sync::Arc;
use std::time::Duration;

use birthmark_core::codec::{decode, encode, from_microdegrees};
use birthmark_core::{
    BackendConfig, CaptureRecord, ErrorKind, ImageHash, RegistryClient, RegistryConfig,
    RegistryError, RegistryEvent, RegistryPolicy, SimulatedConfig, SimulatedLedger,
};
use chrono::{TimeZone, Utc};

/// A capture timestamp safely in the past.
fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn capture(tag: &str) -> CaptureRecord {
    CaptureRecord::new(ImageHash::digest(tag.as_bytes()), t0(), "cam_001")
}

fn client() -> RegistryClient {
    RegistryClient::new(RegistryConfig::default()).expect("simulated client")
}

#[tokio::test]
async fn test_distinct_records_verify_independently() {
    let client = client();
    let r1 = capture("r1").with_geolocation(10.0, 20.0);
    let r2 = CaptureRecord::new(ImageHash::digest(b"r2"), t0(), "cam_002");

    client.record(&r1).await.unwrap();
    client.record(&r2).await.unwrap();

    let v1 = client.verify_record(&r1.image_hash).await.unwrap().unwrap();
    let v2 = client.verify_record(&r2.image_hash).await.unwrap().unwrap();
    assert_eq!(v1.record, r1);
    assert_eq!(v2.record, r2);
}

#[tokio::test]
async fn test_second_record_of_same_hash_is_duplicate() {
    let client = client();
    let original = capture("dup");
    client.record(&original).await.unwrap();
    let before = client.verify(&original.image_hash).await.unwrap();

    let mut replay = original.clone();
    replay.camera_id = "cam_999".into();
    replay.geolocation = None;
    let err = client.record(&replay).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { .. }));

    assert_eq!(client.verify(&original.image_hash).await.unwrap(), before);
    assert_eq!(client.stats().await.unwrap().total_count, 1);
}

#[tokio::test]
async fn test_batch_of_101_rejected_before_commit() {
    let client = client();
    let records: Vec<_> = (0..101).map(|i| capture(&format!("big-{i}"))).collect();

    let err = client.batch_record(&records).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(client.stats().await.unwrap().total_count, 0);
    assert!(!client.verify(&records[0].image_hash).await.unwrap().found);
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    let client = client();
    let existing = capture("existing");
    client.record(&existing).await.unwrap();

    let mut batch: Vec<_> = (0..10).map(|i| capture(&format!("batch-{i}"))).collect();
    batch[5] = existing.clone();

    let err = client.batch_record(&batch).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { index: Some(5), .. }));
    assert_eq!(client.stats().await.unwrap().total_count, 1);

    let hashes: Vec<_> = batch.iter().map(|r| r.image_hash).collect();
    let exists = client.batch_verify(&hashes).await.unwrap();
    assert_eq!(exists.iter().filter(|&&e| e).count(), 1);
    assert!(exists[5]);
}

#[tokio::test]
async fn test_replay_with_any_payload_is_duplicate() {
    let client = client();
    let h1 = capture("h1");
    client.record(&h1).await.unwrap();

    let mut ahead = h1.clone();
    ahead.captured_at = Utc::now() + chrono::Duration::hours(1);
    let err = client.record(&ahead).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { index: None, .. }));

    let batch = vec![capture("fresh"), ahead];
    let err = client.batch_record(&batch).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { index: Some(1), .. }));
    assert_eq!(client.stats().await.unwrap().total_count, 1);
}

#[tokio::test]
async fn test_batch_duplicate_from_the_future_reported_as_duplicate() {
    let client = client();
    let existing = capture("existing");
    client.record(&existing).await.unwrap();

    let mut batch: Vec<_> = (0..10).map(|i| capture(&format!("later-{i}"))).collect();
    let mut replay = existing.clone();
    replay.captured_at = Utc::now() + chrono::Duration::hours(1);
    batch[5] = replay;

    let err = client.batch_record(&batch).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { index: Some(5), .. }));
    assert_eq!(client.stats().await.unwrap().total_count, 1);
    assert!(!client.verify(&batch[0].image_hash).await.unwrap().found);
}

#[tokio::test]
async fn test_stats_count_transactions_once_per_write() {
    let client = client();
    client.record(&capture("tx-single")).await.unwrap();
    let batch: Vec<_> = (0..3).map(|i| capture(&format!("tx-batch-{i}"))).collect();
    client.batch_record(&batch).await.unwrap();

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total_count, 4);
    assert_eq!(stats.total_transactions, Some(2));
}

#[test]
fn test_codec_roundtrip_within_documented_loss() {
    let long_camera = "camera-with-a-very-long-identifier-exceeding-32-bytes";
    let cases = [
        capture("plain"),
        capture("geo").with_geolocation(-33.8688197, 151.2092955),
        capture("edge").with_geolocation(90.0, -180.0),
        CaptureRecord::new(ImageHash::digest(b"long"), t0(), long_camera),
    ];

    for original in cases {
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded.image_hash, original.image_hash);
        assert_eq!(decoded.captured_at, original.captured_at);

        if original.camera_id.len() > 32 {
            assert_eq!(decoded.camera_id, original.camera_id[..32]);
        } else {
            assert_eq!(decoded.camera_id, original.camera_id);
        }

        match (original.geolocation, decoded.geolocation) {
            (Some(a), Some(b)) => {
                assert!((a.latitude - b.latitude).abs() < 1e-6);
                assert!((a.longitude - b.longitude).abs() < 1e-6);
            }
            (None, None) => {}
            other => panic!("geolocation presence changed: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_unknown_hash_returns_canonical_defaults() {
    let client = client();
    let verification = client.verify(&ImageHash::digest(b"never")).await.unwrap();
    assert!(!verification.found);
    let entry = verification.entry;
    assert!(entry.record.image_hash.is_zero());
    assert_eq!(entry.record.captured_at, 0);
    assert_eq!(entry.record.camera_id, [0u8; 32]);
    assert_eq!((entry.record.latitude, entry.record.longitude), (0, 0));
    assert!(!entry.record.has_geolocation);
    assert_eq!(entry.sequence_marker, 0);
}

#[tokio::test]
async fn test_portland_capture_scenario() {
    let client = client();
    let h1 = ImageHash::digest(b"H1");
    let record = CaptureRecord::new(h1, t0(), "cam_001").with_geolocation(45.5231, -122.6765);
    client.record(&record).await.unwrap();

    let verification = client.verify(&h1).await.unwrap();
    assert!(verification.found);
    let stored = verification.entry.record;
    assert_eq!(stored.captured_at, t0().timestamp() as u64);
    assert!(stored.has_geolocation);
    assert_eq!(stored.latitude, 45_523_100);
    assert_eq!(stored.longitude, -122_676_500);
    assert!((from_microdegrees(stored.latitude) - 45.5231).abs() < 1e-9);

    let other_payload = CaptureRecord::new(h1, t0(), "cam_777");
    let err = client.record(&other_payload).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { .. }));

    let from_the_future = CaptureRecord::new(h1, Utc::now() + chrono::Duration::hours(1), "cam_001");
    let err = client.record(&from_the_future).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHash { index: None, .. }));

    let verified = client.verify_record(&h1).await.unwrap().unwrap();
    assert!(verified.tx_id.is_some());
    assert_eq!(verified.network, "simulated");

    let unknown = ImageHash::digest(b"H_unknown");
    assert_eq!(
        client.batch_verify(&[h1, unknown]).await.unwrap(),
        vec![true, false]
    );
}

#[tokio::test]
async fn test_timestamp_tolerance_is_configurable() {
    let strict = RegistryConfig {
        backend: BackendConfig::Simulated(SimulatedConfig::default()),
        policy: RegistryPolicy {
            future_tolerance: Duration::from_secs(0),
            ..Default::default()
        },
    };
    let client = RegistryClient::new(strict).unwrap();

    let mut ahead = capture("ahead");
    ahead.captured_at = Utc::now() + chrono::Duration::seconds(120);
    let err = client.record(&ahead).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FutureTimestamp);

    let lenient = client_with_default_policy();
    lenient.record(&ahead).await.unwrap();
}

fn client_with_default_policy() -> RegistryClient {
    RegistryClient::with_backend(
        Arc::new(SimulatedLedger::default()),
        RegistryPolicy::default(),
    )
}

#[tokio::test]
async fn test_events_carry_no_coordinates() {
    let ledger = Arc::new(SimulatedLedger::default());
    let client = RegistryClient::with_backend(ledger.clone(), RegistryPolicy::default());

    client
        .batch_record(&[
            capture("e1").with_geolocation(1.0, 2.0),
            capture("e2"),
        ])
        .await
        .unwrap();

    let events = ledger.events();
    assert_eq!(events.len(), 3);
    for logged in &events {
        let json = serde_json::to_string(&logged.event).unwrap();
        assert!(!json.contains("latitude") && !json.contains("longitude"));
    }
    assert!(matches!(
        events[2].event,
        RegistryEvent::BatchRecorded { count: 2, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_single_winner() {
    let ledger = Arc::new(SimulatedLedger::default());
    let record = capture("race");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = RegistryClient::with_backend(ledger.clone(), RegistryPolicy::default());
            let record = record.clone();
            tokio::spawn(async move { client.record(&record).await })
        })
        .collect();

    let mut wins = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}
