//! Walk through the registry on the simulated ledger with tracing enabled.
//!
//! Run with: cargo run -p birthmark-core --example simulated_registry

use std::time::Duration;

use birthmark_core::{
    BackendConfig, CaptureRecord, ImageHash, RegistryClient, RegistryConfig, RegistryPolicy,
    SimulatedConfig,
};
use chrono::Utc;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::new("birthmark_core=debug,info"))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    println!("=== Birthmark Simulated Registry Demo ===\n");

    let config = RegistryConfig {
        backend: BackendConfig::Simulated(
            SimulatedConfig::default().with_latency(Duration::from_millis(50)),
        ),
        policy: RegistryPolicy::default(),
    };
    println!("Config: {:?}\n", config);

    let client = match RegistryClient::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create client: {}", e);
            return;
        }
    };

    // Single capture
    let image = b"raw sensor data from camera_001";
    let hash = ImageHash::digest(image);
    let record = CaptureRecord::new(hash, Utc::now(), "camera_001").with_geolocation(45.5231, -122.6765);

    match client.record(&record).await {
        Ok(receipt) => {
            println!("\n✅ Recorded {}", hash);
            println!("   Tx:    {:?}", receipt.tx_id);
            println!("   Block: {}", receipt.sequence_marker);
        }
        Err(e) => println!("\n❌ Record failed: {}", e),
    }

    // Replay is refused
    match client.record(&record).await {
        Ok(_) => println!("\n❌ Replay unexpectedly accepted"),
        Err(e) => println!("\n✅ Replay refused: {} ({})", e, e.code()),
    }

    // Batch of captures
    let batch: Vec<CaptureRecord> = (0..5)
        .map(|i| {
            let data = format!("burst frame {i}");
            CaptureRecord::new(ImageHash::digest(data.as_bytes()), Utc::now(), "camera_001")
        })
        .collect();
    match client.batch_record(&batch).await {
        Ok(receipt) => println!("\n✅ Batch of {} at block {}", receipt.count, receipt.sequence_marker),
        Err(e) => println!("\n❌ Batch failed: {}", e),
    }

    // Verification, including a tampered image
    match client.hash_and_verify(image).await {
        Ok(Some(verified)) => {
            println!("\n✅ Original verified");
            println!("   Camera:   {}", verified.record.camera_id);
            println!("   Captured: {}", verified.record.captured_at);
            println!("   Location: {:?}", verified.record.geolocation);
            println!("   Tx:       {:?}", verified.tx_id);
            println!("   Network:  {}", verified.network);
        }
        Ok(None) => println!("\n❌ Original not found"),
        Err(e) => println!("\n❌ Verify failed: {}", e),
    }
    match client.hash_and_verify(b"edited image").await {
        Ok(None) => println!("\n✅ Edited image has no registry entry"),
        Ok(Some(_)) => println!("\n❌ Edited image unexpectedly found"),
        Err(e) => println!("\n❌ Verify failed: {}", e),
    }

    if let Ok(stats) = client.stats().await {
        println!("\nTotal records: {}", stats.total_count);
        println!("Latest block:  {}", stats.commit_position);
        println!("Transactions:  {:?}", stats.total_transactions);
    }
}
