use service_registry::{InstanceInfo, InstanceStatus, RegistryClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Start a registry node first: `cargo run --bin service-registry`
    let client = RegistryClient::new(["http://localhost:8761"]);

    let instance = InstanceInfo::new("example-service", "localhost:8080", "localhost", 8080)
        .with_attribute("version", "1.0.0")
        .with_attribute("zone", "local")
        .with_lease_terms(5, 15);

    println!("Registering {}", instance.key());
    client.register(&instance).await?;

    let leases = client.fetch_application("example-service", false).await?;
    println!("Found {} instance(s):", leases.len());
    for lease in &leases {
        println!("  - {} at {} (version {})", lease.instance.instance_id, lease.instance.endpoint(), lease.version);
    }

    println!("\nSending heartbeats for 15 seconds...");
    for i in 1..=3 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        client.heartbeat(&instance).await?;
        println!("  Heartbeat sent ({}/3)", i);
    }

    client
        .set_status("example-service", "localhost:8080", InstanceStatus::OutOfService)
        .await?;
    let visible = client.fetch_application("example-service", false).await?;
    println!("\nOut of service, {} instance(s) visible to discovery", visible.len());

    client.cancel("example-service", "localhost:8080").await?;
    println!("Instance cancelled");

    Ok(())
}
