use service_registry::register_service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Reads SERVICE_REGISTRY_URL, registers as hostname:9090 and keeps the
    // lease alive in the background.
    let registration = register_service!("macro-service", "localhost", 9090).await?;

    let info = registration.info();
    println!("Registered {} at {}", info.key(), info.endpoint());

    if let Some(endpoint) = service_registry::get_service_endpoint("macro-service").await {
        println!("Discovery resolves macro-service to {}", endpoint);
    }

    println!("\nService running... (Press Ctrl+C to exit)");
    tokio::signal::ctrl_c().await?;

    registration.deregister().await?;
    println!("Deregistered");
    Ok(())
}
