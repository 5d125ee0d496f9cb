use qmp::{Client, Endpoint};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> qmp::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Pass the monitor address as `host:port` or a socket path.
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/var/run/qemu-server/100.qmp".to_string());
    let endpoint: Endpoint = address.parse()?;

    let mut client = Client::builder(endpoint).nickname("demo").build();
    let greeting = client.connect().await?;
    println!("greeting = {}", greeting.as_value());

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    println!("status = {status}");

    client.close().await
}
