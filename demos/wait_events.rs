use std::time::Duration;

use qmp::{Client, Endpoint, Wait};

#[tokio::main(flavor = "current_thread")]
async fn main() -> qmp::Result<()> {
    // Adjust the path to your environment.
    let mut client = Client::new(Endpoint::unix("/var/run/qemu-server/100.qmp"));
    client.connect().await?;

    // Print events for a while; each wait is bounded so a quiet VM ends the loop.
    loop {
        match client.pull_event(Wait::Timeout(Duration::from_secs(30))).await {
            Ok(Some(ev)) => println!("{} {}", ev.name, ev.data),
            Ok(None) => continue,
            Err(e) if e.kind() == qmp::ErrorKind::Timeout => break,
            Err(e) => return Err(e),
        }
    }

    client.close().await
}
