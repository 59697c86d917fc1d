use std::sync::Arc;

use cosmy::transport::BluestTransport;
use cosmy::{ChannelRegistry, Coordinator, CoordinatorConfig};

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt().with_env_filter("cosmy=debug").init();

    let address = std::env::args().nth(1).unwrap_or_else(|| "C8:47:8C:00:12:34".to_string());
    let transport = Arc::new(BluestTransport::new().await.unwrap());
    let registry = ChannelRegistry::default();
    let handle = Coordinator::new(&address, transport, &registry, CoordinatorConfig::default())
        .unwrap()
        .start();

    let mut minutes = handle.channels().subscribe_minutes();
    while let Some(minutes) = minutes.recv().await {
        let state = handle.state();
        println!("{state:?} ({minutes:?} min left)");
    }
}
