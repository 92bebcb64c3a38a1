//! Send one IPbus 2.0 control packet to a target and print the reply.
//!
//! ```ascii
//! cargo run --example simple_read -- 192.168.0.7 50001
//! ```

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use ipbus_client::config::ClientConfig;
use ipbus_client::registry::ClientRegistry;
use ipbus_client::target::TargetAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut args = std::env::args().skip(1);
    let ip = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: simple_read <target-ip> <control-port>"))?
        .parse()?;
    let port = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: simple_read <target-ip> <control-port>"))?
        .parse()?;
    let target = TargetAddr::new(ip, port)?;

    let registry = ClientRegistry::new(ClientConfig::default());

    // a v2 control packet: header with a placeholder id, then one
    //  transaction word - the client stamps the real id
    let request = vec![
        0x20, 0x00, 0x00, 0xF0, // packet header
        0x20, 0x00, 0x01, 0x0F, // read transaction header
    ];

    let (reply_tx, reply_rx) = oneshot::channel();
    registry.enqueue(target, request, reply_tx).await?;

    let response = timeout(Duration::from_secs(10), reply_rx).await??;
    println!("error code: {}", response.error_code.as_u16());
    println!("payload:    {:02X?}", response.payload);

    Ok(())
}
