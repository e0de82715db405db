use std::net::SocketAddr;

use anyhow::Context;

use authrim_config::AuthrimConfig;
use authrim_server::{ServerBuilder, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mut builder = ServerBuilder::new();

    if let Ok(path) = std::env::var("AUTHRIM_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {path}"))?;
        let config = AuthrimConfig::from_toml_str(&content)
            .with_context(|| format!("failed to parse {path}"))?;
        builder = builder.with_config(config);
    }
    if let Ok(bind) = std::env::var("AUTHRIM_BIND") {
        let addr: SocketAddr = bind.parse().context("AUTHRIM_BIND is not an address")?;
        builder = builder.with_bind(addr);
    }

    builder.build()?.run().await
}
