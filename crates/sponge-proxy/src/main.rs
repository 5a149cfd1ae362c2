use std::process::ExitCode;
use std::sync::Arc;

use sponge_cache::RedisCacheStore;
use sponge_core::ProxyConfig;
use sponge_observe::StderrEventSink;
use sponge_proxy::ProxyServer;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let cache = match RedisCacheStore::new(&config.redis) {
        Ok(cache) => Arc::new(cache),
        Err(error) => {
            eprintln!("cache client error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let listen_hostname = config.listen_hostname.clone();
    let listen_port = config.listen_port;
    let mitm = config.mitm_enabled();

    let server = match ProxyServer::new(config, StderrEventSink, cache) {
        Ok(server) => server,
        Err(error) => {
            eprintln!("CA material error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match server.bind_listener().await {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("cannot listen on {listen_hostname}:{listen_port}: {error}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "sponge-proxy listening on {listen_hostname}:{listen_port} (mitm: {})",
        if mitm { "enabled" } else { "disabled" }
    );

    if let Err(error) = server.run_with_listener(listener).await {
        eprintln!("listener failed: {error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
