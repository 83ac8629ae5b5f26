//! Moonparty: watch and play a friend's Sunshine stream from the browser.
//!
//! One native Moonlight session upstream, any number of WebRTC viewers
//! downstream. The first viewer hosts the session and hands out gamepad
//! slots and keyboard grants to the others.

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use moonlight_common::identity::ClientIdentity;
use moonlight_common::network::{MoonlightHost, PairStatus};
use moonlight_common::pair::{generate_pin, pair_hash_for, PairingEngine};

mod bridge;
mod broadcaster;
mod config;
mod peer;
mod server;
mod session;
mod signaling;

use config::Config;
use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "moonparty", about = "Multi-viewer bridge for a Sunshine host")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "moonparty.json")]
    config: PathBuf,

    /// Override the listen address from the config.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the Sunshine host address from the config.
    #[arg(long)]
    host: Option<String>,

    /// Override the Sunshine API port from the config.
    #[arg(long)]
    port: Option<u16>,

    /// Discard the stored client identity and pair from scratch.
    #[arg(long)]
    new_identity: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(debug_assertions)]
    let log_level = LevelFilter::Debug;
    #[cfg(not(debug_assertions))]
    let log_level = LevelFilter::Info;

    TermLogger::init(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("failed to init logger");

    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(host) = args.host {
        config.host_address = host;
    }
    if let Some(port) = args.port {
        config.host_port = port;
    }

    if args.new_identity {
        ClientIdentity::delete(None)?;
    }
    let identity = ClientIdentity::load_or_generate(None)?;

    let host = MoonlightHost::new(config.host_address.clone(), config.host_port)?;
    ensure_paired(&host, &identity).await?;

    let listen_addr = normalize_listen_addr(&config.listen_addr);
    let state = AppState::new(config, identity, host);

    info!("[Main]: listening on http://{listen_addr}");
    let app_state = state.clone();
    HttpServer::new(move || {
        let state = app_state.clone();
        App::new().configure(move |app| server::configure_routes(app, state))
    })
    .bind(&listen_addr)
    .with_context(|| format!("binding {listen_addr}"))?
    .run()
    .await?;

    server::stop_upstream(&state).await;
    Ok(())
}

/// Verify pairing state and run the PIN handshake when needed. Phase 1
/// blocks until the PIN is entered in the host's admin UI, so the PIN is
/// printed before the request goes out.
async fn ensure_paired(host: &MoonlightHost, identity: &ClientIdentity) -> anyhow::Result<()> {
    let server_info = host
        .server_info(Some(identity.unique_id()))
        .await
        .with_context(|| format!("cannot reach host at {}", host.address()))?;
    info!(
        "[Main]: host {} reports version {}",
        host.address(),
        server_info.app_version
    );

    if host.verify_paired(identity.unique_id()).await? == PairStatus::Paired {
        info!("[Main]: already paired");
        return Ok(());
    }

    // Clear any stuck half-finished pairing before starting over.
    let _ = host.unpair(identity.unique_id()).await;

    let pin = generate_pin();
    println!();
    println!("============================================");
    println!("  PAIRING PIN: {pin}");
    println!("============================================");
    println!();
    println!("Enter this PIN in the host's web UI now:");
    println!("  https://{}:47990 -> PIN Pairing", host.address());
    println!();

    let engine = PairingEngine::new(host, identity, pair_hash_for(&server_info));
    engine.pair(&pin).await?;
    info!("[Main]: pairing complete");
    Ok(())
}

/// Accept both ":8080" and "host:8080" spellings.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(normalize_listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
