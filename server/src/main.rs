use clap::Parser;
use log::{error, info};
use server::arena::ArenaGame;
use server::config::Args;
use server::master::lookup_masters;
use server::network::Server;
use server::transport::UdpTransport;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, binds the socket and runs frames until the
/// server is killed or Ctrl+C arrives.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let address = args.bind_address();
    let map = args.map.clone();
    let tick = Duration::from_millis(args.tick_ms);
    let banned_names = args.banned_names.clone();
    let mut config = args.into_config()?;
    lookup_masters(&mut config.masters).await;

    let transport = UdpTransport::bind(&address).await?;
    info!("Listening on {}", transport.local_addr()?);

    let mut game = ArenaGame::new(config.max_clients);
    for name in &banned_names {
        game.ban_name(name);
    }

    let mut server = Server::new(config, transport, game);
    server.spawn_map(&map, false)?;

    if let Err(e) = server.run(tick).await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
