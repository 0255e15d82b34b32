use clap::{Parser, Subcommand};
use client::network::Connection;
use client::query;
use log::info;
use shared::{InfoString, UserCmd, PORT_SERVER};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to talk to
    #[arg(short = 's', long, default_value = "127.0.0.1:27910")]
    server: String,

    /// Milliseconds to wait for each reply
    #[arg(short = 'w', long, default_value = "2000")]
    wait_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the server info and player list
    Status,
    /// Print the one-line server summary
    Info,
    /// Measure a ping/ack round trip
    Ping,
    /// Run a console command on the server
    Rcon {
        password: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Join the game and run forward for a while
    Connect {
        #[arg(short, long, default_value = "player")]
        name: String,
        #[arg(long, default_value = "10")]
        seconds: u64,
        #[arg(long, default_value = "0")]
        forward: i16,
    },
}

fn resolve(server: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, PORT_SERVER)
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("cannot resolve {}", server).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = resolve(&args.server)?;
    let wait = Duration::from_millis(args.wait_ms);

    match args.command {
        Command::Status => {
            let status = query::status(server, wait).await?;
            for (key, value) in status.info.pairs() {
                println!("{:<20}{}", key, value);
            }
            println!();
            println!("score ping name");
            for player in &status.players {
                println!("{:>5} {:>4} {}", player.score, player.ping, player.name);
            }
        }
        Command::Info => println!("{}", query::info(server, wait).await?),
        Command::Ping => {
            let round_trip = query::ping(server, wait).await?;
            println!("{} ms", round_trip.as_millis());
        }
        Command::Rcon { password, command } => {
            let output = query::rcon(server, &password, &command.join(" "), wait).await?;
            print!("{}", output);
        }
        Command::Connect {
            name,
            seconds,
            forward,
        } => {
            let mut user_info = InfoString::default();
            user_info.set_value_for_key("name", &name)?;
            let qport = rand::random::<u16>();

            let mut connection = Connection::connect(server, &user_info.to_string(), qport, wait).await?;
            let cmd = UserCmd {
                forward_move: forward,
                ..Default::default()
            };
            connection.run_for(Duration::from_secs(seconds), &cmd).await?;
            info!(
                "Leaving {} after frame {}",
                connection.session().map(),
                connection.session().last_frame()
            );
            connection.disconnect().await?;
        }
    }

    Ok(())
}
