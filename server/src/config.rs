//! Server settings and their command line surface.

use crate::error::ServerError;
use clap::{ArgAction, Parser};
use shared::PORT_SERVER;
use std::path::PathBuf;

pub const MAX_MASTERS: usize = 5;
pub const MAX_CLIENTS_LIMIT: usize = 256;

/// Command line arguments of the dedicated server.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = PORT_SERVER)]
    pub port: u16,
    /// Map to start on
    #[clap(short, long, default_value = "q2dm1")]
    pub map: String,
    /// Size of the client table
    #[clap(long = "maxclients", default_value_t = 8)]
    pub max_clients: usize,
    /// Name shown in status and info replies
    #[clap(long, default_value = "noname")]
    pub hostname: String,
    /// Seconds of silence before a client is dropped
    #[clap(long, default_value_t = 120)]
    pub timeout: u64,
    /// Seconds a dropped client's slot is held before reuse
    #[clap(long, default_value_t = 2)]
    pub zombie_time: u64,
    /// Minimum seconds between connects from the same address
    #[clap(long, default_value_t = 3)]
    pub reconnect_limit: u64,
    /// Announce the server to the master servers
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub public: bool,
    /// Remote console password; empty disables rcon
    #[clap(long, default_value = "")]
    pub rcon_password: String,
    /// Answer failed rcon attempts instead of staying silent
    #[clap(long)]
    pub rcon_failure_notice: bool,
    /// Master server address, may be given up to five times
    #[clap(long = "master")]
    pub masters: Vec<String>,
    /// Host tick in milliseconds
    #[clap(short, long, default_value_t = 10)]
    pub tick_ms: u64,
    /// Run frames as fast as possible instead of in real time
    #[clap(long)]
    pub timedemo: bool,
    /// Drop movement commands once a client's time budget is spent
    #[clap(long)]
    pub enforce_time: bool,
    /// Let clients download files from the download directory
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub allow_download: bool,
    /// Directory served to downloading clients
    #[clap(long, default_value = ".")]
    pub download_dir: PathBuf,
    /// Player name the arena refuses, may be repeated
    #[clap(long = "ban")]
    pub banned_names: Vec<String>,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn into_config(self) -> Result<ServerConfig, ServerError> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS_LIMIT {
            return Err(ServerError::Config(format!(
                "maxclients must be between 1 and {}",
                MAX_CLIENTS_LIMIT
            )));
        }
        if self.masters.len() > MAX_MASTERS {
            return Err(ServerError::Config(format!(
                "at most {} master servers are supported",
                MAX_MASTERS
            )));
        }
        if self.tick_ms == 0 {
            return Err(ServerError::Config("tick must be at least 1ms".to_string()));
        }

        let mut masters: [String; MAX_MASTERS] = Default::default();
        for (slot, master) in masters.iter_mut().zip(self.masters) {
            *slot = master;
        }

        Ok(ServerConfig {
            max_clients: self.max_clients,
            host_name: self.hostname,
            timeout_secs: self.timeout,
            zombie_secs: self.zombie_time,
            reconnect_limit_secs: self.reconnect_limit,
            public: self.public,
            dedicated: true,
            rcon_password: self.rcon_password,
            rcon_failure_notice: self.rcon_failure_notice,
            masters,
            timedemo: self.timedemo,
            enforce_time: self.enforce_time,
            allow_download: self.allow_download,
            download_dir: self.download_dir,
        })
    }
}

/// Runtime settings consumed by the server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub host_name: String,
    pub timeout_secs: u64,
    pub zombie_secs: u64,
    pub reconnect_limit_secs: u64,
    pub public: bool,
    pub dedicated: bool,
    pub rcon_password: String,
    pub rcon_failure_notice: bool,
    pub masters: [String; MAX_MASTERS],
    pub timedemo: bool,
    pub enforce_time: bool,
    pub allow_download: bool,
    pub download_dir: PathBuf,
}

impl ServerConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_secs * 1000
    }

    pub fn zombie_ms(&self) -> u64 {
        self.zombie_secs * 1000
    }

    pub fn reconnect_limit_ms(&self) -> u64 {
        self.reconnect_limit_secs * 1000
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 8,
            host_name: "noname".to_string(),
            timeout_secs: 120,
            zombie_secs: 2,
            reconnect_limit_secs: 3,
            public: true,
            dedicated: false,
            rcon_password: String::new(),
            rcon_failure_notice: false,
            masters: Default::default(),
            timedemo: false,
            enforce_time: false,
            allow_download: true,
            download_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_command_line() {
        let args = Args::parse_from(["server"]);
        assert_eq!(args.port, PORT_SERVER);
        assert_eq!(args.bind_address(), format!("0.0.0.0:{}", PORT_SERVER));

        let config = args.into_config().unwrap();
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.timeout_ms(), 120_000);
        assert_eq!(config.zombie_ms(), 2_000);
        assert_eq!(config.reconnect_limit_ms(), 3_000);
        assert!(config.public);
        assert!(config.dedicated);
        assert!(config.rcon_password.is_empty());
    }

    #[test]
    fn test_masters_fill_slots_in_order() {
        let args = Args::parse_from([
            "server",
            "--master",
            "master.example.net",
            "--master",
            "10.1.1.1:27900",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.masters[0], "master.example.net");
        assert_eq!(config.masters[1], "10.1.1.1:27900");
        assert!(config.masters[2..].iter().all(String::is_empty));
    }

    #[test]
    fn test_too_many_masters_rejected() {
        let mut argv = vec!["server".to_string()];
        for i in 0..=MAX_MASTERS {
            argv.push("--master".to_string());
            argv.push(format!("10.0.0.{}", i + 1));
        }
        assert!(Args::parse_from(argv).into_config().is_err());
    }

    #[test]
    fn test_client_limit_validated() {
        let args = Args::parse_from(["server", "--maxclients", "0"]);
        assert!(args.into_config().is_err());

        let args = Args::parse_from(["server", "--public", "false", "--maxclients", "32"]);
        let config = args.into_config().unwrap();
        assert!(!config.public);
        assert_eq!(config.max_clients, 32);
    }
}
