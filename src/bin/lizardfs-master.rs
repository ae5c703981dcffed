use std::path::PathBuf;

use anyhow::{Context, Error};

use lizardfs::master::{MasterConfig, MasterServer, MasterState};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(-1);
    }
}

fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LIZARDFS_LOG", "info"))
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);

    let config = match &config_path {
        Some(path) => MasterConfig::load(path)?,
        None => {
            log::warn!("no config file given, using built-in defaults");
            MasterConfig::default()
        }
    };

    proxmox_async::runtime::main(async move {
        let state = MasterState::new(config, config_path);
        let server = MasterServer::bind(state)
            .await
            .context("starting the master server")?;
        server.serve().await
    })
}
