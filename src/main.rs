use std::process::exit;

use clap::Parser;
use log::error;

use rtain_net::{execute, CLI};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = CLI::parse();

    if let Err(e) = execute(cli) {
        error!("{:#}", e);
        exit(-1);
    }
}
