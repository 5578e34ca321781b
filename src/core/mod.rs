use log::{debug, info};

mod cmd;
mod config;
mod error;
mod network;

pub use cmd::*;
pub use config::*;
pub use error::NetError;
pub use network::*;

async fn run(cli: CLI) -> anyhow::Result<()> {
    let config = cli.root.map(NetworkConfig::with_root).unwrap_or_default();
    debug!("Using network state under {}", config.networks_dir.display());

    let mut networks = Networks::init(config)?;

    match cli.command {
        Commands::Network(NetworkCommands::Create(args)) => create_network(&mut networks, args).await,
        Commands::Network(NetworkCommands::List) => list_networks(&networks),
        Commands::Network(NetworkCommands::Remove(args)) => remove_network(&mut networks, args).await,
        Commands::Connect(args) => connect_container(&networks, args).await,
        Commands::Disconnect(args) => disconnect_container(&networks, args).await,
    }
}

async fn create_network(networks: &mut Networks, args: NetCreateArgs) -> anyhow::Result<()> {
    let network = networks.create(&args.driver, &args.subnet, &args.name).await?;
    println!("{}", network.name);

    Ok(())
}

fn list_networks(networks: &Networks) -> anyhow::Result<()> {
    print!("{}", networks.list()?);

    Ok(())
}

async fn remove_network(networks: &mut Networks, args: NetRemoveArgs) -> anyhow::Result<()> {
    networks.delete(&args.name).await?;
    println!("{}", args.name);

    Ok(())
}

async fn connect_container(networks: &Networks, args: ConnectArgs) -> anyhow::Result<()> {
    let container = ContainerInfo::new(&args.id, args.pid, args.publish);
    let endpoint = Connector::default()
        .connect(networks, &args.network, &container)
        .await?;

    info!("Endpoint {} is {}", endpoint.id, endpoint.ip_address);
    println!("{}", endpoint.ip_address);

    Ok(())
}

async fn disconnect_container(networks: &Networks, args: DisconnectArgs) -> anyhow::Result<()> {
    let network = networks
        .get(&args.network)
        .ok_or(NetError::NoSuchNetwork(args.network.clone()))?;

    let mut endpoint = Endpoint::new(&args.id, network, args.ip, args.publish);
    endpoint.device = Some(veth_pair(&endpoint.id, &network.name));

    Connector::default().disconnect(networks, &endpoint).await
}

/// Runs one command to completion on a fresh runtime.
pub fn execute(cli: CLI) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}
