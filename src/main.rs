use clap::{Args, Parser, Subcommand};

use miniker::{
    enter_if_requested, init_container, CgroupConfig, Error, RunConfig, Runtime,
};

#[derive(Parser)]
#[command(name = "miniker", about = "Simple docker runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container
    Run(RunArgs),
    /// Init container process (internal)
    #[command(hide = true)]
    Init,
    /// Create a new image from a container
    Commit { container: String, image: String },
    /// List all containers
    Ps,
    /// Print a container's log
    Logs { container: String },
    /// Run a command in a running container
    Exec {
        container: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Stop a running container
    Stop { container: String },
    /// Remove an exited container
    Remove { container: String },
    /// Manage networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Enable tty
    #[arg(short = 'i', short_alias = 't', long = "it", overrides_with = "it")]
    it: bool,
    /// Run container in background
    #[arg(short = 'd', long = "detach")]
    detach: bool,
    /// Memory limit in bytes
    #[arg(short = 'm', long = "memory")]
    memory: Option<String>,
    /// CPU shares (relative weight)
    #[arg(long)]
    cpushare: Option<String>,
    /// CPUs in which to allow execution
    #[arg(long)]
    cpuset: Option<String>,
    /// Bind mount a volume (host:container)
    #[arg(short = 'v', long = "volume")]
    volume: Option<String>,
    /// Assign a name to the container
    #[arg(long)]
    name: Option<String>,
    /// Connect the container to a network
    #[arg(long)]
    network: Option<String>,
    /// Publish a container's TCP port (host:container)
    #[arg(short = 'p', long = "publish")]
    publish: Vec<String>,
    /// Image name
    image: String,
    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Create a network
    Create {
        /// Network segment in CIDR notation
        #[arg(long)]
        subnet: String,
        /// Driver to manage the network
        #[arg(long, default_value = "bridge")]
        driver: String,
        name: String,
    },
    /// List networks
    Ls,
    /// Remove a network
    Rm { name: String },
}

fn main() {
    env_logger::init();
    enter_if_requested();
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Run(args) => run(args),
        Commands::Init => init_container().map(|_| ()),
        Commands::Commit { container, image } => Runtime::new()?.commit(&container, &image),
        Commands::Ps => ps(),
        Commands::Logs { container } => {
            print!("{}", Runtime::new()?.logs(&container)?);
            Ok(())
        }
        Commands::Exec { container, command } => Runtime::new()?.exec(&container, &command),
        Commands::Stop { container } => Runtime::new()?.stop(&container),
        Commands::Remove { container } => Runtime::new()?.remove(&container),
        Commands::Network { command } => match command {
            NetworkCommands::Create {
                subnet,
                driver,
                name,
            } => Runtime::new()?.create_network(&driver, &subnet, &name),
            NetworkCommands::Ls => network_ls(),
            NetworkCommands::Rm { name } => Runtime::new()?.remove_network(&name),
        },
    }
}

fn run(args: RunArgs) -> Result<(), Error> {
    if args.it == args.detach {
        return Err("Exactly one of -it and -d must be given".into());
    }
    let tty = args.it;
    let config = RunConfig {
        tty,
        command: args.command,
        cgroup: CgroupConfig {
            mem_limit: args.memory.unwrap_or_default(),
            cpu_share: args.cpushare.unwrap_or_default(),
            cpu_set: args.cpuset.unwrap_or_default(),
        },
        volume: args.volume.unwrap_or_default(),
        name: args.name.unwrap_or_default(),
        image: args.image,
        network: args.network.unwrap_or_default(),
        port_mappings: args.publish,
    };
    let name = Runtime::new()?.run(config)?;
    if !tty {
        println!("{name}");
    }
    Ok(())
}

fn ps() -> Result<(), Error> {
    let records = Runtime::new()?.list()?;
    println!(
        "{:<10} {:<12} {:<8} {:<8} {:<20} {}",
        "Id", "Name", "Pid", "Status", "CreateTime", "Command"
    );
    for record in records {
        println!(
            "{:<10} {:<12} {:<8} {:<8} {:<20} {}",
            record.id, record.name, record.pid, record.status, record.create_time, record.command
        );
    }
    Ok(())
}

fn network_ls() -> Result<(), Error> {
    let runtime = Runtime::new()?;
    println!("{:<12} {:<20} {}", "Name", "IpRange", "Driver");
    for network in runtime.networks() {
        println!(
            "{:<12} {:<20} {}",
            network.name, network.ip_range, network.driver
        );
    }
    Ok(())
}
