use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
};

use clap::Parser;
use ib_echo::{
    bench::{run_role, BenchParams, Role},
    config::{BenchConfig, ConfigLoader},
    error::{BenchError, Result},
    exchange,
    verbs::{ibv::IbvDevice, mock::MockVerbs, QpCaps},
};
use log::{error, info};

const LOG_HEADER: &str = "======================================";

#[derive(Parser, Debug)]
#[command(name = "ib_echo", about = "RDMA reliable-connection echo benchmark")]
struct Args {
    /// Server: msg_size num_concurr_msgs sock_port.
    /// Client: server_name msg_size num_concurr_msgs sock_port
    #[arg(value_name = "ARGS")]
    positional: Vec<String>,

    /// TOML configuration file, defaults to /etc/ib-echo/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// RDMA device name, the first device when omitted
    #[arg(long)]
    device: Option<String>,

    /// Core the worker thread is pinned to
    #[arg(long)]
    core: Option<usize>,

    /// Operations ignored before timing starts
    #[arg(long)]
    warmup: Option<u64>,

    /// Operations after which the server stops the run
    #[arg(long)]
    total_ops: Option<u64>,

    /// Directory receiving the log file
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Run server and client in this process over an emulated device
    #[arg(long)]
    loopback: bool,
}

#[derive(Debug)]
enum Mode {
    Server { port: u16 },
    Client { server_name: String, port: u16 },
    Loopback { port: u16 },
}

impl Mode {
    fn log_file_name(&self) -> &'static str {
        match self {
            Mode::Server { .. } => Role::Server.log_file_name(),
            Mode::Client { .. } => Role::Client.log_file_name(),
            Mode::Loopback { .. } => "loopback.log",
        }
    }
}

#[derive(Debug)]
struct Invocation {
    mode: Mode,
    message_size: usize,
    concurrency: usize,
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BenchError::InvalidInput(format!("invalid {what}: {value}")))
}

/// `None` when the argument count matches no mode.
fn parse_invocation(args: &Args) -> Option<Result<Invocation>> {
    let parse = |rest: &[String]| -> Result<(usize, usize, u16)> {
        Ok((
            parse_num(&rest[0], "msg_size")?,
            parse_num(&rest[1], "num_concurr_msgs")?,
            parse_num(&rest[2], "sock_port")?,
        ))
    };
    let pos = &args.positional;
    let invocation = match (pos.len(), args.loopback) {
        (3, true) => parse(pos).map(|(message_size, concurrency, port)| Invocation {
            mode: Mode::Loopback { port },
            message_size,
            concurrency,
        }),
        (3, false) => parse(pos).map(|(message_size, concurrency, port)| Invocation {
            mode: Mode::Server { port },
            message_size,
            concurrency,
        }),
        (4, false) => parse(&pos[1..]).map(|(message_size, concurrency, port)| Invocation {
            mode: Mode::Client {
                server_name: pos[0].clone(),
                port,
            },
            message_size,
            concurrency,
        }),
        _ => return None,
    };
    Some(invocation)
}

fn print_usage() {
    println!("Usage:");
    println!("Server: ib_echo msg_size num_concurr_msgs sock_port");
    println!("Client: ib_echo server_name msg_size num_concurr_msgs sock_port");
    println!("Loopback: ib_echo --loopback msg_size num_concurr_msgs sock_port");
}

fn init_logging(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let env = env_logger::Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_micros(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
        .map_err(|e| BenchError::Setup(format!("failed to initialise logging: {e}")))
}

fn load_config(args: &Args) -> Result<BenchConfig> {
    let mut config = match args.config {
        Some(ref path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load_default()?,
    };
    if let Some(ref name) = args.device {
        config.device.name = Some(name.clone());
    }
    if let Some(core) = args.core {
        config.run.core = core;
    }
    if let Some(warmup) = args.warmup {
        config.run.warmup_ops = warmup;
    }
    if let Some(total_ops) = args.total_ops {
        config.run.total_ops = total_ops;
    }
    Ok(config)
}

fn print_config_info(inv: &Invocation, config: &BenchConfig) {
    info!("{LOG_HEADER}");
    info!("Config Info");
    match inv.mode {
        Mode::Server { port } => info!("is_server        = true, sock_port = {port}"),
        Mode::Client {
            ref server_name,
            port,
        } => info!("is_server        = false, server_name = {server_name}, sock_port = {port}"),
        Mode::Loopback { port } => info!("loopback         = true, sock_port = {port}"),
    }
    info!("msg_size         = {}", inv.message_size);
    info!("num_concurr_msgs = {}", inv.concurrency);
    info!("device           = {:?}", config.device);
    info!("run              = {:?}", config.run);
    info!("{LOG_HEADER}");
}

fn run(args: &Args, inv: Invocation) -> Result<()> {
    init_logging(&args.log_dir.join(inv.mode.log_file_name()))?;
    let config = load_config(args)?;
    print_config_info(&inv, &config);

    let caps = QpCaps::for_concurrency(inv.concurrency);
    let mut params = BenchParams {
        message_size: inv.message_size,
        concurrency: inv.concurrency,
        pin_core: Some(config.run.core),
        config,
    };
    params.validate()?;

    match inv.mode {
        Mode::Server { port } => {
            let device = IbvDevice::open(params.config.device(), caps)?;
            let listener = exchange::bind(port)?;
            let mut stream = exchange::accept_one(&listener)?;
            run_role(Role::Server, &params, device, &mut stream)?;
        }
        Mode::Client {
            ref server_name,
            port,
        } => {
            let device = IbvDevice::open(params.config.device(), caps)?;
            let mut stream = exchange::connect(server_name, port)?;
            run_role(Role::Client, &params, device, &mut stream)?;
        }
        Mode::Loopback { port } => {
            // Both workers spin, so neither is pinned.
            params.pin_core = None;
            let (server_verbs, client_verbs) = MockVerbs::pair(caps);
            let listener = exchange::bind(port)?;
            let port = listener.local_addr()?.port();
            let server_params = params.clone();
            let server = thread::Builder::new()
                .name("loopback-server".into())
                .spawn(move || -> Result<()> {
                    let mut stream = exchange::accept_one(&listener)?;
                    run_role(Role::Server, &server_params, server_verbs, &mut stream)?;
                    Ok(())
                })?;
            let mut stream = exchange::connect("127.0.0.1", port)?;
            let client = run_role(Role::Client, &params, client_verbs, &mut stream);
            server
                .join()
                .map_err(|_| BenchError::Setup("loopback server panicked".into()))??;
            client?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let Some(invocation) = parse_invocation(&args) else {
        print_usage();
        return ExitCode::SUCCESS;
    };
    match invocation.and_then(|inv| run(&args, inv)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("ib_echo: {e}");
            ExitCode::FAILURE
        }
    }
}
