use crate::demo::{run_demo, DemoArgs};
use crate::infra::{parse_tenant_seed, TenantSeed};
use crate::server;
use clap::{Args, Parser, Subcommand};
use resido::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Resido",
    about = "Run the Resido process and payment engine from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service and worker pool (default command)
    Serve(ServeArgs),
    /// Run an in-process refund walkthrough against the simulated gateway
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Tenant to provision at startup, as `schema=domain`. Repeatable.
    #[arg(long = "tenant", value_parser = parse_tenant_seed)]
    pub(crate) tenants: Vec<TenantSeed>,
    /// Seconds between scheduler ticks
    #[arg(long, default_value_t = 30)]
    pub(crate) scheduler_period_secs: u64,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}
