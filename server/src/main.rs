use clap::{Parser, Subcommand};
use meshd::config::{MeshConfig, ServerConfig};
use meshd::db::conflict::{ConflictRepo, ConflictSource};
use meshd::db::user::UserRepo;
use meshd::{db, VERSION};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "meshd", author, version, about = "Mesh VPN control plane: subnet allocation, WireGuard peers, SSH tunnel broker.")]
struct Opts {
    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(short, long, default_value = "/etc/meshd")]
    config_dir: PathBuf,

    #[clap(short, long, default_value = "/var/lib/meshd")]
    data_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane: HTTP API, SSH tunnel broker, and background tasks.
    Serve,

    /// Print the version and exit.
    Version,

    /// Administrative database operations.
    Admin {
        #[clap(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// List registered users and their subnets.
    ListUsers,

    /// Deactivate a user, soft-deleting their account.
    DeactivateUser { email: String },

    /// List active network conflicts.
    ListConflicts,

    /// Manually record a network conflict.
    AddConflict { cidr: String, description: Option<String> },
}

#[tokio::main]
async fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,meshd=info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();
    let server_config = ServerConfig::new(opts.config_dir, opts.data_dir);

    let result = match opts.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(server_config).await,
        Command::Version => {
            println!("meshd {VERSION}");
            Ok(())
        },
        Command::Admin { command } => run_admin(server_config, command),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            log::error!("{e}");
            eprintln!("meshd: fatal: {e}");
            std::process::exit(1);
        },
    }
}

async fn run_serve(server_config: ServerConfig) -> anyhow::Result<()> {
    let mesh = MeshConfig::from_env()?;
    meshd::lifecycle::run(mesh, server_config).await
}

fn run_admin(server_config: ServerConfig, command: AdminCommand) -> anyhow::Result<()> {
    let conn = db::open_database_connection(&server_config.database_path())?;

    match command {
        AdminCommand::ListUsers => {
            for user in UserRepo::list_all(&conn)? {
                println!("{}\t{}\t{}\tactive={}", user.id, user.email, user.subnet, user.active);
            }
        },
        AdminCommand::DeactivateUser { email } => {
            let user = UserRepo::get_by_email(&conn, &email)?.ok_or(meshd::ServerError::NotFound)?;
            UserRepo::deactivate(&conn, user.id)?;
            println!("deactivated {email}");
        },
        AdminCommand::ListConflicts => {
            for conflict in ConflictRepo::list_active(&conn)? {
                println!("{} ({:?})", conflict.cidr, conflict.source);
            }
        },
        AdminCommand::AddConflict { cidr, description } => {
            let cidr = cidr.parse().map_err(|_| meshd::ServerError::Validation("invalid CIDR".into()))?;
            ConflictRepo::record(&conn, cidr, ConflictSource::Manual, description.as_deref())?;
            println!("recorded conflict {cidr}");
        },
    }

    Ok(())
}
