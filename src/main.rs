use anyhow::Context as _;
use clap::{Parser, Subcommand};
use modelgate::{app, config::Config, logging, server, storage};
use std::net::{IpAddr, SocketAddr};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
    name = "modelgate",
    version,
    about = "AI provider gateway: probes channel models, relays client traffic"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    Migrate,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("初始化 Tokio Runtime 失败")?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    });

    let config = Config::from_env();

    let (data_dir, db_path) = match &config.database_path {
        Some(db_path) => {
            let data_dir = match db_path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            (data_dir, db_path.clone())
        }
        None => {
            let data_dir = app::default_data_dir()?;
            let db_path = app::db_path(&data_dir);
            (data_dir, db_path)
        }
    };

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("创建数据目录失败：{}", data_dir.display()))?;
    storage::init_db(&db_path).with_context(|| "初始化 SQLite 失败")?;
    logging::init(&data_dir)?;

    match cmd {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.host.clone());
            let port = port.unwrap_or(config.port);
            let ip: IpAddr = host
                .parse()
                .with_context(|| format!("监听地址无效：{host}"))?;
            let addr = SocketAddr::new(ip, port);

            tracing::event!(
                Level::INFO,
                addr = %addr,
                db = %db_path.display(),
                "modelgate listening"
            );

            server::serve(addr, db_path, data_dir, config).await
        }
        Command::Migrate => {
            println!("ok: {}", db_path.display());
            Ok(())
        }
    }
}
