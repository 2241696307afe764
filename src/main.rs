use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::io::AsyncBufReadExt;

use warden_core::engine::ServerManager;
use warden_core::proxy_port::ProxyPortListener;
use warden_core::session::{NoopSessionSink, NoopStatsSink};
use warden_core::Dependencies;

mod config;
mod oracle;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
    /// Verbose level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Disable reading from standard input for commands.
    #[arg(long)]
    ignore_stdin: bool,
    /// Disable colors from output.
    #[arg(long)]
    no_color: bool,
}

fn main() {
    let args = Args::parse();
    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(err) = SimpleLogger::new()
        .with_level(log_level)
        .with_colors(!args.no_color)
        .init()
    {
        eprintln!("Could not install the logger: {err}");
        return;
    }
    run(args);
}

#[tokio::main]
async fn run(args: Args) {
    let root_config = match config::read_config(&args.config).await {
        Ok(config) => config,
        Err(err) => {
            log::error!(
                "Could not read configuration file ({}): {}",
                args.config.to_string_lossy(),
                err
            );
            return;
        }
    };
    log::debug!("Parsed configuration: {:#?}", root_config);

    let deps = Arc::new(Dependencies {
        oracle: Arc::new(oracle::FileAclOracle::new(root_config.acl.clone())),
        verifier: None,
        outbounds: Arc::new(warden_core::outbound::OutboundManager::new()),
        session_sink: Arc::new(NoopSessionSink),
        stats_sink: Arc::new(NoopStatsSink),
    });
    for outbound in &root_config.outbounds {
        if let Err(err) = deps.outbounds.add_outbound(outbound.clone()).await {
            log::error!("Could not register outbound {}: {}", outbound.name, err);
        }
    }
    tokio::spawn({
        let outbounds = deps.outbounds.clone();
        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                outbounds.check_all_health().await;
            }
        }
    });

    let manager = Arc::new(ServerManager::new(deps.clone(), root_config.global.clone()));
    for server in &root_config.servers {
        if let Err(err) = manager.start_server(server.clone()).await {
            log::error!("[{}] Could not start server: {:?}", server.id, err);
        }
    }

    if root_config.global.proxy_ports_enabled {
        for port_config in root_config.proxy_ports.iter().filter(|port| port.enabled) {
            match ProxyPortListener::bind(port_config.clone(), deps.outbounds.clone()).await {
                Ok(listener) => {
                    tokio::spawn(Arc::new(listener).run());
                }
                Err(err) => {
                    log::error!(
                        "Could not bind proxy port {}: {:?}",
                        port_config.listen_addr,
                        err
                    );
                }
            }
        }
    }

    if !args.ignore_stdin {
        tokio::spawn({
            let manager = manager.clone();
            let config_file = args.config.clone();
            async move {
                log::info!("Console commands enabled");
                run_stdin_handler(manager, config_file).await;
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutdown requested..."),
        Err(err) => log::error!("Could not listen for shutdown signal: {:?}", err),
    }
    manager.stop_all().await;
}

async fn run_stdin_handler(manager: Arc<ServerManager>, config_file: PathBuf) {
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        let mut buf = String::new();
        let len = match reader.read_line(&mut buf).await {
            Ok(len) => len,
            Err(err) => {
                log::error!("Error reading user input: {:?}", err);
                continue;
            }
        };
        let line = buf[0..len].trim();
        let mut parts = line.split_whitespace();
        match parts.next().unwrap_or_default().to_lowercase().as_str() {
            "" => {}
            "reload" => match config::read_config(&config_file).await {
                Ok(root_config) => {
                    for server in root_config.servers {
                        let id = server.id.clone();
                        if let Err(err) = manager.reload_server(server).await {
                            log::error!("[{}] Reload failed: {:?}", id, err);
                        }
                    }
                    log::info!("Configuration reloaded");
                }
                Err(err) => log::error!("Couldn't reload configuration: {:?}", err),
            },
            "list" | "status" => {
                for status in manager.get_all_server_statuses().await {
                    log::info!(
                        "[{}] {:?} on {} | {} sessions | latency {}",
                        status.server_id,
                        status.proxy_mode,
                        status.listen_addr,
                        status.session_count,
                        status
                            .latency_ms
                            .map(|ms| format!("{ms}ms"))
                            .unwrap_or_else(|| "unknown".to_owned()),
                    );
                }
            }
            "kick" => {
                let name = parts.next().unwrap_or_default();
                if name.is_empty() {
                    log::warn!("Usage: kick <player> [reason]");
                    continue;
                }
                let reason = parts.collect::<Vec<&str>>().join(" ");
                let count = manager.kick_player(name, &reason).await;
                log::info!("Kicked {} session(s) of {}", count, name);
            }
            _ => log::warn!("Unknown command '{}'", line),
        }
    }
}
