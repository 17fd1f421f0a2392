use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use yggdrasil::account::file::FileAccountDb;
use yggdrasil::account::sql::SqlAccountDb;
use yggdrasil::account::AccountDb;
use yggdrasil::config::{LoginConfig, StorageBackend};
use yggdrasil::login::LoginState;
use yggdrasil::network::subnet::SubnetList;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/login.conf".to_string();
    let mut lan_file = "conf/lan.conf".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: login_server [--conf FILE] [--lan-conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            "--lan-conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    lan_file = args[i].clone();
                } else {
                    eprintln!("Error: --lan-conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = match LoginConfig::from_file(&conf_file) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("[login] [config_missing] file={} err={} (using defaults)", conf_file, e);
            LoginConfig::default()
        }
    };

    let subnets = match SubnetList::from_file(&lan_file) {
        Ok(subnets) => subnets,
        Err(e) => {
            tracing::warn!("[login] [lan_config_missing] file={} err={}", lan_file, e);
            SubnetList::default()
        }
    };

    let accounts: Arc<dyn AccountDb> = match config.account_storage {
        StorageBackend::File => Arc::new(
            FileAccountDb::open(&config.accounts_file, config.case_sensitive)
                .with_context(|| format!("Cannot open account file: {}", config.accounts_file))?,
        ),
        StorageBackend::Sql => {
            let db_url = format!(
                "mysql://{}:{}@{}:{}/{}",
                config.sql_id, config.sql_pw, config.sql_ip, config.sql_port, config.sql_db
            );
            let pool = MySqlPoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await
                .with_context(|| format!("Cannot connect to DB: {}", config.sql_ip))?;
            Arc::new(SqlAccountDb::new(pool, config.case_sensitive))
        }
    };

    let console = config.console;
    let state = Arc::new(LoginState::new(config, accounts, subnets));
    tracing::info!("[login] [started] Login Server Started");

    // keep one sender alive so the select arm never sees a closed channel
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    if console {
        tokio::spawn(console_loop(shutdown_tx.clone()));
    }

    tokio::select! {
        result = LoginState::run(Arc::clone(&state)) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[login] [shutdown] signal received");
        }
        _ = shutdown_rx.recv() => {
            tracing::info!("[login] [shutdown] console request");
        }
    }

    Ok(())
}

async fn console_loop(shutdown: mpsc::UnboundedSender<()>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim().to_ascii_lowercase().as_str() {
            "shutdown" | "exit" | "quit" | "end" => {
                let _ = shutdown.send(());
                break;
            }
            "alive" | "status" => tracing::info!("[console] I'm Alive."),
            "help" => {
                tracing::info!("[console] commands: shutdown|exit|quit|end, alive|status, help");
            }
            "" => {}
            other => tracing::info!("[console] unknown command: {}", other),
        }
    }
}
