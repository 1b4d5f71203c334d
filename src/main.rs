// Module declarations
mod cli;
mod config;
mod console;
mod error;
mod gateway;
mod memory;
mod sessions;
mod util;

// Crate-root re-exports so modules can refer to each other's items directly.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use console::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use gateway::*;
#[allow(unused_imports)]
pub(crate) use memory::*;
#[allow(unused_imports)]
pub(crate) use sessions::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = cli::Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli.command))
}

async fn run(command: cli::Command) -> Result<(), Box<dyn std::error::Error>> {
    let gateway_config = config::GatewayConfig::from_env();
    let retriever_config = config::RetrieverConfig::from_env(gateway_config.home.clone());

    match command {
        cli::Command::Serve => {
            tokio::fs::create_dir_all(&gateway_config.home).await?;
            let sessions = Arc::new(sessions::SessionMap::load(&gateway_config.sessions_file()));
            let retriever = Arc::new(memory::HybridRetriever::from_config(&retriever_config));
            info!(
                program = %gateway_config.program,
                home = %gateway_config.home.display(),
                memory = %retriever.mode(),
                "gateway starting"
            );
            let gateway = gateway::Gateway::spawn(gateway_config, sessions, retriever);

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            console::run_console(gateway, shutdown).await?;
            info!("gateway stopped");
            Ok(())
        }

        cli::Command::Index => {
            let retriever = memory::HybridRetriever::from_config(&retriever_config);
            if retriever.mode() == memory::MemoryMode::Disabled {
                warn!("session memory is disabled; nothing to index");
            }
            let report = retriever.index_pending().await;
            println!(
                "{} transcripts, {} pending, {} indexed, {} failed",
                report.total, report.pending, report.indexed, report.failed
            );
            Ok(())
        }

        cli::Command::Search { query, top_k, json } => {
            let retriever = memory::HybridRetriever::from_config(&retriever_config);
            let hits = retriever.search(&query, top_k).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }
            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (idx, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{}] {:.3}  {}",
                    idx + 1,
                    hit.thread_id,
                    hit.similarity,
                    util::truncate_chars(&hit.content, 200).replace('\n', " ")
                );
            }
            Ok(())
        }

        cli::Command::Status { json } => {
            let retriever = memory::HybridRetriever::from_config(&retriever_config);
            let status = retriever.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.summary());
                println!("sessions dir: {}", status.sessions_dir);
                match &status.backend {
                    Some(memory::BackendStatus::External { base_url, dataset_id }) => {
                        println!("service: {base_url} (dataset {dataset_id})");
                    }
                    Some(memory::BackendStatus::Local { db_path, model, initialized, .. }) => {
                        println!("store: {db_path}");
                        println!("model: {model} (loaded: {initialized})");
                    }
                    None => {}
                }
            }
            Ok(())
        }

        cli::Command::Sessions { json } => {
            let map = sessions::SessionMap::load(&gateway_config.sessions_file());
            let records = map.records().await;
            if json {
                let records: BTreeMap<_, _> = records.into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("No sessions.");
            }
            for (thread, record) in records {
                println!(
                    "{thread}\t{}\tinitialized={}\tmodel={}",
                    record.session_id,
                    record.initialized,
                    record.model.as_deref().unwrap_or("default")
                );
            }
            Ok(())
        }
    }
}
