// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use authority_chain::config::NodeConfig;
use authority_chain::crypto::{address_of, sign_tx};
use authority_chain::keys::KeyStore;
use authority_chain::node::Node;
use authority_chain::p2p::HttpTransport;
use authority_chain::rpc::SubmitResp;
use authority_chain::types::{AccountView, Address, Transaction};

#[derive(Parser)]
#[command(author, version, about = "Single-authority blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node; flags override values from the config file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Write a default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Create (or show) a named key in a key store
    Keygen {
        #[arg(long, default_value = "data/keys")]
        dir: PathBuf,
        #[arg(long, default_value = "wallet")]
        name: String,
        #[arg(long, default_value = "")]
        pass: String,
    },
    /// Query an account on a running node
    Account {
        #[arg(long, default_value = "127.0.0.1:9000")]
        node: String,
        address: Address,
        #[arg(long, default_value_t = false)]
        pending: bool,
    },
    /// Sign a transfer with a stored key and submit it to a running node
    Transfer {
        #[arg(long, default_value = "127.0.0.1:9000")]
        node: String,
        #[arg(long, default_value = "data/keys")]
        dir: PathBuf,
        #[arg(long, default_value = "wallet")]
        name: String,
        #[arg(long, default_value = "")]
        pass: String,
        to: Address,
        value: u64,
    },
}

#[derive(Args, Default)]
struct Overrides {
    #[arg(long)]
    node_addr: Option<String>,
    #[arg(long)]
    bootstrap: Option<bool>,
    #[arg(long)]
    seed_addr: Option<String>,
    #[arg(long)]
    key_store_dir: Option<PathBuf>,
    #[arg(long)]
    block_store_dir: Option<PathBuf>,
    #[arg(long)]
    chain: Option<String>,
    #[arg(long)]
    auth_pass: Option<String>,
    #[arg(long)]
    balance: Option<u64>,
}

impl Overrides {
    fn apply(self, cfg: &mut NodeConfig) {
        if let Some(v) = self.node_addr { cfg.node_addr = v; }
        if let Some(v) = self.bootstrap { cfg.bootstrap = v; }
        if let Some(v) = self.seed_addr { cfg.seed_addr = Some(v); }
        if let Some(v) = self.key_store_dir { cfg.key_store_dir = v; }
        if let Some(v) = self.block_store_dir { cfg.block_store_dir = v; }
        if let Some(v) = self.chain { cfg.chain = v; }
        if let Some(v) = self.auth_pass { cfg.auth_pass = v; }
        if let Some(v) = self.balance { cfg.balance = v; }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Commands::Start { config, overrides } => start_node(config, overrides).await,
        Commands::GenerateConfig { path } => {
            NodeConfig::default().save(&path)?;
            info!(path = %path.display(), "wrote default config");
            Ok(())
        }
        Commands::Keygen { dir, name, pass } => {
            let key = KeyStore::open(&dir)?.load_or_create(&name, &pass)?;
            println!("{}", address_of(&key));
            Ok(())
        }
        Commands::Account { node, address, pending } => {
            let view = fetch_account(&reqwest::Client::new(), &node, &address, pending).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Transfer { node, dir, name, pass, to, value } => {
            transfer(&node, dir, &name, &pass, to, value).await
        }
    }
}

async fn start_node(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let mut cfg = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        NodeConfig::default()
    };
    overrides.apply(&mut cfg);

    let transport = Arc::new(HttpTransport::new(cfg.request_timeout())?);
    let node = Node::open(cfg, transport).await.context("node failed to start")?;
    node.run().await?;
    Ok(())
}

async fn fetch_account(client: &reqwest::Client, node: &str, who: &Address, pending: bool) -> Result<AccountView> {
    let resp = client
        .get(format!("http://{node}/accounts/{who}?pending={pending}"))
        .send()
        .await?;
    if !resp.status().is_success() {
        bail!("account query failed: {}", resp.text().await.unwrap_or_default());
    }
    Ok(resp.json().await?)
}

async fn transfer(node: &str, dir: PathBuf, name: &str, pass: &str, to: Address, value: u64) -> Result<()> {
    let key = KeyStore::open(&dir)?.load(name, pass)?;
    let from = address_of(&key);
    let client = reqwest::Client::new();
    // next nonce comes from the pending view so queued transfers chain up
    let nonce = fetch_account(&client, node, &from, true).await?.nonce + 1;
    let tx = sign_tx(&key, Transaction::new(from, to, value, nonce));

    let resp = client.post(format!("http://{node}/tx")).json(&tx).send().await?;
    if !resp.status().is_success() {
        bail!("transfer rejected: {}", resp.text().await.unwrap_or_default());
    }
    let body: SubmitResp = resp.json().await?;
    println!("{}", body.hash);
    Ok(())
}
