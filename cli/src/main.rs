//! evmrpc CLI — query a single EVM node from the terminal.
//!
//! Usage:
//! ```bash
//! # Latest and finalized heads
//! evmrpc head --http https://eth.example/rpc
//!
//! # Balance at a block, only once that block is finalized
//! evmrpc balance --http https://eth.example/rpc --address 0x... --block 19000000 --confidence finalized
//!
//! # Logs of a range on a chain with per-transaction log indices
//! evmrpc logs --http https://sei.example/rpc --chain sei --from 100 --to 110
//!
//! # Follow new heads over a WebSocket
//! evmrpc watch --ws wss://eth.example/ws --count 5
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `warn`).

use std::env;
use std::process;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::EnvFilter;
use url::Url;

use evmrpc_client::{ClientConfig, RpcClient};
use evmrpc_core::{ChainType, ConfidenceLevel, FilterQuery, ReadOpts, RequestContext};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "head" => cmd_head(&args[2..]).await,
        "balance" => cmd_balance(&args[2..]).await,
        "logs" => cmd_logs(&args[2..]).await,
        "watch" => cmd_watch(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("evmrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("evmrpc {}", env!("CARGO_PKG_VERSION"));
    println!("Query a single EVM node\n");
    println!("USAGE:");
    println!("    evmrpc <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    head       Latest and finalized heads, chain info");
    println!("    balance    Account balance at a block");
    println!("    logs       Logs of a block range");
    println!("    watch      Follow new heads (WebSocket or polling)");
    println!("    call       Send a raw JSON-RPC call");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("NODE FLAGS:");
    println!("    --ws <URL>              WebSocket endpoint");
    println!("    --http <URL>            HTTP endpoint");
    println!("    --chain <TYPE>          Chain family (generic, astar, sei, tron, ...)");
    println!("    --chain-id <ID>         Chain id stamped on heads  [default: 1]");
    println!("    --finality-tags         Node supports the finalized/safe tags");
    println!("    --finality-depth <N>    Depth used without finality tags  [default: 50]");
    println!("    --poll-ms <MS>          Poll for heads instead of subscribing\n");
    println!("READ FLAGS:");
    println!("    --block <N>             Block height  [default: latest]");
    println!("    --confidence <LEVEL>    unconfirmed | finalized | safe");
    println!("    --address <ADDR>        Account or contract address");
    println!("    --from <N> --to <N>     Log range");
    println!("    --method <NAME>         Raw call method");
    println!("    --params <JSON>         Raw call params array  [default: []]");
    println!("    --count <N>             Heads to print before exiting  [default: 10]");
}

/// Build and dial a client from the node flags.
async fn connect(args: &[String]) -> Result<RpcClient> {
    let ws = parse_flag(args, "--ws")
        .map(|u| Url::parse(&u).context("invalid --ws url"))
        .transpose()?;
    let http = parse_flag(args, "--http")
        .map(|u| Url::parse(&u).context("invalid --http url"))
        .transpose()?;
    if ws.is_none() && http.is_none() {
        bail!("--ws or --http is required");
    }

    let mut cfg = ClientConfig {
        name: "cli".into(),
        finality_tag_enabled: args.iter().any(|a| a == "--finality-tags"),
        ..ClientConfig::default()
    };
    if let Some(chain) = parse_flag(args, "--chain") {
        cfg.chain_type = chain.parse::<ChainType>().map_err(|e| anyhow!(e))?;
    }
    if let Some(id) = parse_flag(args, "--chain-id") {
        cfg.chain_id = id.parse().context("invalid --chain-id")?;
    }
    if let Some(depth) = parse_flag(args, "--finality-depth") {
        cfg.finality_depth = depth.parse().context("invalid --finality-depth")?;
    }
    if let Some(ms) = parse_flag(args, "--poll-ms") {
        let interval = Duration::from_millis(ms.parse().context("invalid --poll-ms")?);
        cfg.new_heads_poll_interval = interval;
        cfg.finalized_block_poll_interval = interval;
    }

    let client = RpcClient::new(cfg, ws, http);
    client.dial(&RequestContext::background()).await?;
    tracing::debug!(node = %client, "dialed");
    Ok(client)
}

fn read_opts(args: &[String]) -> Result<ReadOpts> {
    let confidence = match parse_flag(args, "--confidence") {
        Some(level) => level.parse::<ConfidenceLevel>().map_err(|e| anyhow!(e))?,
        None => ConfidenceLevel::Unconfirmed,
    };
    Ok(ReadOpts::confidence(confidence))
}

fn parse_height(args: &[String], flag: &str) -> Result<Option<i64>> {
    parse_flag(args, flag)
        .map(|n| n.parse::<i64>().with_context(|| format!("invalid {flag}")))
        .transpose()
}

async fn cmd_head(args: &[String]) -> Result<()> {
    let client = connect(args).await?;
    let ctx = RequestContext::background();

    let start = std::time::Instant::now();
    let latest = client.block_by_number(&ctx, None).await?;
    let latency = start.elapsed();
    println!("  Latest:    {} {}", latest.number, latest.hash);
    match client.latest_finalized_block(&ctx).await {
        Ok(head) => println!("  Finalized: {} {}", head.number, head.hash),
        Err(e) => println!("  Finalized: unavailable ({e})"),
    }
    println!("  Chain id:  {}", client.chain_id(&ctx).await?);
    println!("  Latency:   {}ms", latency.as_millis());

    client.close();
    Ok(())
}

async fn cmd_balance(args: &[String]) -> Result<()> {
    let address: Address = parse_flag(args, "--address")
        .ok_or_else(|| anyhow!("--address is required"))?
        .parse()
        .context("invalid --address")?;
    let block = parse_height(args, "--block")?;
    let opts = read_opts(args)?;
    let client = connect(args).await?;

    let balance = client
        .balance_at_with_opts(&RequestContext::background(), address, block, opts)
        .await?;
    println!("{balance}");
    client.close();
    Ok(())
}

async fn cmd_logs(args: &[String]) -> Result<()> {
    let query = FilterQuery {
        from_block: parse_height(args, "--from")?,
        to_block: parse_height(args, "--to")?,
        addresses: parse_flag(args, "--address")
            .map(|a| a.parse::<Address>().context("invalid --address"))
            .transpose()?
            .into_iter()
            .collect(),
        ..FilterQuery::default()
    };
    let opts = read_opts(args)?;
    let client = connect(args).await?;

    let logs = client
        .filter_logs_with_opts(&RequestContext::background(), &query, opts)
        .await?;
    for log in &logs {
        println!("{}", serde_json::to_string(log)?);
    }
    eprintln!("{} logs", logs.len());
    client.close();
    Ok(())
}

async fn cmd_watch(args: &[String]) -> Result<()> {
    let count: usize = match parse_flag(args, "--count") {
        Some(n) => n.parse().context("invalid --count")?,
        None => 10,
    };
    let client = connect(args).await?;

    let (mut heads, sub) = client
        .subscribe_to_heads(&RequestContext::background())
        .await?;
    let mut err = sub.err();
    for _ in 0..count {
        tokio::select! {
            head = heads.recv() => match head {
                Some(head) => println!("{} {}", head.number, head.hash),
                None => break,
            },
            failed = err.recv() => {
                if let Some(e) = failed {
                    bail!("subscription failed: {e}");
                }
                break;
            }
        }
    }
    sub.unsubscribe();
    client.close();
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params: Vec<serde_json::Value> = match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON array")?,
        None => vec![],
    };
    let client = connect(args).await?;

    let result: Option<serde_json::Value> = client
        .call_context(&RequestContext::background(), &method, params)
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result.unwrap_or_default())?
    );
    client.close();
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
