//! nms-ring — transparent proxy for the planet probe console tool.
//!
//! Usage:
//!   nms-ring [-l LEVEL] "E:\Tool\超级行星探针.exe"
//!
//! Launches the target on a pseudo-terminal, mirrors its output, forwards
//! input on its prompts, and rings once per scan pass with the best grade
//! found — if that grade clears the threshold.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nms_ring_core::{proxy, ring, ProxyOptions, Severity, Transport};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nms-ring")]
#[command(about = "Ring a bell when the planet probe finds something good")]
#[command(version)]
struct Args {
    /// Path to the target executable
    target: String,

    /// Minimum severity that rings: E, D, C, B, A, S, SS, SS+ or SSS
    #[arg(short = 'l', long = "level", default_value = "S")]
    level: String,

    /// I/O transport: "pty" passes the target's own formatting through,
    /// "raw" is for legacy builds that write GBK to plain pipes
    #[arg(long, default_value = "pty")]
    transport: String,

    /// Quiet period in milliseconds before a scan pass's best grade rings
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,

    /// Output substring that marks the end of one scan pass
    #[arg(long)]
    pass_marker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let threshold: Severity = args
        .level
        .parse()
        .with_context(|| format!("invalid level '{}'", args.level))?;
    let transport = match args.transport.as_str() {
        "pty" => Transport::Pty,
        "raw" => Transport::Raw,
        other => anyhow::bail!("invalid transport '{other}' (expected pty or raw)"),
    };

    let mut options = ProxyOptions {
        transport,
        debounce: Duration::from_millis(args.delay_ms),
        ..ProxyOptions::default()
    };
    if let Some(marker) = args.pass_marker {
        options.pass_marker = marker;
    }

    // The override ring lives next to the proxy's own executable.
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()));
    let player = ring::init_player(threshold, exe_dir.as_deref())
        .context("failed to set up ring player")?;

    // Preview so the operator can check the volume before the run.
    if player.is_custom_ring_set() {
        println!("3秒后将预览提醒铃声(自定义铃声)...");
    } else {
        println!("3秒后将预览提醒铃声...");
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    if let Err(e) = player.play(Severity::Sss) {
        eprintln!("提醒铃声预览失败: {e}");
    }
    println!("提醒铃声预览结束.(如未听到声音,请检查您的设备音量,并重新运行)");

    info!(target = %args.target, %threshold, "starting proxy");
    proxy::run(&args.target, options, player)
        .await
        .context("proxy session failed")?;

    Ok(())
}
