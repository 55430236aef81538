// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rdsync-probe - RPC latency probe
//!
//! Measures round-trip latency of `RdCall` requests between two peers
//! connected over TCP. Run `pong` on one side and `ping` on the other.

use clap::{Parser, Subcommand};
use colored::*;
use rdsync::{
    Bindable, LifetimeDef, MessageBroker, Protocol, ProtocolConfig, RdCall, RpcError,
    RpcTimeouts, Serializers, SocketConfig, SocketWire, SynchronousScheduler, Wire,
};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO_CALL: &str = "echo";

/// rdsync latency probe
#[derive(Parser, Debug)]
#[command(name = "rdsync-probe")]
#[command(version)]
#[command(about = "Measure rdsync RPC round-trip latency")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Address the pong side listens on and the ping side connects to
    #[arg(short, long, default_value = "127.0.0.1:7400", global = true)]
    addr: SocketAddr,

    /// Protocol name (must match on both sides)
    #[arg(long, default_value = "probe", global = true)]
    protocol: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Call the echo endpoint and measure RTT
    Ping {
        /// Payload size in bytes
        #[arg(short = 's', long, default_value = "64")]
        size: usize,

        /// Number of measured calls
        #[arg(short = 'n', long, default_value = "1000")]
        count: u64,

        /// Warmup calls before measurement
        #[arg(short, long, default_value = "10")]
        warmup: u64,

        /// Interval between calls in microseconds
        #[arg(short, long, default_value = "1000")]
        interval: u64,

        /// Per-call timeout in milliseconds
        #[arg(short, long, default_value = "3000")]
        timeout: u64,

        /// Output JSON results
        #[arg(long)]
        json: bool,

        /// Quiet mode - only output final results
        #[arg(long)]
        quiet: bool,
    },
    /// Serve the echo endpoint
    Pong {
        /// Quiet mode
        #[arg(long)]
        quiet: bool,
    },
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match &args.mode {
        Mode::Ping {
            size,
            count,
            warmup,
            interval,
            timeout,
            json,
            quiet,
        } => run_ping(
            args,
            &PingOptions {
                size: *size,
                count: *count,
                warmup: *warmup,
                interval_us: *interval,
                timeout_ms: *timeout,
                json: *json,
                quiet: *quiet,
            },
            &running,
        ),
        Mode::Pong { quiet } => run_pong(args, *quiet, &running),
    }
}

struct PingOptions {
    size: usize,
    count: u64,
    warmup: u64,
    interval_us: u64,
    timeout_ms: u64,
    json: bool,
    quiet: bool,
}

fn run_ping(
    args: &Args,
    opts: &PingOptions,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let verbose = !opts.quiet && !opts.json;
    if verbose {
        eprintln!("{} Latency probe (ping mode)", ">>>".green().bold());
        eprintln!(
            "    addr={}, size={} bytes, count={}, warmup={}",
            args.addr, opts.size, opts.count, opts.warmup
        );
        eprintln!("{}", "    Waiting for pong responder...".dimmed());
    }

    let def = LifetimeDef::new();
    let wire = SocketWire::client(
        "probe-ping",
        args.addr,
        SocketConfig::default(),
        MessageBroker::new(),
        def.lifetime(),
    )?;
    while !wire.wait_connected(Duration::from_millis(200)) {
        if !running.load(Ordering::SeqCst) {
            def.terminate();
            return Ok(());
        }
    }

    let protocol = Protocol::new(
        ProtocolConfig::client(args.protocol.clone()),
        Arc::new(Serializers::new()),
        Arc::new(SynchronousScheduler),
        wire.clone(),
        def.lifetime(),
    );
    let echo = RdCall::<String, String>::new();
    protocol.bind_top_level(echo.as_ref(), ECHO_CALL);
    log::debug!("bound `{}`", echo.location());

    let timeout = Duration::from_millis(opts.timeout_ms);
    let timeouts = RpcTimeouts::new(timeout / 2, timeout);
    let filler = "x".repeat(opts.size.saturating_sub(20));

    let mut latencies: Vec<f64> = Vec::with_capacity(opts.count as usize);
    let mut lost = 0u64;
    let mut errors = 0u64;

    if verbose && opts.warmup > 0 {
        eprintln!("{}", "    Warmup...".dimmed());
    }

    let start_time = Instant::now();

    for i in 0..opts.warmup + opts.count {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let is_warmup = i < opts.warmup;
        let request = format!("{:020}{}", i, filler);

        let sent_at = Instant::now();
        match echo.sync(request.clone(), timeouts) {
            Ok(reply) if reply == request => {
                if !is_warmup {
                    latencies.push(sent_at.elapsed().as_secs_f64() * 1_000_000.0);
                }
            }
            Ok(_) => {
                errors += 1;
                if !opts.quiet {
                    eprintln!("\n{}: reply to call {} did not match", "Warning".yellow(), i);
                }
            }
            Err(RpcError::Timeout) => {
                if !is_warmup {
                    lost += 1;
                }
            }
            Err(e) => {
                errors += 1;
                if !opts.quiet {
                    eprintln!("\n{}: call {} failed: {}", "Warning".yellow(), i, e);
                }
                if !wire.is_connected() {
                    break;
                }
            }
        }

        if verbose && !is_warmup {
            let done = i - opts.warmup + 1;
            if done.is_multiple_of(100) {
                eprint!("\r    Progress: {}/{}", done, opts.count);
                let _ = io::stderr().flush();
            }
        }

        if opts.interval_us > 0 {
            std::thread::sleep(Duration::from_micros(opts.interval_us));
        }
    }

    let total_time = start_time.elapsed();
    def.terminate();

    let stats = calculate_stats(&latencies, lost, errors);
    if opts.json {
        print_json_results(&stats, opts.size, total_time);
    } else {
        print_results(&stats, opts.size, total_time, opts.quiet);
    }
    Ok(())
}

fn run_pong(args: &Args, quiet: bool, running: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let def = LifetimeDef::new();
    let wire = SocketWire::server(
        "probe-pong",
        args.addr,
        SocketConfig::default(),
        MessageBroker::new(),
        def.lifetime(),
    )?;

    if !quiet {
        eprintln!("{} Latency probe (pong mode)", ">>>".green().bold());
        eprintln!("    listening on {}", wire.local_addr());
        eprintln!("{}", "    Press Ctrl+C to stop".dimmed());
    }

    let protocol = Protocol::new(
        ProtocolConfig::server(args.protocol.clone()),
        Arc::new(Serializers::new()),
        Arc::new(SynchronousScheduler),
        wire.clone(),
        def.lifetime(),
    );
    let echo = RdCall::<String, String>::new();
    protocol.bind_top_level(echo.as_ref(), ECHO_CALL);

    let served = Arc::new(AtomicU64::new(0));
    let counter = served.clone();
    echo.set_sync_handler(move |_lifetime, request| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(request)
    });

    let mut reported = 0;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        let n = served.load(Ordering::Relaxed);
        if !quiet && n != reported {
            reported = n;
            eprint!("\r    Echoed: {} calls (peers seen: {})", n, wire.connection_count());
            let _ = io::stderr().flush();
        }
    }

    def.terminate();
    if !quiet {
        eprintln!(
            "\n\n{} Echoed {} total calls",
            "---".dimmed(),
            served.load(Ordering::Relaxed)
        );
    }
    Ok(())
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Stats {
    count: usize,
    lost: u64,
    errors: u64,
    min: f64,
    max: f64,
    mean: f64,
    stddev: f64,
    p50: f64,
    p90: f64,
    p99: f64,
    p999: f64,
}

fn calculate_stats(latencies: &[f64], lost: u64, errors: u64) -> Stats {
    if latencies.is_empty() {
        return Stats {
            lost,
            errors,
            ..Stats::default()
        };
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean: f64 = latencies.iter().sum::<f64>() / n as f64;
    let variance: f64 = latencies.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;

    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (n - 1) as f64).round() as usize;
        sorted[idx.min(n - 1)]
    };

    Stats {
        count: n,
        lost,
        errors,
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        stddev: variance.sqrt(),
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
        p999: percentile(99.9),
    }
}

fn print_results(stats: &Stats, size: usize, total_time: Duration, quiet: bool) {
    let attempted = stats.count as u64 + stats.lost;
    let loss_pct = if attempted > 0 {
        (stats.lost as f64 / attempted as f64) * 100.0
    } else {
        0.0
    };

    if quiet {
        println!(
            "min={:.1} max={:.1} avg={:.1} p99={:.1} us",
            stats.min, stats.max, stats.mean, stats.p99
        );
        return;
    }

    println!();
    println!("{}", "=== rdsync Latency Probe Results ===".bold());
    println!();
    println!("  {} {} bytes", "Payload size:".cyan(), size);
    println!("  {} {}", "Calls:".cyan(), stats.count);
    println!("  {} {} ({:.2}%)", "Timed out:".cyan(), stats.lost, loss_pct);
    println!("  {} {}", "Errors:".cyan(), stats.errors);
    println!("  {} {:.2}s", "Duration:".cyan(), total_time.as_secs_f64());
    println!();
    println!("{}", "--- Latency (microseconds) ---".dimmed());
    println!("  {} {:>10.2} us", "Min:".green(), stats.min);
    println!("  {} {:>10.2} us", "Max:".red(), stats.max);
    println!("  {} {:>10.2} us", "Mean:".yellow(), stats.mean);
    println!("  {} {:>10.2} us", "Stddev:".yellow(), stats.stddev);
    println!();
    println!("{}", "--- Percentiles ---".dimmed());
    println!("  {} {:>10.2} us", "p50:".white(), stats.p50);
    println!("  {} {:>10.2} us", "p90:".white(), stats.p90);
    println!("  {} {:>10.2} us", "p99:".white(), stats.p99);
    println!("  {} {:>10.2} us", "p99.9:".white(), stats.p999);
    println!();

    if stats.count > 0 {
        let throughput = stats.count as f64 / total_time.as_secs_f64();
        println!("  {} {:.0} calls/s", "Throughput:".cyan(), throughput);
    }
    println!();
}

fn print_json_results(stats: &Stats, size: usize, total_time: Duration) {
    println!(
        r#"{{"payload_size":{},"calls":{},"timed_out":{},"errors":{},"duration_secs":{:.3},"latency_us":{{"min":{:.2},"max":{:.2},"mean":{:.2},"stddev":{:.2},"p50":{:.2},"p90":{:.2},"p99":{:.2},"p999":{:.2}}}}}"#,
        size,
        stats.count,
        stats.lost,
        stats.errors,
        total_time.as_secs_f64(),
        stats.min,
        stats.max,
        stats.mean,
        stats.stddev,
        stats.p50,
        stats.p90,
        stats.p99,
        stats.p999
    );
}
