//! wpool - persistent worker pool runner

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, info};
use wpool::logging::{self, LogConfig};
use wpool::pool::{WorkerKey, WorkerPool};
use wpool::transport::CommandTransport;
use wpool::worker_main;

use cli::{Cli, Commands, RunArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => {
            logging::init(
                LogConfig::for_worker()
                    .with_level(cli.verbosity().level())
                    .with_env_overrides(),
            );
            worker_main::run_worker_main(args.multiplex)
        }
        Commands::Run(args) => {
            logging::init(
                LogConfig::for_cli()
                    .with_level(cli.verbosity().level())
                    .with_env_overrides(),
            );
            cmd_run(args)
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Outcome of one stdin line.
struct Reply {
    exit_code: i32,
    output: String,
}

/// Send one request, invalidating the worker if its process broke.
fn dispatch(pool: &WorkerPool, key: &WorkerKey, line: &str) -> wpool::Result<Reply> {
    let mut worker = pool.borrow_worker(key)?;
    let arguments = line.split_whitespace().map(str::to_string).collect();
    match worker.do_work(arguments) {
        Ok(output) => {
            pool.return_worker(key, worker);
            Ok(Reply {
                exit_code: output.exit_code,
                output: output.output,
            })
        }
        Err(e) => {
            if e.is_fatal() {
                pool.invalidate_worker(worker);
            } else {
                pool.return_worker(key, worker);
            }
            Err(e)
        }
    }
}

/// Flatten a reply onto one output line.
fn format_reply(line: &str, reply: &wpool::Result<Reply>) -> String {
    match reply {
        Ok(reply) => format!(
            "{}\t{}\t{}",
            line,
            reply.exit_code,
            reply.output.replace(['\n', '\t'], " ")
        ),
        Err(e) => format!("{}\t-1\t{}", line, e),
    }
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = args.pool_config().context("Invalid pool configuration")?;
    let (executable, worker_args) = args.worker_command()?;
    let key = WorkerKey::builder(args.mnemonic.as_str(), executable)
        .args(worker_args.iter().cloned())
        .multiplex(args.multiplex)
        .build();

    let transport = match &config.worker_log_dir {
        Some(dir) => CommandTransport::new().with_log_dir(dir.clone()),
        None => CommandTransport::new(),
    };
    let pool = WorkerPool::new(config, Arc::new(transport))?;

    let lines: Vec<String> = io::stdin()
        .lock()
        .lines()
        .collect::<io::Result<_>>()
        .context("Failed to read requests from stdin")?;
    let lines: Vec<&str> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    info!(requests = lines.len(), key = %key, "Dispatching requests");

    let next = AtomicUsize::new(0);
    let jobs = (args.jobs as usize).min(lines.len()).max(1);
    let mut replies: Vec<Option<wpool::Result<Reply>>> = Vec::new();
    replies.resize_with(lines.len(), || None);

    let done: Vec<(usize, wpool::Result<Reply>)> = thread::scope(|s| {
        let handles: Vec<_> = (0..jobs)
            .map(|_| {
                s.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(line) = lines.get(i) else {
                            break done;
                        };
                        done.push((i, dispatch(&pool, &key, line)));
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });
    for (i, reply) in done {
        replies[i] = Some(reply);
    }

    let mut stdout = io::stdout().lock();
    let mut failures = 0;
    for (line, reply) in lines.iter().zip(replies) {
        let reply = reply.unwrap_or_else(|| {
            Err(wpool::PoolError::Transport("request was never dispatched".into()))
        });
        if reply.is_err() {
            failures += 1;
        }
        writeln!(stdout, "{}", format_reply(line, &reply))?;
    }
    stdout.flush()?;

    let stats = pool.stats();
    for key_stats in &stats {
        debug!(
            mnemonic = %key_stats.mnemonic,
            created = key_stats.created,
            destroyed = key_stats.destroyed,
            idle = key_stats.idle,
            "Pool statistics"
        );
    }
    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    pool.close();

    if failures > 0 {
        anyhow::bail!("{} of {} requests failed", failures, lines.len());
    }
    Ok(())
}
