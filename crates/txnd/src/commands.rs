use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use txnd_core::{TxndConfig, WorkerMode};
use txnd_engine::{
    control, health, runner, shutdown, Daemon, EngineError, Enqueue, ProcessSpawner, Spawner,
    TaskSpawner, Transaction,
};
use txnd_store::Store;

use crate::{app, jobs, Cli, Command};

/// How long `start` waits for the background daemon to take its lock.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows shown per section by `list`.
const LIST_LIMIT: usize = 50;

struct Invocation {
    config: TxndConfig,
    config_path: Option<String>,
}

impl Invocation {
    /// Arguments that make a child process load the same config.
    fn config_args(&self) -> Vec<String> {
        match &self.config_path {
            Some(path) => vec!["--config".to_string(), path.clone()],
            None => Vec::new(),
        }
    }

    fn pid_file(&self) -> &str {
        &self.config.daemon.pid_file
    }

    fn open_store(&self) -> anyhow::Result<Store> {
        let path = &self.config.database.path;
        ensure_parent_dir(path).map_err(|e| anyhow!("[{}] {e}", e.code()))?;
        Store::open(path).with_context(|| format!("opening database {path}"))
    }
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = TxndConfig::load(cli.config.as_deref()).map_err(|e| anyhow!("[{}] {e}", e.code()))?;
    let ctx = Invocation {
        config,
        config_path: cli.config,
    };

    match cli.command {
        Command::Start => start(&ctx).await,
        Command::Stop => stop(&ctx).await,
        Command::Restart => {
            if control::is_running(ctx.pid_file()) {
                stop(&ctx).await?;
            }
            start(&ctx).await
        }
        Command::Status => status(&ctx),
        Command::Foreground => foreground(&ctx).await,
        Command::List => list(&ctx),
        Command::Log { target } => log(&ctx, &target),
        Command::Enqueue {
            classname,
            data,
            in_secs,
            recurring,
            parked,
        } => enqueue(&ctx, &classname, data.as_deref(), in_secs, recurring, parked),
        Command::Worker { id } => worker(&ctx, id).await,
        Command::Serve => serve(&ctx).await,
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

async fn start(ctx: &Invocation) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    if control::is_running(ctx.pid_file()) {
        return Err(EngineError::AlreadyRunning {
            path: ctx.pid_file().to_string(),
        }
        .into());
    }

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.args(ctx.config_args())
        .arg("foreground")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // detach from the controlling terminal
    // Safety: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn().context("spawning daemon")?;

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait()? {
            bail!("daemon exited during startup ({status})");
        }
        // the lock record may exist but still be empty
        if let Ok(pid) = control::owner(ctx.pid_file()) {
            if pid == child.id() {
                println!("txnd started (pid {pid})");
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            bail!("daemon did not take {} within {STARTUP_TIMEOUT:?}", ctx.pid_file());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn stop(ctx: &Invocation) -> anyhow::Result<()> {
    let poll = Duration::from_millis(ctx.config.daemon.drain_poll_ms);
    let pid = control::stop(ctx.pid_file(), poll).await?;
    println!("txnd stopped (pid {pid})");
    Ok(())
}

fn status(ctx: &Invocation) -> anyhow::Result<()> {
    let monitor_file = ctx
        .config
        .daemon
        .monitor_file
        .as_deref()
        .context("monitor disabled: daemon.monitor_file is not set")?;
    let snapshot = control::status(ctx.pid_file(), monitor_file)?;
    let pid = control::owner(ctx.pid_file())?;

    println!("txnd running (pid {pid})");
    for (key, check) in snapshot.checks() {
        println!("  {key:<16} {:<24} {}", check.result.to_string(), check.message);
    }
    let verdict = health::evaluate(&snapshot, Utc::now());
    println!("health: {} {}", verdict.status, verdict.message);
    Ok(())
}

async fn foreground(ctx: &Invocation) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let spawner: Box<dyn Spawner> = match ctx.config.daemon.worker_mode {
        WorkerMode::Process => Box::new(ProcessSpawner::current_exe()?.with_args(ctx.config_args())),
        WorkerMode::Task => Box::new(TaskSpawner::new(store.clone(), Arc::new(jobs::registry()))),
    };

    let stop = CancellationToken::new();
    shutdown::install_signal_handlers(stop.clone())?;

    let mut daemon = Daemon::new(ctx.config.daemon.clone(), store, spawner)?.with_stop_token(stop);
    daemon.run().await?;
    Ok(())
}

/// Entry point of a process-mode worker.
async fn worker(ctx: &Invocation, id: i64) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let registry = jobs::registry();
    let outcome = runner::execute(&store, &registry, id).await?;
    info!(job_id = id, ?outcome, "worker exiting");
    Ok(())
}

// ---------------------------------------------------------------------------
// Queue inspection
// ---------------------------------------------------------------------------

fn list(ctx: &Invocation) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let max = ctx.config.daemon.max_processes;

    let running = Transaction::running(&store)?;
    println!(
        "RUNNING ({}/{max}, {} FREE)",
        running.len(),
        max.saturating_sub(running.len())
    );
    running.iter().for_each(print_row);

    let ready = Transaction::count_runnable(&store)?;
    println!("READY TO RUN ({ready})");
    Transaction::runnable(&store, LIST_LIMIT)?
        .iter()
        .for_each(print_row);

    let scheduled = Transaction::scheduled(&store)?;
    println!("SCHEDULED ({})", scheduled.len());
    scheduled.iter().take(LIST_LIMIT).for_each(print_row);
    Ok(())
}

fn print_row(tx: &Transaction) {
    let mode = if tx.is_parallel() { "parallel" } else { "serial" };
    let at = tx
        .scheduled_at()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:>8}  {:<28} {:<8} w={:<4} {at}",
        tx.id(),
        tx.classname(),
        mode,
        tx.record().weight
    );
}

fn log(ctx: &Invocation, target: &str) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let transaction = match target.parse::<i64>() {
        Ok(id) => Transaction::get(&store, id)?,
        Err(_) => Transaction::by_classname(&store, target, Some(1))?
            .into_iter()
            .next()
            .with_context(|| format!("no transaction with classname {target}"))?,
    };

    let Some(entry) = transaction.last_log()? else {
        println!("transaction {} has no log entries", transaction.id());
        return Ok(());
    };
    println!(
        "transaction {} ({}) {} at {}",
        transaction.id(),
        transaction.classname(),
        if entry.failed { "FAILED" } else { "OK" },
        entry.created.format("%Y-%m-%d %H:%M:%S")
    );
    print!("{}", entry.output);
    if !entry.output.ends_with('\n') && !entry.output.is_empty() {
        println!();
    }
    if let Some(exception) = entry.exception {
        println!("exception: {exception}");
    }
    Ok(())
}

fn enqueue(
    ctx: &Invocation,
    classname: &str,
    data: Option<&str>,
    in_secs: Option<i64>,
    recurring: bool,
    parked: bool,
) -> anyhow::Result<()> {
    let payload = match data {
        Some(raw) => serde_json::from_str::<Value>(raw).context("--data is not valid JSON")?,
        None => Value::Object(Default::default()),
    };
    if !payload.is_object() {
        bail!("--data must be a JSON object");
    }

    let options = if parked {
        Enqueue::parked()
    } else if let Some(secs) = in_secs {
        let delay = chrono::Duration::try_seconds(secs).context("--in-secs out of range")?;
        let at = Utc::now()
            .checked_add_signed(delay)
            .context("--in-secs out of range")?;
        Enqueue::at(at)
    } else {
        Enqueue::now()
    };

    let store = ctx.open_store()?;
    let transaction = jobs::registry().enqueue(
        &store,
        classname,
        options.payload(payload).recurring(recurring),
    )?;
    println!("enqueued transaction {}", transaction.id());
    Ok(())
}

// ---------------------------------------------------------------------------
// Health endpoint
// ---------------------------------------------------------------------------

async fn serve(ctx: &Invocation) -> anyhow::Result<()> {
    let state = Arc::new(app::MonitorState::from_config(&ctx.config));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", ctx.config.monitor.bind, ctx.config.monitor.port).parse()?;
    let stop = CancellationToken::new();
    shutdown::install_signal_handlers(stop.clone())?;

    info!(%addr, "health endpoint listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) -> txnd_core::Result<()> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
