//! appfocus-probe: drive and observe app focus state from a real process.
//!
//! Every invocation is one process of the app identified by `--data-dir`;
//! `--process-name` decides whether it acts as the main process or a
//! secondary one (`name:suffix`).
//!
//! ## Subcommands
//!
//! - `watch`: Print each delivered transition as a JSON line
//! - `emit`: Feed lifecycle events (`resumed:SCREEN`, `paused:SCREEN`, ...)
//! - `hold-lock`: Hold the process lock for a while
//! - `state`: Print the shared foreground/paused flags

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use appfocus_core::{
    listener_fn, AppFocusMonitor, AppHandle, FileStore, ForegroundState, LifecycleEvent,
    ListenerScope, MonitorConfig, ProcessMutex, ScreenId, SharedStore, Transport,
    KEY_IS_FOREGROUND, KEY_IS_PAUSED,
};
use appfocus_protocol::EventKind;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Parser)]
#[command(name = "appfocus-probe")]
#[command(about = "Drive and observe cross-process app focus state")]
#[command(version)]
struct Cli {
    /// Shared data directory of the app
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    /// Application id
    #[arg(long, global = true, default_value = "appfocus.probe")]
    app_id: String,

    /// Process name to report (main process has no `:` suffix)
    #[arg(long, global = true)]
    process_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    All,
    Main,
}

#[derive(Subcommand)]
enum Commands {
    /// Print transitions as JSON lines until COUNT have been seen (or forever)
    Watch {
        #[arg(long)]
        count: Option<usize>,

        #[arg(long, value_enum, default_value = "all")]
        scope: Scope,
    },

    /// Apply lifecycle events in order, e.g. `resumed:Main@1 paused:Main@1`
    Emit {
        #[arg(value_name = "EVENT", required = true, value_parser = parse_lifecycle)]
        events: Vec<LifecycleEvent>,
    },

    /// Acquire the process lock and hold it
    HoldLock {
        #[arg(long, default_value_t = 1000)]
        millis: u64,
    },

    /// Print the shared flags
    State,
}

fn parse_lifecycle(raw: &str) -> Result<LifecycleEvent, String> {
    let (kind, screen) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected KIND:SCREEN, got {raw:?}"))?;
    if screen.is_empty() {
        return Err(format!("missing screen id in {raw:?}"));
    }
    let screen = ScreenId::new(screen);
    match kind {
        "created" => Ok(LifecycleEvent::Created(screen)),
        "started" => Ok(LifecycleEvent::Started(screen)),
        "resumed" => Ok(LifecycleEvent::Resumed(screen)),
        "paused" => Ok(LifecycleEvent::Paused(screen)),
        "stopped" => Ok(LifecycleEvent::Stopped(screen)),
        "destroyed" => Ok(LifecycleEvent::Destroyed(screen)),
        other => Err(format!("unknown lifecycle event {other:?}")),
    }
}

fn print_line(value: serde_json::Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

fn app_handle(cli: &Cli) -> AppHandle {
    let app = AppHandle::with_data_dir(cli.app_id.clone(), cli.data_dir.clone());
    match &cli.process_name {
        Some(name) => app.with_process_name(name.clone()),
        None => app,
    }
}

fn start_monitor(app: AppHandle) -> appfocus_core::Result<AppFocusMonitor> {
    let mut config = MonitorConfig::load(&app)?;
    // Other processes are only reachable over sockets.
    config.transport = Transport::Socket;
    AppFocusMonitor::builder(app).config(config).build()
}

fn watch(app: AppHandle, count: Option<usize>, scope: Scope) -> appfocus_core::Result<()> {
    let monitor = start_monitor(app)?;
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = listener_fn(move |event| {
        print_line(json!({
            "kind": EventKind::from(event.kind).as_str(),
            "screen_id": event.screen_id,
            "process_name": event.process_name,
            "is_main_process": event.is_main_process,
        }));
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(());
        }
    });
    let scope = match scope {
        Scope::All => ListenerScope::AllProcesses,
        Scope::Main => ListenerScope::MainProcessOnly,
    };
    let registered = monitor.register_listener(scope, listener);

    // Startup reset done and bus subscribed: safe for others to publish.
    monitor.flush();
    print_line(json!({
        "status": "ready",
        "pid": monitor.identity().pid(),
        "registered": registered,
    }));

    let mut seen = 0;
    while rx.recv().is_ok() {
        seen += 1;
        if count.is_some_and(|count| seen >= count) {
            break;
        }
    }
    monitor.shutdown();
    Ok(())
}

fn emit(app: AppHandle, events: Vec<LifecycleEvent>) -> appfocus_core::Result<()> {
    let monitor = start_monitor(app)?;
    for event in events {
        monitor.handle_lifecycle(event);
    }
    monitor.flush();
    let stats = monitor.lock_stats();
    print_line(json!({
        "status": "applied",
        "state": monitor.shared_state(),
        "lock": stats,
    }));
    monitor.shutdown();
    Ok(())
}

fn hold_lock(app: AppHandle, millis: u64) -> appfocus_core::Result<()> {
    let config = MonitorConfig::load(&app)?;
    let mutex =
        ProcessMutex::with_timeouts(app.lock_path(), config.lock_timeout(), config.poll_interval());
    let guard = mutex.acquire()?;
    print_line(json!({ "status": "locked", "pid": std::process::id() }));
    thread::sleep(Duration::from_millis(millis));
    drop(guard);
    print_line(json!({ "status": "released" }));
    Ok(())
}

fn state(app: AppHandle) {
    let store = FileStore::new(app.state_path());
    let state = ForegroundState {
        is_foreground: store.get_bool(KEY_IS_FOREGROUND, false),
        is_paused: store.get_bool(KEY_IS_PAUSED, true),
    };
    print_line(json!(state));
}

fn main() {
    let _logging_guard = appfocus_core::logging::init(None);
    let cli = Cli::parse();
    let app = app_handle(&cli);

    let result = match cli.command {
        Commands::Watch { count, scope } => watch(app, count, scope),
        Commands::Emit { events } => emit(app, events),
        Commands::HoldLock { millis } => hold_lock(app, millis),
        Commands::State => {
            state(app);
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "appfocus-probe failed");
        std::process::exit(1);
    }
}
