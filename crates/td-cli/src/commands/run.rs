use std::time::Duration;

use td_core::config::Config;
use td_core::types::SessionEvent;
use td_session::SessionOrchestrator;
use tracing::{info, warn};

pub struct RunArgs {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub inputs: Vec<String>,
    pub input_delay_ms: u64,
    pub duration_ms: u64,
}

/// Run the `run` subcommand: one terminal, scripted input, events on stdout.
pub async fn run(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    let orch = SessionOrchestrator::with_portable_pty(config)?;
    let events = orch.subscribe();
    let printer = tokio::spawn(print_events(events));

    let mut options = orch.default_options();
    if let Some(shell) = args.shell {
        options.shell = shell;
    }
    if let Some(cwd) = args.cwd {
        options = options.cwd(cwd);
    }
    let id = orch.create_terminal(options).await?;
    info!(terminal_id = %id, "terminal open");

    let session = async {
        for line in &args.inputs {
            tokio::time::sleep(Duration::from_millis(args.input_delay_ms)).await;
            if let Err(e) = orch.send_input(id, &format!("{line}\n")) {
                warn!(terminal_id = %id, "input not delivered: {e}");
            }
        }
        tokio::time::sleep(Duration::from_millis(args.duration_ms)).await;
    };

    tokio::select! {
        _ = session => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    if let Ok(state) = orch.get_state(id) {
        eprintln!("final state: {}", serde_json::to_string(&state)?);
    }
    orch.shutdown().await;

    // The printer ends once the orchestrator (and with it the bus) is gone.
    drop(orch);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("event printer did not finish");
    }
    Ok(())
}

async fn print_events(events: flume::Receiver<SessionEvent>) {
    while let Ok(event) = events.recv_async().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("unprintable event: {e}"),
        }
    }
}
