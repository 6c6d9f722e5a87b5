//! Foreground loop: advances the quantum timer every tick, sweeps daily
//! routines on a slower interval, and asks on the terminal when a quantum
//! runs out.

use anyhow::Result;
use quanta_core::{Decision, PendingDecision, Tick, format_hms};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::prompt::{parse_exhaustion_answer, prompt};
use crate::{Engine, open_engine};

type SharedEngine = Arc<Mutex<Engine>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Answered,
    /// Ctrl-C between prompts.
    Shutdown,
    /// Ctrl-C while a prompt was waiting on stdin.
    Interrupted,
}

pub async fn run(cfg: &Config) -> Result<()> {
    let engine: SharedEngine = Arc::new(Mutex::new(open_engine(cfg)?));
    let tick_every = Duration::from_secs(cfg.run.tick_seconds.max(1));
    let sweep_every = Duration::from_secs(cfg.run.sweep_seconds.max(1));
    let extend_minutes = cfg.run.extend_minutes.max(1);

    info!(
        tick_secs = tick_every.as_secs(),
        sweep_secs = sweep_every.as_secs(),
        "scheduler running; ctrl-c to stop"
    );
    report_current(&engine).await;

    let sweeper = tokio::spawn(sweep_loop(engine.clone(), sweep_every));

    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // One signal future for the whole session, so Ctrl-C is seen while a
    // prompt is open too.
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // A restart may come back with the quantum already used up.
    let mut flow = Flow::Answered;
    if pending_exhaustion(&engine).await {
        flow = ask_for_decision(&engine, extend_minutes, &mut shutdown).await?;
    }

    while flow == Flow::Answered {
        tokio::select! {
            _ = ticker.tick() => {
                let tick = engine.lock().await.tick();
                match tick {
                    Tick::Idle => {}
                    Tick::Progress { task_id, elapsed } => {
                        debug!(%task_id, elapsed, "tick");
                    }
                    Tick::Exhausted { task_id, elapsed } => {
                        info!(%task_id, elapsed, "quantum used up");
                        flow = ask_for_decision(&engine, extend_minutes, &mut shutdown).await?;
                    }
                }
            }
            _ = &mut shutdown => flow = Flow::Shutdown,
        }
    }

    info!("shutting down");
    sweeper.abort();
    // Fold the last partial second into the saved state.
    engine.lock().await.tick();

    if flow == Flow::Interrupted {
        // The stdin reader thread is still blocked and runtime shutdown would
        // wait for it. State is saved, so leave now.
        std::process::exit(0);
    }
    Ok(())
}

async fn sweep_loop(engine: SharedEngine, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let cleared = engine.lock().await.sweep_daily_reset();
        if cleared > 0 {
            info!(cleared, "daily routines are back in the queue");
            report_current(&engine).await;
        }
    }
}

async fn pending_exhaustion(engine: &SharedEngine) -> bool {
    matches!(
        engine.lock().await.pending(),
        Some(PendingDecision::QuantumExhausted { .. })
    )
}

/// Keep asking until the engine accepts an answer or Ctrl-C arrives. The
/// engine is not locked while waiting on stdin, so the sweeper keeps running.
async fn ask_for_decision<S>(
    engine: &SharedEngine,
    extend_minutes: u32,
    shutdown: &mut Pin<&mut S>,
) -> Result<Flow>
where
    S: Future,
{
    loop {
        let title = {
            let guard = engine.lock().await;
            match guard.pending() {
                Some(PendingDecision::QuantumExhausted { task_id }) => guard
                    .task(task_id)
                    .map(|t| format!("{} ({})", t.title, format_hms(t.elapsed_time)))
                    .unwrap_or_else(|| task_id.clone()),
                _ => return Ok(Flow::Answered),
            }
        };

        let label = format!(
            "Quantum used up for {title}. [e]xtend [min, default {extend_minutes}] / [r]equeue / [c]omplete"
        );
        let reader = async move {
            match tokio::task::spawn_blocking(move || prompt(&label)).await {
                Ok(line) => line,
                Err(e) => Err(e.into()),
            }
        };
        let Some(answer) = answer_or_shutdown(reader, shutdown.as_mut()).await? else {
            println!();
            return Ok(Flow::Interrupted);
        };

        let Some(decision) = parse_exhaustion_answer(&answer, extend_minutes) else {
            println!("Answer with e, e <minutes>, r or c");
            continue;
        };

        let result = engine.lock().await.resolve(decision);
        match result {
            Ok(()) => {
                if let Decision::Extend { minutes } = decision {
                    println!("Extended by {minutes} min");
                }
                report_current(engine).await;
                return Ok(Flow::Answered);
            }
            Err(e) => {
                warn!(error = %e, "decision rejected");
                println!("{e}");
            }
        }
    }
}

/// `None` when `shutdown` fires before an answer arrives.
async fn answer_or_shutdown<A, S>(answer: A, shutdown: S) -> Result<Option<String>>
where
    A: Future<Output = Result<String>>,
    S: Future,
{
    tokio::select! {
        biased;
        _ = shutdown => Ok(None),
        line = answer => line.map(Some),
    }
}

async fn report_current(engine: &SharedEngine) {
    let guard = engine.lock().await;
    match guard.current() {
        Some(t) => println!(
            "Now: {} ({} / {})",
            t.title,
            format_hms(t.elapsed_time),
            format_hms(t.quantum_secs())
        ),
        None => println!("Now: idle"),
    }
}
