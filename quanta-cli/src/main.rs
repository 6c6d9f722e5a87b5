use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand, ValueEnum};
use quanta_core::time::format_local;
use quanta_core::{
    Decision, LogNotifier, NewTask, PendingDecision, Routine, RtAlgorithm, SchedClass, Scheduler,
    StartOutcome, SystemClock, Task, TaskUpdate, format_hms, parse_local_deadline_to_utc,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod prompt;
mod run;
mod state;

use config::Config;
use state::JsonFileStore;

pub type Engine = Scheduler<SystemClock, JsonFileStore, LogNotifier>;

#[derive(Parser, Debug)]
#[command(
    name = "quanta",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("QUANTA_BUILD_SHA"), ")"),
    about = "Personal task scheduler: deadlines, real-time queues and fair-share routines"
)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a task
    Add(AddArgs),

    /// Show the running task and the ready queue
    Status {
        /// How many queued tasks to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List every live task in creation order
    List,

    /// Give a task the running slot (asks before preempting another task)
    Start {
        id: String,
        /// Switch without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Pause the running task
    Pause,

    /// Resume the paused task
    Resume,

    /// Grow or shrink the running task's quantum, in minutes
    Adjust {
        #[arg(allow_negative_numbers = true)]
        delta: i32,
    },

    /// Complete a task (the running one when no id is given)
    Complete { id: Option<String> },

    /// Edit a task
    Edit(EditArgs),

    /// Delete a live task without archiving it
    Delete { id: String },

    /// Show completed tasks, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Remove an entry from the completed archive
    DeleteCompleted { id: String },

    /// Answer for a task whose quantum ran out
    Decide {
        #[command(subcommand)]
        decision: DecideCommand,
    },

    /// Run the scheduler in the foreground: tick the quantum and reset routines
    Run,

    /// Config helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DecideCommand {
    /// Add minutes and keep going
    Extend { minutes: u32 },
    /// Back to the queue; the next task starts
    Requeue,
    /// Mark it done
    Complete,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write ~/.quanta/config.toml with defaults
    Init,
    /// Print the effective config
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Deadline,
    Realtime,
    Fair,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RtArg {
    Fifo,
    Rr,
}

impl From<RtArg> for RtAlgorithm {
    fn from(a: RtArg) -> Self {
        match a {
            RtArg::Fifo => RtAlgorithm::Fifo,
            RtArg::Rr => RtAlgorithm::Rr,
        }
    }
}

#[derive(Args, Debug)]
struct AddArgs {
    title: String,

    #[arg(long, value_enum, default_value = "fair")]
    class: ClassArg,

    /// Local "YYYY-MM-DD HH:MM" (deadline class)
    #[arg(long)]
    deadline: Option<String>,

    /// Real-time discipline
    #[arg(long, value_enum, default_value = "fifo")]
    rt: RtArg,

    /// Fair-share weight, -20 (greedy) to 19 (polite)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    nice: i32,

    /// Fair-share task that comes back every day
    #[arg(long)]
    daily: bool,

    /// Minutes
    #[arg(long)]
    quantum: Option<u32>,

    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Args, Debug)]
struct EditArgs {
    id: String,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Minutes
    #[arg(long)]
    quantum: Option<u32>,

    #[arg(long, allow_negative_numbers = true)]
    nice: Option<i32>,

    /// New local deadline "YYYY-MM-DD HH:MM" (deadline tasks)
    #[arg(long)]
    deadline: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;

    let cfg = config::load_config()?;

    match cli.command {
        Command::Config { command } => match command {
            ConfigCommand::Init => config::init_config()?,
            ConfigCommand::Show => {
                print!("{}", toml::to_string_pretty(&cfg).context("serialize config")?);
            }
        },

        Command::Run => run::run(&cfg).await?,

        command => {
            let mut engine = open_engine(&cfg)?;
            dispatch(&mut engine, &cfg, command)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    subscriber
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
    Ok(())
}

/// Load state and catch up on any daily boundary crossed while not running.
pub fn open_engine(cfg: &Config) -> Result<Engine> {
    open_engine_at(cfg, JsonFileStore::open_default()?)
}

fn open_engine_at(cfg: &Config, store: JsonFileStore) -> Result<Engine> {
    debug!(path = %store.path().display(), "opening state");
    let mut engine = Scheduler::open(SystemClock, store, LogNotifier, cfg.scheduler_config()?)?;
    engine.sweep_daily_reset();
    Ok(engine)
}

fn dispatch(engine: &mut Engine, cfg: &Config, command: Command) -> Result<()> {
    let tz = engine.config().timezone;

    match command {
        Command::Add(args) => {
            let class = build_class(&args, &cfg.scheduler.timezone)?;
            let mut new = NewTask::new(args.title, class).with_description(args.description);
            if let Some(q) = args.quantum {
                new = new.with_quantum(q);
            }
            let id = engine.add_task(new)?;
            println!("Added {}", short_id(&id));
            print_current(engine);
        }

        Command::Status { limit } => print_status(engine, tz, limit),

        Command::List => {
            for t in engine.tasks() {
                println!("{}", task_line(engine, t, tz));
            }
        }

        Command::Start { id, yes } => {
            let id = resolve_id(engine, &id)?;
            start(engine, &id, yes)?;
        }

        Command::Pause => {
            if engine.pause() {
                println!("Paused");
            } else {
                println!("Nothing to pause");
            }
            print_current(engine);
        }

        Command::Resume => {
            if engine.resume() {
                println!("Resumed");
            } else {
                println!("Nothing is paused");
            }
            print_current(engine);
        }

        Command::Adjust { delta } => {
            if engine.adjust_quantum(delta)? {
                print_current(engine);
            } else {
                println!("Nothing changed");
            }
        }

        Command::Complete { id } => {
            let id = match id {
                Some(id) => resolve_id(engine, &id)?,
                None => engine
                    .current()
                    .map(|t| t.id.clone())
                    .context("no task is running; pass an id")?,
            };
            if !engine.complete(&id) {
                bail!("{} is already done for today", short_id(&id));
            }
            println!("Completed {}", short_id(&id));
            print_current(engine);
        }

        Command::Edit(args) => {
            let id = resolve_id(engine, &args.id)?;
            let mut update = TaskUpdate {
                title: args.title,
                description: args.description,
                time_quantum: args.quantum,
                nice: args.nice,
                ..Default::default()
            };
            if let Some(local) = args.deadline {
                let is_deadline =
                    matches!(engine.task(&id).map(|t| &t.class), Some(SchedClass::Deadline { .. }));
                if !is_deadline {
                    bail!("--deadline only applies to deadline tasks");
                }
                let at = parse_local_deadline_to_utc(&local, &cfg.scheduler.timezone)?;
                update.class = Some(SchedClass::deadline(at));
            }
            engine.update_task(&id, update)?;
            println!("Updated {}", short_id(&id));
        }

        Command::Delete { id } => {
            let id = resolve_id(engine, &id)?;
            engine.delete_task(&id);
            println!("Deleted {}", short_id(&id));
            print_current(engine);
        }

        Command::History { limit } => {
            for c in engine.completed().iter().take(limit) {
                println!(
                    "[{}] {} | {} | {} | done {}",
                    short_id(&c.id),
                    c.title,
                    c.class.label(),
                    format_hms(c.total_time),
                    format_local(c.completed_at, tz)
                );
            }
        }

        Command::DeleteCompleted { id } => {
            let id = resolve_completed_id(engine, &id)?;
            engine.delete_completed(&id);
            println!("Removed {} from history", short_id(&id));
        }

        Command::Decide { decision } => {
            if !matches!(engine.pending(), Some(PendingDecision::QuantumExhausted { .. })) {
                bail!("no task is waiting on a quantum decision");
            }
            let decision = match decision {
                DecideCommand::Extend { minutes } => Decision::Extend { minutes },
                DecideCommand::Requeue => Decision::Requeue,
                DecideCommand::Complete => Decision::Complete,
            };
            engine.resolve(decision)?;
            print_current(engine);
        }

        Command::Run | Command::Config { .. } => {}
    }

    Ok(())
}

fn start(engine: &mut Engine, id: &str, yes: bool) -> Result<()> {
    match engine.start(id) {
        StartOutcome::Started => println!("Started {}", short_id(id)),
        StartOutcome::AlreadyRunning => println!("{} is already running", short_id(id)),
        StartOutcome::Ignored => bail!("{} cannot start (done for today?)", short_id(id)),
        StartOutcome::NeedsConfirmation(PendingDecision::Switch { from, to }) => {
            let from_title = engine.task(&from).map(|t| t.title.clone()).unwrap_or(from);
            let to_title = engine.task(&to).map(|t| t.title.clone()).unwrap_or(to);
            let ok = yes
                || prompt::confirm(&format!("Stop \"{from_title}\" and start \"{to_title}\"?"))?;
            if ok {
                engine.resolve(Decision::ConfirmSwitch)?;
                println!("Switched to {to_title}");
            } else {
                engine.resolve(Decision::CancelSwitch)?;
                println!("Kept {from_title}");
            }
        }
        StartOutcome::NeedsConfirmation(other) => bail!("unexpected decision: {other:?}"),
    }
    Ok(())
}

fn build_class(args: &AddArgs, tz: &str) -> Result<SchedClass> {
    Ok(match args.class {
        ClassArg::Deadline => {
            let local = args
                .deadline
                .as_deref()
                .context("--deadline is required for deadline tasks")?;
            SchedClass::deadline(parse_local_deadline_to_utc(local, tz)?)
        }
        ClassArg::Realtime => SchedClass::real_time(args.rt.into()),
        ClassArg::Fair => {
            let routine = if args.daily {
                Routine::Daily
            } else {
                Routine::OneShot
            };
            SchedClass::fair_share(args.nice, routine)
        }
    })
}

/// Unique id prefix match over live tasks.
fn resolve_id(engine: &Engine, needle: &str) -> Result<String> {
    unique_prefix(engine.tasks().into_iter().map(|t| t.id.as_str()), needle)
}

fn resolve_completed_id(engine: &Engine, needle: &str) -> Result<String> {
    unique_prefix(engine.completed().iter().map(|c| c.id.as_str()), needle)
}

fn unique_prefix<'a>(ids: impl Iterator<Item = &'a str>, needle: &str) -> Result<String> {
    let hits: Vec<&str> = ids.filter(|id| id.starts_with(needle)).collect();
    match hits.as_slice() {
        [one] => Ok(one.to_string()),
        [] => bail!("no task matches '{needle}'"),
        _ => bail!("'{needle}' matches {} tasks; use more characters", hits.len()),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn class_detail(t: &Task, tz: Tz) -> String {
    match &t.class {
        SchedClass::Deadline { deadline } => format!("deadline, due {}", format_local(*deadline, tz)),
        SchedClass::RealTime { algorithm, .. } => match algorithm {
            RtAlgorithm::Fifo => "real-time fifo".to_string(),
            RtAlgorithm::Rr => "real-time rr".to_string(),
        },
        SchedClass::FairShare {
            nice,
            vruntime,
            routine,
        } => {
            let daily = if *routine == Routine::Daily { ", daily" } else { "" };
            format!("fair-share nice {nice}, vruntime {vruntime}{daily}")
        }
    }
}

fn state_tag(t: &Task, done_today: bool) -> &'static str {
    if t.started_at.is_some() {
        if t.is_paused { " [paused]" } else { " [running]" }
    } else if done_today {
        " [done today]"
    } else if t.is_exhausted() {
        // Starting it would stop again on the first tick.
        " [quantum used up; raise it with edit --quantum]"
    } else {
        ""
    }
}

fn task_line(engine: &Engine, t: &Task, tz: Tz) -> String {
    let state = state_tag(t, engine.is_done_today(&t.id));
    format!(
        "[{}] {} | {} | {} / {}{}",
        short_id(&t.id),
        t.title,
        class_detail(t, tz),
        format_hms(t.elapsed_time),
        format_hms(t.quantum_secs()),
        state
    )
}

fn print_current(engine: &Engine) {
    match engine.current() {
        Some(t) => {
            let paused = if t.is_paused { " (paused)" } else { "" };
            println!(
                "Now: {} {} / {} ({:.0}%){}",
                t.title,
                format_hms(t.elapsed_time),
                format_hms(t.quantum_secs()),
                t.progress_percent(),
                paused
            );
            if matches!(engine.pending(), Some(PendingDecision::QuantumExhausted { .. })) {
                println!("Quantum used up: quanta decide extend <min> | requeue | complete");
            }
        }
        None => println!("Now: idle"),
    }
}

fn print_status(engine: &Engine, tz: Tz, limit: usize) {
    print_current(engine);

    let queue = engine.ready_queue(limit);
    if queue.is_empty() {
        println!("\nQueue is empty");
    } else {
        println!("\nUp next:");
        for (i, t) in queue.iter().enumerate() {
            println!("{:>3}. {}", i + 1, task_line(engine, t, tz));
        }
    }

    let done: Vec<&Task> = engine
        .tasks()
        .into_iter()
        .filter(|t| engine.is_done_today(&t.id))
        .collect();
    if !done.is_empty() {
        println!("\nDone today:");
        for t in done {
            println!("  - {}", t.title);
        }
    }
}
