use atlterm::classify::{Classifier, Verdict};
use atlterm::config::{Config, SupervisorConfig};
use atlterm::poller::{Notice, PollHandler, Poller};
use atlterm::supervisor::{self, SupervisorOptions};
use atlterm::transcript::{Outcome, Transcript};
use atlterm::{CommandRequest, OutputMessage, Stream, TerminalManager};

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Run shell commands in an isolated supervisor process.
#[derive(Parser)]
#[command(name = "atl-terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command under a supervisor and stream its output
    Run {
        /// Split the command on whitespace instead of using /bin/sh -c
        #[arg(long)]
        no_shell: bool,

        /// Extra environment variable for the command
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Terminate the command after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Write the transcript as JSON
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,

        /// Score the output once the command completes
        #[arg(long)]
        classify: bool,

        /// Config file (default: ~/.config/atl-terminal/config.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Supervisor loop on stdio; started by the manager
    #[command(hide = true)]
    Supervise {
        #[arg(long)]
        request_poll_ms: Option<u64>,
        #[arg(long)]
        output_poll_ms: Option<u64>,
        #[arg(long)]
        kill_confirm_ms: Option<u64>,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Prints output as it arrives: command stdout to stdout, everything else
/// to stderr.
struct Console;

impl PollHandler for Console {
    fn on_message(&mut self, message: &OutputMessage) {
        match message {
            OutputMessage::Output { stream: Stream::Stdout, text } => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            OutputMessage::Output { stream: Stream::Stderr, text } => eprint!("{text}"),
            OutputMessage::Error { message } => eprintln!("[error] {message}"),
            OutputMessage::Terminated { message } => eprintln!("[terminated] {message}"),
            OutputMessage::Crashed { message } => eprintln!("[crashed] {message}"),
            OutputMessage::Started { .. }
            | OutputMessage::Completed { .. }
            | OutputMessage::Alive { .. }
            | OutputMessage::Idle { .. } => log::debug!("{message:?}"),
        }
    }

    fn on_finished(&mut self, _transcript: &Transcript, verdict: Option<&Verdict>) {
        if let Some(v) = verdict {
            let status = if v.working { "working" } else { "not working" };
            eprintln!("[classify] {status} (score {}): {}", v.score, v.reason);
        }
    }

    fn on_notice(&mut self, notice: &Notice) {
        eprintln!("[system] {notice}");
    }
}

struct RunArgs {
    no_shell: bool,
    env: Vec<(String, String)>,
    timeout: Option<u64>,
    save: Option<PathBuf>,
    classify: bool,
    config: Option<PathBuf>,
    command: Vec<String>,
}

fn run(args: RunArgs) -> i32 {
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let mut manager = TerminalManager::from_config(&config);
    if !manager.start() {
        eprintln!("atl-terminal: failed to start supervisor");
        return 1;
    }

    let mut poller = Poller::new(&config);
    if args.classify {
        poller = poller.with_classifier(Classifier::new());
    }

    let request = CommandRequest::new(args.command.join(" "))
        .use_shell(!args.no_shell)
        .envs(args.env);
    if !poller.execute(&mut manager, request) {
        eprintln!("atl-terminal: could not send command to supervisor");
        manager.stop();
        return 1;
    }

    let deadline = args.timeout.map(Duration::from_secs);
    let transcript = poller.run_until_finished(&mut manager, &mut Console, deadline);
    manager.stop();

    let Some(transcript) = transcript else {
        eprintln!("atl-terminal: supervisor stopped before the command finished");
        return 1;
    };

    if let Some(path) = &args.save {
        match transcript.save(path) {
            Ok(()) => log::info!("transcript saved to {}", path.display()),
            Err(e) => eprintln!("atl-terminal: cannot save transcript to {}: {e}", path.display()),
        }
    }

    match transcript.outcome {
        Some(Outcome::Completed { exit_code }) if exit_code < 0 => 128 - exit_code,
        Some(Outcome::Completed { exit_code }) => exit_code,
        _ => 1,
    }
}

fn supervise(request_poll_ms: Option<u64>, output_poll_ms: Option<u64>, kill_confirm_ms: Option<u64>) -> i32 {
    let defaults = SupervisorConfig::default();
    let cfg = SupervisorConfig {
        request_poll_ms: request_poll_ms.unwrap_or(defaults.request_poll_ms),
        output_poll_ms: output_poll_ms.unwrap_or(defaults.output_poll_ms),
        kill_confirm_ms: kill_confirm_ms.unwrap_or(defaults.kill_confirm_ms),
        ..defaults
    };
    supervisor::run_from_stdio(SupervisorOptions::from(&cfg))
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { no_shell, env, timeout, save, classify, config, command } => run(RunArgs {
            no_shell,
            env,
            timeout,
            save,
            classify,
            config,
            command,
        }),
        Commands::Supervise { request_poll_ms, output_poll_ms, kill_confirm_ms } => {
            supervise(request_poll_ms, output_poll_ms, kill_confirm_ms)
        }
    };
    std::process::exit(code);
}
