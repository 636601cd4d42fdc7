use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use script_runner::config::{ResolverConfig, RunnerConfig};
use script_runner::core::domain::{RunEvent, RunStatus, StreamKind, ToolchainHandle};
use script_runner::core::languages::LanguageRegistry;
use script_runner::core::traits::resolver::ToolchainResolver;
use script_runner::native::resolver::NativeResolver;
use script_runner::session::SessionRunner;
use script_runner::stubs::resolver::ResolverStub;

/// Run a Kotlin or Swift script and stream its output.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Script file to run.
    script: PathBuf,

    /// Language name. Inferred from the file extension when omitted.
    #[arg(short, long)]
    language: Option<String>,

    /// Use this toolchain executable instead of resolving one.
    #[arg(short, long)]
    toolchain: Option<PathBuf>,

    /// Time between SIGTERM and SIGKILL on Ctrl-C.
    #[arg(long, default_value_t = 2000)]
    grace_period_ms: u64,

    /// Extra tool-cache root searched before the defaults. Repeatable.
    #[arg(long)]
    cache_root: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let args = Args::parse();
    let languages = LanguageRegistry::builtin();

    let language = match &args.language {
        Some(name) => languages.get(name)?.clone(),
        None => {
            let extension = args
                .script
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            languages
                .by_extension(&extension)
                .ok_or_else(|| format!("cannot infer language from {}", args.script.display()))?
                .clone()
        }
    };
    let source = tokio::fs::read_to_string(&args.script).await?;

    let resolver: Arc<dyn ToolchainResolver> = match &args.toolchain {
        Some(path) => Arc::new(ResolverStub::new(
            Ok(ToolchainHandle::new(path)),
            Duration::ZERO,
        )),
        None => {
            let mut config = ResolverConfig::from_env();
            config.cache_roots.splice(0..0, args.cache_root.iter().cloned());
            Arc::new(NativeResolver::new(config))
        }
    };

    let config = RunnerConfig {
        grace_period: Duration::from_millis(args.grace_period_ms),
        ..RunnerConfig::default()
    };
    let runner = SessionRunner::new(config, languages, resolver);

    let mut session = runner.start(&language, &source);
    let id = session.id();
    let cancel = session.cancel_handle();
    tracing::info!("Session {} started for {}", id, args.script.display());

    let mut interrupted = false;
    let finished = loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(RunEvent::Started { pid }) => {
                    tracing::debug!("Process started: pid={:?}", pid)
                }
                Some(RunEvent::Output(line)) => {
                    match line.stream {
                        StreamKind::Stdout => println!("{}", line.text),
                        StreamKind::Stderr => eprintln!("{}", line.text),
                    }
                    if let Some(location) = line.diagnostic {
                        tracing::info!("Diagnostic at {}:{}", location.line, location.column);
                    }
                }
                Some(RunEvent::Finished(status)) => break Some(status),
                None => break None,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::info!("Interrupted, stopping session {}", id);
                interrupted = true;
                cancel.cancel();
            }
        }
    };

    let status = finished.unwrap_or_else(|| session.status());
    eprintln!("{}", status);
    Ok(exit_code(&status))
}

fn exit_code(status: &RunStatus) -> ExitCode {
    match status {
        RunStatus::Exited { code } => ExitCode::from((*code & 0xff) as u8),
        RunStatus::Stopped => ExitCode::from(130),
        RunStatus::LaunchFailed { .. } => ExitCode::from(127),
        RunStatus::Running => ExitCode::FAILURE,
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
