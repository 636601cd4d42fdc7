use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::{
    config::RunnerConfig,
    core::{
        domain::{
            CapturedLine, Invocation, LaunchPlan, OutputLine, RunEvent, RunStatus, SessionId,
            ToolchainHandle,
        },
        errors::{LanguageError, WorkspaceError},
        languages::{LanguageRegistry, LanguageSpec},
        scanner::DiagnosticScanner,
        traits::resolver::ToolchainResolver,
    },
    native::{
        supervisor::{self, ProcessOutcome},
        workspace::{Workspace, WorkspaceManager},
    },
};

/// Idempotent cancel trigger shared between a session handle and its runner.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    fn new(sender: watch::Sender<bool>) -> Self {
        CancelHandle(Arc::new(sender))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Starts runs and keeps track of the ones still in flight.
#[derive(Clone, Debug)]
pub struct SessionRunner {
    config: RunnerConfig,
    languages: Arc<LanguageRegistry>,
    scanner: Arc<DiagnosticScanner>,
    resolver: Arc<dyn ToolchainResolver>,
    workspaces: WorkspaceManager,
    active: Arc<DashMap<SessionId, CancelHandle>>,
}

impl SessionRunner {
    pub fn new(
        config: RunnerConfig,
        languages: LanguageRegistry,
        resolver: Arc<dyn ToolchainResolver>,
    ) -> Self {
        let scanner = DiagnosticScanner::from_registry(&languages);
        let workspaces = WorkspaceManager::new(config.workspace_root.clone());

        SessionRunner {
            config,
            languages: Arc::new(languages),
            scanner: Arc::new(scanner),
            resolver,
            workspaces,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    /// Starts a run in the background and returns its handle right away.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, language: &LanguageSpec, source: &str) -> RunSession {
        let id = SessionId::new();
        let (events_tx, events_rx) = mpsc::channel(self.config.channel_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = CancelHandle::new(cancel_tx);

        let workspace = self.workspaces.create(language);
        let script_path = workspace
            .as_ref()
            .ok()
            .map(|w| w.script_path().to_path_buf());

        self.active.insert(id, cancel.clone());

        let driver = Driver {
            id,
            language: language.clone(),
            source: source.to_string(),
            config: self.config.clone(),
            scanner: self.scanner.clone(),
            resolver: self.resolver.clone(),
            active: self.active.clone(),
            events: events_tx,
            cancel: cancel_rx,
        };
        let span = tracing::info_span!("session", id = %id, language = %language.name);
        tokio::spawn(driver.drive(workspace).instrument(span));

        RunSession {
            id,
            language: language.name.clone(),
            script_path,
            started_at: Utc::now(),
            events: events_rx,
            status: RunStatus::Running,
            cancel,
        }
    }

    pub fn start_named(&self, language: &str, source: &str) -> Result<RunSession, LanguageError> {
        let language = self.languages.get(language)?.clone();
        Ok(self.start(&language, source))
    }

    /// Cancels a run by id. Unknown or finished sessions are ignored.
    pub fn cancel(&self, id: &SessionId) {
        match self.active.get(id) {
            Some(handle) => handle.cancel(),
            None => tracing::debug!("Cancel ignored, session {} is not running", id),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }
}

/// Caller-side handle of one run.
///
/// Yields [`RunEvent`]s in delivery order, either through [`RunSession::next_event`]
/// or as a [`Stream`]. Dropping the handle before the run finishes cancels it.
#[derive(Debug)]
pub struct RunSession {
    id: SessionId,
    language: String,
    script_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    events: mpsc::Receiver<RunEvent>,
    /// Last status delivered to the caller; terminal only once `Finished`
    /// has been received, so every output line precedes it.
    status: RunStatus,
    cancel: CancelHandle,
}

/// Everything a finished run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutput {
    pub lines: Vec<OutputLine>,
    pub status: RunStatus,
}

impl RunSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Absolute path of the generated script while the run owns it.
    /// `None` when the workspace could not be created.
    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> RunStatus {
        self.status.clone()
    }

    /// No-op once the run has reached a terminal status.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn next_event(&mut self) -> Option<RunEvent> {
        let event = self.events.recv().await;
        self.observe(event)
    }

    fn observe(&mut self, event: Option<RunEvent>) -> Option<RunEvent> {
        if let Some(RunEvent::Finished(status)) = &event {
            self.status = status.clone();
        }
        event
    }

    /// Consumes the remaining events and returns the collected output.
    pub async fn wait(&mut self) -> RunOutput {
        let mut lines = Vec::new();

        while let Some(event) = self.next_event().await {
            match event {
                RunEvent::Output(line) => lines.push(line),
                RunEvent::Finished(status) => return RunOutput { lines, status },
                RunEvent::Started { .. } => {}
            }
        }

        if !self.status.is_terminal() {
            self.status = RunStatus::LaunchFailed {
                reason: "run ended without a status".to_string(),
            };
        }
        RunOutput {
            lines,
            status: self.status(),
        }
    }
}

impl Stream for RunSession {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let session = self.get_mut();
        session.events.poll_recv(cx).map(|event| session.observe(event))
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        if !self.status.is_terminal() {
            tracing::debug!("Session {} dropped while running, cancelling", self.id);
            self.cancel.cancel();
        }
    }
}

/// Background task behind one [`RunSession`].
struct Driver {
    id: SessionId,
    language: LanguageSpec,
    source: String,
    config: RunnerConfig,
    scanner: Arc<DiagnosticScanner>,
    resolver: Arc<dyn ToolchainResolver>,
    active: Arc<DashMap<SessionId, CancelHandle>>,
    events: mpsc::Sender<RunEvent>,
    cancel: watch::Receiver<bool>,
}

impl Driver {
    async fn drive(mut self, workspace: Result<Workspace, WorkspaceError>) {
        tracing::info!("Run started");

        let status = match workspace {
            Ok(workspace) => {
                let status = self.run_in(&workspace).await;
                workspace.destroy();
                status
            }
            Err(e) => launch_failed(e),
        };

        self.active.remove(&self.id);
        tracing::info!("Run finished: {}", status);
        self.emit(RunEvent::Finished(status)).await;
    }

    async fn run_in(&mut self, workspace: &Workspace) -> RunStatus {
        if let Err(e) = workspace.write_script(&self.source).await {
            return launch_failed(e);
        }

        let resolved = tokio::select! {
            biased;
            _ = self.cancel.wait_for(|requested| *requested) => None,
            resolved = self.resolver.resolve(&self.language) => Some(resolved),
        };
        let toolchain = match resolved {
            None => return RunStatus::Stopped,
            Some(Ok(toolchain)) => toolchain,
            Some(Err(e)) => return launch_failed(e),
        };
        if *self.cancel.borrow() {
            return RunStatus::Stopped;
        }

        let plan = self.plan(&toolchain, workspace);
        tracing::debug!("Launch plan: {:?}", plan);

        let (line_tx, line_rx) = mpsc::channel(self.config.channel_capacity);
        let process = match supervisor::launch(&plan, line_tx, &self.config) {
            Ok(process) => process,
            Err(e) => return launch_failed(e),
        };
        self.emit(RunEvent::Started { pid: process.pid() }).await;

        let (outcome, ()) = tokio::join!(
            process.supervise(self.cancel.clone()),
            self.forward(line_rx)
        );

        match outcome {
            ProcessOutcome::Exited { code } => RunStatus::Exited { code },
            ProcessOutcome::Stopped => RunStatus::Stopped,
        }
    }

    fn plan(&self, toolchain: &ToolchainHandle, workspace: &Workspace) -> LaunchPlan {
        let args = self.language.launch_args(workspace.script_path());

        let mut fallback_args = vec![self.language.toolchain.clone()];
        fallback_args.extend(args.iter().cloned());

        LaunchPlan {
            primary: Invocation {
                program: toolchain.path.clone(),
                args,
            },
            fallback: Some(Invocation {
                program: self.config.fallback_launcher.clone(),
                args: fallback_args,
            }),
            working_dir: workspace.dir().to_path_buf(),
        }
    }

    /// Numbers and scans captured lines until both readers are done.
    async fn forward(&self, mut lines: mpsc::Receiver<CapturedLine>) {
        let mut sequence = 0;

        while let Some(captured) = lines.recv().await {
            let diagnostic = self.scanner.scan(&captured.text);
            self.emit(RunEvent::Output(OutputLine {
                session_id: self.id,
                sequence,
                stream: captured.stream,
                text: captured.text,
                diagnostic,
            }))
            .await;
            sequence += 1;
        }
    }

    async fn emit(&self, event: RunEvent) {
        // A closed receiver means the handle is gone; keep draining regardless.
        if self.events.send(event).await.is_err() {
            tracing::trace!("Session handle dropped, event discarded");
        }
    }
}

fn launch_failed(error: impl Display) -> RunStatus {
    tracing::warn!("Run could not be launched: {}", error);
    RunStatus::LaunchFailed {
        reason: error.to_string(),
    }
}
