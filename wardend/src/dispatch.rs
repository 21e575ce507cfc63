//! Command dispatcher and result delivery.
//!
//! Routes parsed operator input to component handlers and, on the other side
//! of the loop, turns drained [`Completion`]s back into replies. Everything
//! here runs inline in the control loop; anything slow is handed to
//! `supervise` and comes back as a completion event.

use crate::commands;
use crate::config::Config;
use crate::confirm::{ConfirmOutcome, ConfirmStore, PendingAction, TOKEN_TTL_SECS};
use crate::errors::CommandError;
use crate::journal::Journal;
use crate::release::{DeployError, ReleaseManager};
use crate::session::{ExecOutcome, SessionManager};
use crate::supervise::{self, Completion, CompletionSender, ExitSummary};
use crate::tasks::TaskQueue;
use crate::telegram::{BotClient, CallbackQuery, Document, InlineButton, Message, Update, MAX_REPLY_CHARS};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HELP_TEXT: &str = "\
Commands:
/status — uptime, memory, disk
/top — process snapshot
/shell — start a shell session, /exit — end it
  (with a session active, any other text runs in it; cd changes directory)
/task <label> <command...> — run in the background, output delivered as a file
/deploy [project] — deploy a configured project
/rollback <project> — roll back to the previous release (confirmed)
/releases <project>, /projects — release status
/ufw status|enable|disable|allow <port>|deny <port>
/adduser <name> <password>, /deluser <name> (confirmed)
/service <unit> status|restart
/kill <pid> (confirmed), /reboot (confirmed)
/get <path> — fetch a file from the host
/confirm <code> — approve a pending destructive action
Reply to a document to save it on the host.";

pub struct App {
    pub config: Config,
    pub bot: BotClient,
    pub confirm: ConfirmStore,
    pub session: SessionManager,
    pub tasks: TaskQueue,
    pub releases: ReleaseManager,
    pub journal: Journal,
    pub tx: CompletionSender,
    outbox: PathBuf,
    actions_dir: PathBuf,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        bot: BotClient,
        confirm: ConfirmStore,
        session: SessionManager,
        tasks: TaskQueue,
        releases: ReleaseManager,
        journal: Journal,
        tx: CompletionSender,
    ) -> Self {
        let outbox = config.data_dir.join("outbox");
        let actions_dir = config.data_dir.join("actions");
        Self {
            config,
            bot,
            confirm,
            session,
            tasks,
            releases,
            journal,
            tx,
            outbox,
            actions_dir,
        }
    }

    fn authorized(&self, sender: Option<i64>) -> bool {
        sender == Some(self.config.operator_id)
    }

    pub async fn handle_update(&mut self, update: Update) {
        if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        } else if let Some(message) = update.message {
            self.handle_message(message).await;
        }
    }

    async fn handle_message(&mut self, message: Message) {
        let sender = message.from.as_ref().map(|u| u.id);
        if !self.authorized(sender) {
            // Silence: unauthorized senders never learn the bot exists.
            warn!(?sender, "dropping message from unauthorized sender");
            return;
        }
        let chat_id = message.chat.id;

        // A document, attached directly or replied to, is the download
        // command regardless of the message text.
        let attached = message
            .document
            .clone()
            .or_else(|| {
                message
                    .reply_to_message
                    .as_ref()
                    .and_then(|m| m.document.clone())
            });
        if let Some(document) = attached {
            self.journal_event(
                "dispatch",
                "download",
                json!({ "file": document.file_name }),
            );
            if let Err(err) = self.download_document(chat_id, &document).await {
                self.reply(chat_id, &format!("download failed: {}", err)).await;
            }
            return;
        }

        let text = match message.text.as_deref() {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => {
                debug!("ignoring message without text");
                return;
            }
        };

        let mut parts = text.split_whitespace();
        let token = parts.next().unwrap_or_default().to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        self.journal_event("dispatch", &token, json!({ "args": args.len() }));

        if let Err(err) = self.route(chat_id, &token, &args, &text).await {
            match err {
                CommandError::Validation(_) | CommandError::Execution(_) => {
                    self.reply(chat_id, &err.to_string()).await;
                }
                CommandError::Other(err) => {
                    warn!("handler for {} failed: {:#}", token, err);
                    self.reply(chat_id, &format!("{} failed: {}", token, err)).await;
                }
            }
        }
    }

    async fn route(
        &mut self,
        chat_id: i64,
        token: &str,
        args: &[String],
        raw: &str,
    ) -> Result<(), CommandError> {
        match token {
            "/start" | "/help" => {
                self.reply(chat_id, HELP_TEXT).await;
                Ok(())
            }
            "/menu" => {
                self.send_menu(chat_id).await;
                Ok(())
            }
            "/status" => {
                let summary = commands::status_summary().await;
                self.send_result(chat_id, "host status", &summary, None).await;
                Ok(())
            }
            "/top" => {
                let snapshot = commands::top_snapshot().await?;
                self.send_result(chat_id, "top", &snapshot, None).await;
                Ok(())
            }
            "/ufw" => {
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let output = commands::ufw(&arg_refs).await?;
                self.send_result(chat_id, "ufw", &output, None).await;
                Ok(())
            }
            "/adduser" => match args {
                [name, password] => {
                    let report = commands::add_user(name, password).await?;
                    self.reply(chat_id, &report).await;
                    Ok(())
                }
                _ => Err(CommandError::Validation(
                    "usage: /adduser <name> <password>".into(),
                )),
            },
            "/deluser" => match args {
                [name] => {
                    commands::validate_username(name)?;
                    self.request_confirmation(
                        chat_id,
                        PendingAction::DeleteUser { name: name.clone() },
                    )
                    .await
                }
                _ => Err(CommandError::Validation("usage: /deluser <name>".into())),
            },
            "/service" => match args {
                [unit, op] => {
                    let output = commands::service(unit, op).await?;
                    self.send_result(chat_id, "service", &output, None).await;
                    Ok(())
                }
                _ => Err(CommandError::Validation(
                    "usage: /service <unit> status|restart".into(),
                )),
            },
            "/kill" => match args {
                [pid] => {
                    let pid = commands::parse_pid(pid)?;
                    self.request_confirmation(chat_id, PendingAction::Kill { pid })
                        .await
                }
                _ => Err(CommandError::Validation("usage: /kill <pid>".into())),
            },
            "/reboot" => self.request_confirmation(chat_id, PendingAction::Reboot).await,
            "/confirm" => match args {
                [code] => self.run_confirm(chat_id, code).await,
                _ => Err(CommandError::Validation("usage: /confirm <code>".into())),
            },
            "/shell" => {
                let killed_previous = self.session.start();
                let cwd = self
                    .session
                    .cwd()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let note = if killed_previous {
                    " (previous session's command killed)"
                } else {
                    ""
                };
                self.reply(chat_id, &format!("shell session open in {}{}", cwd, note))
                    .await;
                Ok(())
            }
            "/exit" => {
                let was_active = self.session.stop();
                let text = if was_active {
                    "shell session closed"
                } else {
                    "no shell session is open"
                };
                self.reply(chat_id, text).await;
                Ok(())
            }
            "/task" => {
                if args.len() < 2 {
                    return Err(CommandError::Validation(
                        "usage: /task <label> <command...>".into(),
                    ));
                }
                let label = args[0].clone();
                let command = args[1..].join(" ");
                let id = self
                    .tasks
                    .enqueue(&label, &command)
                    .map_err(CommandError::Other)?;
                self.reply(
                    chat_id,
                    &format!("task '{}' queued ({}), output follows as a file", label, id),
                )
                .await;
                Ok(())
            }
            "/deploy" => match args {
                [] => {
                    self.send_deploy_menu(chat_id).await;
                    Ok(())
                }
                [project] => {
                    self.start_deploy(chat_id, project).await;
                    Ok(())
                }
                _ => Err(CommandError::Validation("usage: /deploy [project]".into())),
            },
            "/rollback" => match args {
                [project] => self.prepare_rollback(chat_id, project).await,
                _ => Err(CommandError::Validation("usage: /rollback <project>".into())),
            },
            "/releases" => match args {
                [project] => {
                    let text = self.releases_listing(project)?;
                    self.reply(chat_id, &text).await;
                    Ok(())
                }
                _ => Err(CommandError::Validation("usage: /releases <project>".into())),
            },
            "/projects" => {
                let overview = self.projects_overview();
                self.reply(chat_id, &overview).await;
                Ok(())
            }
            "/get" => match args {
                [path] => {
                    let path = PathBuf::from(path);
                    if !path.is_file() {
                        return Err(CommandError::Validation(format!(
                            "no such file: {}",
                            path.display()
                        )));
                    }
                    self.bot
                        .send_document(chat_id, &path, &path.display().to_string())
                        .await
                        .map_err(|err| CommandError::Execution(err.to_string()))?;
                    Ok(())
                }
                _ => Err(CommandError::Validation("usage: /get <path>".into())),
            },
            _ => {
                // Unknown token: an active session owns the raw text.
                if self.session.is_active() {
                    self.session_input(chat_id, raw).await
                } else {
                    self.reply(chat_id, "Unknown command — try /help.").await;
                    Ok(())
                }
            }
        }
    }

    async fn handle_callback(&mut self, callback: CallbackQuery) {
        if !self.authorized(Some(callback.from.id)) {
            warn!(sender = callback.from.id, "dropping unauthorized callback");
            return;
        }
        let chat_id = callback
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(self.config.operator_id);
        let data = callback.data.clone().unwrap_or_default();

        if let Err(err) = self.bot.answer_callback(&callback.id, None).await {
            warn!("answerCallbackQuery failed: {}", err);
        }
        self.journal_event("dispatch", "callback", json!({ "data": data }));

        match parse_callback(&data) {
            Some(("menu", "status", None)) => {
                let summary = commands::status_summary().await;
                self.send_result(chat_id, "host status", &summary, None).await;
            }
            Some(("menu", "projects", None)) => {
                let overview = self.projects_overview();
                self.reply(chat_id, &overview).await;
            }
            Some(("menu", "help", None)) => {
                self.reply(chat_id, HELP_TEXT).await;
            }
            Some(("deploy", "run", Some(project))) => {
                let project = project.to_string();
                self.start_deploy(chat_id, &project).await;
            }
            Some(("confirm", "run", Some(code))) => {
                let code = code.to_string();
                if let Err(err) = self.run_confirm(chat_id, &code).await {
                    self.reply(chat_id, &err.to_string()).await;
                }
            }
            _ => warn!(%data, "unknown callback payload"),
        }
    }

    // --- confirmation -------------------------------------------------------

    async fn request_confirmation(
        &mut self,
        chat_id: i64,
        action: PendingAction,
    ) -> Result<(), CommandError> {
        let code = self.confirm.create(&action).map_err(CommandError::Other)?;
        self.journal_event(
            "confirm.create",
            &code,
            json!({ "action": action.describe() }),
        );
        let text = format!(
            "About to {}.\nReply /confirm {} within {} minutes.",
            action.describe(),
            code,
            TOKEN_TTL_SECS / 60
        );
        let rows = vec![vec![InlineButton::new(
            "Confirm",
            format!("confirm:run:{}", code),
        )]];
        if let Err(err) = self.bot.send_keyboard(chat_id, &text, &rows).await {
            warn!("sending confirmation prompt failed: {}", err);
        }
        Ok(())
    }

    async fn run_confirm(&mut self, chat_id: i64, code: &str) -> Result<(), CommandError> {
        let outcome = self.confirm.execute(code).map_err(CommandError::Other)?;
        match outcome {
            ConfirmOutcome::Invalid => {
                self.journal_event("confirm.exec", code, json!({ "outcome": "invalid" }));
                self.reply(chat_id, "unknown or already used confirmation code")
                    .await;
            }
            ConfirmOutcome::Expired => {
                self.journal_event("confirm.exec", code, json!({ "outcome": "expired" }));
                self.reply(chat_id, "confirmation code expired — request the action again")
                    .await;
            }
            ConfirmOutcome::Confirmed(action) => {
                self.journal_event(
                    "confirm.exec",
                    code,
                    json!({ "outcome": "confirmed", "action": action.describe() }),
                );
                self.reply(
                    chat_id,
                    &format!("confirmed: {} — running in background", action.describe()),
                )
                .await;
                self.run_action(action);
            }
        }
        Ok(())
    }

    /// Confirmed actions run detached; results come back as completions.
    fn run_action(&mut self, action: PendingAction) {
        match action {
            PendingAction::Reboot => {
                self.spawn_action("reboot", &["systemctl", "reboot"]);
            }
            PendingAction::DeleteUser { name } => {
                self.spawn_action(&format!("deluser {}", name), &["userdel", "-r", &name]);
            }
            PendingAction::Kill { pid } => {
                let (exit, output) = match supervise::kill_pid(pid) {
                    Ok(()) => (ExitSummary { code: Some(0), signal: None }, String::new()),
                    Err(err) => (ExitSummary::spawn_failure(), format!("{:#}", err)),
                };
                let _ = self.tx.send(Completion::Action {
                    label: format!("kill {}", pid),
                    exit,
                    output,
                });
            }
            PendingAction::Rollback { project, release } => {
                self.start_rollback(&project, &release);
            }
        }
    }

    fn spawn_action(&self, label: &str, argv: &[&str]) {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let output_path = self
            .actions_dir
            .join(format!("act-{}.log", Utc::now().format("%Y%m%d%H%M%S%6f")));
        let label = label.to_string();
        let tx = self.tx.clone();

        match supervise::spawn_argv(&argv, Path::new("/"), &output_path) {
            Ok(job) => {
                tokio::spawn(async move {
                    let exit = job.wait().await;
                    let output = supervise::read_output(&output_path).await;
                    let _ = std::fs::remove_file(&output_path);
                    let _ = tx.send(Completion::Action { label, exit, output });
                });
            }
            Err(err) => {
                let _ = tx.send(Completion::Action {
                    label,
                    exit: ExitSummary::spawn_failure(),
                    output: format!("{:#}", err),
                });
            }
        }
    }

    // --- shell session ------------------------------------------------------

    async fn session_input(&mut self, chat_id: i64, raw: &str) -> Result<(), CommandError> {
        let mut parts = raw.split_whitespace();
        if parts.next() == Some("cd") {
            let target = parts.next();
            let cwd = self.session.change_dir(target)?;
            self.reply(chat_id, &format!("cwd: {}", cwd.display())).await;
            return Ok(());
        }

        match self.session.execute(raw)? {
            ExecOutcome::Busy { pid } => {
                self.reply(
                    chat_id,
                    &format!("busy: pid {} is still running — wait for its output", pid),
                )
                .await;
            }
            ExecOutcome::Spawned(job) => {
                let handle = job.handle.clone();
                self.journal_event("session.exec", raw, json!({ "pid": handle.pid }));
                self.reply(chat_id, &format!("[{}] started (pid {})", handle.id, handle.pid))
                    .await;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let exit = job.wait().await;
                    let _ = tx.send(Completion::SessionJob {
                        job_id: handle.id,
                        exit,
                        output_path: handle.output_path,
                    });
                });
            }
        }
        Ok(())
    }

    // --- releases -----------------------------------------------------------

    async fn start_deploy(&mut self, chat_id: i64, project: &str) {
        let Some(cfg) = self.config.projects.get(project).cloned() else {
            self.reply(chat_id, &format!("unknown project '{}' — see /projects", project))
                .await;
            return;
        };

        self.journal_event("deploy", project, json!({ "branch": cfg.branch }));
        self.reply(
            chat_id,
            &format!("deploying {} (branch {})...", project, cfg.branch),
        )
        .await;

        let manager = self.releases.clone();
        let project = project.to_string();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = match manager.deploy(&project, &cfg).await {
                Ok(report) => {
                    let mut summary =
                        format!("deployed {} — release {} is live", report.project, report.release);
                    if !report.pruned.is_empty() {
                        summary.push_str(&format!(" (pruned {})", report.pruned.join(", ")));
                    }
                    Completion::Release {
                        project: report.project,
                        summary,
                        attachment: None,
                    }
                }
                Err(DeployError::Build { log_path }) => Completion::Release {
                    project: project.clone(),
                    summary: format!(
                        "deploy {} failed at build — release discarded, current untouched; log attached",
                        project
                    ),
                    attachment: Some(log_path),
                },
                Err(DeployError::Clone { output }) => Completion::Release {
                    project: project.clone(),
                    summary: format!("deploy {} failed at clone:\n{}", project, clip_tail(&output, 1000)),
                    attachment: None,
                },
                Err(DeployError::Restart { release, output }) => Completion::Release {
                    project: project.clone(),
                    summary: format!(
                        "deploy {}: release {} is live but restart failed (not reverted):\n{}",
                        project,
                        release,
                        clip_tail(&output, 1000)
                    ),
                    attachment: None,
                },
                Err(DeployError::Other(err)) => Completion::Release {
                    project: project.clone(),
                    summary: format!("deploy {} failed: {:#}", project, err),
                    attachment: None,
                },
            };
            let _ = tx.send(completion);
        });
    }

    async fn prepare_rollback(&mut self, chat_id: i64, project: &str) -> Result<(), CommandError> {
        if !self.config.projects.contains_key(project) {
            return Err(CommandError::Validation(format!(
                "unknown project '{}' — see /projects",
                project
            )));
        }
        match self
            .releases
            .rollback_target(project)
            .map_err(CommandError::Other)?
        {
            None => Err(CommandError::Validation(
                "need at least two releases on disk to roll back".into(),
            )),
            Some((newest, previous)) => {
                self.reply(
                    chat_id,
                    &format!("rollback {}: {} -> {}", project, newest, previous),
                )
                .await;
                self.request_confirmation(
                    chat_id,
                    PendingAction::Rollback {
                        project: project.to_string(),
                        release: previous,
                    },
                )
                .await
            }
        }
    }

    fn start_rollback(&mut self, project: &str, release: &str) {
        let Some(cfg) = self.config.projects.get(project).cloned() else {
            let _ = self.tx.send(Completion::Release {
                project: project.to_string(),
                summary: format!("rollback failed: project '{}' is no longer configured", project),
                attachment: None,
            });
            return;
        };

        self.journal_event("rollback", project, json!({ "release": release }));
        let manager = self.releases.clone();
        let project = project.to_string();
        let release = release.to_string();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = match manager.rollback(&project, &cfg, &release).await {
                Ok(()) => Completion::Release {
                    project: project.clone(),
                    summary: format!("rolled back {} to release {}", project, release),
                    attachment: None,
                },
                Err(DeployError::Restart { release, output }) => Completion::Release {
                    project: project.clone(),
                    summary: format!(
                        "rollback {}: release {} is current but restart failed:\n{}",
                        project,
                        release,
                        clip_tail(&output, 1000)
                    ),
                    attachment: None,
                },
                Err(err) => Completion::Release {
                    project: project.clone(),
                    summary: format!("rollback {} failed: {}", project, err),
                    attachment: None,
                },
            };
            let _ = tx.send(completion);
        });
    }

    fn releases_listing(&self, project: &str) -> Result<String, CommandError> {
        if !self.config.projects.contains_key(project) {
            return Err(CommandError::Validation(format!(
                "unknown project '{}' — see /projects",
                project
            )));
        }
        let releases = self.releases.list_releases(project).map_err(CommandError::Other)?;
        if releases.is_empty() {
            return Ok(format!("{}: no releases deployed yet", project));
        }
        let lines: Vec<String> = releases
            .iter()
            .map(|info| {
                if info.is_current {
                    format!("* {} (current)", info.name)
                } else {
                    format!("* {}", info.name)
                }
            })
            .collect();
        Ok(format!("{} releases:\n{}", project, lines.join("\n")))
    }

    fn projects_overview(&self) -> String {
        if self.config.projects.is_empty() {
            return "no projects configured".to_string();
        }
        let mut lines = Vec::new();
        for (name, cfg) in &self.config.projects {
            let current = self
                .releases
                .current_release(name)
                .unwrap_or_else(|| "none".to_string());
            let last = self
                .releases
                .last_deploy(name)
                .map(|meta| meta.deployed_at.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "{} — branch {}, current {}, last deploy {}",
                name, cfg.branch, current, last
            ));
        }
        lines.join("\n")
    }

    async fn send_menu(&self, chat_id: i64) {
        let rows = vec![
            vec![InlineButton::new("Host status", "menu:status")],
            vec![InlineButton::new("Projects", "menu:projects")],
            vec![InlineButton::new("Help", "menu:help")],
        ];
        if let Err(err) = self
            .bot
            .send_keyboard(chat_id, "Pick an option:", &rows)
            .await
        {
            warn!("sending menu failed: {}", err);
        }
    }

    async fn send_deploy_menu(&self, chat_id: i64) {
        if self.config.projects.is_empty() {
            self.reply(chat_id, "no projects configured").await;
            return;
        }
        let rows: Vec<Vec<InlineButton>> = self
            .config
            .projects
            .keys()
            .map(|name| vec![InlineButton::new(name.clone(), format!("deploy:run:{}", name))])
            .collect();
        if let Err(err) = self
            .bot
            .send_keyboard(chat_id, "Deploy which project?", &rows)
            .await
        {
            warn!("sending deploy menu failed: {}", err);
        }
    }

    // --- file transfer ------------------------------------------------------

    async fn download_document(
        &mut self,
        chat_id: i64,
        document: &Document,
    ) -> Result<(), CommandError> {
        let info = self
            .bot
            .get_file(&document.file_id)
            .await
            .map_err(|err| CommandError::Execution(err.to_string()))?;
        let remote_path = info
            .file_path
            .ok_or_else(|| CommandError::Execution("file has no download path".into()))?;

        // Only the final name component; an attachment never picks its directory.
        let name = document
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let dest = self.session.download_dir().join(name);

        self.bot
            .download_file(&remote_path, &dest)
            .await
            .map_err(|err| CommandError::Execution(err.to_string()))?;
        self.reply(chat_id, &format!("saved to {}", dest.display()))
            .await;
        Ok(())
    }

    // --- completion delivery ------------------------------------------------

    pub async fn deliver(&mut self, completion: Completion) {
        let chat_id = self.config.operator_id;
        match completion {
            Completion::SessionJob {
                job_id,
                exit,
                output_path,
            } => {
                self.session.job_finished(job_id);
                let output = supervise::read_output(&output_path).await;
                self.journal_event(
                    "session.done",
                    &job_id.to_string(),
                    json!({ "exit": exit.describe() }),
                );
                self.send_result(
                    chat_id,
                    &format!("[{}] {}", job_id, exit.describe()),
                    &output,
                    Some(output_path.as_path()),
                )
                .await;
                let _ = std::fs::remove_file(&output_path);
            }
            Completion::Task {
                id,
                label,
                exit,
                output_path,
                work_dir,
            } => {
                self.journal_event("task.done", &id, json!({ "exit": exit.describe() }));
                let verdict = if exit.success() { "finished" } else { "failed" };
                let caption = format!("task '{}' {} ({})", label, verdict, exit.describe());
                if let Err(err) = self.bot.send_document(chat_id, &output_path, &caption).await {
                    warn!("task output upload failed: {}", err);
                    let output = supervise::read_output(&output_path).await;
                    self.send_result(chat_id, &caption, &output, None).await;
                }
                TaskQueue::cleanup(&work_dir);
            }
            Completion::Action { label, exit, output } => {
                self.journal_event("action.done", &label, json!({ "exit": exit.describe() }));
                self.send_result(
                    chat_id,
                    &format!("{}: {}", label, exit.describe()),
                    &output,
                    None,
                )
                .await;
            }
            Completion::Release {
                project,
                summary,
                attachment,
            } => {
                self.journal_event("release.done", &project, json!({}));
                self.reply(chat_id, &summary).await;
                if let Some(path) = attachment {
                    let caption = format!("{} build log", project);
                    if let Err(err) = self.bot.send_document(chat_id, &path, &caption).await {
                        warn!("build log upload failed: {}", err);
                    }
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    // --- plumbing -----------------------------------------------------------

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.bot.send_message(chat_id, text).await {
            warn!("reply failed: {}", err);
        }
    }

    /// Short output goes inline; long output becomes a document.
    async fn send_result(&self, chat_id: i64, head: &str, body: &str, file: Option<&Path>) {
        if body.trim().is_empty() {
            self.reply(chat_id, &format!("{} (no output)", head)).await;
            return;
        }
        if head.len() + body.len() + 1 <= MAX_REPLY_CHARS {
            self.reply(chat_id, &format!("{}\n{}", head, body)).await;
            return;
        }
        if let Some(path) = file {
            if self.bot.send_document(chat_id, path, head).await.is_ok() {
                return;
            }
        }
        // No reusable file: stage the body in the outbox, attach, discard.
        let staged = self
            .outbox
            .join(format!("out-{}.txt", Utc::now().format("%Y%m%d%H%M%S%6f")));
        let send = async {
            if let Some(parent) = staged.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&staged, body).await?;
            self.bot
                .send_document(chat_id, &staged, head)
                .await
                .map_err(std::io::Error::other)?;
            Ok::<(), std::io::Error>(())
        };
        if let Err(err) = send.await {
            warn!("long output delivery failed: {}", err);
            self.reply(chat_id, &format!("{}\n{}", head, clip_tail(body, MAX_REPLY_CHARS)))
                .await;
        }
        let _ = std::fs::remove_file(&staged);
    }

    fn journal_event(&self, event: &str, subject: &str, meta: serde_json::Value) {
        let actor = self.config.operator_id.to_string();
        if let Err(err) = self.journal.append(event, &actor, subject, meta) {
            warn!("journal append failed: {:#}", err);
        }
    }
}

/// Callback payloads are `namespace:action[:argument]`.
pub fn parse_callback(data: &str) -> Option<(&str, &str, Option<&str>)> {
    let mut parts = data.splitn(3, ':');
    let namespace = parts.next()?;
    let action = parts.next()?;
    let argument = parts.next();
    if namespace.is_empty() || action.is_empty() {
        return None;
    }
    Some((namespace, action, argument))
}

/// Keep the last `max` chars of noisy output.
fn clip_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let tail: String = text
        .chars()
        .rev()
        .take(max)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{}", tail)
}
