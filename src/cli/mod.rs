use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use console::style;
use thiserror::Error;
use tracing::info;

use crate::core::app::StoryApp;
use crate::core::auth::{Authorizer, Caller};
use crate::core::config::{self, AppConfig};
use crate::core::llm::LlmManager;
use crate::core::templates::seed_default_templates;
use crate::core::terminal::{self, GuideSection};
use crate::core::worker::WorkerSettings;
use crate::logging;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Everything a command handler may touch.
pub struct CliContext {
    pub config: AppConfig,
    pub app: StoryApp,
    pub caller: Caller,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
type Handler = for<'a> fn(&'a CliContext, &'a [String]) -> HandlerFuture<'a>;

pub struct Command {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    pub section: &'static str,
    /// `None` for commands that run without opening the store.
    handler: Option<Handler>,
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "worker",
        usage: "worker",
        summary: "Consume the task queue until interrupted",
        section: "Worker",
        handler: Some(cmd_worker),
    },
    Command {
        name: "task",
        usage: "task <id>",
        summary: "Print a task as JSON",
        section: "Tasks",
        handler: Some(cmd_task),
    },
    Command {
        name: "reset-task",
        usage: "reset-task <id>",
        summary: "Reset a task to pending and queue it again",
        section: "Tasks",
        handler: Some(cmd_reset_task),
    },
    Command {
        name: "delete-task",
        usage: "delete-task <id>",
        summary: "Delete a task",
        section: "Tasks",
        handler: Some(cmd_delete_task),
    },
    Command {
        name: "create-api-key",
        usage: "create-api-key <name>",
        summary: "Mint an API key for task administration",
        section: "Setup",
        handler: Some(cmd_create_api_key),
    },
    Command {
        name: "seed-templates",
        usage: "seed-templates",
        summary: "Insert any missing default templates and prompt slots",
        section: "Setup",
        handler: Some(cmd_seed_templates),
    },
    Command {
        name: "list-commands",
        usage: "list-commands",
        summary: "List command names",
        section: "Help",
        handler: None,
    },
    Command {
        name: "help",
        usage: "help",
        summary: "Show this help",
        section: "Help",
        handler: None,
    },
];

pub fn find_command(name: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.name == name)
}

fn print_help() {
    terminal::print_banner();
    for section in ["Worker", "Tasks", "Setup", "Help"] {
        COMMANDS
            .iter()
            .filter(|c| c.section == section)
            .fold(GuideSection::new(section), |guide, c| {
                guide.command(c.usage, c.summary)
            })
            .print();
    }
    println!(
        "\n {} {} <command> [args]\n",
        style("Usage:").bold(),
        style("storyforge").green()
    );
}

fn print_command_list() {
    for command in COMMANDS {
        println!("{}", command.name);
    }
}

fn required_arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .map(|s| s.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("missing <{}>", what))
}

pub async fn run_main() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    run(&args, &config::data_dir()).await
}

/// Dispatch `args` (without the program name) against `data_dir`.
pub async fn run(args: &[String], data_dir: &Path) -> Result<(), CliError> {
    let name = args.first().map(|s| s.as_str()).unwrap_or("help");
    let command = find_command(name).ok_or_else(|| CliError::UnknownCommand(name.to_string()))?;

    let Some(handler) = command.handler else {
        match command.name {
            "list-commands" => print_command_list(),
            _ => print_help(),
        }
        return Ok(());
    };

    let config = AppConfig::load(data_dir).await?;
    logging::init(config.tracing_level());
    let app = StoryApp::open(&config, data_dir)
        .await
        .with_context(|| format!("opening store in {}", data_dir.display()))?;
    let ctx = CliContext {
        config,
        app,
        caller: Caller::operator(),
    };
    handler(&ctx, &args[1..]).await?;
    Ok(())
}

async fn require_task_admin(ctx: &CliContext) -> Result<()> {
    Authorizer::new(ctx.app.store.clone())
        .require_task_admin(&ctx.caller)
        .await?;
    Ok(())
}

fn cmd_worker<'a>(ctx: &'a CliContext, _args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let llm = Arc::new(LlmManager::from_config(&ctx.config.providers)?);
        let worker = ctx
            .app
            .worker(llm, WorkerSettings::from_config(&ctx.config));
        terminal::print_status("worker", worker.identity());
        terminal::print_status("queue", &ctx.config.queue.name);
        tokio::select! {
            result = worker.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping worker {}", worker.identity());
                terminal::print_info("Worker stopped.");
                Ok(())
            }
        }
    })
}

fn cmd_task<'a>(ctx: &'a CliContext, args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = required_arg(args, 0, "id")?;
        require_task_admin(ctx).await?;
        let task = ctx.app.tasks.get(id).await?;
        println!("{}", serde_json::to_string_pretty(&task)?);
        Ok(())
    })
}

fn cmd_reset_task<'a>(ctx: &'a CliContext, args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = required_arg(args, 0, "id")?;
        require_task_admin(ctx).await?;
        let task = ctx.app.tasks.reset(id).await?;
        terminal::print_success(&format!("Task {} is {} and queued again.", task.id, task.status));
        Ok(())
    })
}

fn cmd_delete_task<'a>(ctx: &'a CliContext, args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = required_arg(args, 0, "id")?;
        require_task_admin(ctx).await?;
        if !ctx.app.tasks.delete(id).await? {
            return Err(anyhow!("task {} not found", id));
        }
        terminal::print_success(&format!("Task {} deleted.", id));
        Ok(())
    })
}

fn cmd_create_api_key<'a>(ctx: &'a CliContext, args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let name = required_arg(args, 0, "name")?;
        let (key, record) = ctx.app.store.create_api_key(name).await?;
        terminal::print_success(&format!("API key '{}' created ({}).", record.name, record.id));
        terminal::print_warn("Store this key now; it cannot be shown again.");
        println!("{}", key);
        Ok(())
    })
}

fn cmd_seed_templates<'a>(ctx: &'a CliContext, _args: &'a [String]) -> HandlerFuture<'a> {
    Box::pin(async move {
        let inserted = seed_default_templates(&ctx.app.store).await?;
        if inserted == 0 {
            terminal::print_info("Default templates already present.");
        } else {
            terminal::print_success(&format!("Seeded {} templates and slots.", inserted));
        }
        Ok(())
    })
}
