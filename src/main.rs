//! Hive - 任务执行与工具编排引擎
//!
//! 入口：加载配置、初始化日志，运行计划文件并把事件流逐行打印为 JSON。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};

use hive::config::{load_config, AppConfig};
use hive::core::{run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use hive::engine::{Engine, EngineCleanup, EventType};
use hive::plan::{TaskStatus, TaskSubmission};
use hive::tools::{builtin_registry, submission_schema_json};

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Task execution & tool orchestration engine")]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 提交计划文件（TaskSubmission JSON）并打印事件流直到任务结束
    Run(RunArgs),
    /// 打印计划文件的 JSON Schema
    Schema,
    /// 列出内置工具
    Tools,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    plan: PathBuf,

    /// 自动批准需要确认的步骤
    #[arg(long)]
    auto_approve: bool,

    /// 等待任务结束的上限（秒）
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    hive::observability::init(&cfg.logging);

    match args.command {
        Commands::Schema => println!("{}", submission_schema_json()),
        Commands::Tools => println!("{}", builtin_registry(&cfg.tools).to_schema_json()),
        Commands::Run(run) => run_plan(cfg, run).await?,
    }
    Ok(())
}

async fn run_plan(cfg: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&args.plan)
        .await
        .with_context(|| format!("Failed to read plan {:?}", args.plan))?;
    let submission: TaskSubmission = serde_json::from_str(&text).context("Invalid plan file")?;

    let cleanup_timeout = Duration::from_millis(cfg.engine.cancel_grace_ms.saturating_mul(3).max(1000));
    let engine = Engine::from_config(cfg).await;
    let mut shutdown = ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(cleanup_timeout);
    shutdown.register(EngineCleanup::new(engine.clone()));

    let accepted = engine.submit(submission).await.context("Plan rejected")?;
    println!("{}", serde_json::to_string(&accepted)?);

    if args.auto_approve {
        for step_id in &accepted.step_ids {
            let step = engine.step(step_id).await?;
            if engine.registry().describe(&step.tool_name).map(|d| d.needs_confirmation()) == Some(true) {
                engine.approve_step(step_id).await?;
            }
        }
    }

    let mut subscription = engine.subscribe(&accepted.task_id).await?;
    let mut final_status = None;
    let deadline = Duration::from_secs(args.timeout_secs);
    let app = async {
        let stream = async {
            while let Some(event) = subscription.next().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
                if event.event_type == EventType::TaskStatus
                    && event.status.parse::<TaskStatus>().map(TaskStatus::is_terminal).unwrap_or(false)
                {
                    break;
                }
            }
        };
        if tokio::time::timeout(deadline, stream).await.is_err() {
            tracing::warn!(task_id = %accepted.task_id, "timed out waiting for task, cancelling");
            let _ = engine.cancel_task(&accepted.task_id).await;
        }
        match engine.task_report(&accepted.task_id).await {
            Ok(report) => {
                if let Ok(json) = serde_json::to_string_pretty(&report) {
                    println!("{json}");
                }
                final_status = Some(report.status);
            }
            Err(e) => tracing::error!(error = %e, "failed to build task report"),
        }
    };

    let reason = run_with_graceful_shutdown(&shutdown, app).await;
    match (reason, final_status) {
        (ShutdownReason::Completed, Some(TaskStatus::Completed)) => Ok(()),
        (ShutdownReason::Completed, Some(status)) => anyhow::bail!("task {} finished as {}", accepted.task_id, status),
        (reason, _) => anyhow::bail!("interrupted: {:?}", reason),
    }
}
