use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};

use disttask::{
    shutdown::{stop_node_on_shutdown, wait_for_signal, ShutdownManager},
    telemetry::{init_logging, init_metrics},
};
use disttask_application::{builtin_registry, Node, NodeHooks, EXAMPLE_TASK_TYPE};
use disttask_core::{models::NewTask, AppConfig};
use disttask_dispatcher::{TaskControlService, TaskService};
use disttask_infrastructure::create_task_store;

fn key_arg() -> Arg {
    Arg::new("key").value_name("KEY").help("任务 key").required(true)
}

fn cli() -> Command {
    Command::new("disttask")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务调度与高可用框架")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找 config/disttask.toml、disttask.toml")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("启动节点，直到收到 Ctrl+C 或 SIGTERM")
                .arg(
                    Arg::new("exec-id")
                        .long("exec-id")
                        .value_name("ID")
                        .help("节点执行 ID，覆盖配置文件"),
                )
                .arg(
                    Arg::new("executor-only")
                        .long("executor-only")
                        .help("只执行子任务，不参与 owner 竞争")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("grace-period")
                        .long("grace-period")
                        .value_name("SECONDS")
                        .help("优雅退出的最长等待时间")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("30"),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("提交任务")
                .arg(
                    Arg::new("key")
                        .long("key")
                        .value_name("KEY")
                        .help("任务 key，缺省时自动生成"),
                )
                .arg(
                    Arg::new("type")
                        .long("type")
                        .value_name("TYPE")
                        .help("任务类型")
                        .default_value(EXAMPLE_TASK_TYPE),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .value_name("N")
                        .help("单个节点上该任务的子任务并发数")
                        .value_parser(clap::value_parser!(i32))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("meta")
                        .long("meta")
                        .value_name("JSON")
                        .help("任务元数据，例如 {\"step_one\": 10, \"step_two\": 5}"),
                ),
        )
        .subcommand(Command::new("status").about("查询任务状态").arg(key_arg()))
        .subcommand(Command::new("cancel").about("取消任务").arg(key_arg()))
        .subcommand(Command::new("pause").about("暂停任务").arg(key_arg()))
        .subcommand(Command::new("resume").about("恢复已暂停的任务").arg(key_arg()))
        .subcommand(Command::new("list").about("列出所有任务"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| config.observability.log_format.clone());
    init_logging(&log_level, &log_format)?;

    match matches.subcommand() {
        Some(("run", args)) => {
            if let Some(exec_id) = args.get_one::<String>("exec-id") {
                config.node.exec_id = exec_id.clone();
            }
            if args.get_flag("executor-only") {
                config.node.can_be_owner = false;
            }
            let grace_period = Duration::from_secs(*args.get_one::<u64>("grace-period").unwrap_or(&30));
            run_node(config, grace_period).await
        }
        Some((command, args)) => run_client(config, command, args).await,
        None => Err(anyhow::anyhow!("缺少子命令")),
    }
}

async fn run_node(config: AppConfig, grace_period: Duration) -> Result<()> {
    init_metrics(&config.observability)?;
    info!("存储: {}", config.store.url);

    let node = Arc::new(
        Node::from_config(config, Arc::new(builtin_registry()), NodeHooks::default())
            .await
            .context("创建节点失败")?,
    );
    node.start().await.context("启动节点失败")?;

    let shutdown_manager = ShutdownManager::new();
    let stopper = {
        let node = Arc::clone(&node);
        let shutdown = shutdown_manager.subscribe().await;
        tokio::spawn(async move { stop_node_on_shutdown(&node, shutdown, grace_period).await })
    };

    wait_for_signal().await;
    shutdown_manager.shutdown().await;

    if let Err(e) = stopper.await {
        error!("节点退出时发生错误: {e}");
    }
    info!("disttask 已退出");
    Ok(())
}

async fn run_client(config: AppConfig, command: &str, args: &ArgMatches) -> Result<()> {
    let store = create_task_store(&config.store)
        .await
        .with_context(|| format!("连接存储失败: {}", config.store.url))?;
    let service = TaskService::new(store, Arc::new(builtin_registry()));
    let key = || {
        args.get_one::<String>("key")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("缺少任务 key"))
    };

    match command {
        "submit" => {
            let key = args
                .get_one::<String>("key")
                .cloned()
                .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4()));
            let task_type = args
                .get_one::<String>("type")
                .cloned()
                .unwrap_or_else(|| EXAMPLE_TASK_TYPE.to_string());
            let concurrency = *args.get_one::<i32>("concurrency").unwrap_or(&4);
            let mut task = NewTask::new(key.clone(), task_type, concurrency);
            if let Some(meta) = args.get_one::<String>("meta") {
                let meta: serde_json::Value =
                    serde_json::from_str(meta).context("解析任务元数据失败")?;
                task = task.with_meta(meta);
            }
            let id = service.submit_task(task).await?;
            println!("已提交任务 {key} (id {id})");
        }
        "status" => {
            let status = service.get_task_status(&key()?).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "cancel" => report("取消", &key()?, service.cancel_task(&key()?).await?),
        "pause" => report("暂停", &key()?, service.pause_task(&key()?).await?),
        "resume" => report("恢复", &key()?, service.resume_task(&key()?).await?),
        "list" => {
            for task in service.list_tasks().await? {
                println!(
                    "{:>6}  {:<32}  {:<10}  {:<10}  step {}",
                    task.id, task.key, task.task_type, task.state, task.step
                );
            }
        }
        other => return Err(anyhow::anyhow!("不支持的子命令: {other}")),
    }
    Ok(())
}

fn report(action: &str, key: &str, accepted: bool) {
    if accepted {
        println!("已请求{action}任务 {key}");
    } else {
        println!("任务 {key} 当前状态下无需{action}");
    }
}
