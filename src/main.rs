use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};

use cuniculus::{builtin_registry, parse_args, Application, ShutdownManager};
use cuniculus_core::{logging, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| config.observability.log_format.clone());
    logging::init_logging(&log_level, &log_format)?;

    let app = Application::new(config)?;

    match matches.subcommand() {
        Some(("declare", _)) => app.declare().await,
        Some(("enqueue", sub)) => enqueue(&app, sub).await,
        Some(("consume", _)) => consume(app).await,
        _ => Err(anyhow::anyhow!("缺少子命令，使用 --help 查看用法")),
    }
}

fn cli() -> Command {
    Command::new("cuniculus")
        .version(env!("CARGO_PKG_VERSION"))
        .about("基于RabbitMQ的可靠后台任务系统")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("配置文件路径，未指定时依次查找 config/cuniculus.toml 和 cuniculus.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .subcommand(Command::new("declare").about("声明交换机、死信队列和配置中的全部队列"))
        .subcommand(
            Command::new("enqueue")
                .about("提交一个任务")
                .arg(Arg::new("queue").required(true).help("队列名称"))
                .arg(Arg::new("class").required(true).help("任务类型"))
                .arg(Arg::new("args").help("任务参数，JSON数组或单个JSON值")),
        )
        .subcommand(Command::new("consume").about("消费配置中的全部队列，直到收到关闭信号"))
}

async fn enqueue(app: &Application, matches: &ArgMatches) -> Result<()> {
    let queue = matches
        .get_one::<String>("queue")
        .context("缺少队列名称")?;
    let class = matches
        .get_one::<String>("class")
        .context("缺少任务类型")?;
    let args = parse_args(matches.get_one::<String>("args").map(String::as_str))?;

    app.enqueue(queue, class, args).await
}

async fn consume(app: Application) -> Result<()> {
    let shutdown_manager = ShutdownManager::new();
    let grace = app.config().publisher.shutdown_grace_period();

    let mut app_handle = {
        let app = Arc::new(app);
        let shutdown = shutdown_manager.clone();
        tokio::spawn(async move { app.consume(builtin_registry(), shutdown).await })
    };

    tokio::select! {
        result = &mut app_handle => {
            // 启动失败
            return result.context("消费任务异常退出")?;
        }
        _ = wait_for_shutdown_signal() => {}
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(grace + Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => info!("Cuniculus已优雅关闭"),
        Ok(Ok(Err(e))) => error!("关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("消费任务异常退出: {e}"),
        Err(_) => warn!("关闭超时，强制退出"),
    }
    Ok(())
}

/// 等待Ctrl+C或SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
