//! Media Ingest CLI
//!
//! Scans a media tree, extracts metadata, fingerprints files and stores
//! the catalog in SQLite.

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use media_ingest::{
    db, ExtractorConfig, IngestionCoordinator, LogLevel, PipelineConfig, PipelineError,
    PipelineState, ProgressReporter, ProgressSnapshot,
};

const ABOUT: &str = r#"
Media Ingest - 并发媒体导入流水线

使用示例:
  media_ingest ingest -r /path/to/media                 扫描并导入目录
  media_ingest ingest -r /photos -d catalog.db          指定数据库文件
  media_ingest ingest -r /photos --no-exiftool          不提取元数据
  media_ingest ingest -r /photos --clean                清空目录表后重新导入
  media_ingest schema -d catalog.db                     检查数据库表结构
"#;

/// Concurrent media ingestion pipeline
#[derive(Parser)]
#[command(name = "media_ingest")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 显示帮助信息
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help, global = true)]
    help: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描目录并导入媒体文件
    #[command(about = "扫描目录并导入媒体文件")]
    Ingest {
        /// 扫描的根目录
        #[arg(short = 'r', long, help = "扫描的根目录")]
        root: PathBuf,

        /// 数据库文件路径
        #[arg(short = 'd', long, default_value = "media_ingest.db", help = "SQLite数据库文件路径")]
        db: PathBuf,

        /// 工作线程数（0 = 自动检测）
        #[arg(short = 't', long, default_value = "0", help = "工作线程数，0表示自动检测")]
        workers: usize,

        /// 每批提交给工作线程的文件数
        #[arg(long, default_value = "8", help = "每批提交给工作线程的文件数")]
        read_batch: usize,

        /// 数据库批量写入大小
        #[arg(short = 'b', long, default_value = "200", help = "每次批量写入数据库的记录数")]
        write_batch: usize,

        /// 不调用 exiftool
        #[arg(long, help = "禁用元数据提取")]
        no_exiftool: bool,

        /// exiftool 可执行文件
        #[arg(long, default_value = "exiftool", help = "exiftool 可执行文件路径")]
        exiftool: PathBuf,

        /// exiftool 不可用时拒绝启动
        #[arg(long, help = "exiftool 不可用时直接失败")]
        require_exiftool: bool,

        /// 单个文件的提取超时（毫秒）
        #[arg(long, default_value = "10000", help = "单个文件的元数据提取超时（毫秒）")]
        timeout_ms: u64,

        /// 导入前清空目录表
        #[arg(long, help = "导入前删除已有的目录表")]
        clean: bool,

        /// 额外忽略的目录名
        #[arg(short = 'i', long = "ignore", value_name = "NAME", help = "额外忽略的目录名，可多次指定")]
        ignore: Vec<String>,

        /// 不输出进度信息
        #[arg(long, help = "不向 stderr 输出 JSON 进度")]
        no_progress: bool,

        /// 以 JSON 格式输出结果
        #[arg(long, help = "输出JSON格式的结果")]
        json: bool,
    },
    /// 检查数据库表结构
    #[command(about = "比较配置的字段与数据库中的实际列")]
    Schema {
        /// 数据库文件路径
        #[arg(short = 'd', long, default_value = "media_ingest.db", help = "SQLite数据库文件路径")]
        db: PathBuf,

        /// 以 JSON 格式输出结果
        #[arg(long, help = "输出JSON格式的结果")]
        json: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Ingest {
            root,
            db,
            workers,
            read_batch,
            write_batch,
            no_exiftool,
            exiftool,
            require_exiftool,
            timeout_ms,
            clean,
            ignore,
            no_progress,
            json,
        }) => {
            let mut builder = PipelineConfig::builder();
            for dir in ignore {
                builder = builder.add_ignore_dir(dir);
            }
            let built = builder
                .workers(workers)
                .read_batch_size(read_batch)
                .write_batch_size(write_batch)
                .extractor(ExtractorConfig {
                    enabled: !no_exiftool,
                    required: require_exiftool,
                    program: exiftool,
                    timeout_ms,
                })
                .db_path(db)
                .clean_start(clean)
                .build();

            let config = match built {
                Ok(config) => config,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::from(2);
                }
            };
            match ingest(config, &root, !no_progress, json) {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Some(Commands::Schema { db, json }) => {
            let config = match PipelineConfig::builder().db_path(db).build() {
                Ok(config) => config,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::from(2);
                }
            };
            match db::check_schema(&config) {
                Ok(report) if json => {
                    match serde_json::to_string_pretty(&report) {
                        Ok(text) => println!("{}", text),
                        Err(e) => error!("{}", e),
                    }
                    if report.matches() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Ok(report) => {
                    println!("Table: {}", report.table);
                    if !report.exists() {
                        println!("  (table does not exist yet)");
                        return ExitCode::SUCCESS;
                    }
                    println!("  Missing columns: {:?}", report.missing);
                    println!("  Extra columns: {:?}", report.extra);
                    if report.matches() {
                        println!("  Schema matches");
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        None => {
            println!("{}", ABOUT);
            println!("使用 'media_ingest ingest -h' 查看导入命令的详细帮助");
            println!("使用 'media_ingest --help' 查看完整帮助信息");
            ExitCode::SUCCESS
        }
    }
}

/// Scan and process `root`; returns false when the run hit a fatal error
fn ingest(
    config: PipelineConfig,
    root: &Path,
    progress: bool,
    json: bool,
) -> Result<bool, PipelineError> {
    let reporter = ProgressReporter::new(progress, config.progress_interval_ms);
    let mut coordinator = IngestionCoordinator::new(config)?;
    reporter.report_start(coordinator.config(), root);

    coordinator.start_scan(root)?;
    drive(&mut coordinator, &reporter, PipelineState::IdleScanDone);

    let Some(report) = coordinator.scan_report() else {
        return Ok(false);
    };
    for error in &report.errors {
        reporter.report_error(error);
    }
    info!(
        "Scan found {} media files ({} sidecars) in {} directories",
        report.media_files, report.sidecar_files, report.directories
    );

    if report.candidates.is_empty() {
        info!("Nothing to process");
    } else {
        coordinator.start_process()?;
        drive(&mut coordinator, &reporter, PipelineState::Idle);
    }

    let run = coordinator.last_run();
    let failed = match coordinator.progress() {
        ProgressSnapshot::Process(stats) => stats.files_failed,
        ProgressSnapshot::Scan(_) => 0,
    };
    reporter.report_done(&report, run.as_ref(), failed);

    if json {
        let summary = serde_json::json!({
            "scan": report,
            "progress": coordinator.progress(),
            "run": run,
            "error": coordinator.last_error(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("{}", e),
        }
    } else {
        println!("Ingest completed:");
        println!("  Total files: {}", report.total_files);
        println!("  Media files: {}", report.media_files);
        println!("  Sidecar files: {}", report.sidecar_files);
        println!("  Directories: {}", report.directories);
        if let Some(run) = &run {
            println!("  Records written: {}", run.writer.records_committed);
            println!("  Commits: {}", run.writer.commits);
        }
        println!("  Failed files: {}", failed);
        println!("  Scan errors: {}", report.error_count());
    }

    match coordinator.last_error() {
        Some(e) => {
            error!("Run failed: {}", e);
            Ok(false)
        }
        None => Ok(true),
    }
}

/// Tick until `target`, forwarding progress and warnings to the reporter
fn drive(coordinator: &mut IngestionCoordinator, reporter: &ProgressReporter, target: PipelineState) {
    let interval = Duration::from_millis(coordinator.config().progress_interval_ms);
    let mut cursor = coordinator.event_cursor();
    loop {
        let state = coordinator.tick();
        for event in coordinator.events_since(cursor) {
            if event.level >= LogLevel::Warning {
                reporter.report_event(&event);
            }
        }
        cursor = coordinator.event_cursor();
        reporter.report_progress(state, &coordinator.progress());
        if state == target || state == PipelineState::Idle {
            break;
        }
        std::thread::sleep(interval);
    }
}
