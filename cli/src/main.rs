use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use avdl_core::{
    CoreError, DownloadEngine, EngineConfig, JsonFileStorage, StaticCredentials, StoreEvent,
    TaskRequest, TaskStatus, WorkScheduler,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config = load_config();
    let scheduler = Arc::new(WorkScheduler::new(&config));
    let engine = match build_engine(config, &scheduler) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "failed to start engine");
            eprintln!("error: {}", err);
            return;
        }
    };

    let result = match args[1].as_str() {
        "add" => add(&engine, &scheduler, &args[2..]),
        "list" => list(&engine, args.get(2).map(String::as_str) == Some("--json")),
        "start" => with_id(&args, |id| engine.start(id)).and_then(|started| {
            if started {
                run_until_idle(&engine, &scheduler);
            }
            Ok(())
        }),
        "pause" => with_id(&args, |id| engine.pause(id)).map(|_| ()),
        "remove" => with_id(&args, |id| engine.remove(id)).map(|_| ()),
        "run" => engine.recover_interrupted().map(|scheduled| {
            if scheduled == 0 {
                println!("no pending tasks");
                return;
            }
            println!("resuming {} task(s)", scheduled);
            run_until_idle(&engine, &scheduler);
        }),
        _ => {
            print_usage();
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
    }
}

fn load_config() -> EngineConfig {
    let mut config = match env::var("AVDL_DOWNLOAD_DIR") {
        Ok(dir) => EngineConfig::with_base_dir(PathBuf::from(dir)),
        Err(_) => EngineConfig::default(),
    };
    if let Ok(path) = env::var("AVDL_TASKS_FILE") {
        config.tasks_file = PathBuf::from(path);
    }
    if let Some(count) = env::var("AVDL_SEGMENTS").ok().and_then(|v| v.parse::<u32>().ok()) {
        config.segment_count = count.max(1);
    }
    config
}

fn build_engine(config: EngineConfig, scheduler: &Arc<WorkScheduler>) -> Result<Arc<DownloadEngine>, CoreError> {
    let storage = JsonFileStorage::new(config.tasks_file.clone());
    let mut engine = DownloadEngine::new(config, Box::new(storage), scheduler.clone())?;
    if let Ok(cookie) = env::var("AVDL_COOKIE") {
        engine = engine.with_credentials(Arc::new(StaticCredentials::with_cookie(cookie)));
    }
    Ok(engine.bind_to(scheduler))
}

fn add(engine: &DownloadEngine, scheduler: &WorkScheduler, args: &[String]) -> Result<(), CoreError> {
    let (Some(content_id), Some(video_url), Some(audio_url)) = (args.first(), args.get(1), args.get(2)) else {
        print_usage();
        return Ok(());
    };
    let variant_id = parse_or(args.get(3), 0i64)?;
    let quality = parse_or(args.get(4), 0i32)?;
    let request = TaskRequest {
        content_id: content_id.clone(),
        variant_id,
        quality,
        title: args.get(5).cloned().unwrap_or_else(|| content_id.clone()),
        video_url: video_url.clone(),
        audio_url: audio_url.clone(),
        ..TaskRequest::default()
    };
    let id = engine.add_task(request)?;
    println!("added task: {}", id);
    run_until_idle(engine, scheduler);
    Ok(())
}

fn parse_or<T: std::str::FromStr>(value: Option<&String>, default: T) -> Result<T, CoreError> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::InvalidRequest(format!("not a number: {}", raw))),
        None => Ok(default),
    }
}

fn list(engine: &DownloadEngine, json: bool) -> Result<(), CoreError> {
    let mut tasks = engine.list_tasks()?;
    tasks.sort_by_key(|t| t.created_at);
    if json {
        let body = serde_json::to_string_pretty(&tasks)
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        println!("{}", body);
        return Ok(());
    }
    for task in tasks {
        println!(
            "{}\t{}\t{:.1}%\t{}\t{}",
            task.id,
            task.status,
            task.progress * 100.0,
            format_bytes(task.downloaded_bytes),
            task.file_path
                .or(task.error_message)
                .unwrap_or_else(|| task.title.clone()),
        );
    }
    Ok(())
}

/// Runs `f` on the id argument. Returns whether the command applied.
fn with_id<F>(args: &[String], f: F) -> Result<bool, CoreError>
where
    F: FnOnce(&str) -> Result<(), CoreError>,
{
    match args.get(2) {
        Some(id) => f(id).map(|_| true),
        None => {
            print_usage();
            Ok(false)
        }
    }
}

fn run_until_idle(engine: &DownloadEngine, scheduler: &WorkScheduler) {
    let (handle, stop) = spawn_progress(engine);
    if scheduler.wait_idle(RUN_TIMEOUT) {
        info!("queue drained");
    } else {
        error!("queue still busy at timeout");
    }
    stop.store(true, Ordering::SeqCst);
    let _ = handle.join();
}

fn spawn_progress(engine: &DownloadEngine) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    let events = engine.subscribe();
    let handle = thread::spawn(move || {
        let mut last: HashMap<String, (TaskStatus, Instant)> = HashMap::new();
        while !stop_clone.load(Ordering::SeqCst) {
            let task = match events.recv_timeout(Duration::from_millis(200)) {
                Ok(StoreEvent::Updated(task)) => task,
                Ok(StoreEvent::Removed(id)) => {
                    println!("[removed] {}", id);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let now = Instant::now();
            let changed = last.get(&task.id).map(|(status, _)| *status != task.status).unwrap_or(true);
            let due = last
                .get(&task.id)
                .map(|(_, at)| now.duration_since(*at) >= Duration::from_secs(1))
                .unwrap_or(true);
            if !changed && !due {
                continue;
            }
            last.insert(task.id.clone(), (task.status, now));
            match task.status {
                TaskStatus::Downloading => println!(
                    "[{}] {} {:.1}% (video {:.0}% audio {:.0}%) {}",
                    task.status,
                    task.id,
                    task.progress * 100.0,
                    task.video_progress * 100.0,
                    task.audio_progress * 100.0,
                    format_bytes(task.downloaded_bytes),
                ),
                TaskStatus::Completed => println!(
                    "[{}] {} {} -> {}",
                    task.status,
                    task.id,
                    format_bytes(task.file_size),
                    task.file_path.unwrap_or_default(),
                ),
                TaskStatus::Failed => println!(
                    "[{}] {} {}",
                    task.status,
                    task.id,
                    task.error_message.unwrap_or_default(),
                ),
                _ => println!("[{}] {}", task.status, task.id),
            }
        }
    });
    (handle, stop)
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn print_usage() {
    eprintln!(
        "Usage: avdl <command> [args]\n\
Commands:\n\
  add <content_id> <video_url> <audio_url> [variant] [quality] [title]\n\
                       Add a task and download it\n\
  list [--json]        List tasks\n\
  start <id>           Schedule a paused, failed or pending task and wait\n\
  pause <id>           Pause a downloading task\n\
  remove <id>          Remove a task and its files\n\
  run                  Resume interrupted and pending tasks until idle\n\
Environment:\n\
  AVDL_DOWNLOAD_DIR    Base directory for output and temp files\n\
  AVDL_TASKS_FILE      Task list JSON file\n\
  AVDL_SEGMENTS        Parallel segments per stream\n\
  AVDL_COOKIE          Cookie header sent with every request\n\
  RUST_LOG             Log filter (default info)"
    );
}
