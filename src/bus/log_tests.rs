use super::*;
use crate::channel::Role;
use crate::protocol::Envelope;
use serde_json::json;
use std::time::Instant;
use tempfile::TempDir;

const TICK: Duration = Duration::from_millis(5);
const WAIT: Duration = Duration::from_secs(5);

fn parent_bus(dir: &TempDir) -> LogBus {
    let logger = FileLogger::new(dir.path().join("logs"), dir.path().join("err"));
    let bus = LogBus::with_logger(Arc::new(ChannelRouter::parent()), logger, TICK);
    bus.init(Some("git-sync"), Some("run.log"));
    bus
}

fn collector() -> (Arc<Mutex<Vec<LogMessage>>>, impl FnMut(LogMessage) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |msg| sink.lock().push(msg))
}

fn wait_for_len(seen: &Arc<Mutex<Vec<LogMessage>>>, len: usize) {
    let deadline = Instant::now() + WAIT;
    while seen.lock().len() < len {
        assert!(Instant::now() < deadline, "pipe delivered {} of {}", seen.lock().len(), len);
        thread::sleep(TICK);
    }
}

fn texts(seen: &Arc<Mutex<Vec<LogMessage>>>) -> Vec<String> {
    seen.lock().iter().map(LogMessage::text).collect()
}

#[test]
fn test_parent_writes_each_call_once_in_order() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);

    for i in 0..5 {
        bus.log(vec![json!("step"), json!(i)]);
    }

    assert_eq!(bus.cached().len(), 5);
    let content = fs::read_to_string(bus.log_file()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 5);
    for (i, line) in lines.iter().enumerate() {
        assert!(line.ends_with(&format!(" - step {}", i)), "bad line {:?}", line);
    }
    assert_eq!(
        bus.log_file(),
        dir.path().join("logs").join("git-sync").join("run.log")
    );
}

#[test]
fn test_err_goes_to_err_root_under_same_name() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);

    bus.log(["fine"]);
    bus.err(["broken", "repo-a"]);

    assert_eq!(bus.err_file(), dir.path().join("err").join("run.log"));
    let err = fs::read_to_string(bus.err_file()).unwrap();
    assert!(err.ends_with(" - broken repo-a\n"));
    let cached = bus.cached();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[1].kind, LogKind::Err);
}

#[test]
fn test_init_clears_cache_and_rotates_file() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["before"]);

    bus.init(Some("scan"), None);

    assert!(bus.cached().is_empty());
    let file = bus.log_file();
    assert_eq!(file.parent().unwrap(), dir.path().join("logs").join("scan"));
    let name = file.file_name().unwrap().to_str().unwrap();
    // YYYY-MM-DD_hhmmss.log
    assert_eq!(name.len(), "2025-06-03_161640.log".len());
    assert!(file_name_date(name).is_some());
}

#[test]
fn test_line_format() {
    let at = chrono::Utc.with_ymd_and_hms(2025, 6, 3, 16, 16, 40).unwrap();
    assert_eq!(
        format_line(&at, &[json!("clone"), json!(3), json!({"ok": true})]),
        "2025-06-03 16:16:40 - clone 3 {\"ok\":true}\n"
    );
    assert_eq!(default_file_name(&at), "2025-06-03_161640.log");
}

#[test]
fn test_pipe_replays_backlog() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    for i in 0..4 {
        bus.log([format!("line {}", i)]);
    }

    let (seen, consumer) = collector();
    bus.pipe(consumer).open();

    wait_for_len(&seen, 4);
    assert_eq!(texts(&seen), vec!["line 0", "line 1", "line 2", "line 3"]);
    bus.close();
}

#[test]
fn test_chained_consumer_sees_fresh_snapshot() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["a"]);
    bus.log(["b"]);

    let (first, first_consumer) = collector();
    let (second, second_consumer) = collector();
    bus.pipe(first_consumer).pipe(second_consumer).open();

    wait_for_len(&first, 2);
    bus.log(["late"]);

    wait_for_len(&second, 3);
    assert_eq!(texts(&first)[..2], ["a", "b"]);
    assert_eq!(texts(&second), vec!["a", "b", "late"]);
    bus.close();
}

#[test]
fn test_live_tail_reaches_active_consumer() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    let (seen, consumer) = collector();
    bus.pipe(consumer).open();
    assert!(bus.is_streaming());

    bus.log(["tail 1"]);
    bus.err(["tail 2"]);

    wait_for_len(&seen, 2);
    assert_eq!(texts(&seen), vec!["tail 1", "tail 2"]);
    bus.close();
}

#[test]
fn test_close_stops_delivery() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["first"]);
    let (seen, consumer) = collector();
    bus.pipe(consumer).open();
    wait_for_len(&seen, 1);

    bus.close();
    thread::sleep(TICK * 10);
    bus.log(["while closed"]);
    thread::sleep(TICK * 10);
    assert_eq!(seen.lock().len(), 1);

    // Reopening resumes from where the queue stopped
    bus.open();
    wait_for_len(&seen, 2);
    assert_eq!(texts(&seen)[1], "while closed");
    bus.close();
}

#[test]
fn test_child_forwards_and_never_touches_disk() {
    let dir = TempDir::new().unwrap();
    let (tx, rx) = async_channel::unbounded::<Envelope>();
    let child_logger = FileLogger::new(dir.path().join("child-logs"), dir.path().join("child-err"));
    let child = LogBus::with_logger(Arc::new(ChannelRouter::new(Role::child(tx))), child_logger, TICK);

    let parent = parent_bus(&dir);
    parent.register_channel();
    let parent_router = Arc::clone(&parent.router);

    child.init(Some("child-script"), Some("child.log"));
    child.log(["from", "child"]);
    child.err([json!("oops"), json!(42)]);
    child.pipe(|_| {});

    let envelopes: Vec<Envelope> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(envelopes.len(), 3);
    assert!(envelopes.iter().all(|e| e.channel == LOGGER_CHANNEL));
    assert!(child.cached().is_empty());
    assert!(!dir.path().join("child-logs").exists());

    for envelope in envelopes {
        parent_router.dispatch_envelope(envelope);
    }

    let log_file = dir.path().join("logs").join("child-script").join("child.log");
    assert_eq!(parent.log_file(), log_file);
    let content = fs::read_to_string(&log_file).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.ends_with(" - from child\n"));
    let err = fs::read_to_string(dir.path().join("err").join("child.log")).unwrap();
    assert!(err.ends_with(" - oops 42\n"));
    assert_eq!(parent.cached().len(), 2);
}

#[test]
fn test_clear_log_truncates_file() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["something"]);
    bus.clear_log();
    assert!(bus.log_file().exists());
    assert_eq!(fs::read_to_string(bus.log_file()).unwrap(), "");
}

#[test]
fn test_clear_all_by_kind() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["l"]);
    bus.err(["e"]);
    let logger = FileLogger::new(dir.path().join("logs"), dir.path().join("err"));

    assert_eq!(logger.clear_all(Some(LogKind::Err)).unwrap(), 1);
    assert!(!bus.err_file().exists());
    assert!(bus.log_file().exists());
    assert_eq!(logger.clear_all(None).unwrap(), 1);
    assert!(!bus.log_file().exists());
}

#[test]
fn test_clear_expired_uses_name_date() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs").join("main");
    let errs = dir.path().join("err");
    fs::create_dir_all(&logs).unwrap();
    fs::create_dir_all(&errs).unwrap();
    fs::write(logs.join("2025-01-01_101010.log"), "old").unwrap();
    fs::write(errs.join("2025-01-02.log"), "old").unwrap();
    fs::write(logs.join("2025-03-01_090000.log"), "recent").unwrap();
    fs::write(logs.join("notes.log"), "undated").unwrap();

    let logger = FileLogger::new(dir.path().join("logs"), &errs);
    let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
    assert_eq!(logger.clear_expired(31, today).unwrap(), 2);

    assert!(!logs.join("2025-01-01_101010.log").exists());
    assert!(!errs.join("2025-01-02.log").exists());
    assert!(logs.join("2025-03-01_090000.log").exists());
    assert!(logs.join("notes.log").exists());
}

#[test]
fn test_backlog_drains_to_zero() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    for i in 0..4 {
        bus.log([format!("line {}", i)]);
    }
    assert_eq!(bus.backlog(), 0);

    let (seen, consumer) = collector();
    bus.pipe(consumer);
    assert_eq!(bus.backlog(), 4);

    bus.open();
    wait_for_len(&seen, 4);
    let deadline = Instant::now() + WAIT;
    while bus.backlog() > 0 {
        assert!(Instant::now() < deadline, "backlog never drained");
        thread::sleep(TICK);
    }
    bus.close();
}

#[test]
fn test_panicking_consumer_keeps_pump_alive() {
    let dir = TempDir::new().unwrap();
    let bus = parent_bus(&dir);
    bus.log(["boom"]);
    bus.log(["ok"]);

    let first = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&first);
    bus.pipe(move |msg: LogMessage| {
        if msg.text() == "boom" {
            panic!("consumer cannot handle this record");
        }
        sink.lock().push(msg);
    })
    .open();
    wait_for_len(&first, 1);

    bus.close();
    let (second, consumer) = collector();
    bus.pipe(consumer).open();
    bus.log(["after"]);

    wait_for_len(&first, 2);
    wait_for_len(&second, 3);
    assert_eq!(texts(&first), vec!["ok", "after"]);
    assert_eq!(texts(&second), vec!["boom", "ok", "after"]);
    bus.close();
}

#[test]
fn test_concurrent_calls_keep_file_and_cache_in_same_order() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(parent_bus(&dir));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..50 {
                    bus.log([format!("w{}-{}", worker, i)]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let content = fs::read_to_string(bus.log_file()).unwrap();
    let from_file: Vec<String> = content
        .lines()
        .map(|line| line.split(" - ").nth(1).unwrap().to_string())
        .collect();
    let from_cache: Vec<String> = bus.cached().iter().map(LogMessage::text).collect();
    assert_eq!(from_file.len(), 200);
    assert_eq!(from_file, from_cache);
}
