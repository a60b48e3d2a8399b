use super::*;
use crate::bus::LOGGER_CHANNEL;
use crate::protocol::Envelope;
use crate::request::STATUS_ERROR;
use std::fs;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSurface {
    events: Mutex<Vec<(String, Vec<ChannelMessage>)>>,
}

impl RecordingSurface {
    fn functions(&self, channel: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .flat_map(|(_, messages)| messages.iter().map(|m| m.function.clone()))
            .collect()
    }
}

impl UiSurface for RecordingSurface {
    fn notify(&self, channel: &str, messages: &[ChannelMessage]) {
        self.events
            .lock()
            .push((channel.to_string(), messages.to_vec()));
    }
}

fn test_config(dir: &TempDir) -> ShellConfig {
    let mut config = ShellConfig::with_home(dir.path());
    config.pipe_interval_ms = 5;
    config.request_timeout_ms = 5_000;
    config
}

fn write_script(config: &ShellConfig, name: &str, body: &str) {
    let dir = config.scripts_dir().join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("main.sh"), body).unwrap();
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(unix)]
#[test]
fn test_exec_script_routes_logs_and_progress() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_script(
        &config,
        "deploy",
        r#"echo '{"channel":"LOGGER_CHANNEL","messages":{"function":"log","argv":["cloning","repo-a"]}}'
echo '{"channel":"PROGRESS_CHANNEL","messages":[{"function":"update","argv":[55],"progressName":"deploy"}]}'
exit 0
"#,
    );
    let surface = Arc::new(RecordingSurface::default());
    let shell = ScriptShell::new(config, surface.clone());

    let response = shell
        .commands()
        .request(CMD_EXEC_SCRIPT, json!({ "scriptName": "deploy" }))
        .unwrap();
    assert!(response.is_ok(), "{:?}", response);
    assert_eq!(response.data, json!("script finish 0"));

    let log = shell.context().log();
    let log_file = log.log_file();
    assert!(log_file.starts_with(dir.path().join("logs/scripts/deploy")));
    let text = fs::read_to_string(&log_file).unwrap();
    assert!(text.trim_end().ends_with("cloning repo-a"), "{}", text);

    let state = shell.context().progress().state();
    assert_eq!(state.name, "deploy");
    assert_eq!(state.percent, 55.0);
    assert!(surface
        .functions(crate::bus::PROGRESS_CHANNEL)
        .contains(&"update".to_string()));
}

#[cfg(unix)]
#[test]
fn test_exec_script_while_running_reports_still_running() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_script(&config, "slow", "sleep 30\n");
    let shell = ScriptShell::new(config, Arc::new(LogSurface));

    let first = shell.exec_script("slow").unwrap();
    assert!(matches!(first, ExecOutcome::Started { .. }));

    let second = shell
        .commands()
        .request(CMD_EXEC_SCRIPT, json!({ "scriptName": "slow" }))
        .unwrap();
    assert_eq!(second.data, json!("slow still running"));

    shell.shutdown();
    if let ExecOutcome::Started { exit, .. } = first {
        assert_eq!(exit.recv_blocking().unwrap(), 0);
    }
}

#[cfg(unix)]
#[test]
fn test_concurrent_exec_script_spawns_once() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_script(&config, "slow", "echo $$ >> spawned.pid\nsleep 30\n");
    let marker = config.scripts_dir().join("slow").join("spawned.pid");
    let shell = ScriptShell::new(config, Arc::new(LogSurface));

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let racers: Vec<_> = (0..2)
        .map(|_| {
            let (shell, barrier) = (Arc::clone(&shell), Arc::clone(&barrier));
            std::thread::spawn(move || {
                barrier.wait();
                shell.exec_script("slow").unwrap()
            })
        })
        .collect();
    let outcomes: Vec<ExecOutcome> = racers.into_iter().map(|r| r.join().unwrap()).collect();

    let started = outcomes
        .iter()
        .filter(|o| matches!(o, ExecOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, ExecOutcome::StillRunning)));

    wait_until(|| marker.exists());
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 1);
    shell.shutdown();
}

#[cfg(unix)]
#[test]
fn test_terminate_script_completes_progress_and_stops() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_script(&config, "crawl", "sleep 30\n");
    let shell = ScriptShell::new(config, Arc::new(LogSurface));

    let ExecOutcome::Started { exit, .. } = shell.exec_script("crawl").unwrap() else {
        panic!("expected a fresh start");
    };

    let stopped = shell
        .commands()
        .request(CMD_TERMINATE_SCRIPT, json!({ "scriptName": "crawl" }))
        .unwrap();
    assert_eq!(stopped.data, json!("script stopped"));
    assert_eq!(exit.recv_blocking().unwrap(), 0);
    assert_eq!(shell.context().progress().state().percent, 100.0);

    let again = shell
        .commands()
        .request(CMD_TERMINATE_SCRIPT, json!({ "scriptName": "crawl" }))
        .unwrap();
    assert_eq!(again.data, json!("script already stopped"));
}

#[test]
fn test_terminate_unknown_script_is_error_response() {
    let dir = TempDir::new().unwrap();
    let shell = ScriptShell::new(test_config(&dir), Arc::new(LogSurface));

    let response = shell
        .commands()
        .request(CMD_TERMINATE_SCRIPT, json!({ "scriptName": "ghost" }))
        .unwrap();
    assert_eq!(response.status, STATUS_ERROR);
    assert!(response.message.contains("ghost"), "{}", response.message);
}

#[test]
fn test_exec_missing_script_is_error_response() {
    let dir = TempDir::new().unwrap();
    let shell = ScriptShell::new(test_config(&dir), Arc::new(LogSurface));

    let response = shell
        .commands()
        .request(CMD_EXEC_SCRIPT, json!({ "scriptName": "nope" }))
        .unwrap();
    assert_eq!(response.status, STATUS_ERROR);

    let missing_name = shell
        .commands()
        .request(CMD_EXEC_SCRIPT, json!({}))
        .unwrap();
    assert_eq!(missing_name.status, STATUS_ERROR);
}

#[test]
fn test_log_stream_pushes_backlog_to_surface() {
    let dir = TempDir::new().unwrap();
    let surface = Arc::new(RecordingSurface::default());
    let shell = ScriptShell::new(test_config(&dir), surface.clone());

    let log = shell.context().log();
    log.log(["first"]);
    log.log(["second"]);

    let started = shell.commands().request(CMD_START_LOG, Value::Null).unwrap();
    assert!(started.is_ok());
    wait_until(|| surface.functions(LOG_MESSAGE_EVENT).len() >= 2);

    let stopped = shell.commands().request(CMD_STOP_LOG, Value::Null).unwrap();
    assert!(stopped.is_ok());
    std::thread::sleep(Duration::from_millis(50));
    let delivered = surface.functions(LOG_MESSAGE_EVENT).len();
    log.log(["after close"]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(surface.functions(LOG_MESSAGE_EVENT).len(), delivered);

    let events = surface.events.lock();
    let first = &events
        .iter()
        .find(|(c, _)| c == LOG_MESSAGE_EVENT)
        .unwrap()
        .1[0];
    assert_eq!(first.argv[0]["type"], json!("log"));
    assert_eq!(first.argv[0]["messages"], json!(["first"]));
}

#[test]
fn test_command_failures_are_logged_to_err_file() {
    let dir = TempDir::new().unwrap();
    let shell = ScriptShell::new(test_config(&dir), Arc::new(LogSurface));

    let response = shell
        .commands()
        .request(CMD_TERMINATE_SCRIPT, json!({ "scriptName": "ghost" }))
        .unwrap();
    assert_eq!(response.status, STATUS_ERROR);

    let err_text = fs::read_to_string(shell.context().log().err_file()).unwrap();
    assert!(err_text.contains("terminate-script failed"), "{}", err_text);
}

#[test]
fn test_standalone_context_writes_directly() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let context = ScriptContext::new(Role::Parent, config, Arc::new(LogSurface));

    assert!(context.router().is_registered(LOGGER_CHANNEL));
    context.log().log(["standalone"]);
    let text = fs::read_to_string(context.log().log_file()).unwrap();
    assert!(text.contains("standalone"));

    context.store().set("prefs", &["theme"], json!("dark")).unwrap();
    assert_eq!(
        context.store().get("prefs", &["theme"]).unwrap(),
        Some(json!("dark"))
    );
    assert_eq!(context.bunch().limit(), crate::config::DEFAULT_BUNCH_LIMIT);
}

#[test]
fn test_child_context_forwards_without_registering() {
    let dir = TempDir::new().unwrap();
    let (tx, rx) = async_channel::unbounded::<Envelope>();
    let context = ScriptContext::new(Role::child(tx), test_config(&dir), Arc::new(LogSurface));

    assert!(context.router().registered_channels().is_empty());
    context.log().log(["from child"]);

    let envelope = rx.try_recv().unwrap();
    assert_eq!(envelope.channel, LOGGER_CHANNEL);
    let messages = envelope.messages.into_vec();
    assert_eq!(messages[0].function, "log");
    assert_eq!(messages[0].argv, vec![json!("from child")]);
}

#[test]
fn test_jsonl_surface_writes_one_line_per_event() {
    let out = Arc::new(Mutex::new(Vec::<u8>::new()));
    let surface = JsonlSurface::new(Arc::clone(&out));

    surface.notify(
        "PROGRESS_CHANNEL",
        &[ChannelMessage::new("update", vec![json!(40)]).with_progress_name("sync")],
    );
    surface.notify(LOG_MESSAGE_EVENT, &[ChannelMessage::call("ping")]);

    let text = String::from_utf8(out.lock().clone()).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event"], json!("PROGRESS_CHANNEL"));
    assert_eq!(lines[0]["messages"][0]["progressName"], json!("sync"));
    assert_eq!(lines[1]["messages"][0]["function"], json!("ping"));
}

#[test]
fn test_clean_logs_on_empty_home() {
    let dir = TempDir::new().unwrap();
    let shell = ScriptShell::new(test_config(&dir), Arc::new(LogSurface));
    assert_eq!(shell.clean_logs().unwrap(), 0);
}
