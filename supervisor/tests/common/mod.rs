#![allow(dead_code)]

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use supervisor::{LogSink, ServiceDefinition, ServiceStatus, Supervisor};

/// A service running `script` under `/bin/sh -c`.
pub fn sh(name: &str, script: &str) -> ServiceDefinition {
    ServiceDefinition::new(name, "/bin/sh").with_args(["-c", script])
}

pub fn supervisor(dir: &Path) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        Arc::new(LogSink::new(dir.join("logs"))),
        dir,
    ))
}

pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll until the service reaches `status`, or panic after `timeout`.
pub async fn wait_for_status(
    supervisor: &Supervisor,
    name: &str,
    status: ServiceStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = supervisor.state(name).unwrap().status;
        if current == status {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{} is {:?}, expected {:?}", name, current, status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Whether `pid` is a live (non-zombie) process.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Lines of a log tail without their timestamps.
pub fn messages(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.split_once("] ").map_or(line.as_str(), |(_, rest)| rest).to_owned())
        .collect()
}

/// Whether `python3` can be run. Tests that need a listener outside this process skip without it.
pub fn has_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// A process outside the supervisor listening on `port`, like one a previous
/// session left running. With `detached_pid_file`, the listening socket is also
/// held by a detached process outside the listener's tree, whose pid is written
/// to that file.
pub async fn outside_listener(
    port: u16,
    detached_pid_file: Option<&Path>,
) -> tokio::process::Child {
    let mut script = vec![
        "import os, socket, time".to_owned(),
        "s = socket.socket()".to_owned(),
        "s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)".to_owned(),
        format!("s.bind(('127.0.0.1', {}))", port),
        "s.listen()".to_owned(),
    ];
    if let Some(pid_file) = detached_pid_file {
        script.extend([
            "if os.fork() == 0:".to_owned(),
            "    os.setsid()".to_owned(),
            "    if os.fork() == 0:".to_owned(),
            format!("        open({:?}, 'w').write(str(os.getpid()))", pid_file.display().to_string()),
            "        time.sleep(300)".to_owned(),
            "    os._exit(0)".to_owned(),
        ]);
    }
    script.push("time.sleep(300)".to_owned());

    let child = tokio::process::Command::new("python3")
        .arg("-c")
        .arg(script.join("\n"))
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let detached_ready = detached_pid_file.map_or(true, |file| {
            std::fs::read_to_string(file).is_ok_and(|pid| !pid.is_empty())
        });
        if detached_ready && tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return child;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "outside listener never came up on port {}",
            port
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
