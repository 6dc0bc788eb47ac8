//! In-memory transport and ledger for tests
//!
//! `FakeHost` interprets the commands this crate issues (mkdir, rm, cat,
//! test -d, git, pm2, pkill, the registration launch) against a small model
//! of a node: files, directories, supervised jobs and whether the
//! registration tool is running. Everything is recorded so tests can assert
//! on ordering.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{CommandResult, RunOptions, Session, Transport};
use crate::error::{FleetError, Result};
use crate::inventory::Node;
use crate::ledger::{LedgerClient, LedgerError, RegistrationInfo};

#[derive(Default)]
struct FakeHost {
    reachable: bool,
    corrupt_uploads: bool,
    files: HashMap<String, String>,
    dirs: HashSet<String>,
    installed: bool,
    branch: Option<String>,
    jobs: HashMap<String, u32>,
    next_pid: u32,
    job_starts: usize,
    registration_running: bool,
    registration_launches: usize,
    /// Command fragments that fail once their remaining passes run out
    failing: Vec<(String, usize)>,
    panic_on: Option<String>,
    log: Vec<String>,
    opened: usize,
    closed: usize,
}

fn ok(stdout: impl Into<String>) -> CommandResult {
    CommandResult {
        exit_status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: impl Into<String>) -> CommandResult {
    CommandResult {
        exit_status: status,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Undo `shell_quote` on a path argument
fn unquote(arg: &str) -> String {
    arg.replace("'\\''", "\u{0}").replace('\'', "").replace('\u{0}', "'")
}

impl FakeHost {
    fn interpret(&mut self, cmd: &str) -> CommandResult {
        for (fragment, passes) in self.failing.iter_mut() {
            if cmd.contains(fragment.as_str()) {
                if *passes == 0 {
                    return fail(2, "forced failure");
                }
                *passes -= 1;
            }
        }

        if cmd == "true" {
            return ok("");
        }
        if let Some(path) = cmd.strip_prefix("mkdir -p ") {
            self.dirs.insert(unquote(path));
            return ok("");
        }
        if let Some(path) = cmd.strip_prefix("rm -rf ") {
            self.dirs.remove(&unquote(path));
            self.installed = false;
            self.branch = None;
            return ok("");
        }
        if let Some(path) = cmd.strip_prefix("rm -f ") {
            self.files.remove(&unquote(path));
            return ok("");
        }
        if let Some(path) = cmd.strip_prefix("cat ") {
            let path = unquote(path);
            return match self.files.get(&path) {
                Some(content) => ok(content.clone()),
                None => fail(1, format!("cat: {}: No such file or directory", path)),
            };
        }
        if let Some(path) = cmd.strip_prefix("test -d ") {
            return if self.dirs.contains(&unquote(path)) { ok("") } else { fail(1, "") };
        }
        if cmd.contains("git clone") {
            if let Some(dir) = cmd.split_whitespace().last() {
                self.dirs.insert(dir.to_string());
            }
            self.installed = true;
            self.branch = Some("master".into());
            return ok("");
        }
        if let Some(rest) = cmd.split("git checkout ").nth(1) {
            self.branch = rest.split_whitespace().last().map(str::to_string);
            return ok("");
        }
        if cmd.contains("git branch --show-current") {
            return match &self.branch {
                Some(branch) => ok(format!("{}\n", branch)),
                None => fail(128, "fatal: not a git repository"),
            };
        }
        if cmd.contains("import ") {
            return if self.installed { ok("") } else { fail(1, "ModuleNotFoundError") };
        }
        if let Some(name) = cmd.strip_prefix("pm2 pid ") {
            return ok(self
                .jobs
                .get(name)
                .map(|pid| format!("{}\n", pid))
                .unwrap_or_else(|| "\n".into()));
        }
        if let Some(name) = cmd.strip_prefix("pm2 delete ") {
            return match self.jobs.remove(name) {
                Some(_) => ok(format!("[PM2] [{}](0) ✓\n", name)),
                None => fail(1, format!("[PM2][ERROR] Process or Namespace {} not found", name)),
            };
        }
        if cmd.starts_with("pm2 start ") {
            let name = cmd
                .split("--name ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or_default()
                .to_string();
            if self.jobs.contains_key(&name) {
                return fail(1, "[PM2][ERROR] Script already launched");
            }
            self.next_pid += 1;
            self.jobs.insert(name, 1000 + self.next_pid);
            self.job_starts += 1;
            return ok("");
        }
        if cmd.starts_with("pkill -9 -f ") {
            return if std::mem::take(&mut self.registration_running) {
                ok("")
            } else {
                fail(1, "")
            };
        }
        if cmd.contains("--procs") {
            self.registration_running = true;
            self.registration_launches += 1;
            return ok("");
        }
        ok("")
    }
}

/// Handle to one fake node's state
#[derive(Clone)]
pub(crate) struct FakeHostHandle(Arc<Mutex<FakeHost>>);

impl FakeHostHandle {
    fn with<R>(&self, f: impl FnOnce(&mut FakeHost) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn unreachable(&self) -> &Self {
        self.with(|h| h.reachable = false);
        self
    }

    pub fn corrupt_uploads(&self, corrupt: bool) -> &Self {
        self.with(|h| h.corrupt_uploads = corrupt);
        self
    }

    pub fn installed(&self, dir: &str, branch: &str) -> &Self {
        self.with(|h| {
            h.dirs.insert(dir.to_string());
            h.installed = true;
            h.branch = Some(branch.to_string());
        });
        self
    }

    pub fn with_job(&self, name: &str) -> &Self {
        self.with(|h| {
            h.next_pid += 1;
            h.jobs.insert(name.to_string(), 1000 + h.next_pid);
        });
        self
    }

    pub fn with_file(&self, path: &str, content: &str) -> &Self {
        self.with(|h| h.files.insert(path.to_string(), content.to_string()));
        self
    }

    pub fn registration_running(&self, running: bool) -> &Self {
        self.with(|h| h.registration_running = running);
        self
    }

    pub fn fail_command(&self, fragment: &str) -> &Self {
        self.fail_after(fragment, 0)
    }

    /// Let `passes` matching commands through, then fail every later one
    pub fn fail_after(&self, fragment: &str, passes: usize) -> &Self {
        self.with(|h| h.failing.push((fragment.to_string(), passes)));
        self
    }

    pub fn panic_on(&self, fragment: &str) -> &Self {
        self.with(|h| h.panic_on = Some(fragment.to_string()));
        self
    }

    pub fn is_registration_running(&self) -> bool {
        self.with(|h| h.registration_running)
    }

    pub fn registration_launches(&self) -> usize {
        self.with(|h| h.registration_launches)
    }

    pub fn job_pid(&self, name: &str) -> Option<u32> {
        self.with(|h| h.jobs.get(name).copied())
    }

    pub fn job_starts(&self) -> usize {
        self.with(|h| h.job_starts)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with(|h| h.files.get(path).cloned())
    }

    pub fn branch(&self) -> Option<String> {
        self.with(|h| h.branch.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|h| h.log.clone())
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.with(|h| h.opened - h.closed)
    }
}

/// Transport over a set of fake hosts keyed by node name
#[derive(Clone, Default)]
pub(crate) struct FakeFleet {
    hosts: Arc<Mutex<HashMap<String, FakeHostHandle>>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, name: &str) -> FakeHostHandle {
        let handle = FakeHostHandle(Arc::new(Mutex::new(FakeHost {
            reachable: true,
            ..Default::default()
        })));
        self.hosts
            .lock()
            .unwrap()
            .insert(name.to_string(), handle.clone());
        handle
    }

    pub fn host(&self, name: &str) -> FakeHostHandle {
        self.hosts.lock().unwrap()[name].clone()
    }
}

struct FakeSession {
    node: Node,
    host: FakeHostHandle,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for FakeFleet {
    async fn open(&self, node: &Node) -> Result<Box<dyn Session>> {
        let host = self.hosts.lock().unwrap().get(&node.name).cloned();
        let host = match host {
            Some(host) if host.with(|h| h.reachable) => host,
            _ => {
                return Err(FleetError::Connectivity {
                    node: node.name.clone(),
                    reason: "connection refused".into(),
                })
            }
        };
        host.with(|h| h.opened += 1);
        Ok(Box::new(FakeSession {
            node: node.clone(),
            host,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Session for FakeSession {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandResult> {
        let panic_on = self.host.with(|h| {
            h.log.push(command.to_string());
            h.panic_on.clone()
        });
        if let Some(fragment) = panic_on {
            if command.contains(&fragment) {
                panic!("fake host panicked on `{}`", command);
            }
        }
        tokio::task::yield_now().await;
        let result = self.host.with(|h| h.interpret(command));
        result.checked(&self.node.name, command, opts)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let content = std::fs::read_to_string(local).map_err(|e| FleetError::Transfer {
            node: self.node.name.clone(),
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reason: e.to_string(),
        })?;
        self.host.with(|h| {
            h.log.push(format!("put {} {}", local.display(), remote));
            let content = if h.corrupt_uploads {
                r#"{"ss58Address": "5Corrupted"}"#.to_string()
            } else {
                content
            };
            h.files.insert(remote.to_string(), content);
        });
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.with(|h| h.closed += 1);
        }
    }
}

/// Ledger keyed by canonical address
#[derive(Default)]
pub(crate) struct FakeLedger {
    entries: Mutex<HashMap<String, RegistrationInfo>>,
    pending: Mutex<HashMap<String, (usize, RegistrationInfo)>>,
    failing: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str, info: RegistrationInfo) {
        self.entries.lock().unwrap().insert(address.to_string(), info);
    }

    /// Appear registered once `lookups` further lookups have happened
    pub fn register_after(&self, address: &str, lookups: usize, info: RegistrationInfo) {
        self.pending
            .lock()
            .unwrap()
            .insert(address.to_string(), (lookups, info));
    }

    pub fn fail_lookups(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn lookup(&self, address: &str) -> std::result::Result<Option<RegistrationInfo>, LedgerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(address) {
            return Err(LedgerError::Network("connection reset".into()));
        }

        let mut pending = self.pending.lock().unwrap();
        if let Some((remaining, info)) = pending.get_mut(address) {
            if *remaining == 0 {
                let info = info.clone();
                pending.remove(address);
                self.register(address, info);
            } else {
                *remaining -= 1;
            }
        }
        drop(pending);

        Ok(self.entries.lock().unwrap().get(address).cloned())
    }
}
