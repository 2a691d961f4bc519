//! Test doubles shared by the unit tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::exec::{CommandExecutor, ExecError, ExecOptions};

/// `ip addr show` from a host with a VLAN on eth0 and eth1 enslaved to bond0
pub const IP_ADDR_SAMPLE: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
    inet 127.0.0.1/8 scope host lo
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
    inet 192.168.1.10/24 brd 192.168.1.255 scope global dynamic eth0
3: eth1: <BROADCAST,MULTICAST,SLAVE,UP,LOWER_UP> mtu 1500 qdisc fq_codel master bond0 state UP group default qlen 1000
    link/ether 52:54:00:aa:bb:01 brd ff:ff:ff:ff:ff:ff
4: eth2: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN group default qlen 1000
    link/ether 52:54:00:aa:bb:02 brd ff:ff:ff:ff:ff:ff
5: bond0: <BROADCAST,MULTICAST,MASTER,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000
    link/ether 52:54:00:aa:bb:01 brd ff:ff:ff:ff:ff:ff
6: eth0.100@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000
    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
7: eth3: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN group default qlen 1000
    link/ether 52:54:00:aa:bb:03 brd ff:ff:ff:ff:ff:ff
";

/// `output` with the block of device `name` cut out
pub fn ip_addr_without(output: &str, name: &str) -> String {
    let mut skipping = false;
    let mut kept = String::new();
    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            skipping = line
                .split(": ")
                .nth(1)
                .map(|device| crate::network::normalize_name(device) == name)
                .unwrap_or(false);
        }
        if !skipping {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    kept
}

#[derive(Debug, Clone)]
pub enum Reply {
    Stdout(String),
    Failed { stdout: String, stderr: String },
    TimedOut,
}

impl Reply {
    pub fn stdout(text: &str) -> Self {
        Reply::Stdout(text.to_string())
    }

    pub fn failure(stderr: &str) -> Self {
        Reply::Failed {
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn failed_with_stdout(stdout: &str) -> Self {
        Reply::Failed {
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }
}

/// Replays canned output per command line.
///
/// Replies queued for the same command are returned in order; the last one
/// repeats. Commands nobody scripted succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    triggers: Mutex<HashMap<String, Vec<(String, Reply)>>>,
    effects: Mutex<HashMap<String, Box<dyn Fn() + Send + Sync>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, argv: &[&str], reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(argv.join(" "))
            .or_default()
            .push_back(reply);
    }

    /// Replace whatever is queued for `argv`
    pub fn set(&self, argv: &[&str], reply: Reply) {
        let mut replies = self.replies.lock().unwrap();
        replies.insert(argv.join(" "), VecDeque::from([reply]));
    }

    /// Once `trigger` runs, `target` answers with `reply` from then on.
    /// Stands in for the live state change a command causes.
    pub fn after(&self, trigger: &[&str], target: &[&str], reply: Reply) {
        self.triggers
            .lock()
            .unwrap()
            .entry(trigger.join(" "))
            .or_default()
            .push((target.join(" "), reply));
    }

    /// Run `effect` every time `argv` executes, e.g. another writer
    /// touching the netplan directory mid-commit
    pub fn effect(&self, argv: &[&str], effect: impl Fn() + Send + Sync + 'static) {
        self.effects
            .lock()
            .unwrap()
            .insert(argv.join(" "), Box::new(effect));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, argv: &[&str]) -> usize {
        let line = argv.join(" ");
        self.calls.lock().unwrap().iter().filter(|call| **call == line).count()
    }

    pub fn ran(&self, argv: &[&str]) -> bool {
        self.count(argv) > 0
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, argv: &[&str], _options: ExecOptions) -> Result<String, ExecError> {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&line) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        let fired = self.triggers.lock().unwrap().remove(&line);
        if let Some(fired) = fired {
            let mut replies = self.replies.lock().unwrap();
            for (target, reply) in fired {
                replies.insert(target, VecDeque::from([reply]));
            }
        }

        if let Some(effect) = self.effects.lock().unwrap().get(&line) {
            effect();
        }

        let program = argv.first().copied().unwrap_or_default().to_string();
        match reply {
            None => Ok(String::new()),
            Some(Reply::Stdout(stdout)) => Ok(stdout),
            Some(Reply::Failed { stdout, stderr }) => Err(ExecError::Failed {
                program,
                code: Some(1),
                stdout,
                stderr,
            }),
            Some(Reply::TimedOut) => Err(ExecError::TimedOut {
                program,
                after: std::time::Duration::from_secs(1),
            }),
        }
    }
}
