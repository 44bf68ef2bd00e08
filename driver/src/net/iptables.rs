use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Output;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, VirtError};

/// NAT prerouting chain owned by this driver.
pub const PREROUTING_CHAIN: &str = "NOMAD_VT_PRT";
/// Filter forwarding chain owned by this driver.
pub const FORWARD_CHAIN: &str = "NOMAD_VT_FW";

/// One iptables rule, recorded exactly as its argv so teardown can replay it
/// with `-D`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl Rule {
    fn argv(&self, action: &str) -> Vec<String> {
        let mut argv = vec![
            "-t".to_string(),
            self.table.clone(),
            action.to_string(),
            self.chain.clone(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Prerouting DNAT rule steering `host_ip:host_port` to `vm_ip:container_port`.
pub fn dnat_rule(
    host_ip: IpAddr,
    host_iface: &str,
    host_port: u16,
    vm_ip: IpAddr,
    container_port: u16,
) -> Rule {
    Rule {
        table: "nat".to_string(),
        chain: PREROUTING_CHAIN.to_string(),
        args: vec![
            "-d".to_string(),
            host_ip.to_string(),
            "-i".to_string(),
            host_iface.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{vm_ip}:{container_port}"),
        ],
    }
}

/// Forward rule accepting new connections towards the VM's service port.
pub fn forward_rule(vm_ip: IpAddr, container_port: u16) -> Rule {
    Rule {
        table: "filter".to_string(),
        chain: FORWARD_CHAIN.to_string(),
        args: vec![
            "-d".to_string(),
            vm_ip.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "state".to_string(),
            "--state".to_string(),
            "NEW".to_string(),
            "-m".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            container_port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
    }
}

/// Executes iptables invocations. Split out so rule bookkeeping is testable
/// without touching the host.
#[async_trait::async_trait]
pub trait RuleRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> std::io::Result<Output>;
}

struct HostRuleRunner {
    iptables: PathBuf,
}

#[async_trait::async_trait]
impl RuleRunner for HostRuleRunner {
    async fn run(&self, args: &[String]) -> std::io::Result<Output> {
        Command::new(&self.iptables).args(args).output().await
    }
}

pub struct Iptables {
    runner: Box<dyn RuleRunner>,
}

impl Iptables {
    pub fn new() -> Result<Self> {
        let iptables = which::which("iptables")
            .map_err(|e| VirtError::Validation(vec![format!("iptables not found: {e}")]))?;
        Ok(Self {
            runner: Box::new(HostRuleRunner { iptables }),
        })
    }

    pub fn with_runner(runner: Box<dyn RuleRunner>) -> Self {
        Self { runner }
    }

    /// Create the driver's chains and their jump rules.
    ///
    /// Chain creation reports exit status 1 when the chain already exists,
    /// which is treated as success; jump rules are checked with `-C` before
    /// being inserted at position 1. Safe to call any number of times.
    pub async fn ensure_chains(&self) -> Result<()> {
        for (table, chain, builtin) in [
            ("nat", PREROUTING_CHAIN, "PREROUTING"),
            ("filter", FORWARD_CHAIN, "FORWARD"),
        ] {
            let create = to_args(&["-t", table, "-N", chain]);
            let output = self.runner.run(&create).await?;
            if !output.status.success() && output.status.code() != Some(1) {
                return Err(VirtError::from_output(format!("iptables -N {chain}"), &output));
            }

            let check = to_args(&["-t", table, "-C", builtin, "-j", chain]);
            let exists = self.runner.run(&check).await?.status.success();
            if !exists {
                let insert = to_args(&["-t", table, "-I", builtin, "1", "-j", chain]);
                let output = self.runner.run(&insert).await?;
                if !output.status.success() {
                    return Err(VirtError::from_output(
                        format!("iptables -I {builtin} -j {chain}"),
                        &output,
                    ));
                }
            }
        }
        tracing::debug!("iptables chains {PREROUTING_CHAIN} and {FORWARD_CHAIN} in place");
        Ok(())
    }

    pub async fn append(&self, rule: &Rule) -> Result<()> {
        let output = self.runner.run(&rule.argv("-A")).await?;
        if !output.status.success() {
            return Err(VirtError::from_output(
                format!("iptables -A {}", rule.chain),
                &output,
            ));
        }
        Ok(())
    }

    /// Delete a rule if it is present; an absent rule is not an error, so
    /// teardown can be retried freely.
    pub async fn delete_if_exists(&self, rule: &Rule) -> Result<()> {
        let present = self.runner.run(&rule.argv("-C")).await?.status.success();
        if !present {
            return Ok(());
        }
        let output = self.runner.run(&rule.argv("-D")).await?;
        if !output.status.success() {
            return Err(VirtError::from_output(
                format!("iptables -D {}", rule.chain),
                &output,
            ));
        }
        Ok(())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    /// Scripted runner: records every invocation and answers with the exit
    /// code configured for the invocation's action (argv position 2).
    pub(crate) struct FakeRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub exit_codes: Mutex<HashMap<String, Vec<i32>>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exit_codes: Mutex::new(HashMap::new()),
            }
        }

        pub fn script(&self, action: &str, codes: Vec<i32>) {
            self.exit_codes
                .lock()
                .unwrap()
                .insert(action.to_string(), codes);
        }

        fn output(code: i32) -> Output {
            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl RuleRunner for FakeRunner {
        async fn run(&self, args: &[String]) -> std::io::Result<Output> {
            self.calls.lock().unwrap().push(args.to_vec());
            let action = args.get(2).cloned().unwrap_or_default();
            let code = self
                .exit_codes
                .lock()
                .unwrap()
                .get_mut(&action)
                .and_then(|codes| {
                    if codes.len() > 1 {
                        Some(codes.remove(0))
                    } else {
                        codes.first().copied()
                    }
                })
                .unwrap_or(0);
            Ok(Self::output(code))
        }
    }

    fn host_ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn vm_ip() -> IpAddr {
        "192.168.122.50".parse().unwrap()
    }

    #[test]
    fn dnat_rule_matches_expected_argv() {
        let rule = dnat_rule(host_ip(), "eth0", 8080, vm_ip(), 8000);
        assert_eq!(rule.table, "nat");
        assert_eq!(rule.chain, PREROUTING_CHAIN);
        assert_eq!(
            rule.args.join(" "),
            "-d 10.0.0.1 -i eth0 -p tcp -m tcp --dport 8080 -j DNAT \
             --to-destination 192.168.122.50:8000"
        );
    }

    #[test]
    fn forward_rule_matches_expected_argv() {
        let rule = forward_rule(vm_ip(), 8000);
        assert_eq!(rule.table, "filter");
        assert_eq!(rule.chain, FORWARD_CHAIN);
        assert_eq!(
            rule.args.join(" "),
            "-d 192.168.122.50 -p tcp -m state --state NEW -m tcp --dport 8000 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn ensure_chains_is_idempotent() {
        let runner = FakeRunner::new();
        // First pass: chains are new, jump checks miss so jumps are inserted.
        runner.script("-C", vec![1, 1, 0, 0]);
        let iptables = Iptables::with_runner(Box::new(runner));

        iptables.ensure_chains().await.unwrap();
        // Second pass: -N reports "already exists" via exit status 1 and the
        // jump checks now succeed.
        iptables.ensure_chains().await.unwrap();
    }

    #[tokio::test]
    async fn second_chain_creation_tolerates_exit_one() {
        let runner = FakeRunner::new();
        runner.script("-N", vec![1]);
        runner.script("-C", vec![0]);
        let iptables = Iptables::with_runner(Box::new(runner));
        iptables.ensure_chains().await.unwrap();
    }

    #[tokio::test]
    async fn chain_creation_fails_on_other_exit_codes() {
        let runner = FakeRunner::new();
        runner.script("-N", vec![2]);
        let iptables = Iptables::with_runner(Box::new(runner));
        assert!(iptables.ensure_chains().await.is_err());
    }

    #[tokio::test]
    async fn delete_if_exists_skips_absent_rules() {
        let runner = FakeRunner::new();
        runner.script("-C", vec![1]);
        let iptables = Iptables::with_runner(Box::new(runner));

        iptables
            .delete_if_exists(&forward_rule(vm_ip(), 8000))
            .await
            .unwrap();
    }

    /// Runner sharing its recording state, so tests can inspect calls after
    /// handing ownership to `Iptables`.
    pub(crate) struct SharedRunner(pub std::sync::Arc<FakeRunner>);

    #[async_trait::async_trait]
    impl RuleRunner for SharedRunner {
        async fn run(&self, args: &[String]) -> std::io::Result<Output> {
            self.0.run(args).await
        }
    }

    #[tokio::test]
    async fn jump_rules_are_inserted_at_position_one() {
        let fake = std::sync::Arc::new(FakeRunner::new());
        fake.script("-C", vec![1]);
        let iptables = Iptables::with_runner(Box::new(SharedRunner(fake.clone())));
        iptables.ensure_chains().await.unwrap();

        let calls = fake.calls.lock().unwrap();
        let inserts: Vec<_> = calls
            .iter()
            .filter(|argv| argv.get(2).map(String::as_str) == Some("-I"))
            .collect();
        assert_eq!(inserts.len(), 2);
        assert_eq!(
            inserts[0].join(" "),
            format!("-t nat -I PREROUTING 1 -j {PREROUTING_CHAIN}")
        );
        assert_eq!(
            inserts[1].join(" "),
            format!("-t filter -I FORWARD 1 -j {FORWARD_CHAIN}")
        );
    }
}
