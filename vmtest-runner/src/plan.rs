//! JSON test plans and their execution.
//!
//! ```json
//! { "steps": [ { "machine": "server", "action": "wait_for_unit", "unit": "nginx" },
//!              { "machine": "client", "action": "succeed", "command": "curl -f http://server/" } ] }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmtest_driver::{GuestExt, Machine};

use crate::error::RunnerError;
use crate::registry::MachineRegistry;

/// An ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    pub steps: Vec<Step>,
}

/// One action on one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub machine: String,
    #[serde(flatten)]
    pub action: Action,
}

/// What a step does. Serialized with an `action` tag, e.g.
/// `{"action": "wait_for_open_port", "port": 80}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Start,
    Connect,
    /// Run a command and log its status and output without judging them.
    Execute { command: String },
    Succeed { command: String },
    Fail { command: String },
    WaitUntilSucceeds { command: String },
    WaitUntilFails { command: String },
    WaitForUnit { unit: String },
    StartUnit { unit: String },
    StopUnit { unit: String },
    WaitForFile { path: String },
    WaitForOpenPort { port: u16 },
    WaitForClosedPort { port: u16 },
    WaitForX,
    WaitForWindow { pattern: String },
    Block { iface: String },
    Unblock { iface: String },
    CopyFileFromHost { source: PathBuf, dest: String },
    Shutdown,
    Crash,
}

impl Action {
    /// The `action` tag of this variant.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Connect => "connect",
            Self::Execute { .. } => "execute",
            Self::Succeed { .. } => "succeed",
            Self::Fail { .. } => "fail",
            Self::WaitUntilSucceeds { .. } => "wait_until_succeeds",
            Self::WaitUntilFails { .. } => "wait_until_fails",
            Self::WaitForUnit { .. } => "wait_for_unit",
            Self::StartUnit { .. } => "start_unit",
            Self::StopUnit { .. } => "stop_unit",
            Self::WaitForFile { .. } => "wait_for_file",
            Self::WaitForOpenPort { .. } => "wait_for_open_port",
            Self::WaitForClosedPort { .. } => "wait_for_closed_port",
            Self::WaitForX => "wait_for_x",
            Self::WaitForWindow { .. } => "wait_for_window",
            Self::Block { .. } => "block",
            Self::Unblock { .. } => "unblock",
            Self::CopyFileFromHost { .. } => "copy_file_from_host",
            Self::Shutdown => "shutdown",
            Self::Crash => "crash",
        }
    }
}

impl TestPlan {
    /// Parse a plan from JSON text.
    ///
    /// # Errors
    /// Returns [`RunnerError::Json`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self, RunnerError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a plan file.
    ///
    /// # Errors
    /// Returns [`RunnerError::Io`] if the file cannot be read and
    /// [`RunnerError::Json`] if it does not parse.
    pub async fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }

    /// Check that every step refers to a registered machine.
    ///
    /// # Errors
    /// Returns [`RunnerError::Plan`] for the first step naming an unknown
    /// machine.
    pub fn validate(&self, registry: &MachineRegistry) -> Result<(), RunnerError> {
        for (index, step) in self.steps.iter().enumerate() {
            if registry.get(&step.machine).is_err() {
                return Err(RunnerError::Plan {
                    reason: format!("step {index} ({}) uses unknown machine {}", step.action.name(), step.machine),
                });
            }
        }
        Ok(())
    }
}

/// Run `plan` step by step. Stops at the first failing step.
///
/// # Errors
/// Returns [`RunnerError::Plan`] if the plan references unknown machines
/// (checked before anything runs) and the error of the first failing step
/// otherwise.
pub async fn execute_plan(registry: &MachineRegistry, plan: &TestPlan) -> Result<(), RunnerError> {
    plan.validate(registry)?;

    for (index, step) in plan.steps.iter().enumerate() {
        let machine = registry.get(&step.machine)?;
        tracing::info!(step = index, machine = %step.machine, action = step.action.name(), "running step");
        if let Err(e) = run_action(machine, &step.action).await {
            tracing::error!(step = index, machine = %step.machine, error = %e, "step failed");
            return Err(e);
        }
    }

    tracing::info!(steps = plan.steps.len(), "test plan passed");
    Ok(())
}

async fn run_action(machine: &Machine, action: &Action) -> Result<(), RunnerError> {
    match action {
        Action::Start => machine.start().await?,
        Action::Connect => machine.connect().await?,
        Action::Execute { command } => {
            let out = machine.execute(command).await?;
            tracing::info!(machine = %machine.name(), status = out.status, output = %out.output, "command returned");
        }
        Action::Succeed { command } => {
            let output = machine.succeed(&[command.as_str()]).await?;
            tracing::debug!(machine = %machine.name(), %output, "command succeeded");
        }
        Action::Fail { command } => machine.fail(command).await?,
        Action::WaitUntilSucceeds { command } => {
            machine.wait_until_succeeds(command).await?;
        }
        Action::WaitUntilFails { command } => {
            machine.wait_until_fails(command).await?;
        }
        Action::WaitForUnit { unit } => machine.wait_for_unit(unit).await?,
        Action::StartUnit { unit } => machine.start_unit(unit).await?,
        Action::StopUnit { unit } => machine.stop_unit(unit).await?,
        Action::WaitForFile { path } => machine.wait_for_file(path).await?,
        Action::WaitForOpenPort { port } => machine.wait_for_open_port(*port).await?,
        Action::WaitForClosedPort { port } => machine.wait_for_closed_port(*port).await?,
        Action::WaitForX => machine.wait_for_x().await?,
        Action::WaitForWindow { pattern } => machine.wait_for_window(pattern).await?,
        Action::Block { iface } => machine.block(iface).await?,
        Action::Unblock { iface } => machine.unblock(iface).await?,
        Action::CopyFileFromHost { source, dest } => machine.copy_file_from_host(source, dest).await?,
        Action::Shutdown => machine.shutdown().await?,
        Action::Crash => machine.crash().await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vmtest_driver::{DriverError, MachineConfig, MachineName, RetryPolicy};

    use super::*;

    const PLAN: &str = r#"{
        "steps": [
            { "machine": "server", "action": "start" },
            { "machine": "server", "action": "wait_for_open_port", "port": 80 },
            { "machine": "client", "action": "succeed", "command": "curl -f http://server/" },
            { "machine": "client", "action": "copy_file_from_host", "source": "/etc/hosts", "dest": "/etc/hosts" },
            { "machine": "server", "action": "crash" }
        ]
    }"#;

    fn registry_with(dir: &Path, machines: &[(&str, &str)]) -> MachineRegistry {
        let mut registry = MachineRegistry::new();
        for (name, start) in machines {
            let name = MachineName::new(*name).expect("name");
            let config = MachineConfig::in_run_dir(name, dir)
                .with_start_command(*start)
                .with_retry(RetryPolicy::new(3, Duration::from_millis(10)));
            registry.insert(Machine::new(config)).expect("insert");
        }
        registry
    }

    #[test]
    fn parses_tagged_steps() {
        let plan = TestPlan::from_json(PLAN).expect("parse");
        assert_eq!(plan.steps.len(), 5);
        assert_eq!(plan.steps[0].action, Action::Start);
        assert_eq!(plan.steps[1].action, Action::WaitForOpenPort { port: 80 });
        assert_eq!(
            plan.steps[2],
            Step {
                machine: "client".to_owned(),
                action: Action::Succeed { command: "curl -f http://server/".to_owned() },
            }
        );
        assert_eq!(
            plan.steps[3].action,
            Action::CopyFileFromHost { source: PathBuf::from("/etc/hosts"), dest: "/etc/hosts".to_owned() }
        );
    }

    #[test]
    fn serialized_tag_matches_action_name() {
        let plan = TestPlan::from_json(PLAN).expect("parse");
        for step in &plan.steps {
            let value = serde_json::to_value(step).expect("serialize");
            assert_eq!(value["action"], step.action.name());
        }
    }

    #[test]
    fn rejects_unknown_action_and_missing_fields() {
        assert!(matches!(
            TestPlan::from_json(r#"{"steps":[{"machine":"a","action":"reboot"}]}"#),
            Err(RunnerError::Json(_))
        ));
        assert!(matches!(
            TestPlan::from_json(r#"{"steps":[{"machine":"a","action":"succeed"}]}"#),
            Err(RunnerError::Json(_))
        ));
        assert!(matches!(
            TestPlan::from_json(r#"{"steps":[{"machine":"a","action":"wait_for_open_port","port":70000}]}"#),
            Err(RunnerError::Json(_))
        ));
    }

    #[tokio::test]
    async fn unknown_machine_is_rejected_before_anything_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_with(dir.path(), &[("server", "sleep 30")]);
        let plan = TestPlan::from_json(PLAN).expect("parse");

        let err = execute_plan(&registry, &plan).await.expect_err("client is unknown");
        assert!(matches!(err, RunnerError::Plan { .. }), "got {err:?}");
        assert!(!registry.get("server").expect("server").is_booted().await);
    }

    #[tokio::test]
    async fn lifecycle_steps_drive_the_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_with(dir.path(), &[("server", "sleep 30")]);
        let server = registry.get("server").expect("server");

        let plan = TestPlan::from_json(r#"{"steps":[{"machine":"server","action":"start"}]}"#).expect("parse");
        execute_plan(&registry, &plan).await.expect("start");
        assert!(server.is_booted().await);

        let plan = TestPlan::from_json(r#"{"steps":[{"machine":"server","action":"crash"}]}"#).expect("parse");
        execute_plan(&registry, &plan).await.expect("crash");
        assert!(!server.is_booted().await);
    }

    #[tokio::test]
    async fn first_failing_step_aborts_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_with(dir.path(), &[("a", "exit 1"), ("b", "sleep 30")]);
        let plan = TestPlan::from_json(
            r#"{"steps":[
                {"machine":"a","action":"connect"},
                {"machine":"b","action":"start"}
            ]}"#,
        )
        .expect("parse");

        let err = execute_plan(&registry, &plan).await.expect_err("a never answers");
        assert!(matches!(err, RunnerError::Driver(DriverError::Timeout { .. })), "got {err:?}");
        assert!(!registry.get("b").expect("b").is_booted().await, "steps after a failure must not run");

        registry.shutdown_all().await.ok();
    }
}
