//! The machines of one test run, keyed by name in start-script order.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use vmtest_driver::{Machine, MachineConfig};

use crate::error::RunnerError;

/// Insertion-ordered set of machines. Names are unique.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: IndexMap<String, Machine>,
}

impl MachineRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one machine per start script, all scratch directories under
    /// `run_dir`.
    ///
    /// # Errors
    /// Returns [`RunnerError::Driver`] if a script path yields no valid
    /// config and [`RunnerError::DuplicateMachine`] if two scripts share a
    /// machine name.
    pub fn from_start_scripts(scripts: &[PathBuf], run_dir: &Path) -> Result<Self, RunnerError> {
        let mut registry = Self::new();
        for script in scripts {
            let config = MachineConfig::from_start_script(script, run_dir)?;
            registry.insert(Machine::new(config))?;
        }
        Ok(registry)
    }

    /// Register `machine`.
    ///
    /// # Errors
    /// Returns [`RunnerError::DuplicateMachine`] if the name is taken.
    pub fn insert(&mut self, machine: Machine) -> Result<(), RunnerError> {
        let name = machine.name().to_string();
        if self.machines.contains_key(&name) {
            return Err(RunnerError::DuplicateMachine(name));
        }
        tracing::debug!(machine = %name, state_dir = %machine.state_dir().display(), "registered machine");
        self.machines.insert(name, machine);
        Ok(())
    }

    /// Look up a machine by name.
    ///
    /// # Errors
    /// Returns [`RunnerError::UnknownMachine`] if no machine has that name.
    pub fn get(&self, name: &str) -> Result<&Machine, RunnerError> {
        self.machines
            .get(name)
            .ok_or_else(|| RunnerError::UnknownMachine(name.to_owned()))
    }

    /// Machine names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Boot every machine and wait until each accepts commands.
    ///
    /// # Errors
    /// Returns the first connect error; later machines are not started.
    pub async fn connect_all(&self) -> Result<(), RunnerError> {
        for machine in self.machines.values() {
            machine.connect().await?;
        }
        Ok(())
    }

    /// Shut down every booted machine, pulling the plug on those whose
    /// shutdown fails. All machines are visited even after an error.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn shutdown_all(&self) -> Result<(), RunnerError> {
        let mut first_error = None;
        for (name, machine) in &self.machines {
            if !machine.is_booted().await {
                continue;
            }
            if let Err(e) = machine.shutdown().await {
                tracing::warn!(machine = %name, error = %e, "shutdown failed, killing VM");
                if let Err(crash) = machine.crash().await {
                    tracing::error!(machine = %name, error = %crash, "failed to kill VM");
                }
                first_error.get_or_insert(RunnerError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/nix/store/x/bin/{n}"))).collect()
    }

    #[test]
    fn registry_keeps_script_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            MachineRegistry::from_start_scripts(&scripts(&["run-server-vm", "run-client-vm"]), dir.path())
                .expect("registry");
        assert_eq!(registry.names().collect::<Vec<_>>(), ["server", "client"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("client").expect("client").state_dir(),
            dir.path().join("client")
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = MachineRegistry::from_start_scripts(
            &scripts(&["run-server-vm", "../other/run-server-vm"]),
            dir.path(),
        )
        .expect_err("duplicate must fail");
        assert!(matches!(err, RunnerError::DuplicateMachine(name) if name == "server"));
    }

    #[test]
    fn unknown_machine_lookup_fails() {
        let registry = MachineRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(registry.get("ghost"), Err(RunnerError::UnknownMachine(n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn shutdown_all_skips_machines_that_never_booted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = MachineRegistry::from_start_scripts(&scripts(&["run-a-vm", "run-b-vm"]), dir.path())
            .expect("registry");
        registry.shutdown_all().await.expect("nothing to shut down");
    }
}
