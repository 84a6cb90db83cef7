//! Process name and role resolution.
//!
//! A multi-process app names its secondary processes with a qualifier suffix
//! (`com.example.app:sync`); the main process carries the bare name. The name
//! is looked up once per process and memoized. Lookup failure is not an error:
//! the identity is simply unresolved and never counts as the main process.

use std::env;

use once_cell::sync::OnceCell;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Overrides the process-table lookup (hosts that name their processes
/// themselves, and tests spawning several "processes" of one app).
pub const PROCESS_NAME_ENV: &str = "APPFOCUS_PROCESS_NAME";

const PROCESS_QUALIFIER: char = ':';

static CURRENT: OnceCell<ProcessIdentity> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    name: Option<String>,
    pid: u32,
}

impl ProcessIdentity {
    /// Identity of the running process, resolved on first use.
    pub fn current() -> &'static ProcessIdentity {
        CURRENT.get_or_init(|| Self::resolve(lookup_process_name))
    }

    pub fn resolve(lookup: impl FnOnce(u32) -> Option<String>) -> Self {
        let pid = std::process::id();
        let name = lookup(pid)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if name.is_none() {
            tracing::warn!(pid, "Could not resolve process name; treating as secondary");
        }
        Self { name, pid }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::resolve(|_| Some(name.into()))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name listeners receive; empty when unresolved.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_main_process(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| !name.contains(PROCESS_QUALIFIER))
    }
}

fn lookup_process_name(pid: u32) -> Option<String> {
    if let Ok(name) = env::var(PROCESS_NAME_ENV) {
        if !name.trim().is_empty() {
            return Some(name);
        }
    }

    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_main_process() {
        let identity = ProcessIdentity::named("com.example.app");
        assert!(identity.is_main_process());
        assert_eq!(identity.name(), Some("com.example.app"));
        assert_eq!(identity.pid(), std::process::id());
    }

    #[test]
    fn qualified_name_is_secondary() {
        let identity = ProcessIdentity::named("com.example.app:sync");
        assert!(!identity.is_main_process());
        assert_eq!(identity.display_name(), "com.example.app:sync");
    }

    #[test]
    fn unresolved_identity_is_not_main() {
        let identity = ProcessIdentity::resolve(|_| None);
        assert_eq!(identity.name(), None);
        assert_eq!(identity.display_name(), "");
        assert!(!identity.is_main_process());
    }

    #[test]
    fn blank_name_counts_as_unresolved() {
        let identity = ProcessIdentity::resolve(|_| Some("   ".to_string()));
        assert_eq!(identity.name(), None);
        assert!(!identity.is_main_process());
    }

    #[test]
    fn lookup_receives_own_pid() {
        let identity = ProcessIdentity::resolve(|pid| Some(format!("proc-{pid}")));
        assert_eq!(
            identity.name(),
            Some(format!("proc-{}", std::process::id()).as_str())
        );
    }

    #[test]
    fn current_is_memoized() {
        let first = ProcessIdentity::current();
        let second = ProcessIdentity::current();
        assert!(std::ptr::eq(first, second));
    }
}
