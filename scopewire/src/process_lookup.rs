//! Process and thread names of the current process.
//!
//! Names set explicitly with [`name_thread`] take precedence over the kernel's
//! `comm` values read from `/proc/self/task/*/comm`.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::domain::Tid;

fn explicit_names() -> &'static Mutex<BTreeMap<Tid, String>> {
    static NAMES: OnceLock<Mutex<BTreeMap<Tid, String>>> = OnceLock::new();
    NAMES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Record a human name for `tid`.
pub fn name_thread(tid: Tid, name: impl Into<String>) {
    explicit_names().lock().unwrap_or_else(PoisonError::into_inner).insert(tid, name.into());
}

/// Name of the current process from `/proc/self/comm`, falling back to the
/// executable name.
pub fn process_name() -> String {
    if let Ok(comm) = fs::read_to_string("/proc/self/comm") {
        let comm = comm.trim();
        if !comm.is_empty() {
            return comm.to_string();
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// All live threads with their `comm`, overlaid with explicit names.
/// Explicitly named threads that already exited are kept.
pub fn thread_names() -> BTreeMap<Tid, String> {
    let mut names = list_task_comms("/proc/self/task");
    let explicit = explicit_names().lock().unwrap_or_else(PoisonError::into_inner);
    for (tid, name) in explicit.iter() {
        names.insert(*tid, name.clone());
    }
    names
}

/// Read `<task_dir>/*/comm`; unreadable entries are skipped.
fn list_task_comms(task_dir: &str) -> BTreeMap<Tid, String> {
    let Ok(entries) = fs::read_dir(task_dir) else {
        return BTreeMap::new();
    };
    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
            let comm = fs::read_to_string(entry.path().join("comm")).ok()?;
            Some((Tid(tid), comm.trim().to_string()))
        })
        .collect()
}
