//! Offline replay of flow dumps through the addon pipeline.

use std::path::Path;

use tracing::info;

use crate::addon::permission::PermissionFailure;
use crate::addon::AddonManager;
use crate::error::Result;
use crate::flow::io::FlowReader;

/// Feed every flow in the dump at `path` through `addons`.
///
/// Each flow fires `request`, then `response` when it carries one. Stops at
/// the first unreadable line. Returns the number of flows replayed.
pub fn replay_file(path: &Path, addons: &AddonManager) -> Result<usize> {
    let mut count = 0;
    for flow in FlowReader::open(path)? {
        let flow = flow?;
        addons.request(&flow);
        if flow.response.is_some() {
            addons.response(&flow);
        }
        count += 1;
    }
    info!("Replayed {} flows from {}", count, path.display());
    Ok(count)
}

/// Permission failures found in the dump at `path`, in file order.
///
/// Every failing flow is listed, repeats included.
pub fn collect_failures(path: &Path) -> Result<Vec<PermissionFailure>> {
    let mut failures = Vec::new();
    for flow in FlowReader::open(path)? {
        if let Some(failure) = PermissionFailure::from_flow(&flow?) {
            failures.push(failure);
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::Addon;
    use crate::error::PermDumpError;
    use crate::flow::io::FlowWriter;
    use crate::flow::{fixtures, Flow};
    use crate::soap::fixtures::{permission_fault, OTHER_FAULT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        requests: AtomicUsize,
        responses: AtomicUsize,
    }

    impl Addon for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn request(&self, _flow: &Flow) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn response(&self, _flow: &Flow) -> Result<()> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn replays_requests_and_responses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.jsonl");
        let mut writer = FlowWriter::create(&path).unwrap();
        writer.add(&fixtures::flow(1, Some("a"), 500, "x")).unwrap();
        writer
            .add(&Flow::new(2, None, fixtures::request(None)))
            .unwrap();
        writer.add(&fixtures::flow(3, Some("b"), 200, "y")).unwrap();
        drop(writer);

        let counter = Arc::new(Counter::default());
        let mut addons = AddonManager::new();
        addons.add(counter.clone());

        assert_eq!(replay_file(&path, &addons).unwrap(), 3);
        assert_eq!(counter.requests.load(Ordering::SeqCst), 3);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn collects_failures_including_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.jsonl");
        let fault = permission_fault("vm-42", "VirtualMachine.Interact.PowerOn");
        let mut writer = FlowWriter::create(&path).unwrap();
        writer.add(&fixtures::flow(1, Some("govc"), 500, &fault)).unwrap();
        writer.add(&fixtures::flow(2, Some("govc"), 500, OTHER_FAULT)).unwrap();
        writer.add(&fixtures::flow(3, Some("govc"), 500, &fault)).unwrap();
        drop(writer);

        let failures = collect_failures(&path).unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], failures[1]);
        assert_eq!(failures[0].user_agent, "govc");
        assert_eq!(failures[0].object_name.as_deref(), Some("vm-42"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = replay_file(&dir.path().join("absent.jsonl"), &AddonManager::new());
        assert!(matches!(result, Err(PermDumpError::Io(_))));
    }

    #[test]
    fn corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.jsonl");
        let good = serde_json::to_string(&fixtures::flow(1, None, 500, "")).unwrap();
        std::fs::write(&path, format!("{}\n{{broken\n", good)).unwrap();
        let result = replay_file(&path, &AddonManager::new());
        assert!(matches!(result, Err(PermDumpError::FlowFormat { line: 2, .. })));
    }
}
