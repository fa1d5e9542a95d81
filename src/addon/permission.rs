//! Capture of vSphere permission failures.
//!
//! [`PermissionRecorder`] watches responses for `NoPermissionFault` and writes
//! each distinct failure to the flow dump (`vs_dump_flows`) and the CSV flat
//! file (`vs_dump_csv`). Unless `vs_duplicates` is set, a failure with the
//! same user agent, object and privilege as an earlier one is skipped.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, error, info};

use super::Addon;
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::flow::io::FlowWriter;
use crate::flow::Flow;
use crate::logging::csv::CsvWriter;
use crate::soap;

/// One recorded permission failure. Equality covers every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PermissionFailure {
    pub user_agent: String,
    pub object_type: Option<String>,
    pub object_name: Option<String>,
    pub privilege_missing: Option<String>,
}

impl PermissionFailure {
    /// Build a record from a flow, if its response is a permission fault.
    pub fn from_flow(flow: &Flow) -> Option<Self> {
        let response = flow.response.as_ref()?;
        let body = response.decoded_content();
        if !soap::is_permission_fault(response.status_code, &body) {
            return None;
        }
        let fault = soap::extract_permission_fault(&body)?;
        Some(Self {
            user_agent: flow
                .request
                .headers
                .get("user-agent")
                .unwrap_or_default()
                .to_string(),
            object_type: fault.object_type,
            object_name: fault.object_name,
            privilege_missing: fault.privilege_id,
        })
    }
}

/// Counters reported when capture ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSummary {
    /// Failures written to the outputs.
    pub recorded: usize,
    /// Repeated failures skipped.
    pub duplicates_skipped: usize,
    /// Recorded failures per missing privilege.
    pub by_privilege: BTreeMap<String, usize>,
}

type Output = Box<dyn Write + Send>;

#[derive(Default)]
struct RecorderState {
    flow_writer: Option<FlowWriter<Output>>,
    csv_writer: Option<CsvWriter<Output>>,
    seen: HashSet<PermissionFailure>,
    summary: CaptureSummary,
}

/// Addon that records permission failures.
pub struct PermissionRecorder {
    config: CaptureConfig,
    state: Mutex<RecorderState>,
}

impl PermissionRecorder {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn summary(&self) -> CaptureSummary {
        self.lock().summary.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn with_outputs(
        config: CaptureConfig,
        flow_writer: Option<FlowWriter<Output>>,
        csv_writer: Option<CsvWriter<Output>>,
    ) -> Self {
        let recorder = Self::new(config);
        {
            let mut state = recorder.lock();
            state.flow_writer = flow_writer;
            state.csv_writer = csv_writer;
        }
        recorder
    }

    fn open_outputs(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(path) = self.config.dump_flows_path() {
            let writer = FlowWriter::create(path)
                .inspect_err(|e| error!("Cannot open flow dump {}: {}", path.display(), e))?;
            state.flow_writer = Some(writer);
            info!("Writing permission failure flows to {}", path.display());
        }
        if let Some(path) = self.config.dump_csv_path() {
            let writer = CsvWriter::create(path)
                .inspect_err(|e| error!("Cannot open CSV file {}: {}", path.display(), e))?;
            state.csv_writer = Some(writer);
            info!("Writing permission failure rows to {}", path.display());
        }
        Ok(())
    }
}

impl Addon for PermissionRecorder {
    fn name(&self) -> &str {
        "permission-recorder"
    }

    fn running(&self) -> Result<()> {
        self.open_outputs()?;
        debug!(
            "Permission recorder running (duplicates: {})",
            self.config.duplicates
        );
        Ok(())
    }

    fn response(&self, flow: &Flow) -> Result<()> {
        let Some(failure) = PermissionFailure::from_flow(flow) else {
            return Ok(());
        };

        // Check, write and remember under one lock so concurrent
        // connections cannot record the same failure twice.
        let mut state = self.lock();
        if !self.config.duplicates && state.seen.contains(&failure) {
            state.summary.duplicates_skipped += 1;
            debug!(
                "Skipping duplicate failure: {} missing {}",
                failure.user_agent,
                failure.privilege_missing.as_deref().unwrap_or("?")
            );
            return Ok(());
        }

        // A failure counts as recorded once any output accepted it, so the
        // outputs never receive it twice.
        let mut accepted = state.flow_writer.is_none() && state.csv_writer.is_none();
        let mut first_error = None;
        if let Some(writer) = state.flow_writer.as_mut() {
            match writer.add(flow) {
                Ok(()) => accepted = true,
                Err(e) => {
                    error!("Cannot write flow {} to the flow dump: {}", flow.id, e);
                    first_error = Some(e);
                }
            }
        }
        if let Some(writer) = state.csv_writer.as_mut() {
            match writer.write_failure(&failure) {
                Ok(()) => accepted = true,
                Err(e) => {
                    error!("Cannot write flow {} to the CSV file: {}", flow.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if !accepted {
            return first_error.map_or(Ok(()), Err);
        }

        info!(
            "Permission failure: {:?} missing {} on {} {}",
            failure.user_agent,
            failure.privilege_missing.as_deref().unwrap_or("?"),
            failure.object_type.as_deref().unwrap_or("?"),
            failure.object_name.as_deref().unwrap_or("?"),
        );

        state.summary.recorded += 1;
        let privilege = failure.privilege_missing.clone().unwrap_or_default();
        *state.summary.by_privilege.entry(privilege).or_insert(0) += 1;
        state.seen.insert(failure);
        first_error.map_or(Ok(()), Err)
    }

    fn done(&self) -> Result<()> {
        let mut state = self.lock();
        // Dropping the writers closes the files; rows are already flushed
        state.flow_writer = None;
        state.csv_writer = None;

        let summary = &state.summary;
        info!(
            "Captured {} permission failure(s), skipped {} duplicate(s)",
            summary.recorded, summary.duplicates_skipped
        );
        for (privilege, count) in &summary.by_privilege {
            info!("  {:<50} {}", privilege, count);
        }
        Ok(())
    }
}
