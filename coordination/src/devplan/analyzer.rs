//! The Devplan Analyzer (§4.2): turns a devplan markdown file into task rows
//! in the Coordination Store.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::devplan::markdown::parse_pending_tasks;
use crate::devplan::predictor::FileScopePredictor;
use crate::devplan::tree::build_tree_listing;
use crate::error::CoordResult;
use crate::store::{AddTaskOutcome, CoordinationStore};

pub struct DevplanAnalyzer {
    predictor: Arc<dyn FileScopePredictor>,
}

#[derive(Debug, Default)]
pub struct AnalyzeSummary {
    pub inserted: u32,
    pub skipped: u32,
}

impl DevplanAnalyzer {
    pub fn new(predictor: Arc<dyn FileScopePredictor>) -> Self {
        Self { predictor }
    }

    /// Parse `devplan_contents`, predict file scope for each pending task
    /// against `project_root`'s tree listing, and feed every task into the
    /// store via `add_task`. Tasks already present in `CompletedTask` are
    /// reported as skipped and not inserted.
    pub async fn analyze(
        &self,
        store: &mut CoordinationStore,
        run_id: &str,
        devplan_contents: &str,
        project_root: impl AsRef<Path>,
    ) -> CoordResult<AnalyzeSummary> {
        let parsed = parse_pending_tasks(devplan_contents);
        let tree = build_tree_listing(project_root);
        let mut summary = AnalyzeSummary::default();

        for task in parsed {
            let estimated_files = self.predictor.predict(&task.text, &tree).await;
            match store.add_task(
                run_id,
                &task.text,
                &estimated_files,
                Some(task.devplan_line),
                task.priority,
            )? {
                AddTaskOutcome::Inserted(id) => {
                    summary.inserted += 1;
                    info!(run_id, task_id = id, "devplan task added");
                }
                AddTaskOutcome::Skipped => {
                    summary.skipped += 1;
                    info!(run_id, task_text = %task.text, "devplan task skipped: already completed");
                }
            }
        }

        Ok(summary)
    }
}
