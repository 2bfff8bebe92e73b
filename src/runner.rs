use crate::catalog::ApiCatalog;
use crate::config::{Config, EvalMode};
use crate::error::ValidationError;
use crate::evaluation::{self, Evaluator};
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::models::Conversation;
use crate::predictor::Predict;
use crate::simulator::ReplaySimulator;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

/// Main runner that drives every conversation file through the selected phases
pub struct Runner<P> {
    config: Config,
    catalog: ApiCatalog,
    predictor: P,
    modes: Vec<EvalMode>,
    reset: bool,
}

impl<P: Predict> Runner<P> {
    /// Create a new runner with the given configuration
    pub fn new(config: Config, catalog: ApiCatalog, predictor: P, modes: Vec<EvalMode>, reset: bool) -> Self {
        Self {
            config,
            catalog,
            predictor,
            modes,
            reset,
        }
    }

    /// Process the whole dataset and return the summed metrics.
    ///
    /// Per-file failures are logged and the file is skipped; a validation
    /// failure aborts the run.
    pub async fn run(&mut self) -> Result<Metrics> {
        let files = self.dataset_files()?;
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create directory: {}", self.config.output_dir.display())
        })?;

        let mut total = Metrics::default();
        let total_files = files.len();

        for (file_index, path) in files.iter().enumerate() {
            self.log_file_processing(file_index + 1, total_files, path);

            match self.process_file(path).await {
                Ok(Some(metrics)) => total += metrics,
                Ok(None) => {}
                Err(err) if err.is::<ValidationError>() => {
                    return Err(err.context(format!("Validation failed for {}", path.display())));
                }
                Err(err) => error!("Skipping {}: {:#}", path.display(), err),
            }
        }

        info!(
            "Finished {} files, {} conversations scored",
            total_files, total.num_conversations
        );
        Ok(total)
    }

    fn runs(&self, mode: EvalMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Conversation files in the dataset, sorted by path
    fn dataset_files(&self) -> Result<Vec<PathBuf>> {
        let dataset = &self.config.dataset;
        if dataset.is_file() {
            return Ok(vec![dataset.clone()]);
        }

        let entries = std::fs::read_dir(dataset)
            .with_context(|| format!("Failed to read dataset directory: {}", dataset.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to list dataset directory: {}", dataset.display()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Run the selected phases on one file; `Some` once the conversation is scored
    async fn process_file(&mut self, path: &Path) -> Result<Option<Metrics>> {
        let file_name = path
            .file_name()
            .with_context(|| format!("Not a file path: {}", path.display()))?;
        let output_path = self.config.output_dir.join(file_name);

        let resumed = output_path.exists() && !self.reset;
        let mut conversation = if resumed {
            let saved = load_conversation(&output_path)?;
            if let Some(mut metrics) = saved.metrics {
                info!("Already evaluated, reusing {}", output_path.display());
                if self.runs(EvalMode::Validate) {
                    evaluation::validate(&saved)?;
                }
                // A stored file is one conversation even if its count was dropped
                metrics.num_conversations = metrics.num_conversations.max(1);
                return Ok(Some(metrics));
            }
            debug!("Resuming from {}", output_path.display());
            saved
        } else {
            load_conversation(path)?
        };

        let mut changed = false;
        if self.runs(EvalMode::Predict) && !(resumed && conversation.is_predicted()) {
            self.predict_conversation(&mut conversation).await?;
            changed = true;
        }

        let mut metrics = None;
        if self.runs(EvalMode::Evaluate) {
            metrics = Some(Evaluator::new(&self.catalog).evaluate_predictions(&mut conversation)?);
            changed = true;

            // Only a conversation scored in this run is checked
            if self.runs(EvalMode::Validate) {
                evaluation::validate(&conversation)?;
            }
        }

        if changed {
            self.store_conversation(&conversation, &output_path)?;
        }
        Ok(metrics)
    }

    async fn predict_conversation(&mut self, conversation: &mut Conversation) -> Result<()> {
        let visible = self.catalog.visible_apis(self.config.api_mode, conversation)?;
        debug!("Exposing {} APIs", visible.len());
        self.predictor.expose_apis(&visible);

        let simulator = ReplaySimulator::new(&self.catalog, conversation);
        let mut executor = Executor::new(simulator, self.config.max_chained_calls);
        executor
            .run_conversation(conversation, &mut self.predictor)
            .await
            .context("Failed to predict conversation")
    }

    /// Write-then-rename so a crash never leaves a partial file behind
    fn store_conversation(&self, conversation: &Conversation, path: &Path) -> Result<()> {
        let json_content =
            serde_json::to_string_pretty(conversation).context("Failed to serialize conversation to JSON")?;

        let mut temp_file = NamedTempFile::new_in(&self.config.output_dir).with_context(|| {
            format!("Failed to create temp file in: {}", self.config.output_dir.display())
        })?;
        temp_file
            .write_all(json_content.as_bytes())
            .context("Failed to write conversation")?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to write conversation to: {}", path.display()))?;

        debug!("Conversation stored to: {}", path.display());
        Ok(())
    }

    fn log_file_processing(&self, file_num: usize, total_files: usize, path: &Path) {
        info!("Processing file {}/{}: {}", file_num, total_files, path.display());
    }
}

fn load_conversation(path: &Path) -> Result<Conversation> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read conversation: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse conversation: {}", path.display()))
}
