//! Run orchestration: the per-output state machine
//! Parse → Probe → ResolveExpressions → Rasterize → BuildGraph → Encode,
//! outputs rendered sequentially from fresh parses, and the cache reaper
//! once every output has succeeded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::{
    cache::reap_cache,
    encode::{build_encoder_args, ensure_parent_dir, is_encoder_on_path, preset_args, run_encoder,
        EncoderConfig, DEFAULT_PRESET},
    error::{ReelError, ReelResult},
    probe::MediaProber,
    project::load_project,
    rasterize::{rasterize_overlays, OverlayBrowser},
    timeline::{compile_resolved, resolve_timing},
};

/// Cooperative cancellation, checked at every state transition. External
/// cancellation terminates the in-flight subprocess and surfaces
/// [`ReelError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> ReelResult<()> {
        if self.is_cancelled() {
            Err(ReelError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderOptions {
    /// Output names to render; empty renders every output.
    pub outputs: Vec<String>,
    /// Fast low-quality encode for iteration.
    pub dev: bool,
    pub encoder: EncoderConfig,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            outputs: Vec::new(),
            dev: false,
            encoder: EncoderConfig::default(),
        }
    }
}

/// Everything one run needs, passed explicitly instead of living in
/// globals. Dropping the run drops the browser, which closes it.
pub struct RenderRun<'a> {
    pub prober: &'a dyn MediaProber,
    pub browser: &'a mut dyn OverlayBrowser,
    pub options: RenderOptions,
    pub cancel: CancelToken,
}

impl RenderRun<'_> {
    /// Render every requested output of the project at `project_dir`,
    /// reaping the overlay cache only after all of them succeed.
    pub fn render(
        &mut self,
        project_dir: &Path,
        on_progress: &mut dyn FnMut(&str),
    ) -> ReelResult<()> {
        let requested: Vec<String> = if self.options.outputs.is_empty() {
            let project = load_project(project_dir, self.prober)?;
            project.outputs.keys().cloned().collect()
        } else {
            self.options.outputs.clone()
        };
        if requested.is_empty() {
            return Err(ReelError::fragment_invalid(
                "project",
                "the project declares no outputs",
            ));
        }

        let mut touched = BTreeSet::new();
        for name in &requested {
            self.render_output(project_dir, name, &mut touched, on_progress)?;
        }

        let removed = reap_cache(project_dir, &touched);
        if removed > 0 {
            info!(removed, "reaped stale overlay cache entries");
        }
        Ok(())
    }

    /// One output, built from a fresh parse so no state leaks between
    /// outputs.
    fn render_output(
        &mut self,
        project_dir: &Path,
        output_name: &str,
        touched: &mut BTreeSet<String>,
        on_progress: &mut dyn FnMut(&str),
    ) -> ReelResult<PathBuf> {
        self.cancel.check()?;
        if !is_encoder_on_path(&self.options.encoder.binary) {
            return Err(ReelError::EncoderNotFound);
        }
        info!(output = output_name, "parsing and probing project");
        let project = load_project(project_dir, self.prober)?;
        let output = project.output(output_name)?.clone();

        self.cancel.check()?;
        info!(output = output_name, "resolving timing expressions");
        let sequences = resolve_timing(&project)?;

        self.cancel.check()?;
        info!(output = output_name, "rasterizing overlays");
        let pngs = rasterize_overlays(&project, &output, self.browser, touched)?;

        self.cancel.check()?;
        info!(output = output_name, "building filter graph");
        let compiled = compile_resolved(&project, &output, &sequences, &pngs)?;

        self.cancel.check()?;
        let preset_text = match &output.preset {
            Some(name) => project.presets.get(name).cloned().ok_or_else(|| {
                ReelError::fragment_invalid(
                    &output.name,
                    format!("unknown ffmpeg preset '{name}'"),
                )
            })?,
            None => DEFAULT_PRESET.to_string(),
        };
        let preset = preset_args(&preset_text, self.options.dev);

        let out_path = project.dir.join(&output.path);
        ensure_parent_dir(&out_path)?;
        let args = build_encoder_args(&compiled, &out_path, &preset, &self.options.encoder);

        info!(
            output = output_name,
            path = %out_path.display(),
            duration_ms = compiled.total_duration_ms,
            "encoding"
        );
        run_encoder(&self.options.encoder, &args, on_progress)?;

        info!(output = output_name, "done");
        Ok(out_path)
    }
}
