//! Builds the encoder argument vector from a compiled output and runs the
//! encoder, streaming its stderr back to the caller line by line.

use std::collections::VecDeque;
use std::io::{BufRead as _, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context as _;
use tracing::debug;

use crate::{
    error::{ReelError, ReelResult},
    graph::fmt_secs,
    timeline::CompiledOutput,
};

/// Default encoder settings; a project `ffmpeg` preset replaces these.
pub const DEFAULT_PRESET: &str = "-pix_fmt yuv420p -preset medium -c:a aac -b:a 192k";

/// How many trailing stderr lines an encoder failure carries.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub binary: PathBuf,
    pub loglevel: String,
    pub dev: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            binary: PathBuf::from("ffmpeg"),
            loglevel: "error".to_string(),
            dev: false,
        }
    }
}

pub fn is_encoder_on_path(binary: &Path) -> bool {
    Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Split a preset string into argv tokens; dev mode forces
/// `-preset ultrafast` for quick iteration.
pub fn preset_args(preset: &str, dev: bool) -> Vec<String> {
    let mut args: Vec<String> = preset.split_whitespace().map(str::to_string).collect();
    if dev {
        match args.iter().position(|a| a == "-preset") {
            Some(i) if i + 1 < args.len() => args[i + 1] = "ultrafast".to_string(),
            _ => {
                args.push("-preset".to_string());
                args.push("ultrafast".to_string());
            }
        }
    }
    args
}

/// The full encoder argument vector: global flags, inputs in stable index
/// order (stills looped for their longest use), the filter graph, stream
/// maps, preset args, and the output path.
pub fn build_encoder_args(
    compiled: &CompiledOutput,
    out_path: &Path,
    preset: &[String],
    config: &EncoderConfig,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        config.loglevel.clone(),
        "-stats".to_string(),
    ];

    for input in &compiled.inputs {
        if let Some(still_ms) = input.still_duration_ms {
            args.push("-loop".to_string());
            args.push("1".to_string());
            args.push("-t".to_string());
            args.push(fmt_secs(still_ms));
        }
        args.push("-i".to_string());
        args.push(input.path.to_string_lossy().into_owned());
    }

    args.push("-filter_complex".to_string());
    args.push(compiled.filter_graph.clone());
    args.push("-map".to_string());
    args.push("[outv]".to_string());
    args.push("-map".to_string());
    args.push("[outa]".to_string());
    args.extend(preset.iter().cloned());
    args.push(out_path.to_string_lossy().into_owned());
    args
}

pub fn ensure_parent_dir(path: &Path) -> ReelResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Spawn the encoder and stream its stderr through `on_stderr` (progress is
/// opaque passthrough). A nonzero exit surfaces the stderr tail.
pub fn run_encoder(
    config: &EncoderConfig,
    args: &[String],
    on_stderr: &mut dyn FnMut(&str),
) -> ReelResult<()> {
    debug!(binary = %config.binary.display(), ?args, "spawning encoder");

    let mut child = Command::new(&config.binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReelError::EncoderNotFound
            } else {
                ReelError::Other(anyhow::Error::new(e).context("spawn encoder"))
            }
        })?;

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = child.stderr.take() {
        for line in BufReader::new(stderr).lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            on_stderr(&line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    let status = child.wait().context("wait for encoder")?;
    if !status.success() {
        return Err(ReelError::EncoderFailed {
            exit_code: status.code().unwrap_or(-1),
            tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
        });
    }
    Ok(())
}
