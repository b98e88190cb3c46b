//! Media probing through an external `ffprobe`-compatible binary.
//!
//! Probes run blocking and sequentially; one failed probe fails the render
//! (no best-effort substitution).

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{ReelError, ReelResult},
    model::AssetKind,
};

/// What the probe learned about one file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaProbe {
    pub duration_ms: f64,
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
    pub has_video: bool,
    pub has_audio: bool,
}

pub trait MediaProber {
    fn probe(&self, path: &Path) -> ReelResult<MediaProbe>;
}

/// Shells out to `ffprobe`.
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> FfprobeProber {
        FfprobeProber {
            binary: binary.into(),
        }
    }

    fn run(&self, path: &Path, args: &[&str]) -> ReelResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| ReelError::AssetProbeFailed {
                path: path.to_path_buf(),
                message: format!("failed to launch probe: {e}"),
            })?;
        if !output.status.success() {
            return Err(ReelError::AssetProbeFailed {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl MediaProber for FfprobeProber {
    fn probe(&self, path: &Path) -> ReelResult<MediaProbe> {
        if !path.exists() {
            return Err(ReelError::AssetMissing {
                path: path.to_path_buf(),
            });
        }

        let streams_json = self.run(
            path,
            &[
                "-v",
                "error",
                "-show_entries",
                "stream=codec_type,width,height:stream_side_data=rotation",
                "-of",
                "json",
            ],
        )?;
        let mut probe = parse_streams(path, &streams_json)?;

        let is_image = AssetKind::from_extension(path) == AssetKind::Image;
        if is_image {
            probe.duration_ms = 0.0;
            probe.has_audio = false;
        } else {
            let duration_out = self.run(
                path,
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ],
            )?;
            probe.duration_ms = parse_duration_ms(path, &duration_out)?;
        }

        debug!(path = %path.display(), ?probe, "probed asset");
        Ok(probe)
    }
}

#[derive(Deserialize)]
struct FfprobeStreams {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Deserialize)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

/// Decimal seconds on stdout, per the probe contract.
pub fn parse_duration_ms(path: &Path, stdout: &str) -> ReelResult<f64> {
    stdout
        .trim()
        .parse::<f64>()
        .map(|s| s * 1000.0)
        .map_err(|_| ReelError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: format!("unparsable duration '{}'", stdout.trim()),
        })
}

pub fn parse_streams(path: &Path, json: &str) -> ReelResult<MediaProbe> {
    let parsed: FfprobeStreams =
        serde_json::from_str(json).map_err(|e| ReelError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: format!("unparsable stream info: {e}"),
        })?;

    let mut probe = MediaProbe {
        duration_ms: 0.0,
        width: 0,
        height: 0,
        rotation: 0,
        has_video: false,
        has_audio: false,
    };

    for stream in &parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                probe.has_video = true;
                if probe.width == 0 {
                    probe.width = stream.width.unwrap_or(0);
                    probe.height = stream.height.unwrap_or(0);
                    if let Some(r) = stream.side_data_list.iter().find_map(|s| s.rotation) {
                        probe.rotation = normalize_rotation(r);
                    }
                }
            }
            Some("audio") => probe.has_audio = true,
            _ => {}
        }
    }

    Ok(probe)
}

/// ffprobe reports the display-matrix rotation (negative for clockwise);
/// normalize to the clockwise degrees the layout stage undoes.
fn normalize_rotation(reported: f64) -> u32 {
    let r = (-reported).rem_euclid(360.0).round() as u32 % 360;
    // snap to quarter turns; anything else is not representable by transpose
    match r {
        45..=134 => 90,
        135..=224 => 180,
        225..=314 => 270,
        _ => 0,
    }
}
