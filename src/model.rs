//! The typed project model: what the markup+stylesheet document compiles
//! into, and what the timeline compiler consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{
    error::{ReelError, ReelResult},
    expr::CompiledExpression,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Video,
    Image,
    Audio,
}

impl AssetKind {
    pub fn from_name(name: &str) -> Option<AssetKind> {
        match name.to_ascii_lowercase().as_str() {
            "video" => Some(AssetKind::Video),
            "image" => Some(AssetKind::Image),
            "audio" => Some(AssetKind::Audio),
            _ => None,
        }
    }

    /// Kind inferred from a file extension when the document does not
    /// override it.
    pub fn from_extension(path: &std::path::Path) -> AssetKind {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => AssetKind::Image,
            "mp3" | "wav" | "flac" | "ogg" | "m4a" | "aac" => AssetKind::Audio,
            _ => AssetKind::Video,
        }
    }
}

/// A probed media file. Immutable once built; owned by the [`Project`].
#[derive(Clone, Debug)]
pub struct Asset {
    pub name: String,
    pub path: PathBuf,
    pub kind: AssetKind,
    /// 0 for images.
    pub duration_ms: f64,
    pub width: u32,
    pub height: u32,
    /// Display rotation in degrees, normalized to {0, 90, 180, 270}.
    pub rotation: u32,
    pub has_video: bool,
    pub has_audio: bool,
    /// Stable filter-graph input index, assigned on first use in sequence
    /// order; `None` when no fragment references the asset.
    pub input_index: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Output {
    pub name: String,
    pub path: PathBuf,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Name of an `ffmpeg` preset block; `None` uses the default args.
    pub preset: Option<String>,
}

impl Output {
    pub fn validate(&self) -> ReelResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ReelError::fragment_invalid(
                &self.name,
                "output resolution must be non-zero",
            ));
        }
        if self.fps == 0 {
            return Err(ReelError::fragment_invalid(
                &self.name,
                "output fps must be non-zero",
            ));
        }
        Ok(())
    }
}

/// A timing field as parsed: literal milliseconds, `100%` of the source, or
/// a `calc(…)` expression resolved later against the expression context.
#[derive(Clone, Debug)]
pub enum Timing {
    Literal(f64),
    Percent,
    Expr(CompiledExpression),
}

impl Timing {
    pub fn parse(value: &str) -> ReelResult<Timing> {
        let value = value.trim();
        if value == "100%" {
            return Ok(Timing::Percent);
        }
        if value.starts_with("calc(") {
            return Ok(Timing::Expr(CompiledExpression::parse(value)?));
        }
        Ok(Timing::Literal(parse_time_literal(value)?))
    }
}

/// `500ms`, `2.5s`, or a bare millisecond count.
pub fn parse_time_literal(value: &str) -> ReelResult<f64> {
    let value = value.trim();
    let (num, scale) = if let Some(v) = value.strip_suffix("ms") {
        (v, 1.0)
    } else if let Some(v) = value.strip_suffix('s') {
        (v, 1000.0)
    } else {
        (value, 1.0)
    };
    num.trim()
        .parse::<f64>()
        .map(|v| v * scale)
        .map_err(|_| ReelError::expression_parse(value, "expected a time value"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentSource {
    Asset(String),
    Container(String),
    App(String),
}

impl FragmentSource {
    pub fn target(&self) -> &str {
        match self {
            FragmentSource::Asset(n) | FragmentSource::Container(n) | FragmentSource::App(n) => n,
        }
    }

    pub fn is_overlay_source(&self) -> bool {
        !matches!(self, FragmentSource::Asset(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectFit {
    Cover,
    Contain(ContainMode),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContainMode {
    Letterbox,
    Ambient {
        blur: f64,
        brightness: f64,
        saturation: f64,
    },
    Pillarbox {
        color: String,
    },
}

impl ObjectFit {
    /// `cover | contain [ambient <blur> <brightness> <saturation> |
    /// pillarbox <color>]`
    pub fn parse(value: &str) -> ReelResult<ObjectFit> {
        let mut words = value.split_whitespace();
        match words.next() {
            Some("cover") | None => Ok(ObjectFit::Cover),
            Some("contain") => match words.next() {
                None | Some("letterbox") => Ok(ObjectFit::Contain(ContainMode::Letterbox)),
                Some("ambient") => {
                    let mut num = |name: &str, default: f64| -> ReelResult<f64> {
                        match words.next() {
                            None => Ok(default),
                            Some(w) => w.parse().map_err(|_| {
                                ReelError::expression_parse(
                                    value,
                                    format!("bad ambient {name} '{w}'"),
                                )
                            }),
                        }
                    };
                    let blur = num("blur", 20.0)?;
                    let brightness = num("brightness", -0.1)?;
                    let saturation = num("saturation", 1.0)?;
                    Ok(ObjectFit::Contain(ContainMode::Ambient {
                        blur,
                        brightness,
                        saturation,
                    }))
                }
                Some("pillarbox") => Ok(ObjectFit::Contain(ContainMode::Pillarbox {
                    color: words.next().unwrap_or("black").to_string(),
                })),
                Some(other) => Err(ReelError::expression_parse(
                    value,
                    format!("unknown contain mode '{other}'"),
                )),
            },
            Some(other) => Err(ReelError::expression_parse(
                value,
                format!("unknown object-fit '{other}'"),
            )),
        }
    }
}

/// `-transition-start: fade 500ms` and friends.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub name: String,
    pub duration_ms: f64,
}

impl Transition {
    pub fn parse(value: &str) -> ReelResult<Transition> {
        let mut words = value.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| ReelError::expression_parse(value, "empty transition"))?
            .to_string();
        let duration_ms = match words.next() {
            Some(w) => parse_time_literal(w)?,
            None => 500.0,
        };
        Ok(Transition { name, duration_ms })
    }
}

/// `-chromakey: <color> <similarity> <blend>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Chromakey {
    pub color: String,
    pub similarity: f64,
    pub blend: f64,
}

impl Chromakey {
    pub fn parse(value: &str) -> ReelResult<Chromakey> {
        let mut words = value.split_whitespace();
        let color = words
            .next()
            .ok_or_else(|| ReelError::expression_parse(value, "chromakey needs a color"))?
            .to_string();
        let mut num = |name: &str, default: f64| -> ReelResult<f64> {
            match words.next() {
                None => Ok(default),
                Some(w) => w.parse().map_err(|_| {
                    ReelError::expression_parse(value, format!("bad chromakey {name} '{w}'"))
                }),
            }
        };
        let similarity = num("similarity", 0.1)?;
        let blend = num("blend", 0.1)?;
        Ok(Chromakey {
            color,
            similarity,
            blend,
        })
    }
}

/// One scheduled use of an asset or overlay on a sequence timeline, exactly
/// as the document declared it. Resolution to concrete milliseconds happens
/// in the timeline compiler and never mutates this record.
#[derive(Clone, Debug)]
pub struct FragmentSpec {
    pub id: String,
    pub source: FragmentSource,
    pub enabled: bool,
    pub trim_start_ms: f64,
    pub start: Option<Timing>,
    pub end: Option<Timing>,
    pub duration: Option<Timing>,
    /// Signed; negative slides the fragment left into a cross-fade.
    pub overlap_left_ms: f64,
    pub object_fit: ObjectFit,
    pub transition_in: Option<Transition>,
    pub transition_out: Option<Transition>,
    pub z_index: i32,
    /// Parsed but not interpolated; the start z-index is authoritative.
    pub z_index_end: Option<i32>,
    pub chromakey: Option<Chromakey>,
    pub blur_sigma: Option<f64>,
    pub audio_enabled: bool,
}

impl FragmentSpec {
    pub fn new(id: impl Into<String>, source: FragmentSource) -> FragmentSpec {
        FragmentSpec {
            id: id.into(),
            source,
            enabled: true,
            trim_start_ms: 0.0,
            start: None,
            end: None,
            duration: None,
            overlap_left_ms: 0.0,
            object_fit: ObjectFit::Cover,
            transition_in: None,
            transition_out: None,
            z_index: 0,
            z_index_end: None,
            chromakey: None,
            blur_sigma: None,
            audio_enabled: true,
        }
    }

    /// Overlays render on top of the base track: explicit z-index, or any
    /// container/app source.
    pub fn is_overlay(&self) -> bool {
        self.z_index > 0 || self.source.is_overlay_source()
    }
}

#[derive(Clone, Debug)]
pub struct Sequence {
    pub id: Option<String>,
    pub offset: Option<Timing>,
    pub fragments: Vec<FragmentSpec>,
}

/// An HTML subtree rasterized to a transparent PNG at output resolution.
#[derive(Clone, Debug)]
pub struct Container {
    pub id: String,
    pub html: String,
}

/// An external built SPA rasterized after signaling readiness.
#[derive(Clone, Debug)]
pub struct App {
    pub id: String,
    pub source_dir: PathBuf,
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default)]
pub struct ProjectMeta {
    pub title: Option<String>,
    pub date: Option<String>,
    pub tags: Vec<String>,
}

/// Which file a stable input index refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    Asset(String),
    /// Container or app id; the concrete PNG path is chosen per output.
    Overlay(String),
}

/// Root aggregate for one parsed project document.
#[derive(Clone, Debug)]
pub struct Project {
    pub dir: PathBuf,
    pub assets: BTreeMap<String, Asset>,
    pub outputs: BTreeMap<String, Output>,
    pub sequences: Vec<Sequence>,
    pub containers: BTreeMap<String, Container>,
    pub apps: BTreeMap<String, App>,
    /// The project `<style>` contents, shared with container rasterization.
    pub css: String,
    pub presets: BTreeMap<String, String>,
    /// Upload configs are outside the compiler's scope but round-trip.
    pub uploads: BTreeMap<String, BTreeMap<String, String>>,
    pub meta: ProjectMeta,
    /// Input files in stable index order (position == input index).
    pub inputs: Vec<InputSource>,
}

impl Project {
    pub fn input_index_of_overlay(&self, id: &str) -> Option<usize> {
        self.inputs
            .iter()
            .position(|i| matches!(i, InputSource::Overlay(o) if o == id))
    }

    pub fn output(&self, name: &str) -> ReelResult<&Output> {
        self.outputs.get(name).ok_or_else(|| {
            ReelError::fragment_invalid(name, "no output with this name in the project")
        })
    }
}
