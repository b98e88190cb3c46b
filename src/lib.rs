#![forbid(unsafe_code)]

mod cache;
mod encode;
mod error;
mod expr;
mod graph;
mod markup;
mod model;
mod pipeline;
mod probe;
mod project;
mod rasterize;
mod style;
mod timeline;

pub use cache::reap_cache;
pub use encode::{
    build_encoder_args, ensure_parent_dir, is_encoder_on_path, preset_args, run_encoder,
    EncoderConfig, DEFAULT_PRESET,
};
pub use error::{ReelError, ReelResult};
pub use expr::{CompiledExpression, ExpressionContext, FieldRef, FragmentData, TimeData};
pub use graph::{fmt_num, fmt_secs, FadeDirection, Filter, FilterGraph, FilterStep, Label, Stream};
pub use markup::{Document, Element, Node};
pub use model::{
    parse_time_literal, App, Asset, AssetKind, Chromakey, ContainMode, Container, FragmentSource,
    FragmentSpec, InputSource, ObjectFit, Output, Project, ProjectMeta, Sequence, Timing,
    Transition,
};
pub use pipeline::{CancelToken, RenderOptions, RenderRun};
pub use probe::{FfprobeProber, MediaProbe, MediaProber};
pub use project::{build_project, load_project};
pub use rasterize::{
    app_key, app_png_path, app_url, container_document, container_key, container_png_path,
    rasterize_overlays, ChromeBrowser, OverlayBrowser, APP_CACHE_DIR, CONTAINER_CACHE_DIR,
};
pub use style::{parse_declarations, Stylesheet};
pub use timeline::{
    compile_output, compile_resolved, resolve_timing, CompiledOutput, InputArg, ResolvedFragment,
    ResolvedSequence,
};
