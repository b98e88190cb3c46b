//! The timeline compiler: resolves every fragment's timing, materializes
//! per-fragment filter chains, joins them with concat runs or cross-fades,
//! applies overlays, and composes sequences into the final `[outv]`/`[outa]`
//! pair.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use crate::{
    error::{ReelError, ReelResult},
    expr::{ExpressionContext, TimeData},
    graph::{fmt_secs, FadeDirection, FilterGraph, Label, Stream},
    model::{
        Asset, AssetKind, ContainMode, FragmentSource, FragmentSpec, InputSource, ObjectFit,
        Output, Project, Timing,
    },
};

const EPSILON_MS: f64 = 1e-6;

/// A fragment with concrete millisecond timing. The declaration it was
/// resolved from is carried along unchanged.
#[derive(Clone, Debug)]
pub struct ResolvedFragment {
    pub spec: FragmentSpec,
    pub start_ms: f64,
    pub duration_ms: f64,
    pub end_ms: f64,
}

#[derive(Clone, Debug)]
pub struct ResolvedSequence {
    pub offset_ms: f64,
    pub fragments: Vec<ResolvedFragment>,
}

/// One `-i` entry, in stable index order. Stills (image assets and
/// rasterized overlay PNGs) carry the loop duration they must cover.
#[derive(Clone, Debug, PartialEq)]
pub struct InputArg {
    pub index: usize,
    pub path: PathBuf,
    pub still_duration_ms: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct CompiledOutput {
    pub filter_graph: String,
    pub inputs: Vec<InputArg>,
    pub total_duration_ms: f64,
}

/// Compile one output of the project. `overlay_pngs` maps container/app ids
/// to the PNGs the rasterizer produced for this output's resolution.
pub fn compile_output(
    project: &Project,
    output: &Output,
    overlay_pngs: &BTreeMap<String, PathBuf>,
) -> ReelResult<CompiledOutput> {
    let sequences = resolve_timing(project)?;
    compile_resolved(project, output, &sequences, overlay_pngs)
}

/// Compile against timing that was already resolved, so a caller that ran
/// [`resolve_timing`] as an early gate does not pay for it twice.
pub fn compile_resolved(
    project: &Project,
    output: &Output,
    sequences: &[ResolvedSequence],
    overlay_pngs: &BTreeMap<String, PathBuf>,
) -> ReelResult<CompiledOutput> {
    output.validate()?;

    let graph = FilterGraph::new();
    let mut composed: Vec<(Option<Stream>, Option<Stream>, f64, f64)> = Vec::new();

    for seq in sequences {
        if seq.fragments.is_empty() {
            continue;
        }
        let (video, audio, total) = build_sequence(&graph, project, output, seq, overlay_pngs)?;
        composed.push((video, audio, seq.offset_ms, total));
    }

    if composed.is_empty() {
        return Err(ReelError::fragment_invalid(
            "project",
            "no enabled fragments in any sequence",
        ));
    }

    let total_duration_ms = composed
        .iter()
        .map(|(_, _, offset, total)| offset + total)
        .fold(0.0, f64::max);

    compose_sequences(&graph, composed, total_duration_ms)?;

    let inputs = build_inputs(project, sequences, overlay_pngs)?;
    let filter_count = graph.render().matches(';').count() + 1;
    debug!(filters = filter_count, total_ms = total_duration_ms, "compiled output");

    Ok(CompiledOutput {
        filter_graph: graph.render(),
        inputs,
        total_duration_ms,
    })
}

// --- timing resolution -----------------------------------------------------

/// Iterative two-pass resolution: literals and already-resolved references
/// settle first; each resolved fragment enters the expression context so
/// later passes can see it. No progress with fragments left over means the
/// references can never settle.
pub fn resolve_timing(project: &Project) -> ReelResult<Vec<ResolvedSequence>> {
    let mut ctx = ExpressionContext::default();

    let enabled: Vec<Vec<&FragmentSpec>> = project
        .sequences
        .iter()
        .map(|s| s.fragments.iter().filter(|f| f.enabled).collect())
        .collect();
    let mut slots: Vec<Vec<Option<ResolvedFragment>>> =
        enabled.iter().map(|f| vec![None; f.len()]).collect();

    loop {
        let mut progress = false;
        let mut unresolved = Vec::new();

        for (si, frags) in enabled.iter().enumerate() {
            for (fi, frag) in frags.iter().enumerate() {
                if slots[si][fi].is_some() {
                    continue;
                }
                match try_resolve(project, frag, fi, frags, &slots[si], &ctx)? {
                    Some(resolved) => {
                        ctx.insert(
                            resolved.spec.id.clone(),
                            TimeData {
                                start: resolved.start_ms,
                                end: resolved.end_ms,
                                duration: resolved.duration_ms,
                            },
                        );
                        slots[si][fi] = Some(resolved);
                        progress = true;
                    }
                    None => unresolved.push(frag.id.clone()),
                }
            }
        }

        if unresolved.is_empty() {
            break;
        }
        if !progress {
            return Err(ReelError::UnresolvableExpression {
                fragment_ids: unresolved,
            });
        }
    }

    let sequences = project
        .sequences
        .iter()
        .zip(slots)
        .map(|(seq, resolved)| {
            let offset_ms = match &seq.offset {
                None => 0.0,
                Some(t) => eval_offset(t, &ctx)?,
            };
            Ok(ResolvedSequence {
                offset_ms,
                fragments: resolved.into_iter().flatten().collect(),
            })
        })
        .collect::<ReelResult<Vec<_>>>()?;
    Ok(sequences)
}

fn eval_offset(timing: &Timing, ctx: &ExpressionContext) -> ReelResult<f64> {
    match timing {
        Timing::Literal(v) => Ok(*v),
        Timing::Percent => Err(ReelError::expression_parse(
            "100%",
            "sequence offsets cannot be percentages",
        )),
        Timing::Expr(e) => e.evaluate(ctx),
    }
}

/// `Ok(None)` means "not yet" (an input is still unresolved); errors are
/// permanent.
fn try_resolve(
    project: &Project,
    frag: &FragmentSpec,
    index: usize,
    sequence_frags: &[&FragmentSpec],
    sequence_slots: &[Option<ResolvedFragment>],
    ctx: &ExpressionContext,
) -> ReelResult<Option<ResolvedFragment>> {
    let asset = match &frag.source {
        FragmentSource::Asset(name) => project.assets.get(name),
        _ => None,
    };

    let explicit_duration = match &frag.duration {
        None => None,
        Some(t) => match eval_timing(project, frag, t, asset, ctx)? {
            None => return Ok(None),
            Some(v) => Some(v),
        },
    };
    let end = match &frag.end {
        None => None,
        Some(t) => match eval_timing(project, frag, t, asset, ctx)? {
            None => return Ok(None),
            Some(v) => Some(v),
        },
    };

    let start = match &frag.start {
        Some(t) => match eval_timing(project, frag, t, asset, ctx)? {
            None => return Ok(None),
            Some(v) => v,
        },
        None => {
            let prev = previous_for(frag, index, sequence_frags, sequence_slots);
            match prev {
                PreviousFragment::None => 0.0,
                PreviousFragment::Pending => return Ok(None),
                PreviousFragment::Resolved(prev_end) => prev_end + frag.overlap_left_ms,
            }
        }
    };

    let duration = match explicit_duration {
        Some(d) => d,
        None => match end {
            Some(end) => end - start,
            None => default_duration(frag, asset)?,
        },
    };

    if duration <= 0.0 {
        return Err(ReelError::fragment_invalid(
            &frag.id,
            format!("resolved duration {duration}ms is not positive"),
        ));
    }
    if start < 0.0 {
        return Err(ReelError::fragment_invalid(
            &frag.id,
            format!("resolved start {start}ms is negative"),
        ));
    }
    if let Some(asset) = asset {
        if asset.kind != AssetKind::Image {
            let available = asset.duration_ms - frag.trim_start_ms;
            if duration > available + EPSILON_MS {
                return Err(ReelError::DurationOverflow {
                    fragment_id: frag.id.clone(),
                    requested_ms: duration,
                    available_ms: available,
                });
            }
        }
    }

    Ok(Some(ResolvedFragment {
        spec: frag.clone(),
        start_ms: start,
        duration_ms: duration,
        end_ms: start + duration,
    }))
}

enum PreviousFragment {
    None,
    Pending,
    Resolved(f64),
}

/// The fragment an absent start chains from: base fragments follow the
/// previous base fragment (an interleaved overlay never blocks them),
/// overlays follow whatever directly precedes them.
fn previous_for(
    frag: &FragmentSpec,
    index: usize,
    frags: &[&FragmentSpec],
    slots: &[Option<ResolvedFragment>],
) -> PreviousFragment {
    let want_base_only = !frag.is_overlay();
    for i in (0..index).rev() {
        if want_base_only && frags[i].is_overlay() {
            continue;
        }
        return match &slots[i] {
            Some(prev) => PreviousFragment::Resolved(prev.end_ms),
            None => PreviousFragment::Pending,
        };
    }
    PreviousFragment::None
}

fn eval_timing(
    project: &Project,
    frag: &FragmentSpec,
    timing: &Timing,
    asset: Option<&Asset>,
    ctx: &ExpressionContext,
) -> ReelResult<Option<f64>> {
    match timing {
        Timing::Literal(v) => Ok(Some(*v)),
        Timing::Percent => match asset {
            Some(asset) if asset.kind != AssetKind::Image => {
                Ok(Some(asset.duration_ms - frag.trim_start_ms))
            }
            _ => Err(ReelError::fragment_invalid(
                &frag.id,
                "100% requires a video or audio asset source",
            )),
        },
        Timing::Expr(e) => {
            // an unknown id that exists nowhere in the project will never
            // resolve, so fail now instead of looping to a fixed point
            for r in e.refs() {
                if !fragment_id_exists(project, &r.fragment_id) {
                    return Err(ReelError::expression_eval(
                        e.source(),
                        format!("unknown fragment id '{}'", r.fragment_id),
                    ));
                }
            }
            if !e.ready(ctx) {
                return Ok(None);
            }
            e.evaluate(ctx).map(Some)
        }
    }
}

fn fragment_id_exists(project: &Project, id: &str) -> bool {
    project
        .sequences
        .iter()
        .flat_map(|s| &s.fragments)
        .any(|f| f.id == id)
}

fn default_duration(frag: &FragmentSpec, asset: Option<&Asset>) -> ReelResult<f64> {
    match asset {
        Some(asset) if asset.kind != AssetKind::Image => {
            Ok(asset.duration_ms - frag.trim_start_ms)
        }
        Some(_) => Err(ReelError::fragment_invalid(
            &frag.id,
            "image fragments need an explicit duration",
        )),
        None => Err(ReelError::fragment_invalid(
            &frag.id,
            "container/app fragments need an explicit duration",
        )),
    }
}

// --- per-sequence stream construction --------------------------------------

struct Pair {
    video: Option<Stream>,
    audio: Option<Stream>,
}

fn build_sequence(
    graph: &FilterGraph,
    project: &Project,
    output: &Output,
    seq: &ResolvedSequence,
    overlay_pngs: &BTreeMap<String, PathBuf>,
) -> ReelResult<(Option<Stream>, Option<Stream>, f64)> {
    let (base, overlays): (Vec<&ResolvedFragment>, Vec<&ResolvedFragment>) =
        seq.fragments.iter().partition(|f| !f.spec.is_overlay());

    let (mut video, audio, total) = join_base(graph, project, output, &base)?;

    // z-index order, document order within equal z
    let mut ordered: Vec<(usize, &ResolvedFragment)> = overlays.into_iter().enumerate().collect();
    ordered.sort_by_key(|(doc_order, f)| (f.spec.z_index, *doc_order));

    for (_, frag) in ordered {
        let top = build_overlay_stream(graph, project, output, frag, overlay_pngs)?;
        let base_v = video.ok_or_else(|| {
            ReelError::fragment_invalid(
                &frag.spec.id,
                "overlay fragment needs a video-bearing base track",
            )
        })?;
        video = Some(base_v.overlay(&top, "0", "0", Some((frag.start_ms, frag.end_ms)))?);
    }

    Ok((video, audio, total))
}

/// Walk base fragments keeping a timeline cursor: zero-overlap neighbours
/// pile into one concat run, a negative overlap flushes the run and joins
/// with a cross-fade.
fn join_base(
    graph: &FilterGraph,
    project: &Project,
    output: &Output,
    base: &[&ResolvedFragment],
) -> ReelResult<(Option<Stream>, Option<Stream>, f64)> {
    let mut current: Option<Pair> = None;
    let mut run: Vec<Pair> = Vec::new();
    let mut cursor_ms = 0.0;

    for (i, frag) in base.iter().enumerate() {
        let pair = build_base_pair(graph, project, output, frag)?;
        let overlap = frag.spec.overlap_left_ms;

        if overlap < 0.0 && (current.is_some() || !run.is_empty()) {
            let merged = flush_run(graph, current.take(), &mut run)?;
            let duration = -overlap;
            let offset = cursor_ms + overlap;
            current = Some(crossfade_pairs(graph, merged, pair, frag, duration, offset)?);
        } else {
            run.push(pair);
        }

        cursor_ms += frag.duration_ms;
        if i > 0 && overlap < 0.0 {
            cursor_ms += overlap;
        }
    }

    if current.is_none() && run.is_empty() {
        return Ok((None, None, 0.0));
    }
    let joined = flush_run(graph, current, &mut run)?;
    Ok((joined.video, joined.audio, cursor_ms))
}

fn crossfade_pairs(
    graph: &FilterGraph,
    a: Pair,
    b: Pair,
    frag: &ResolvedFragment,
    duration_ms: f64,
    offset_ms: f64,
) -> ReelResult<Pair> {
    let transition = frag
        .spec
        .transition_in
        .as_ref()
        .map(|t| t.name.as_str())
        .unwrap_or("fade");

    let video = match (a.video, b.video) {
        (Some(va), Some(vb)) => Some(graph.stream(graph.make_xfade(
            va.label(),
            vb.label(),
            duration_ms,
            offset_ms,
            transition,
        )?)),
        (None, None) => None,
        _ => {
            return Err(ReelError::invalid_filter_inputs(
                "xfade",
                format!(
                    "fragment '{}' mixes video and non-video segments",
                    frag.spec.id
                ),
            ));
        }
    };
    let audio = match (a.audio, b.audio) {
        (Some(aa), Some(ab)) => Some(graph.stream(graph.make_acrossfade(
            aa.label(),
            ab.label(),
            duration_ms,
        )?)),
        (None, None) => None,
        _ => {
            return Err(ReelError::invalid_filter_inputs(
                "acrossfade",
                format!(
                    "fragment '{}' mixes audio and audio-less segments",
                    frag.spec.id
                ),
            ));
        }
    };
    Ok(Pair { video, audio })
}

/// One concat per run of consecutive zero-overlap fragments.
fn flush_run(
    graph: &FilterGraph,
    current: Option<Pair>,
    run: &mut Vec<Pair>,
) -> ReelResult<Pair> {
    let mut segments: Vec<Pair> = current.into_iter().collect();
    segments.append(run);

    match segments.len() {
        0 => Err(ReelError::invalid_filter_inputs("concat", "no inputs")),
        1 => Ok(segments.pop().expect("one segment")),
        _ => {
            let mut labels: Vec<Label> = Vec::new();
            for seg in &segments {
                if let Some(v) = &seg.video {
                    labels.push(v.label().clone());
                }
                if let Some(a) = &seg.audio {
                    labels.push(a.label().clone());
                }
            }
            let outputs = graph.make_concat(&labels)?;
            let mut video = None;
            let mut audio = None;
            for label in outputs {
                if label.is_audio {
                    audio = Some(graph.stream(label));
                } else {
                    video = Some(graph.stream(label));
                }
            }
            Ok(Pair { video, audio })
        }
    }
}

fn asset_for<'a>(project: &'a Project, frag: &ResolvedFragment) -> ReelResult<&'a Asset> {
    match &frag.spec.source {
        FragmentSource::Asset(name) => project.assets.get(name).ok_or_else(|| {
            ReelError::UnknownReference {
                fragment_id: frag.spec.id.clone(),
                target: name.clone(),
            }
        }),
        other => Err(ReelError::fragment_invalid(
            &frag.spec.id,
            format!("'{}' is not an asset fragment", other.target()),
        )),
    }
}

fn input_index_of(asset: &Asset, frag: &ResolvedFragment) -> ReelResult<usize> {
    asset.input_index.ok_or_else(|| {
        ReelError::fragment_invalid(
            &frag.spec.id,
            format!("asset '{}' was never assigned an input index", asset.name),
        )
    })
}

fn build_base_pair(
    graph: &FilterGraph,
    project: &Project,
    output: &Output,
    frag: &ResolvedFragment,
) -> ReelResult<Pair> {
    let asset = asset_for(project, frag)?;
    let index = input_index_of(asset, frag)?;

    let video = if asset.has_video {
        Some(build_video_chain(graph, output, frag, asset, index)?)
    } else {
        None
    };

    let audio = if video.is_some() {
        // video segments always carry an audio lane so concat factorizes
        if frag.spec.audio_enabled && asset.has_audio {
            Some(build_audio_chain(graph, frag, asset, index))
        } else {
            Some(graph.silence(frag.duration_ms))
        }
    } else if asset.has_audio && frag.spec.audio_enabled {
        Some(build_audio_chain(graph, frag, asset, index))
    } else {
        return Err(ReelError::fragment_invalid(
            &frag.spec.id,
            format!("asset '{}' has neither video nor audible audio", asset.name),
        ));
    };

    Ok(Pair { video, audio })
}

fn needs_trim(frag: &ResolvedFragment, asset: &Asset) -> bool {
    asset.kind != AssetKind::Image
        && (frag.spec.trim_start_ms > EPSILON_MS
            || frag.duration_ms + EPSILON_MS < asset.duration_ms)
}

fn build_video_chain(
    graph: &FilterGraph,
    output: &Output,
    frag: &ResolvedFragment,
    asset: &Asset,
    index: usize,
) -> ReelResult<Stream> {
    let mut v = graph.video_input(index);

    if needs_trim(frag, asset) {
        v = v.trim(frag.spec.trim_start_ms, frag.duration_ms);
    }
    v = match asset.rotation {
        90 => v.transpose(1),
        180 => v.transpose(1).transpose(1),
        270 => v.transpose(2),
        _ => v,
    };
    v = v.fps(output.fps);
    v = apply_fit(v, &frag.spec.object_fit, output)?;

    if let Some(key) = &frag.spec.chromakey {
        v = v.colorkey(&key.color, key.similarity, key.blend);
    }
    if let Some(sigma) = frag.spec.blur_sigma {
        v = v.gblur(sigma);
    }
    // a negative overlap turns the entry into an xfade named after the
    // transition, so the plain fade-in only applies to hard joins
    if let Some(t) = &frag.spec.transition_in {
        if frag.spec.overlap_left_ms >= 0.0 {
            v = v.fade(FadeDirection::In, 0.0, t.duration_ms);
        }
    }
    if let Some(t) = &frag.spec.transition_out {
        v = v.fade(
            FadeDirection::Out,
            frag.duration_ms - t.duration_ms,
            t.duration_ms,
        );
    }
    Ok(v)
}

fn apply_fit(v: Stream, fit: &ObjectFit, output: &Output) -> ReelResult<Stream> {
    Ok(match fit {
        ObjectFit::Cover => v.fit_cover(output.width, output.height),
        ObjectFit::Contain(ContainMode::Letterbox) => {
            v.fit_pad(output.width, output.height, None)
        }
        ObjectFit::Contain(ContainMode::Pillarbox { color }) => {
            v.fit_pad(output.width, output.height, Some(color))
        }
        ObjectFit::Contain(ContainMode::Ambient {
            blur,
            brightness,
            saturation,
        }) => v.fit_ambient(output.width, output.height, *blur, *brightness, *saturation)?,
    })
}

fn build_audio_chain(
    graph: &FilterGraph,
    frag: &ResolvedFragment,
    asset: &Asset,
    index: usize,
) -> Stream {
    let a = graph.audio_input(index);
    if needs_trim(frag, asset) {
        a.trim(frag.spec.trim_start_ms, frag.duration_ms)
    } else {
        a
    }
}

fn build_overlay_stream(
    graph: &FilterGraph,
    project: &Project,
    output: &Output,
    frag: &ResolvedFragment,
    overlay_pngs: &BTreeMap<String, PathBuf>,
) -> ReelResult<Stream> {
    match &frag.spec.source {
        FragmentSource::Asset(_) => {
            let asset = asset_for(project, frag)?;
            if !asset.has_video {
                return Err(ReelError::fragment_invalid(
                    &frag.spec.id,
                    "overlay fragments must carry video",
                ));
            }
            let index = input_index_of(asset, frag)?;
            let mut v = build_video_chain(graph, output, frag, asset, index)?;
            if frag.start_ms > EPSILON_MS {
                // slide the trimmed clip to its timeline position
                v = v.setpts(&format!("PTS+{}/TB", fmt_secs(frag.start_ms)));
            }
            Ok(v)
        }
        FragmentSource::Container(id) | FragmentSource::App(id) => {
            let index = project.input_index_of_overlay(id).ok_or_else(|| {
                ReelError::fragment_invalid(
                    &frag.spec.id,
                    format!("overlay '{id}' was never assigned an input index"),
                )
            })?;
            if !overlay_pngs.contains_key(id) {
                return Err(ReelError::fragment_invalid(
                    &frag.spec.id,
                    format!("overlay '{id}' was not rasterized for this output"),
                ));
            }
            let mut v = graph.video_input(index);
            if let Some(key) = &frag.spec.chromakey {
                v = v.colorkey(&key.color, key.similarity, key.blend);
            }
            if let Some(sigma) = frag.spec.blur_sigma {
                v = v.gblur(sigma);
            }
            // alpha fades so the PNG dissolves instead of dipping to black
            if let Some(t) = &frag.spec.transition_in {
                v = v.fade_alpha(FadeDirection::In, frag.start_ms, t.duration_ms);
            }
            if let Some(t) = &frag.spec.transition_out {
                v = v.fade_alpha(
                    FadeDirection::Out,
                    frag.end_ms - t.duration_ms,
                    t.duration_ms,
                );
            }
            Ok(v)
        }
    }
}

// --- cross-sequence composition --------------------------------------------

fn compose_sequences(
    graph: &FilterGraph,
    composed: Vec<(Option<Stream>, Option<Stream>, f64, f64)>,
    total_duration_ms: f64,
) -> ReelResult<()> {
    let mut base_video: Option<Stream> = None;
    let mut audios: Vec<Stream> = Vec::new();

    for (video, audio, offset_ms, seq_total_ms) in composed {
        if let Some(mut v) = video {
            if offset_ms > EPSILON_MS {
                v = v.setpts(&format!("PTS+{}/TB", fmt_secs(offset_ms)));
            }
            base_video = match base_video {
                None => Some(v),
                Some(base) => Some(base.overlay(
                    &v,
                    "0",
                    "0",
                    Some((offset_ms, offset_ms + seq_total_ms)),
                )?),
            };
        }
        if let Some(mut a) = audio {
            if offset_ms > EPSILON_MS {
                a = a.adelay(offset_ms);
            }
            audios.push(a);
        }
    }

    let video = base_video.ok_or_else(|| {
        ReelError::fragment_invalid("project", "no sequence produced a video stream")
    })?;
    video.end_to("outv");

    let audio = match audios.len() {
        0 => graph.silence(total_duration_ms),
        1 => audios.pop().expect("one audio"),
        _ => {
            let labels: Vec<Label> = audios.iter().map(|a| a.label().clone()).collect();
            graph.stream(graph.make_amix(&labels)?)
        }
    };
    audio.end_to("outa");
    Ok(())
}

// --- input argument list ---------------------------------------------------

fn build_inputs(
    project: &Project,
    sequences: &[ResolvedSequence],
    overlay_pngs: &BTreeMap<String, PathBuf>,
) -> ReelResult<Vec<InputArg>> {
    // longest use per source decides the -t of still inputs
    let mut longest_use: BTreeMap<&str, f64> = BTreeMap::new();
    for seq in sequences {
        for frag in &seq.fragments {
            let entry = longest_use.entry(frag.spec.source.target()).or_insert(0.0);
            *entry = entry.max(frag.duration_ms);
        }
    }

    let mut inputs = Vec::with_capacity(project.inputs.len());
    for (index, source) in project.inputs.iter().enumerate() {
        let arg = match source {
            InputSource::Asset(name) => {
                let asset = project.assets.get(name).ok_or_else(|| {
                    ReelError::fragment_invalid(name, "input names a missing asset")
                })?;
                InputArg {
                    index,
                    path: asset.path.clone(),
                    still_duration_ms: (asset.kind == AssetKind::Image)
                        .then(|| longest_use.get(name.as_str()).copied().unwrap_or(0.0)),
                }
            }
            InputSource::Overlay(id) => {
                let path = overlay_pngs.get(id).ok_or_else(|| {
                    ReelError::fragment_invalid(id, "overlay was not rasterized for this output")
                })?;
                InputArg {
                    index,
                    path: path.clone(),
                    still_duration_ms: Some(
                        longest_use.get(id.as_str()).copied().unwrap_or(0.0),
                    ),
                }
            }
        };
        inputs.push(arg);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, FragmentSpec, ProjectMeta, Sequence, Timing, Transition};
    use std::collections::BTreeMap;

    fn asset(name: &str, duration_ms: f64, index: usize) -> Asset {
        Asset {
            name: name.to_string(),
            path: PathBuf::from(format!("input/{name}.mp4")),
            kind: AssetKind::Video,
            duration_ms,
            width: 1920,
            height: 1080,
            rotation: 0,
            has_video: true,
            has_audio: true,
            input_index: Some(index),
        }
    }

    fn output() -> Output {
        Output {
            name: "main".to_string(),
            path: PathBuf::from("output/main.mp4"),
            fps: 30,
            width: 1920,
            height: 1080,
            preset: None,
        }
    }

    fn project(assets: Vec<Asset>, sequences: Vec<Sequence>) -> Project {
        let inputs = {
            let mut by_index: Vec<(usize, String)> = assets
                .iter()
                .filter_map(|a| a.input_index.map(|i| (i, a.name.clone())))
                .collect();
            by_index.sort_by_key(|(i, _)| *i);
            by_index
                .into_iter()
                .map(|(_, name)| InputSource::Asset(name))
                .collect()
        };
        Project {
            dir: PathBuf::from("/proj"),
            assets: assets.into_iter().map(|a| (a.name.clone(), a)).collect(),
            outputs: BTreeMap::from([("main".to_string(), output())]),
            sequences,
            containers: BTreeMap::new(),
            apps: BTreeMap::new(),
            css: String::new(),
            presets: BTreeMap::new(),
            uploads: BTreeMap::new(),
            meta: ProjectMeta::default(),
            inputs,
        }
    }

    fn fragment(id: &str, asset: &str) -> FragmentSpec {
        FragmentSpec::new(id, FragmentSource::Asset(asset.to_string()))
    }

    fn seq(fragments: Vec<FragmentSpec>) -> Sequence {
        Sequence {
            id: None,
            offset: None,
            fragments,
        }
    }

    #[test]
    fn single_full_clip_matches_the_minimal_graph() {
        let project = project(
            vec![asset("clip", 5000.0, 0)],
            vec![seq(vec![fragment("f", "clip")])],
        );
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert_eq!(
            compiled.filter_graph,
            "[0:v]fps=30[L0];\
             [L0]scale=1920:1080:force_original_aspect_ratio=increase,crop=1920:1080[L1];\
             [L1]null[outv];\
             [0:a]anull[outa]"
        );
        assert_eq!(compiled.total_duration_ms, 5000.0);
        assert_eq!(compiled.inputs.len(), 1);
        assert_eq!(compiled.inputs[0].still_duration_ms, None);
    }

    #[test]
    fn two_clips_concat_into_one_filter() {
        let mut b = fragment("b", "clipb");
        b.duration = Some(Timing::Literal(4000.0));
        let project = project(
            vec![asset("clipa", 3000.0, 0), asset("clipb", 4000.0, 1)],
            vec![seq(vec![fragment("a", "clipa"), b])],
        );
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert!(compiled.filter_graph.contains("concat=n=2:v=1:a=1"));
        assert_eq!(compiled.total_duration_ms, 7000.0);
    }

    #[test]
    fn negative_overlap_becomes_xfade_and_acrossfade() {
        let mut b = fragment("b", "clipb");
        b.overlap_left_ms = -1000.0;
        let project = project(
            vec![asset("clipa", 3000.0, 0), asset("clipb", 3000.0, 1)],
            vec![seq(vec![fragment("a", "clipa"), b])],
        );
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert!(compiled
            .filter_graph
            .contains("xfade=transition=fade:duration=1:offset=2"));
        assert!(compiled.filter_graph.contains("acrossfade=d=1"));
        assert_eq!(compiled.total_duration_ms, 5000.0);
    }

    #[test]
    fn forward_reference_resolves_on_second_pass() {
        let mut intro = fragment("intro", "clipa");
        intro.duration = Some(Timing::Expr(
            crate::expr::CompiledExpression::parse("calc(url(#ending.time.start))").unwrap(),
        ));
        let mut ending = fragment("ending", "clipb");
        ending.start = Some(Timing::Literal(8000.0));
        ending.duration = Some(Timing::Literal(3000.0));

        let project = project(
            vec![asset("clipa", 10000.0, 0), asset("clipb", 4000.0, 1)],
            vec![seq(vec![intro, ending])],
        );
        let resolved = resolve_timing(&project).unwrap();
        let frags = &resolved[0].fragments;
        assert_eq!(frags[0].duration_ms, 8000.0);
        assert_eq!(frags[1].start_ms, 8000.0);
        assert_eq!(frags[1].end_ms, 11000.0);
    }

    #[test]
    fn unresolvable_cycle_names_the_fragments() {
        let mut a = fragment("a", "clipa");
        a.duration = Some(Timing::Expr(
            crate::expr::CompiledExpression::parse("calc(url(#b.time.duration))").unwrap(),
        ));
        let mut b = fragment("b", "clipb");
        b.duration = Some(Timing::Expr(
            crate::expr::CompiledExpression::parse("calc(url(#a.time.duration))").unwrap(),
        ));
        let project = project(
            vec![asset("clipa", 10000.0, 0), asset("clipb", 10000.0, 1)],
            vec![seq(vec![a, b])],
        );
        let err = resolve_timing(&project).unwrap_err();
        match err {
            ReelError::UnresolvableExpression { fragment_ids } => {
                assert_eq!(fragment_ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected UnresolvableExpression, got {other:?}"),
        }
    }

    #[test]
    fn duration_overflow_is_reported_with_both_sides() {
        let mut f = fragment("f", "clip");
        f.trim_start_ms = 2000.0;
        f.duration = Some(Timing::Literal(4000.0));
        let project = project(vec![asset("clip", 5000.0, 0)], vec![seq(vec![f])]);
        let err = resolve_timing(&project).unwrap_err();
        match err {
            ReelError::DurationOverflow {
                requested_ms,
                available_ms,
                ..
            } => {
                assert_eq!(requested_ms, 4000.0);
                assert_eq!(available_ms, 3000.0);
            }
            other => panic!("expected DurationOverflow, got {other:?}"),
        }
    }

    #[test]
    fn container_overlay_gets_enable_window_and_still_input() {
        let mut title = FragmentSpec::new(
            "title",
            FragmentSource::Container("title-card".to_string()),
        );
        title.start = Some(Timing::Literal(1000.0));
        title.duration = Some(Timing::Literal(2000.0));
        title.z_index = 10;

        let mut project = project(
            vec![asset("clip", 5000.0, 0)],
            vec![seq(vec![fragment("base", "clip"), title])],
        );
        project.containers.insert(
            "title-card".to_string(),
            Container {
                id: "title-card".to_string(),
                html: "<h1>Title</h1>".to_string(),
            },
        );
        project
            .inputs
            .push(InputSource::Overlay("title-card".to_string()));

        let pngs = BTreeMap::from([(
            "title-card".to_string(),
            PathBuf::from("/proj/.cache/containers/abc.png"),
        )]);
        let compiled = compile_output(&project, &project.outputs["main"], &pngs).unwrap();

        assert!(compiled
            .filter_graph
            .contains("overlay=x=0:y=0:enable='between(t,1,3)'"));
        let overlay_input = &compiled.inputs[1];
        assert_eq!(overlay_input.still_duration_ms, Some(2000.0));
        assert!(overlay_input.path.ends_with(".cache/containers/abc.png"));
    }

    #[test]
    fn trim_is_skipped_for_full_duration_and_applied_otherwise() {
        let mut f = fragment("f", "clip");
        f.trim_start_ms = 500.0;
        f.duration = Some(Timing::Literal(2000.0));
        let project = project(vec![asset("clip", 5000.0, 0)], vec![seq(vec![f])]);
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert!(compiled
            .filter_graph
            .contains("trim=start=0.5:duration=2,setpts=PTS-STARTPTS"));
        assert!(compiled
            .filter_graph
            .contains("atrim=start=0.5:duration=2,asetpts=PTS-STARTPTS"));
    }

    #[test]
    fn fades_anchor_to_fragment_edges() {
        let mut f = fragment("f", "clip");
        f.transition_in = Some(Transition {
            name: "fade".to_string(),
            duration_ms: 500.0,
        });
        f.transition_out = Some(Transition {
            name: "fade".to_string(),
            duration_ms: 500.0,
        });
        let project = project(vec![asset("clip", 5000.0, 0)], vec![seq(vec![f])]);
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert!(compiled.filter_graph.contains("fade=t=in:st=0:d=0.5"));
        assert!(compiled.filter_graph.contains("fade=t=out:st=4.5:d=0.5"));
    }

    #[test]
    fn second_sequence_overlays_video_and_mixes_audio() {
        let project = project(
            vec![asset("clipa", 4000.0, 0), asset("music", 4000.0, 1)],
            vec![
                seq(vec![fragment("a", "clipa")]),
                seq(vec![fragment("m", "music")]),
            ],
        );
        let compiled =
            compile_output(&project, &project.outputs["main"], &BTreeMap::new()).unwrap();
        assert!(compiled.filter_graph.contains("amix=inputs=2"));
        assert!(compiled.filter_graph.contains("overlay="));
    }

    #[test]
    fn compilation_is_deterministic() {
        let mut b = fragment("b", "clipb");
        b.overlap_left_ms = -500.0;
        let build = || {
            let project = project(
                vec![asset("clipa", 3000.0, 0), asset("clipb", 3000.0, 1)],
                vec![seq(vec![fragment("a", "clipa"), b.clone()])],
            );
            compile_output(&project, &project.outputs["main"], &BTreeMap::new())
                .unwrap()
                .filter_graph
        };
        assert_eq!(build(), build());
    }
}
