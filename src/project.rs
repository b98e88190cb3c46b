//! Builds the typed [`Project`] from a parsed document: resolves assets
//! against probe results, merges class and inline styles into fragment
//! specs, captures container/app subtrees, and assigns each referenced
//! input its stable index in first-use order.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use tracing::debug;

use crate::{
    error::{ReelError, ReelResult},
    markup::{Document, Element},
    model::{
        App, Asset, AssetKind, Chromakey, Container, FragmentSource, FragmentSpec, InputSource,
        ObjectFit, Output, Project, ProjectMeta, Sequence, Timing, Transition, parse_time_literal,
    },
    probe::MediaProber,
    style::Stylesheet,
};

/// Read and build `<dir>/project.html`.
pub fn load_project(project_dir: &Path, prober: &dyn MediaProber) -> ReelResult<Project> {
    let doc_path = project_dir.join("project.html");
    let source = std::fs::read_to_string(&doc_path)
        .with_context(|| format!("read project document '{}'", doc_path.display()))?;
    let doc = Document::parse(&source)?;
    build_project(&doc, project_dir, prober)
}

pub fn build_project(
    doc: &Document,
    project_dir: &Path,
    prober: &dyn MediaProber,
) -> ReelResult<Project> {
    let css = doc
        .find_all("style")
        .first()
        .map(|s| s.text())
        .unwrap_or_default();
    let sheet = Stylesheet::parse(&css)?;

    let meta = doc
        .find_all("project")
        .first()
        .map(|p| ProjectMeta {
            title: p.attr("data-title").map(str::to_string),
            date: p.attr("data-date").map(str::to_string),
            tags: p
                .attr("data-tags")
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        })
        .unwrap_or_default();

    let outputs = build_outputs(doc)?;
    let mut assets = build_assets(doc, project_dir, prober)?;
    let containers = build_containers(doc)?;
    let apps = build_apps(doc, project_dir)?;
    let presets = build_presets(doc);
    let uploads = build_uploads(doc);
    let sequences = build_sequences(doc, &sheet)?;

    validate_references(&sequences, &assets, &containers, &apps)?;
    let inputs = assign_input_indices(&sequences, &mut assets);

    debug!(
        assets = assets.len(),
        outputs = outputs.len(),
        sequences = sequences.len(),
        inputs = inputs.len(),
        "built project model"
    );

    Ok(Project {
        dir: project_dir.to_path_buf(),
        assets,
        outputs,
        sequences,
        containers,
        apps,
        css,
        presets,
        uploads,
        meta,
        inputs,
    })
}

fn require_attr<'a>(el: &'a Element, name: &str) -> ReelResult<&'a str> {
    el.attr(name).filter(|v| !v.is_empty()).ok_or_else(|| {
        ReelError::parse(
            el.line,
            el.col,
            format!("<{}> requires a {} attribute", el.tag, name),
        )
    })
}

fn build_outputs(doc: &Document) -> ReelResult<BTreeMap<String, Output>> {
    let mut outputs = BTreeMap::new();
    for el in doc.find_all("output") {
        let name = require_attr(el, "data-name")?.to_string();
        let resolution = require_attr(el, "data-resolution")?;
        let (width, height) = resolution
            .split_once('x')
            .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
            .ok_or_else(|| {
                ReelError::parse(
                    el.line,
                    el.col,
                    format!("bad data-resolution '{resolution}', expected WxH"),
                )
            })?;
        let fps = require_attr(el, "data-fps")?
            .parse()
            .map_err(|_| ReelError::parse(el.line, el.col, "bad data-fps"))?;

        let output = Output {
            name: name.clone(),
            path: require_attr(el, "data-path")?.into(),
            fps,
            width,
            height,
            preset: el.attr("data-ffmpeg").map(str::to_string),
        };
        output.validate()?;
        if outputs.insert(name.clone(), output).is_some() {
            return Err(ReelError::parse(
                el.line,
                el.col,
                format!("duplicate output name '{name}'"),
            ));
        }
    }
    Ok(outputs)
}

fn build_assets(
    doc: &Document,
    project_dir: &Path,
    prober: &dyn MediaProber,
) -> ReelResult<BTreeMap<String, Asset>> {
    let mut assets = BTreeMap::new();
    for el in doc.find_all("asset") {
        let name = require_attr(el, "data-name")?.to_string();
        let rel = require_attr(el, "data-path")?;
        let path = project_dir.join(rel);
        let kind = el
            .attr("data-type")
            .and_then(AssetKind::from_name)
            .unwrap_or_else(|| AssetKind::from_extension(&path));

        let probe = prober.probe(&path)?;
        let asset = Asset {
            name: name.clone(),
            path,
            kind,
            duration_ms: if kind == AssetKind::Image {
                0.0
            } else {
                probe.duration_ms
            },
            width: probe.width,
            height: probe.height,
            rotation: probe.rotation,
            has_video: probe.has_video || kind == AssetKind::Image,
            has_audio: probe.has_audio,
            input_index: None,
        };
        if assets.insert(name.clone(), asset).is_some() {
            return Err(ReelError::parse(
                el.line,
                el.col,
                format!("duplicate asset name '{name}'"),
            ));
        }
    }
    Ok(assets)
}

fn build_containers(doc: &Document) -> ReelResult<BTreeMap<String, Container>> {
    let mut containers = BTreeMap::new();
    for el in doc.find_all("container") {
        let id = require_attr(el, "id")?.to_string();
        let container = Container {
            id: id.clone(),
            html: doc.inner_html(el).to_string(),
        };
        if containers.insert(id.clone(), container).is_some() {
            return Err(ReelError::parse(
                el.line,
                el.col,
                format!("duplicate container id '{id}'"),
            ));
        }
    }
    Ok(containers)
}

fn build_apps(doc: &Document, project_dir: &Path) -> ReelResult<BTreeMap<String, App>> {
    let mut apps = BTreeMap::new();
    for el in doc.find_all("app") {
        let id = require_attr(el, "id")?.to_string();
        let source_dir = project_dir.join(require_attr(el, "data-src")?);

        let mut params = BTreeMap::new();
        if let Some(raw) = el.attr("data-params") {
            let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                ReelError::parse(el.line, el.col, format!("bad data-params JSON: {e}"))
            })?;
            match value {
                serde_json::Value::Object(map) => {
                    params.extend(map);
                }
                _ => {
                    return Err(ReelError::parse(
                        el.line,
                        el.col,
                        "data-params must be a JSON object",
                    ));
                }
            }
        }

        let app = App {
            id: id.clone(),
            source_dir,
            params,
        };
        if apps.insert(id.clone(), app).is_some() {
            return Err(ReelError::parse(
                el.line,
                el.col,
                format!("duplicate app id '{id}'"),
            ));
        }
    }
    Ok(apps)
}

fn build_presets(doc: &Document) -> BTreeMap<String, String> {
    let mut presets = BTreeMap::new();
    for block in doc.find_all("ffmpeg") {
        for el in block.child_elements() {
            if let Some(name) = el.attr("data-name") {
                let args = el
                    .attr("data-args")
                    .map(str::to_string)
                    .unwrap_or_else(|| el.text().trim().to_string());
                presets.insert(name.to_string(), args);
            }
        }
    }
    presets
}

fn build_uploads(doc: &Document) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut uploads = BTreeMap::new();
    for block in doc.find_all("upload") {
        for el in block.child_elements() {
            if let Some(name) = el.attr("data-name") {
                let attrs = el
                    .attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                uploads.insert(name.to_string(), attrs);
            }
        }
    }
    uploads
}

fn build_sequences(doc: &Document, sheet: &Stylesheet) -> ReelResult<Vec<Sequence>> {
    let mut sequences = Vec::new();
    let mut auto_id = 0usize;
    let mut seen_ids = std::collections::BTreeSet::new();

    for seq_el in doc.find_all("sequence") {
        if let Some(mode) = seq_el.attr("data-mode") {
            if mode != "overlay" {
                return Err(ReelError::parse(
                    seq_el.line,
                    seq_el.col,
                    format!("sequence data-mode '{mode}' is not supported (only 'overlay')"),
                ));
            }
        }

        let offset = seq_el.attr("data-offset").map(Timing::parse).transpose()?;
        let mut fragments = Vec::new();
        for frag_el in seq_el.find_all("fragment") {
            let frag = build_fragment(frag_el, sheet, &mut auto_id)?;
            if !seen_ids.insert(frag.id.clone()) {
                return Err(ReelError::parse(
                    frag_el.line,
                    frag_el.col,
                    format!("duplicate fragment id '{}'", frag.id),
                ));
            }
            fragments.push(frag);
        }

        sequences.push(Sequence {
            id: seq_el.id().map(str::to_string),
            offset,
            fragments,
        });
    }
    Ok(sequences)
}

fn build_fragment(
    el: &Element,
    sheet: &Stylesheet,
    auto_id: &mut usize,
) -> ReelResult<FragmentSpec> {
    let mut sources = Vec::new();
    if let Some(a) = el.attr("data-asset") {
        sources.push(FragmentSource::Asset(a.to_string()));
    }
    if let Some(c) = el.attr("data-container") {
        sources.push(FragmentSource::Container(c.to_string()));
    }
    if let Some(a) = el.attr("data-app") {
        sources.push(FragmentSource::App(a.to_string()));
    }
    if sources.len() != 1 {
        return Err(ReelError::parse(
            el.line,
            el.col,
            "fragment needs exactly one of data-asset, data-container, data-app",
        ));
    }
    let source = sources.remove(0);

    let id = match el.id() {
        Some(id) => id.to_string(),
        None => {
            *auto_id += 1;
            format!("fragment-{auto_id}")
        }
    };

    let mut frag = FragmentSpec::new(id, source);
    if el.attr("data-enabled") == Some("false") {
        frag.enabled = false;
    }

    let style = sheet.resolve(el);
    for (prop, value) in &style {
        apply_style_property(&mut frag, prop, value)?;
    }
    Ok(frag)
}

fn apply_style_property(frag: &mut FragmentSpec, prop: &str, value: &str) -> ReelResult<()> {
    match prop {
        "-offset-start" => frag.start = Some(Timing::parse(value)?),
        "-offset-end" => frag.end = Some(Timing::parse(value)?),
        "-duration" => frag.duration = Some(Timing::parse(value)?),
        "-trim-start" => frag.trim_start_ms = parse_time_literal(value)?,
        "-overlay-left" => frag.overlap_left_ms = parse_time_literal(value)?,
        "-overlay-start-z-index" => {
            frag.z_index = value.trim().parse().map_err(|_| {
                ReelError::fragment_invalid(&frag.id, format!("bad z-index '{value}'"))
            })?;
        }
        "-overlay-end-z-index" => {
            frag.z_index_end = Some(value.trim().parse().map_err(|_| {
                ReelError::fragment_invalid(&frag.id, format!("bad z-index '{value}'"))
            })?);
        }
        "-transition-start" => frag.transition_in = Some(Transition::parse(value)?),
        "-transition-end" => frag.transition_out = Some(Transition::parse(value)?),
        "-object-fit" => frag.object_fit = ObjectFit::parse(value)?,
        "-chromakey" => frag.chromakey = Some(Chromakey::parse(value)?),
        "-audio" => {
            if matches!(value.trim(), "none" | "off") {
                frag.audio_enabled = false;
            }
        }
        "filter" => {
            let inner = value
                .trim()
                .strip_prefix("blur(")
                .and_then(|v| v.strip_suffix(')'));
            if let Some(inner) = inner {
                let sigma: f64 = inner
                    .trim()
                    .trim_end_matches("px")
                    .parse()
                    .map_err(|_| {
                        ReelError::fragment_invalid(&frag.id, format!("bad blur '{value}'"))
                    })?;
                frag.blur_sigma = Some(sigma);
            }
            // other filter functions are standard CSS, not ours
        }
        _ => {} // standard properties ride along for container styling
    }
    Ok(())
}

fn validate_references(
    sequences: &[Sequence],
    assets: &BTreeMap<String, Asset>,
    containers: &BTreeMap<String, Container>,
    apps: &BTreeMap<String, App>,
) -> ReelResult<()> {
    for seq in sequences {
        for frag in &seq.fragments {
            let known = match &frag.source {
                FragmentSource::Asset(n) => assets.contains_key(n),
                FragmentSource::Container(n) => containers.contains_key(n),
                FragmentSource::App(n) => apps.contains_key(n),
            };
            if !known {
                return Err(ReelError::UnknownReference {
                    fragment_id: frag.id.clone(),
                    target: frag.source.target().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Dense input indices starting at 0, in first-use order across all
/// sequences. Overlay PNGs (containers/apps) share the same index space.
fn assign_input_indices(
    sequences: &[Sequence],
    assets: &mut BTreeMap<String, Asset>,
) -> Vec<InputSource> {
    let mut inputs: Vec<InputSource> = Vec::new();
    for seq in sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            let source = match &frag.source {
                FragmentSource::Asset(name) => InputSource::Asset(name.clone()),
                FragmentSource::Container(id) | FragmentSource::App(id) => {
                    InputSource::Overlay(id.clone())
                }
            };
            if !inputs.contains(&source) {
                if let InputSource::Asset(name) = &source {
                    if let Some(asset) = assets.get_mut(name) {
                        asset.input_index = Some(inputs.len());
                    }
                }
                inputs.push(source);
            }
        }
    }
    inputs
}
