use super::{non_max_suppression, BoundingBox, Detection, Detector, DetectorConfig, COCO_CLASSES};
use crate::error::{Error, Result};
use crate::frame::Frame;
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use image::imageops::FilterType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// YOLOv8 detection model evaluated on the CPU with candle-onnx.
pub struct YoloDetector {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
    names: Vec<String>,
    config: DetectorConfig,
    device: Device,
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ModelSummary {
    pub path: PathBuf,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub nodes: usize,
    pub parameters: u64,
    pub classes: usize,
}

/// Returns `file` when it exists locally, otherwise fetches it from the
/// Hugging Face `repo`.
pub fn resolve_model(file: &str, repo: &str) -> Result<PathBuf> {
    if Path::new(file).exists() {
        return Ok(PathBuf::from(file));
    }
    info!(repo, file, "model not found locally, downloading");
    Api::new()
        .and_then(|api| api.model(repo.to_string()).get(file))
        .map_err(|e| Error::Model(format!("failed to download {file} from {repo}: {e}")))
}

impl YoloDetector {
    pub fn load(path: &Path, config: DetectorConfig) -> Result<Self> {
        let start = Instant::now();
        let mut model = read_file(path)?;
        patch_maxpool_padding(&mut model);
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| Error::Model("model graph missing".to_string()))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::Model("model has no inputs".to_string()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Model("model has no outputs".to_string()))?;
        let names = class_names(&model);
        info!(
            path = %path.display(),
            classes = names.len(),
            elapsed = ?start.elapsed(),
            "model loaded"
        );
        Ok(Self {
            model,
            input_name,
            output_name,
            names,
            config,
            device: Device::Cpu,
        })
    }

    fn prepare(&self, frame: &Frame) -> Result<Tensor> {
        let size = self.config.input_size;
        let img = image::imageops::resize(frame.as_rgb(), size, size, FilterType::CatmullRom);
        let data = img.into_raw();
        let tensor = Tensor::from_vec(data, (size as usize, size as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?;
        Ok(tensor)
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &'static str {
        "yolov8-candle"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let start = Instant::now();
        let input = self.prepare(frame)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), input);
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| Error::Detector("model output missing".to_string()))?;
        let dets = decode_output(
            &output,
            &self.names,
            &self.config,
            frame.width(),
            frame.height(),
        )?;
        debug!(count = dets.len(), elapsed = ?start.elapsed(), "inference done");
        Ok(dets)
    }
}

/// Turns a `[1, 4 + classes, anchors]` YOLOv8 head output into detections
/// in `width` x `height` frame pixels. Boxes are `cx, cy, w, h` in model
/// input pixels; each anchor keeps its best class.
pub fn decode_output(
    output: &Tensor,
    names: &[String],
    config: &DetectorConfig,
    width: u32,
    height: u32,
) -> Result<Vec<Detection>> {
    let output = output.squeeze(0)?.to_dtype(DType::F32)?;
    let (rows, anchors) = output.dims2()?;
    if rows <= 4 {
        return Err(Error::Model(format!("unexpected output shape {:?}", output.dims())));
    }
    let data = output.to_vec2::<f32>()?;
    let classes = rows - 4;
    let size = config.input_size as f32;
    let (sx, sy) = (width as f32 / size, height as f32 / size);

    let mut dets = Vec::new();
    for a in 0..anchors {
        let (class_id, confidence) = (0..classes)
            .map(|c| (c, data[4 + c][a]))
            .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
        if confidence < config.confidence {
            continue;
        }
        let bbox = BoundingBox::from_center(
            data[0][a] * sx,
            data[1][a] * sy,
            data[2][a] * sx,
            data[3][a] * sy,
        )
        .clamp(width as f32, height as f32);
        dets.push(Detection {
            label: names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{class_id}")),
            class_id,
            confidence,
            bbox,
        });
    }
    Ok(non_max_suppression(dets, config.iou))
}

/// Loads the model at `path` without preparing it for inference.
pub fn inspect(path: &Path) -> Result<ModelSummary> {
    let model = read_file(path)?;
    let classes = class_names(&model).len();
    Ok(summarize(&model, path, classes))
}

fn summarize(model: &onnx::ModelProto, path: &Path, classes: usize) -> ModelSummary {
    let (inputs, outputs, nodes, parameters) = match &model.graph {
        Some(g) => (
            g.input.iter().map(|i| i.name.clone()).collect(),
            g.output.iter().map(|o| o.name.clone()).collect(),
            g.node.len(),
            g.initializer
                .iter()
                .map(|t| t.dims.iter().map(|&d| d.max(0) as u64).product::<u64>())
                .sum(),
        ),
        None => (Vec::new(), Vec::new(), 0, 0),
    };
    ModelSummary {
        path: path.to_path_buf(),
        inputs,
        outputs,
        nodes,
        parameters,
        classes,
    }
}

/// Class names from the exporter's `names` metadata, e.g.
/// `{0: 'person', 1: 'bicycle'}`. Falls back to the COCO classes.
fn class_names(model: &onnx::ModelProto) -> Vec<String> {
    model
        .metadata_props
        .iter()
        .find(|p| p.key == "names")
        .and_then(|p| parse_names(&p.value))
        .unwrap_or_else(|| COCO_CLASSES.iter().map(|s| s.to_string()).collect())
}

pub(crate) fn parse_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries: Vec<(usize, String)> = Vec::new();
    for item in body.split(", ") {
        let (id, name) = item.split_once(':')?;
        let id = id.trim().parse().ok()?;
        let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
        entries.push((id, name.to_string()));
    }
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(id, _)| *id);
    Some(entries.into_iter().map(|(_, n)| n).collect())
}

/// candle's MaxPool has no padding support; move non-zero pads into an
/// explicit Pad node in front of the pool.
fn patch_maxpool_padding(model: &mut onnx::ModelProto) {
    let Some(graph) = model.graph.as_mut() else {
        return;
    };
    let mut new_nodes = Vec::with_capacity(graph.node.len());
    for mut node in std::mem::take(&mut graph.node) {
        if node.op_type == "MaxPool" {
            let mut pad_attr = None;
            for attr in node.attribute.iter_mut() {
                if attr.name == "pads" {
                    if attr.ints.len() == 4 && attr.ints.iter().any(|&v| v != 0) {
                        pad_attr = Some(attr.ints.clone());
                        attr.ints.iter_mut().for_each(|v| *v = 0);
                    }
                    break;
                }
            }
            if let Some(pads) = pad_attr {
                let pad_init_name = format!("{}_pads", node.name);
                let full_pads = vec![0, 0, pads[0], pads[1], 0, 0, pads[2], pads[3]];
                graph.initializer.push(onnx::TensorProto {
                    name: pad_init_name.clone(),
                    dims: vec![full_pads.len() as i64],
                    data_type: onnx::tensor_proto::DataType::Int64 as i32,
                    int64_data: full_pads,
                    ..Default::default()
                });

                let pad_output = format!("{}_pad_out", node.name);
                let mut pad_node = onnx::NodeProto {
                    input: vec![node.input[0].clone(), pad_init_name],
                    output: vec![pad_output.clone()],
                    name: format!("{}_pad", node.name),
                    op_type: "Pad".to_string(),
                    ..Default::default()
                };
                pad_node.attribute.push(onnx::AttributeProto {
                    name: "mode".to_string(),
                    r#type: onnx::attribute_proto::AttributeType::String as i32,
                    s: b"reflect".to_vec(),
                    ..Default::default()
                });
                new_nodes.push(pad_node);
                node.input[0] = pad_output;
            }
        }
        new_nodes.push(node);
    }
    graph.node = new_nodes;
}
