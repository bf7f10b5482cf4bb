//! Reader for OpenCV `<opencv_storage>` HAAR cascade files.
//!
//! Handles the format written by `opencv_traincascade` and shipped as
//! `haarcascade_*.xml` (`type_id="opencv-cascade-classifier"`). Weak
//! classifiers are stored as `internalNodes` quadruples
//! (`left right featureIdx threshold`, where values `<= 0` name leaf `-v`)
//! plus `leafValues`; features as `rects` of `x y width height weight`.

use crate::cascade::{
    Branch, CascadeDefinition, HaarFeature, Stage, TreeNode, WeakClassifier, WeightedRect, WindowSize,
};
use roxmltree::{Document, Node};
use std::str::FromStr;

const ROOT_TAG: &str = "opencv_storage";
const CASCADE_TAG: &str = "cascade";
const LEGACY_TYPE_ID: &str = "opencv-haar-classifier";

/// Parse and validate an OpenCV HAAR cascade.
pub fn parse(text: &str) -> Result<CascadeDefinition, String> {
    let doc = Document::parse(text).map_err(|e| format!("invalid XML: {e}"))?;
    let root = doc.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(format!(
            "expected <{ROOT_TAG}> root element, found <{}>",
            root.tag_name().name()
        ));
    }

    let cascade = match child(root, CASCADE_TAG) {
        Ok(node) => node,
        Err(_) if elements(root).any(|n| n.attribute("type_id") == Some(LEGACY_TYPE_ID)) => {
            return Err("legacy opencv-haar-classifier layout is not supported; \
                        use a cascade saved by OpenCV 3 or later"
                .into());
        }
        Err(e) => return Err(e),
    };

    let stage_type = text_of(child(cascade, "stageType")?);
    if stage_type != "BOOST" {
        return Err(format!("unsupported stage type {stage_type:?}"));
    }
    let feature_type = text_of(child(cascade, "featureType")?);
    if feature_type != "HAAR" {
        return Err(format!("unsupported feature type {feature_type:?}"));
    }
    if let Ok(params) = child(cascade, "featureParams") {
        if let Ok(max_cat) = child(params, "maxCatCount") {
            let max_cat: u32 = number(max_cat)?;
            if max_cat != 0 {
                return Err(format!("categorical features are not supported (maxCatCount {max_cat})"));
            }
        }
    }

    let window = WindowSize {
        width: number(child(cascade, "width")?)?,
        height: number(child(cascade, "height")?)?,
    };

    let stages = elements(child(cascade, "stages")?)
        .enumerate()
        .map(|(i, node)| parse_stage(node).map_err(|e| format!("stage {i}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    let features = elements(child(cascade, "features")?)
        .enumerate()
        .map(|(i, node)| parse_feature(node).map_err(|e| format!("feature {i}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    if let Ok(declared) = child(cascade, "stageNum") {
        let declared: usize = number(declared)?;
        if declared != stages.len() {
            return Err(format!("stageNum is {declared} but {} stages are present", stages.len()));
        }
    }

    let definition = CascadeDefinition {
        window,
        features,
        stages,
    };
    definition.validate()?;
    Ok(definition)
}

fn parse_stage(node: Node) -> Result<Stage, String> {
    let threshold = number(child(node, "stageThreshold")?)?;
    let classifiers = elements(child(node, "weakClassifiers")?)
        .enumerate()
        .map(|(i, weak)| parse_weak(weak).map_err(|e| format!("classifier {i}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak(node: Node) -> Result<WeakClassifier, String> {
    let raw: Vec<f64> = numbers(child(node, "internalNodes")?)?;
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(format!(
            "internalNodes holds {} values, expected groups of 4",
            raw.len()
        ));
    }

    let nodes = raw
        .chunks_exact(4)
        .map(|q| -> Result<TreeNode, String> {
            Ok(TreeNode {
                left: branch(q[0])?,
                right: branch(q[1])?,
                feature: index(q[2])?,
                threshold: q[3] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let leaves = numbers(child(node, "leafValues")?)?;

    Ok(WeakClassifier { nodes, leaves })
}

fn parse_feature(node: Node) -> Result<HaarFeature, String> {
    if let Ok(tilted) = child(node, "tilted") {
        if text_of(tilted) != "0" {
            return Err("tilted features are not supported".into());
        }
    }

    let rects = elements(child(node, "rects")?)
        .map(|r| -> Result<WeightedRect, String> {
            let v: Vec<f64> = numbers(r)?;
            let &[x, y, w, h, weight] = v.as_slice() else {
                return Err(format!("rect needs 5 values, found {}", v.len()));
            };
            Ok(WeightedRect {
                x: index(x)? as u32,
                y: index(y)? as u32,
                width: index(w)? as u32,
                height: index(h)? as u32,
                weight: weight as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

fn branch(v: f64) -> Result<Branch, String> {
    let i = integer(v)?;
    Ok(if i > 0 {
        Branch::Node(i as usize)
    } else {
        Branch::Leaf(i.unsigned_abs() as usize)
    })
}

fn index(v: f64) -> Result<usize, String> {
    let i = integer(v)?;
    usize::try_from(i).map_err(|_| format!("expected a non-negative integer, found {v}"))
}

fn integer(v: f64) -> Result<i64, String> {
    if v.fract() != 0.0 || !v.is_finite() || v.abs() > u32::MAX as f64 {
        return Err(format!("expected an integer, found {v}"));
    }
    Ok(v as i64)
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Result<Node<'a, 'input>, String> {
    elements(node)
        .find(|n| n.tag_name().name() == tag)
        .ok_or_else(|| format!("<{}> has no <{tag}> element", node.tag_name().name()))
}

fn text_of<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().map(str::trim).unwrap_or("")
}

fn number<T: FromStr>(node: Node) -> Result<T, String> {
    let text = text_of(node);
    text.parse()
        .map_err(|_| format!("<{}>: cannot parse {text:?}", node.tag_name().name()))
}

fn numbers<T: FromStr>(node: Node) -> Result<Vec<T>, String> {
    text_of(node)
        .split_whitespace()
        .map(|t| {
            t.parse()
                .map_err(|_| format!("<{}>: cannot parse {t:?}", node.tag_name().name()))
        })
        .collect()
}
